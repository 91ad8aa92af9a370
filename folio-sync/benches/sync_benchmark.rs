use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use folio_sync::{
    codec, compact, Classifier, ClassifierMode, MessageBody, MessageId, ReplayLog,
    SharedDoc, Snapshot, TransportMessage, UPDATE_MESSAGE_TYPE,
};
use std::hint::black_box;

/// `n` single-key updates from one writer.
fn updates(n: usize) -> Vec<(MessageId, Vec<u8>)> {
    let doc = SharedDoc::new();
    (0..n)
        .map(|i| {
            let update = doc.set_key("cells", &format!("cell-{i}"), &"x".repeat(64));
            (MessageId::new(format!("${i}")), update)
        })
        .collect()
}

fn bench_update_encode(c: &mut Criterion) {
    let (_, update) = updates(1).remove(0);

    c.bench_function("update_encode", |b| {
        b.iter(|| black_box(codec::encode_update(black_box(&update))))
    });
}

fn bench_update_decode(c: &mut Criterion) {
    let (_, update) = updates(1).remove(0);
    let encoded = codec::encode_update(&update);

    c.bench_function("update_decode", |b| {
        b.iter(|| black_box(codec::decode_update(black_box(&encoded)).unwrap()))
    });
}

fn bench_snapshot_encode(c: &mut Criterion) {
    let all = updates(500);
    let snapshot = compact(None, &all).unwrap();

    let mut group = c.benchmark_group("snapshot_encode_500");
    for compress in [false, true] {
        group.bench_with_input(BenchmarkId::from_parameter(compress), &compress, |b, &compress| {
            b.iter(|| black_box(codec::encode_snapshot(&snapshot, compress).unwrap()))
        });
    }
    group.finish();
}

fn bench_classify(c: &mut Criterion) {
    let classifier = Classifier::new(ClassifierMode::Dedicated);
    let msg = TransportMessage::new(
        "$1",
        UPDATE_MESSAGE_TYPE,
        MessageBody::Text(codec::encode_update(&updates(1)[0].1)),
    );

    c.bench_function("classify_update", |b| {
        b.iter(|| black_box(classifier.classify(black_box(&msg)).kind()))
    });
}

fn bench_compaction(c: &mut Criterion) {
    let mut group = c.benchmark_group("compact");
    for n in [30, 300, 1000] {
        let all = updates(n);
        group.bench_with_input(BenchmarkId::from_parameter(n), &all, |b, all| {
            b.iter(|| black_box(compact(None, all).unwrap()))
        });
    }
    group.finish();
}

fn bench_replay(c: &mut Criterion) {
    let all = updates(1000);
    let snapshot = compact(None, &all[..970]).unwrap();

    let mut group = c.benchmark_group("replay_1000");
    group.bench_function("full", |b| {
        b.iter(|| {
            let doc = SharedDoc::new();
            for (_, update) in &all {
                doc.apply_update(update).unwrap();
            }
            black_box(doc.keys("cells").len())
        })
    });
    group.bench_function("snapshot_plus_30", |b| {
        b.iter(|| {
            let doc = SharedDoc::new();
            doc.apply_update(&snapshot.state).unwrap();
            for (_, update) in &all[970..] {
                doc.apply_update(update).unwrap();
            }
            black_box(doc.keys("cells").len())
        })
    });
    group.finish();
}

fn bench_replay_log_append(c: &mut Criterion) {
    let all = updates(100);

    c.bench_function("replay_log_append_100", |b| {
        b.iter(|| {
            let mut log = ReplayLog::new(0);
            for (id, update) in &all {
                log.append(id.clone(), update);
            }
            log.subsume(
                Snapshot {
                    state: Vec::new(),
                    last_update_id: Some(MessageId::from("$99")),
                },
                all.len(),
            );
            black_box(log.pending_count())
        })
    });
}

criterion_group!(
    benches,
    bench_update_encode,
    bench_update_decode,
    bench_snapshot_encode,
    bench_classify,
    bench_compaction,
    bench_replay,
    bench_replay_log_append,
);

criterion_main!(benches);
