use chrono::Utc;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use slait::{
    commit_log::{
        segmented_log::{config::SegmentedLogConfig, SegmentedLog},
        Entry,
    },
    storage::impls::in_mem::{InMemSegmentStorageProvider, InMemStorage},
};
use tokio::runtime::Runtime;

const LOREM_140: [&[u8]; 4] = [
    b"Donec neque velit, pulvinar in sed.",
    b"Pellentesque sodales, felis sit et.",
    b"Sed lobortis magna sem, eu laoreet.",
    b"Praesent quis varius diam. Nunc at.",
];

fn criterion_benchmark_with_payload(c: &mut Criterion, payload: Vec<u8>, group_name: &str) {
    let runtime = Runtime::new().unwrap();
    let mut group = c.benchmark_group(group_name);

    for num_appends in (0..10000).step_by(1000) {
        group
            .throughput(Throughput::Bytes(payload.len() as u64 * num_appends as u64))
            .sample_size(10)
            .bench_with_input(
                BenchmarkId::new("in_memory_segmented_log", num_appends),
                &num_appends,
                |b, &num_appends| {
                    b.to_async(&runtime).iter_with_large_drop(|| async {
                        let mut segmented_log = SegmentedLog::<InMemStorage, _>::new(
                            SegmentedLogConfig::default(),
                            InMemSegmentStorageProvider::default(),
                        )
                        .await
                        .unwrap();

                        let entry = Entry::new(Utc::now(), payload.clone());

                        for _ in 0..num_appends {
                            segmented_log
                                .append(std::slice::from_ref(&entry))
                                .await
                                .unwrap();
                        }

                        segmented_log
                    });
                },
            );
    }
}

fn benchmark_tiny_message_append(c: &mut Criterion) {
    // 12 bytes
    criterion_benchmark_with_payload(
        c,
        b"Hello World!".to_vec(),
        "commit_log_append_with_tiny_message",
    );
}

fn benchmark_tweet_append(c: &mut Criterion) {
    // 140 bytes: pre-2017 Twitter tweet limit
    criterion_benchmark_with_payload(c, LOREM_140.concat(), "commit_log_append_with_tweet");
}

fn benchmark_half_k_message_append(c: &mut Criterion) {
    // 560 bytes
    criterion_benchmark_with_payload(
        c,
        LOREM_140.iter().cycle().take(16).copied().collect::<Vec<_>>().concat(),
        "commit_log_append_with_half_k_message",
    );
}

criterion_group!(
    benches,
    benchmark_tiny_message_append,
    benchmark_tweet_append,
    benchmark_half_k_message_append
);
criterion_main!(benches);
