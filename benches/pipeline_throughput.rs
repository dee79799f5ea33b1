use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tablelink::{MessagePipeline, MessagePriority, MessageType, PipelineConfig};
use tokio::runtime::Runtime;

const PRIORITIES: [MessagePriority; 4] = [
    MessagePriority::Low,
    MessagePriority::Normal,
    MessagePriority::High,
    MessagePriority::Critical,
];

fn payload() -> Vec<u8> {
    br#"{"response":"result","arg":{"round_id":"R1","res":[1,2,3],"err":0}}"#.to_vec()
}

fn bench_enqueue(c: &mut Criterion) {
    let mut group = c.benchmark_group("pipeline_enqueue");
    for batch in [100usize, 1000] {
        group.throughput(Throughput::Elements(batch as u64));
        group.bench_with_input(BenchmarkId::from_parameter(batch), &batch, |b, &batch| {
            b.iter(|| {
                let pipeline = MessagePipeline::new(PipelineConfig {
                    max_queue_size: batch,
                    ..Default::default()
                });
                for i in 0..batch {
                    let msg = pipeline.create_message(
                        "ikg/idp/SBO-001/response",
                        payload(),
                        MessageType::Response,
                        PRIORITIES[i % 4],
                        None,
                    );
                    black_box(pipeline.enqueue(msg));
                }
                pipeline
            })
        });
    }
    group.finish();
}

fn bench_drain(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let batch = 400usize;

    let mut group = c.benchmark_group("pipeline_drain");
    group.throughput(Throughput::Elements(batch as u64));
    group.bench_function("process_tick", |b| {
        b.to_async(&rt).iter(|| async {
            let pipeline = MessagePipeline::new(PipelineConfig::default());
            for i in 0..batch {
                let msg = pipeline.create_message(
                    "ikg/idp/SBO-001/response",
                    payload(),
                    MessageType::Response,
                    PRIORITIES[i % 4],
                    Some(format!("R{}", i)),
                );
                pipeline.enqueue(msg);
            }
            while pipeline.process_tick().await > 0 {}
            black_box(pipeline.stats().completed)
        })
    });
    group.finish();
}

criterion_group!(benches, bench_enqueue, bench_drain);
criterion_main!(benches);
