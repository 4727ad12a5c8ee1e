use core::hint::black_box;
use chunkstream_core::types::{ChunkCoordinates, ChunkData, GenerationConfig};
use chunkstream_server::server::{
    generation::FlatChunkGenerator,
    pool::{
        manager::{PoolConfig, WorkerPool},
        request::ChunkOutcome,
    },
};
use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use futures::future::join_all;
use serde_json::json;
use std::{sync::Arc, time::Instant};
use tokio::runtime::Builder;
use tokio_util::sync::CancellationToken;

// Chunks submitted per benchmark iteration.
const TOTAL_CHUNKS: usize = 1024;

#[derive(Clone, Copy, Debug)]
struct PoolBenchParams {
    workers: usize,
    chunk_size: usize,
}

/// Measures end-to-end pool throughput: enqueue, dispatch, generate, settle.
fn bench_pool(c: &mut Criterion) {
    let worker_cases = [1, 2, 4, 8];
    // `0` uses a generator that does no work, isolating pool overhead.
    let chunk_size_cases = [0, 16, 64];

    let rt = Builder::new_multi_thread().enable_all().build().unwrap();

    for &chunk_size in &chunk_size_cases {
        let mut group = c.benchmark_group(format!("pool/chunk_size/{chunk_size}"));
        group.throughput(Throughput::Elements(TOTAL_CHUNKS as u64));

        for &workers in &worker_cases {
            let params = PoolBenchParams {
                workers,
                chunk_size,
            };
            group.bench_function(format!("elems/{TOTAL_CHUNKS}/workers/{workers}"), |b| {
                b.to_async(&rt).iter_custom(|iters| async move {
                    let pool = build_pool(params);
                    let start = Instant::now();

                    for _ in 0..iters {
                        run_pool_bench(&pool).await;
                    }

                    let elapsed = start.elapsed();
                    pool.shutdown().await.unwrap();
                    elapsed
                });
            });
        }

        group.finish();
    }
}

fn build_pool(params: PoolBenchParams) -> WorkerPool {
    let config = PoolConfig {
        max_workers: params.workers,
        max_queue_depth: TOTAL_CHUNKS,
        ..PoolConfig::default()
    };

    if params.chunk_size == 0 {
        let noop = |coords: ChunkCoordinates,
                    _: &GenerationConfig,
                    _: &CancellationToken|
         -> anyhow::Result<ChunkData> { Ok(json!(coords.x)) };
        WorkerPool::new(Arc::new(noop), config)
    } else {
        WorkerPool::new(Arc::new(FlatChunkGenerator::new(params.chunk_size)), config)
    }
}

async fn run_pool_bench(pool: &WorkerPool) {
    let config = GenerationConfig::new(json!({"seed": "bench"}));
    let tickets: Vec<_> = (0..TOTAL_CHUNKS as i32)
        .map(|x| {
            pool.enqueue(
                x.to_string(),
                ChunkCoordinates::new(x, 0),
                config.clone(),
                CancellationToken::new(),
            )
            .expect("enqueue failed")
        })
        .collect();

    for outcome in join_all(tickets).await {
        match outcome {
            ChunkOutcome::Completed(result) => {
                black_box(result);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}

criterion_group!(benches, bench_pool);
criterion_main!(benches);
