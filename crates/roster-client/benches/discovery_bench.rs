// Benchmarks for discovery lookups
// Measures cache snapshots, event application and end-to-end selection

use std::hint::black_box;
use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use roster_api::{InstanceRecord, codec};
use roster_client::{Balancer, DiscoveryClient, RegistrationService, ServiceCache, ServiceType};
use roster_store::{MemoryConnector, MemoryStore, NodeEvent, StoreConfig};

fn populated_cache(size: usize) -> ServiceCache {
    let cache = ServiceCache::new("orders", "/services");
    for i in 0..size {
        let record = InstanceRecord::builder("orders")
            .id(format!("i{}", i))
            .address("10.0.0.1")
            .port(8000 + i as u16)
            .build();
        let event = NodeEvent::created(format!("/services/orders/i{}", i), codec::encode(&record).unwrap());
        cache.apply_event(&event);
    }
    cache
}

fn bench_snapshot(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_snapshot");
    for size in [4usize, 64, 512] {
        let cache = populated_cache(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &cache, |b, cache| {
            b.iter(|| black_box(cache.snapshot()))
        });
    }
    group.finish();
}

fn bench_apply_event(c: &mut Criterion) {
    let cache = populated_cache(64);
    let record = InstanceRecord::builder("orders")
        .id("i0")
        .address("10.0.0.2")
        .port(9000)
        .build();
    let event = NodeEvent::updated("/services/orders/i0", codec::encode(&record).unwrap());

    c.bench_function("cache_apply_update", |b| {
        b.iter(|| cache.apply_event(black_box(&event)))
    });
}

fn bench_random_selection(c: &mut Criterion) {
    let instances = populated_cache(64).snapshot();
    c.bench_function("balancer_random_64", |b| {
        b.iter(|| Balancer::random(black_box(&instances)))
    });
}

fn bench_get_service(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = MemoryStore::new();
    let connector = Arc::new(MemoryConnector::new(store.clone(), StoreConfig::default()).unwrap());
    let client = DiscoveryClient::new("/services", connector.clone()).unwrap();
    let registrar = RegistrationService::new(ServiceType::Dynamic, "/services", connector).unwrap();

    rt.block_on(async {
        for port in 8000..8016 {
            registrar.regist("orders", "10.0.0.1", port, "").await.unwrap();
        }
        client.get_all_services("orders").await.unwrap();
    });

    c.bench_function("client_get_service", |b| {
        b.to_async(&rt)
            .iter(|| async { client.get_service(black_box("orders")).await.unwrap() })
    });
}

criterion_group!(
    benches,
    bench_snapshot,
    bench_apply_event,
    bench_random_selection,
    bench_get_service
);
criterion_main!(benches);
