#[cfg(target_arch = "wasm32")]
fn main() {}

#[cfg(not(target_arch = "wasm32"))]
use std::time::Duration;

#[cfg(not(target_arch = "wasm32"))]
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
#[cfg(not(target_arch = "wasm32"))]
use hvx_x86::{decode, CpuMode};

#[cfg(not(target_arch = "wasm32"))]
fn criterion_config() -> Criterion {
    match std::env::var("HVX_BENCH_PROFILE").as_deref() {
        Ok("ci") => Criterion::default()
            .warm_up_time(Duration::from_millis(200))
            .measurement_time(Duration::from_secs(1))
            .sample_size(10),
        _ => Criterion::default()
            .warm_up_time(Duration::from_secs(1))
            .measurement_time(Duration::from_secs(2))
            .sample_size(30),
    }
}

/// Instructions typical of MMIO and port-I/O exits.
#[cfg(not(target_arch = "wasm32"))]
const EXIT_MIX: &[&[u8]] = &[
    &[0x8b, 0x45, 0xfc],
    &[0x89, 0x08],
    &[0xc7, 0x80, 0x00, 0x03, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00],
    &[0x48, 0x8b, 0x05, 0x10, 0x00, 0x00, 0x00],
    &[0x66, 0x89, 0x44, 0x24, 0x08],
    &[0xf3, 0xab],
    &[0x0f, 0xb6, 0x06],
    &[0xee],
];

#[cfg(not(target_arch = "wasm32"))]
fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Elements(EXIT_MIX.len() as u64));
    group.bench_function("exit_mix_protected32", |b| {
        b.iter(|| {
            for bytes in EXIT_MIX {
                let _ = black_box(decode(black_box(bytes), CpuMode::Protected { cs_db: true }));
            }
        })
    });
    group.bench_function("exit_mix_long64", |b| {
        b.iter(|| {
            for bytes in EXIT_MIX {
                let _ = black_box(decode(black_box(bytes), CpuMode::Long64));
            }
        })
    });
    group.finish();
}

#[cfg(not(target_arch = "wasm32"))]
criterion_group! {
    name = benches;
    config = criterion_config();
    targets = bench_decode
}
#[cfg(not(target_arch = "wasm32"))]
criterion_main!(benches);
