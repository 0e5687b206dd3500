#![recursion_limit = "256"]

use burn::prelude::*;
use burn_deepv2d::{
    InferenceBackend,
    config::Deepv2dConfig,
    model::{
        RunMode,
        network::{DeepV2dNetwork, NetworkRequest},
    },
};
use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;

const FRAMES: usize = 5;

criterion_group! {
    name = deepv2d_benchmarks;
    config = Criterion::default().sample_size(10);
    targets = inference_benchmark,
}
criterion_main!(deepv2d_benchmarks);

fn inference_benchmark(c: &mut Criterion) {
    let device = <InferenceBackend as Backend>::Device::default();
    let bench_device = device.clone();

    let config = Deepv2dConfig::default();
    let network = DeepV2dNetwork::<InferenceBackend>::new(&device, &config);
    let (height, width) = network.input_size();
    let input = Tensor::<InferenceBackend, 4>::zeros([FRAMES, 3, height, width], &device);

    let mut group = c.benchmark_group("burn_deepv2d_inference");
    group.throughput(Throughput::Elements(FRAMES as u64));
    for mode in [RunMode::Keyframe, RunMode::Global] {
        let request = NetworkRequest {
            intrinsics: Some([width as f32, width as f32, width as f32 * 0.5, height as f32 * 0.5]),
            iters: 5,
            mode,
            use_fcrn: false,
        };
        group.bench_function(format!("deepv2d_{mode}"), |b| {
            b.iter(|| {
                let output = network.forward(input.clone(), &request);
                let _ = InferenceBackend::sync(&bench_device);
                black_box(output)
            });
        });
    }
    group.finish();
}
