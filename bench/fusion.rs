#![recursion_limit = "256"]

use burn::{backend::NdArray, prelude::*};
use burn_disambiguation::model::{
    fusion::{flatten_pair, mask_features},
    interpolate::{DepthResample, resize},
    padding::pad_to_multiple,
};
use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;

type BenchBackend = NdArray<f32>;

criterion_group! {
    name = fusion_benchmarks;
    config = Criterion::default().sample_size(50);
    targets = padding_benchmark, fusion_benchmark,
}
criterion_main!(fusion_benchmarks);

fn padding_benchmark(c: &mut Criterion) {
    let device = <BenchBackend as Backend>::Device::default();

    let cases = [
        ("b8_224x224_aligned", 8, 224, 224),
        ("b8_230x300_unaligned", 8, 230, 300),
        ("b1_480x640_unaligned", 1, 480, 640),
    ];

    let mut group = c.benchmark_group("disambiguation_padding");
    for (name, batch, height, width) in cases {
        let input: Tensor<BenchBackend, 4> = Tensor::zeros([batch, 3, height, width], &device);
        group.throughput(Throughput::Elements((batch * 3 * height * width) as u64));

        group.bench_function(name, |b| {
            b.iter(|| {
                let output = pad_to_multiple(input.clone(), 14);
                BenchBackend::sync(&device);
                black_box(output);
            });
        });
    }
    group.finish();
}

fn fusion_benchmark(c: &mut Criterion) {
    let device = <BenchBackend as Backend>::Device::default();

    struct FusionCase {
        name: &'static str,
        batch: usize,
        channels: usize,
        grid: [usize; 2],
        depth: [usize; 2],
    }

    let cases = [
        FusionCase {
            name: "vits_b8_16x16",
            batch: 8,
            channels: 384,
            grid: [16, 16],
            depth: [224, 224],
        },
        FusionCase {
            name: "vitl_b8_16x16",
            batch: 8,
            channels: 1024,
            grid: [16, 16],
            depth: [224, 224],
        },
    ];

    let mut group = c.benchmark_group("disambiguation_fusion");
    for case in cases {
        let [gh, gw] = case.grid;
        let features: Tensor<BenchBackend, 4> =
            Tensor::ones([case.batch, case.channels, gh, gw], &device);
        let depth: Tensor<BenchBackend, 4> =
            Tensor::ones([case.batch, 1, case.depth[0], case.depth[1]], &device);
        group.throughput(Throughput::Elements(
            (2 * case.batch * case.channels * gh * gw) as u64,
        ));

        for resample in [DepthResample::Bilinear, DepthResample::Nearest] {
            group.bench_function(format!("{}::{resample:?}", case.name), |b| {
                b.iter(|| {
                    let depth = resize(depth.clone(), case.grid, &resample);
                    let a = mask_features(features.clone(), depth.clone());
                    let b_side = mask_features(features.clone(), depth);
                    let output = flatten_pair(a, b_side);
                    BenchBackend::sync(&device);
                    black_box(output);
                });
            });
        }
    }
    group.finish();
}
