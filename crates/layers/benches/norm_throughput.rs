use candle_core::{DType, Device, Tensor};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use layers::{
    dtypes::PrecisionPolicy,
    norm::{GemmaRmsNorm, NormConfig, NormKind, NormalizationLayer, RmsNorm},
};

fn bench_norms(c: &mut Criterion) {
    let device = Device::Cpu;
    let batch = 8usize;
    let seq = 32usize;
    let hidden_sizes = &[1024usize, 2048];
    let dtypes = &[DType::F16, DType::BF16, DType::F32];

    for &dtype in dtypes {
        let mut group = c.benchmark_group(format!("norm/{dtype:?}"));
        for &hidden in hidden_sizes {
            let input = Tensor::randn(0f32, 1.0, (batch, seq, hidden), &device)
                .expect("input")
                .to_dtype(dtype)
                .expect("cast input");
            let policy = PrecisionPolicy::from_parameter_dtype(dtype);

            let gemma = GemmaRmsNorm::zeros(NormConfig::new(hidden, NormKind::GemmaRmsNorm), &device, dtype)
                .expect("gemma norm");
            let rms = RmsNorm::ones(NormConfig::new(hidden, NormKind::RmsNorm), &device, dtype)
                .expect("rms norm");

            group.throughput(Throughput::Elements((batch * seq * hidden) as u64));

            group.bench_with_input(
                BenchmarkId::new("gemma", hidden),
                &(gemma, input.clone(), policy),
                |b, (norm, input, policy)| {
                    b.iter(|| {
                        let out = norm.forward(black_box(input), policy).expect("forward");
                        black_box(out);
                    });
                },
            );

            group.bench_with_input(
                BenchmarkId::new("rms", hidden),
                &(rms, input.clone(), policy),
                |b, (norm, input, policy)| {
                    b.iter(|| {
                        let out = norm.forward(black_box(input), policy).expect("forward");
                        black_box(out);
                    });
                },
            );
        }
        group.finish();
    }
}

criterion_group!(benches, bench_norms);
criterion_main!(benches);
