use criterion::{Criterion, criterion_group, criterion_main};
use search_core::rrf_fuse;

fn bench_fusion(c: &mut Criterion) {
    let dense = (0..100).map(|i| format!("q{i}\u{241f}0\u{241f}t")).collect::<Vec<_>>();
    let sparse = (0..100)
        .rev()
        .map(|i| format!("q{i}\u{241f}0\u{241f}t"))
        .collect::<Vec<_>>();

    c.bench_function("rrf_fuse_100", |b| {
        b.iter(|| {
            let _ = rrf_fuse(&dense, &sparse, 60.0);
        });
    });
}

criterion_group!(benches, bench_fusion);
criterion_main!(benches);
