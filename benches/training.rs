use criterion::{black_box, criterion_group, criterion_main, Criterion};
use grove::data::Column;
use grove::{Family, Frame, Gbm};

fn synthetic(nrows: usize, ncols: usize) -> (Frame, Vec<f64>) {
    let mut cols = Vec::with_capacity(ncols);
    for c in 0..ncols {
        let data: Vec<f64> = (0..nrows)
            .map(|i| (((i + 13 * c) * 2654435761) % 10_000) as f64 / 10_000.0)
            .collect();
        cols.push(Column::numeric(format!("x{}", c), data));
    }
    let y: Vec<f64> = (0..nrows)
        .map(|i| {
            let v = ((i * 2654435761) % 10_000) as f64 / 10_000.0;
            v.sin() + ((i % 7) as f64) * 0.1
        })
        .collect();
    (Frame::new(cols, 4096).unwrap(), y)
}

pub fn training_benchmarks(c: &mut Criterion) {
    let (frame, y) = synthetic(100_000, 10);

    c.bench_function("Train GBM gaussian", |b| {
        b.iter(|| {
            let mut gbm = Gbm::new(Family::Gaussian).set_ntrees(5).set_max_depth(5);
            gbm.fit(black_box(&frame), black_box(&y), None, None).unwrap();
            gbm.trees.len()
        })
    });

    c.bench_function("Train GBM shared histograms", |b| {
        b.iter(|| {
            let mut gbm = Gbm::new(Family::Gaussian).set_ntrees(5).set_max_depth(5);
            gbm.histo.shared_histo = true;
            gbm.fit(black_box(&frame), black_box(&y), None, None).unwrap();
            gbm.trees.len()
        })
    });
}

criterion_group!(benches, training_benchmarks);
criterion_main!(benches);
