// ========================================================================================
//
//                       HD BATCH SCORING THROUGHPUT BENCHMARK
//
// ========================================================================================
//
// Measures how batch Mahalanobis scoring scales with the number of panels, parallel
// (rayon) against a plain sequential loop over the same fit.

use bioage::hd::{CohortRow, HdFit, ReferenceCohort, fit_reference_population};
use bioage::types::{PANEL_SIZE, Panel};
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};

/// Reference cohort size, roughly one NHANES cycle's complete-panel adults.
const COHORT_SIZE: usize = 5_000;
const BATCH_SIZES: [usize; 4] = [100, 1_000, 10_000, 100_000];

fn random_values(rng: &mut StdRng, noise: &Normal<f64>) -> [f64; PANEL_SIZE] {
    let centres = [4.3, 70.0, 0.85, 5.0, 1.2, 6.5, 30.0, 89.0, 13.0];
    let spreads = [0.3, 18.0, 0.15, 0.5, 0.6, 1.5, 6.0, 4.0, 0.8];
    let shared = noise.sample(rng);
    let mut values = [0.0; PANEL_SIZE];
    for j in 0..PANEL_SIZE {
        values[j] = centres[j] + spreads[j] * (0.4 * shared + noise.sample(rng));
    }
    values
}

fn setup(batch: usize) -> (HdFit, Vec<Panel>) {
    let mut rng = StdRng::seed_from_u64(42);
    let noise = Normal::new(0.0, 1.0).unwrap();
    let cohort: ReferenceCohort = (0..COHORT_SIZE)
        .map(|_| CohortRow::complete(random_values(&mut rng, &noise), Some(45.0)))
        .collect();
    let fit = fit_reference_population(&cohort).expect("synthetic cohort fits");
    let panels = (0..batch)
        .map(|_| Panel::from_values(random_values(&mut rng, &noise)).unwrap())
        .collect();
    (fit, panels)
}

fn bench_batch_scoring(c: &mut Criterion) {
    let mut group = c.benchmark_group("hd_batch_scoring");
    for &batch in &BATCH_SIZES {
        let (fit, panels) = setup(batch);
        group.throughput(Throughput::Elements(batch as u64));

        group.bench_with_input(BenchmarkId::new("rayon", batch), &panels, |b, panels| {
            b.iter(|| black_box(fit.score_batch(black_box(panels), false)))
        });
        group.bench_with_input(BenchmarkId::new("sequential", batch), &panels, |b, panels| {
            b.iter(|| {
                black_box(
                    panels
                        .iter()
                        .map(|p| fit.score(p, false))
                        .collect::<Vec<_>>(),
                )
            })
        });
    }
    group.finish();
}

fn bench_fit(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(7);
    let noise = Normal::new(0.0, 1.0).unwrap();
    let cohort: ReferenceCohort = (0..COHORT_SIZE)
        .map(|i| CohortRow::complete(random_values(&mut rng, &noise), Some(20.0 + (i % 60) as f64)))
        .collect();
    c.bench_function("hd_fit_reference_population", |b| {
        b.iter(|| fit_reference_population(black_box(&cohort)).unwrap())
    });
}

criterion_group!(benches, bench_batch_scoring, bench_fit);
criterion_main!(benches);
