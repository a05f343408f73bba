use std::hint::black_box;

use blindsum::field::FieldParams;
use blindsum::session::simulate_exchange;
use blindsum_test_utils::{seeded_rng, study_config, vector};
use criterion::Criterion;
use num_bigint::BigUint;

pub fn sharing_benchmark(c: &mut Criterion) {
    let field = FieldParams::new(BigUint::from(1_000_000_007u64)).unwrap();
    let value = BigUint::from(123_456u32);
    let mut rng = seeded_rng(1);

    c.bench_function("split 10 fragments", |b| {
        b.iter(|| black_box(field.split(&value, 10, &mut rng).unwrap()))
    });

    let fragments = field.split(&value, 10, &mut rng).unwrap();
    c.bench_function("combine 10 fragments", |b| {
        b.iter(|| black_box(field.combine(&fragments)))
    });

    let bins: Vec<String> = (0..16).map(|i| format!("bin{i}")).collect();
    let bin_refs: Vec<&str> = bins.iter().map(String::as_str).collect();
    c.bench_function("full exchange 5 participants x 16 bins", |b| {
        b.iter(|| {
            let config = study_config(5, &bin_refs, 1_000_000_007);
            let inputs = (0..5)
                .map(|i| {
                    vector(
                        &bin_refs
                            .iter()
                            .map(|bin| (*bin, i as i64 + 1))
                            .collect::<Vec<_>>(),
                    )
                })
                .collect();
            black_box(simulate_exchange(config, inputs, &mut rng).unwrap())
        })
    });
}
