//! Voluntary context-switch benchmark
//!
//! Measures a full resume -> yield -> back-to-resumer round trip.

use criterion::{criterion_group, criterion_main, Criterion};

use strand_fiber::Fiber;

fn bench_switch(c: &mut Criterion) {
    c.bench_function("resume_yield_roundtrip", |b| {
        let fiber = Fiber::new(|| loop {
            Fiber::yield_to_ready();
        });
        b.iter(|| {
            fiber.resume();
        });
        // The looping fiber never terminates and a suspended fiber
        // cannot be dropped; leak it.
        std::mem::forget(fiber);
    });

    c.bench_function("create_run_destroy", |b| {
        b.iter(|| {
            let fiber = Fiber::with_stack_size(|| {}, 64 * 1024);
            fiber.resume();
        });
    });
}

criterion_group!(benches, bench_switch);
criterion_main!(benches);
