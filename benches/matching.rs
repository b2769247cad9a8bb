use argent_profile::callsite::{CallSiteChain, InlinedCallSite};
use argent_profile::location::{ByteCodeLocation, MethodId, NO_CALLER};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

/// A linear chain `depth` levels deep: each method inlined into the previous
fn deep_chain(depth: usize) -> CallSiteChain {
    let mut entries = Vec::with_capacity(depth);
    for i in 0..depth {
        let caller = if i == 0 { NO_CALLER } else { (i - 1) as i32 };
        entries.push(InlinedCallSite {
            callee: MethodId(100 + i as u64),
            at_caller: ByteCodeLocation::new(caller, (i * 8) as u32),
        });
    }
    CallSiteChain::new(entries)
}

fn bench_exact_match(c: &mut Criterion) {
    let chain = deep_chain(32);
    let loc = ByteCodeLocation::new(31, 4);
    c.bench_function("exact_match_depth_32", |b| {
        b.iter(|| {
            CallSiteChain::exact_match(
                black_box(loc),
                black_box(&chain),
                black_box(loc),
                black_box(&chain),
            )
        })
    });
}

fn bench_partial_match(c: &mut Criterion) {
    let a = deep_chain(32);
    let mut entries = a.entries().to_vec();
    // Diverge halfway up.
    entries[16].at_caller = ByteCodeLocation::new(15, 9999);
    let b_chain = CallSiteChain::new(entries);
    let loc = ByteCodeLocation::new(31, 4);
    c.bench_function("partial_match_depth_32", |b| {
        b.iter(|| {
            CallSiteChain::partial_match_depth(
                black_box(loc),
                black_box(&a),
                black_box(loc),
                black_box(&b_chain),
            )
        })
    });
}

fn bench_graft_search(c: &mut Criterion) {
    let chain = deep_chain(32);
    let stack = chain.call_stack_of(ByteCodeLocation::new(31, 4));
    c.bench_function("graft_search_depth_32", |b| {
        b.iter(|| black_box(&chain).graft_search(black_box(&stack)))
    });
}

criterion_group!(
    benches,
    bench_exact_match,
    bench_partial_match,
    bench_graft_search
);
criterion_main!(benches);
