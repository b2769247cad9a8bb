//! End-to-end tests across compilations: grafting, fallbacks, lifecycle

use argent_profile::blocks::{
    BlockEntry, BlockFrequencyStore, DerivationPair, DerivationSlot, FrequencyQuery, QueryContext,
};
use argent_profile::callsite::{CallSiteChain, InlinedCallSite};
use argent_profile::external::{ExternalProfiler, ProfileResolver};
use argent_profile::location::{ByteCodeLocation, MethodId};
use argent_profile::record::{ProfileRecord, ProfileRegistry, ProfileSelector, RecordGuard};
use argent_profile::values::ValueHistogram;
use rustc_hash::FxHashMap as HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

const ROOT: MethodId = MethodId(1);
const BAR: MethodId = MethodId(2);
const CALL_OFFSET: u32 = 40;

struct MapResolver {
    records: HashMap<MethodId, Arc<ProfileRecord>>,
}

impl ProfileResolver for MapResolver {
    fn record_for(&self, method: MethodId) -> Option<RecordGuard> {
        self.records
            .get(&method)
            .map(|record| RecordGuard::new(record.clone()))
    }
}

struct FixedExternal {
    frequency: u32,
}

impl ExternalProfiler for FixedExternal {
    fn frequency(&self, _method: MethodId, _offset: u32) -> Option<u32> {
        Some(self.frequency)
    }

    fn value_histogram(&self, _method: MethodId, _offset: u32) -> Option<ValueHistogram> {
        None
    }
}

/// Compilation A of `root`: `bar` inlined at CALL_OFFSET, fully profiled
fn compile_a() -> (Arc<ProfileRecord>, Arc<CallSiteChain>) {
    let chain = Arc::new(CallSiteChain::new(vec![InlinedCallSite {
        callee: BAR,
        at_caller: ByteCodeLocation::outermost(CALL_OFFSET),
    }]));
    let record = ProfileRecord::new(ROOT, chain.clone());
    let blocks = record.install_blocks(BlockFrequencyStore::direct(
        chain.clone(),
        vec![
            BlockEntry::at(ByteCodeLocation::outermost(0)),
            BlockEntry::at(ByteCodeLocation::new(0, 0)), // bar's entry
            BlockEntry::at(ByteCodeLocation::new(0, 16)), // inside bar
        ],
        0,
    ));
    blocks.record_slot(0).store(1000, Ordering::Relaxed);
    blocks.record_slot(1).store(1000, Ordering::Relaxed); // bar entered 1000x
    blocks.record_slot(2).store(500, Ordering::Relaxed);
    (record, chain)
}

/// Compilation B of `root`: `bar` stays a call, counters minimized
fn compile_b() -> (Arc<ProfileRecord>, Arc<CallSiteChain>) {
    let chain = Arc::new(CallSiteChain::empty());
    let record = ProfileRecord::new(ROOT, chain.clone());
    let blocks = record.install_blocks(BlockFrequencyStore::derived(
        chain.clone(),
        vec![
            BlockEntry::at(ByteCodeLocation::outermost(0)),
            BlockEntry::at(ByteCodeLocation::outermost(CALL_OFFSET)),
        ],
        2,
        vec![
            DerivationPair {
                add: DerivationSlot::Direct(0),
                sub: DerivationSlot::Absent,
            },
            DerivationPair {
                add: DerivationSlot::Direct(1),
                sub: DerivationSlot::Absent,
            },
        ],
        0,
    ));
    blocks.record_slot(0).store(2000, Ordering::Relaxed);
    blocks.record_slot(1).store(600, Ordering::Relaxed); // bar called 600x
    (record, chain)
}

#[test]
fn grafting_scales_foreign_counts() {
    let (record_a, chain_a) = compile_a();
    let (record_b, _chain_b) = compile_b();

    let mut records = HashMap::default();
    records.insert(BAR, record_a.clone());
    let resolver = MapResolver { records };

    // The logical point inside bar, expressed under A's inlining shape.
    let query = FrequencyQuery {
        method: BAR,
        location: ByteCodeLocation::new(0, 16),
        chain: &chain_a,
        normalize_across_callers: true,
    };
    let ctx = QueryContext {
        resolver: Some(&resolver),
        external: None,
    };

    let blocks_b = record_b.blocks().unwrap();
    // A saw 500 at the point with 1000 entries into bar; B called bar 600
    // times, so the projection is 500 * 600 / 1000 = 300 raw, then scaled
    // against B's max of 2000.
    assert_eq!(blocks_b.frequency(&query, &ctx), Some(1500));

    // A's own store answers the same query directly, unscaled.
    let blocks_a = record_a.blocks().unwrap();
    assert_eq!(blocks_a.frequency(&query, &QueryContext::empty()), Some(5000));
}

#[test]
fn grafting_needs_a_resolvable_record() {
    let (_, chain_a) = compile_a();
    let (record_b, _) = compile_b();
    let query = FrequencyQuery {
        method: BAR,
        location: ByteCodeLocation::new(0, 16),
        chain: &chain_a,
        normalize_across_callers: true,
    };
    let blocks_b = record_b.blocks().unwrap();
    assert_eq!(blocks_b.frequency(&query, &QueryContext::empty()), None);
}

#[test]
fn external_profiler_is_the_last_resort() {
    let (_, chain_a) = compile_a();
    let (record_b, _) = compile_b();
    let external = FixedExternal { frequency: 777 };
    let resolver = MapResolver {
        records: HashMap::default(), // nothing to graft through
    };
    let query = FrequencyQuery {
        method: BAR,
        location: ByteCodeLocation::new(0, 16),
        chain: &chain_a,
        normalize_across_callers: true,
    };
    let ctx = QueryContext {
        resolver: Some(&resolver),
        external: Some(&external),
    };
    let blocks_b = record_b.blocks().unwrap();
    assert_eq!(blocks_b.frequency(&query, &ctx), Some(777));
}

#[test]
fn grafting_balances_reference_counts() {
    let (record_a, chain_a) = compile_a();
    let (record_b, _) = compile_b();

    let mut records = HashMap::default();
    records.insert(BAR, record_a.clone());
    let resolver = MapResolver { records };

    let before = record_a.ref_count();
    let query = FrequencyQuery {
        method: BAR,
        location: ByteCodeLocation::new(0, 16),
        chain: &chain_a,
        normalize_across_callers: true,
    };
    let ctx = QueryContext {
        resolver: Some(&resolver),
        external: None,
    };
    let blocks_b = record_b.blocks().unwrap();
    assert!(blocks_b.frequency(&query, &ctx).is_some());
    // The guard taken inside the graft walk was released on every path.
    assert_eq!(record_a.ref_count(), before);
}

#[test]
fn selector_hands_out_guarded_records() {
    let registry = ProfileRegistry::new();
    let selector = ProfileSelector::new();
    let (record, chain) = compile_a();
    registry.publish(&record);
    selector.on_published(&record);

    let guard = selector.get(ROOT, None).expect("published record");
    let blocks = guard.blocks().unwrap();
    let query = FrequencyQuery {
        method: ROOT,
        location: ByteCodeLocation::outermost(0),
        chain: &chain,
        normalize_across_callers: true,
    };
    assert_eq!(blocks.frequency(&query, &QueryContext::empty()), Some(10000));

    // The record currently being compiled never profiles itself.
    assert!(selector.get(ROOT, Some(&record)).is_none());
}

#[test]
fn reclamation_waits_for_readers() {
    use argent_profile::reclaim::{ReclaimConfig, ReclamationWorker};
    use std::time::{Duration, Instant};

    let registry = Arc::new(ProfileRegistry::new());
    let (record, _) = compile_a();
    registry.publish(&record);

    let worker = ReclamationWorker::start(
        registry.clone(),
        ReclaimConfig {
            interval: Duration::from_millis(10),
            ..ReclaimConfig::default()
        },
    );

    let guard = RecordGuard::new(record.clone());
    record.dec_ref(); // the owning body is discarded
    std::thread::sleep(Duration::from_millis(100));
    // A reader still holds a reference, so the record survives.
    assert_eq!(registry.footprint(), 1);

    drop(guard);
    let deadline = Instant::now() + Duration::from_secs(5);
    while registry.footprint() != 0 {
        assert!(Instant::now() < deadline, "record was never reclaimed");
        std::thread::sleep(Duration::from_millis(5));
    }
    worker.stop();
}
