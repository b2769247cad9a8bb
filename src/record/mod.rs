//! Profile records, their lifecycle, and the live-record registry
//!
//! A [`ProfileRecord`] aggregates everything profiled for one compiled
//! method body: the call-site chain, the block frequency store, the value
//! store, and a pair of catch/throw event counters. Records move through
//! four states: building (owned by the compilation, invisible), published
//! (linked into the [`ProfileRegistry`], readable by any thread), zero
//! referenced (eligible for reclamation) and reclaimed.
//!
//! The reference count is explicit: every reader takes a [`RecordGuard`]
//! before touching a published record, and the count reaching zero only
//! marks the record reclaimable; the registry sweep, run by exactly one
//! worker thread, performs the actual unlink.
//!
//! # Example
//! ```
//! use std::sync::Arc;
//! use argent_profile::callsite::CallSiteChain;
//! use argent_profile::location::MethodId;
//! use argent_profile::record::{ProfileRecord, RecordGuard};
//!
//! let record = ProfileRecord::new(MethodId(1), Arc::new(CallSiteChain::empty()));
//! {
//!     let guard = RecordGuard::new(record.clone());
//!     assert_eq!(guard.ref_count(), 2);
//! }
//! assert_eq!(record.ref_count(), 1);
//! ```

use crate::blocks::BlockFrequencyStore;
use crate::callsite::CallSiteChain;
use crate::location::MethodId;
use crate::values::ValueProfileStore;
use rustc_hash::FxHashMap as HashMap;
use std::fmt;
use std::ops::Deref;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicPtr, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, trace};

/// Simple per-record event counters bumped by instrumentation
#[derive(Debug, Default)]
pub struct EventCounters {
    catches: AtomicU32,
    throws: AtomicU32,
}

impl EventCounters {
    /// Count one caught exception
    pub fn record_catch(&self) {
        self.catches.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one thrown exception
    pub fn record_throw(&self) {
        self.throws.fetch_add(1, Ordering::Relaxed);
    }

    /// Caught-exception count
    pub fn catches(&self) -> u32 {
        self.catches.load(Ordering::Relaxed)
    }

    /// Thrown-exception count
    pub fn throws(&self) -> u32 {
        self.throws.load(Ordering::Relaxed)
    }

    pub(crate) fn preset(catches: u32, throws: u32) -> Self {
        Self {
            catches: AtomicU32::new(catches),
            throws: AtomicU32::new(throws),
        }
    }
}

struct RecordInner {
    chain: Arc<CallSiteChain>,
    blocks: Option<Arc<BlockFrequencyStore>>,
    values: Option<Arc<ValueProfileStore>>,
}

/// All profiling state owned by one compiled method body
pub struct ProfileRecord {
    method: MethodId,
    inner: Mutex<RecordInner>,
    events: EventCounters,
    /// Starts at 1 (the owning compiled body); readers add increments
    ref_count: AtomicI32,
    published: AtomicBool,
    active: AtomicBool,
}

impl fmt::Debug for ProfileRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProfileRecord")
            .field("method", &self.method)
            .field("ref_count", &self.ref_count())
            .field("published", &self.is_published())
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}

impl ProfileRecord {
    /// Fresh building-state record; the count of 1 belongs to the owning
    /// compiled body
    pub fn new(method: MethodId, chain: Arc<CallSiteChain>) -> Arc<Self> {
        Arc::new(Self {
            method,
            inner: Mutex::new(RecordInner {
                chain,
                blocks: None,
                values: None,
            }),
            events: EventCounters::default(),
            ref_count: AtomicI32::new(1),
            published: AtomicBool::new(false),
            active: AtomicBool::new(false),
        })
    }

    pub(crate) fn from_parts(
        method: MethodId,
        chain: Arc<CallSiteChain>,
        blocks: Option<BlockFrequencyStore>,
        events: EventCounters,
    ) -> Arc<Self> {
        Arc::new(Self {
            method,
            inner: Mutex::new(RecordInner {
                chain,
                blocks: blocks.map(Arc::new),
                values: None,
            }),
            events,
            ref_count: AtomicI32::new(1),
            published: AtomicBool::new(false),
            active: AtomicBool::new(false),
        })
    }

    /// Method this record profiles
    pub fn method(&self) -> MethodId {
        self.method
    }

    /// The record's current chain
    pub fn chain(&self) -> Arc<CallSiteChain> {
        self.inner.lock().unwrap().chain.clone()
    }

    /// Ready the record for a (re-)instrumenting compilation under `chain`
    ///
    /// A committed chain of the same size is kept as is; a size change
    /// replaces the chain wholesale, which is only legal while no store
    /// built against the old chain exists.
    pub fn prepare(&self, chain: Arc<CallSiteChain>) {
        let mut inner = self.inner.lock().unwrap();
        if inner.chain.len() == chain.len() {
            return;
        }
        assert!(
            inner.blocks.is_none() && inner.values.is_none(),
            "cannot replace the chain of a record with live stores"
        );
        inner.chain = chain;
    }

    /// Install the block store built for this record, once
    ///
    /// Returns the already-installed store on a second call; panics if the
    /// store was built against a different chain object.
    pub fn install_blocks(&self, blocks: BlockFrequencyStore) -> Arc<BlockFrequencyStore> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(existing) = &inner.blocks {
            return existing.clone();
        }
        assert!(
            Arc::ptr_eq(blocks.chain(), &inner.chain),
            "block store built against a foreign chain"
        );
        let blocks = Arc::new(blocks);
        inner.blocks = Some(blocks.clone());
        blocks
    }

    /// The block store, if one was installed
    pub fn blocks(&self) -> Option<Arc<BlockFrequencyStore>> {
        self.inner.lock().unwrap().blocks.clone()
    }

    /// The value store, created lazily on first use
    pub fn get_or_create_values(&self) -> Arc<ValueProfileStore> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(values) = &inner.values {
            return values.clone();
        }
        let values = Arc::new(ValueProfileStore::new(inner.chain.clone(), self.method));
        inner.values = Some(values.clone());
        values
    }

    /// The value store, if one exists
    pub fn values(&self) -> Option<Arc<ValueProfileStore>> {
        self.inner.lock().unwrap().values.clone()
    }

    /// Catch/throw event counters
    pub fn events(&self) -> &EventCounters {
        &self.events
    }

    /// Current reference count
    pub fn ref_count(&self) -> i32 {
        self.ref_count.load(Ordering::Acquire)
    }

    /// Take a reference; the caller must already hold one (a record at zero
    /// is awaiting reclamation and must not come back)
    pub fn inc_ref(&self) {
        let previous = self.ref_count.fetch_add(1, Ordering::AcqRel);
        assert!(previous > 0, "reviving a zero-referenced record");
    }

    /// Drop a reference
    ///
    /// Reaching zero only marks the record eligible; the registry sweep
    /// frees it. Going below zero is a double release and fatal.
    pub fn dec_ref(&self) {
        let previous = self.ref_count.fetch_sub(1, Ordering::AcqRel);
        assert!(previous > 0, "reference count underflow");
        if previous == 1 {
            trace!(method = %self.method, "record reached zero references");
        }
    }

    /// Whether the record has been pushed to the registry
    pub fn is_published(&self) -> bool {
        self.published.load(Ordering::Acquire)
    }

    /// Whether the owning compiled body is still installed
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Mark the owning body installed or discarded; only active records get
    /// the worker's value-eviction pass
    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    fn mark_published(&self) {
        let was = self.published.swap(true, Ordering::AcqRel);
        assert!(!was, "record published twice");
        self.active.store(true, Ordering::Release);
    }
}

/// RAII reference to a published record
///
/// Takes an increment on construction and releases it on drop, so every
/// path out of a reader releases exactly once.
pub struct RecordGuard {
    record: Arc<ProfileRecord>,
}

impl RecordGuard {
    /// Guard an additional reference to `record`
    pub fn new(record: Arc<ProfileRecord>) -> Self {
        record.inc_ref();
        Self { record }
    }

    /// The underlying shared record
    pub fn record(&self) -> &Arc<ProfileRecord> {
        &self.record
    }
}

impl Deref for RecordGuard {
    type Target = ProfileRecord;

    fn deref(&self) -> &ProfileRecord {
        &self.record
    }
}

impl Clone for RecordGuard {
    fn clone(&self) -> Self {
        Self::new(self.record.clone())
    }
}

impl Drop for RecordGuard {
    fn drop(&mut self) {
        self.record.dec_ref();
    }
}

struct RegistryNode {
    record: Arc<ProfileRecord>,
    next: AtomicPtr<RegistryNode>,
}

/// Process-wide list of all published records
///
/// Push is a lock-free CAS loop callable from any compilation thread.
/// Traversal and unlink happen only on the reclamation worker thread; that
/// confinement is what keeps the raw-pointer list sound, since no two
/// threads ever race to detach the same node and a detached node is freed
/// by the thread that detached it.
pub struct ProfileRegistry {
    head: AtomicPtr<RegistryNode>,
    footprint: AtomicUsize,
}

impl Default for ProfileRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProfileRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            footprint: AtomicUsize::new(0),
        }
    }

    /// Number of records currently linked
    pub fn footprint(&self) -> usize {
        self.footprint.load(Ordering::Relaxed)
    }

    /// Transition `record` from building to published and link it
    pub fn publish(&self, record: &Arc<ProfileRecord>) {
        record.mark_published();
        let node = Box::into_raw(Box::new(RegistryNode {
            record: record.clone(),
            next: AtomicPtr::new(ptr::null_mut()),
        }));
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            // Safety: the node is not yet reachable by anyone else.
            unsafe { (*node).next.store(head, Ordering::Relaxed) };
            match self
                .head
                .compare_exchange_weak(head, node, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(current) => head = current,
            }
        }
        self.footprint.fetch_add(1, Ordering::Relaxed);
        debug!(method = %record.method(), footprint = self.footprint(), "published profile record");
    }

    /// Worker-only pass: unlink and free zero-referenced records, invoke
    /// `on_live` for the rest; returns how many were reclaimed
    ///
    /// Must only ever run on one thread at a time. A zero-referenced node
    /// whose unlink CAS loses against a concurrent push stays linked and is
    /// picked up by the next cycle.
    pub(crate) fn sweep(&self, mut on_live: impl FnMut(&ProfileRecord)) -> usize {
        let mut reclaimed = 0;
        let mut prev_link: &AtomicPtr<RegistryNode> = &self.head;
        let mut cur = prev_link.load(Ordering::Acquire);
        while !cur.is_null() {
            // Safety: linked nodes are freed only by this function, on this
            // thread, and only after the detaching CAS below succeeds.
            let node = unsafe { &*cur };
            let next = node.next.load(Ordering::Acquire);
            if node.record.ref_count() == 0 {
                match prev_link.compare_exchange(cur, next, Ordering::AcqRel, Ordering::Acquire) {
                    Ok(_) => {
                        // Detached; nothing can reach the node any more.
                        trace!(method = %node.record.method(), "reclaiming profile record");
                        drop(unsafe { Box::from_raw(cur) });
                        self.footprint.fetch_sub(1, Ordering::Relaxed);
                        reclaimed += 1;
                        cur = next;
                        continue;
                    }
                    Err(_) => {
                        // A push moved the head under us; keep the node for
                        // the next cycle.
                        prev_link = &node.next;
                        cur = next;
                        continue;
                    }
                }
            }
            on_live(&node.record);
            prev_link = &node.next;
            cur = next;
        }
        reclaimed
    }
}

impl Drop for ProfileRegistry {
    fn drop(&mut self) {
        // Exclusive access; free every node regardless of reference counts.
        let mut cur = *self.head.get_mut();
        while !cur.is_null() {
            let node = unsafe { Box::from_raw(cur) };
            cur = node.next.load(Ordering::Relaxed);
        }
    }
}

// The raw head pointer is only mutated through CAS and the worker-confined
// sweep; the nodes themselves hold Arc'd records.
unsafe impl Send for ProfileRegistry {}
unsafe impl Sync for ProfileRegistry {}

#[derive(Default)]
struct MethodProfiles {
    recent: Option<RecordGuard>,
    best: Option<RecordGuard>,
}

/// Per-method choice of which live record readers should consult
///
/// The policy is a plain recency bias: whenever a newer record exists for a
/// method, it becomes the best one and the outgoing best releases its
/// reference. A statistically weighted comparison would slot in here.
#[derive(Default)]
pub struct ProfileSelector {
    table: Mutex<HashMap<MethodId, MethodProfiles>>,
}

impl ProfileSelector {
    /// Empty selector
    pub fn new() -> Self {
        Self::default()
    }

    /// Note a freshly published record for its method
    pub fn on_published(&self, record: &Arc<ProfileRecord>) {
        let mut table = self.table.lock().unwrap();
        let entry = table.entry(record.method()).or_default();
        entry.recent = Some(RecordGuard::new(record.clone()));
    }

    /// The record readers should consult for `method`, if any
    ///
    /// `current` is the record of the compilation doing the asking; it is
    /// never returned, since a compilation must not profile itself from its
    /// own in-progress data.
    pub fn get(&self, method: MethodId, current: Option<&ProfileRecord>) -> Option<RecordGuard> {
        let mut table = self.table.lock().unwrap();
        let entry = table.get_mut(&method)?;

        if let Some(recent) = &entry.recent {
            let differs = match &entry.best {
                Some(best) => !Arc::ptr_eq(best.record(), recent.record()),
                None => true,
            };
            if differs {
                debug!(method = %method, "replacing best profile with most recent");
                entry.best = Some(recent.clone());
            }
        }

        let best = entry.best.as_ref()?;
        if let Some(current) = current {
            if ptr::eq::<ProfileRecord>(&**best.record(), current) {
                return None;
            }
        }
        Some(best.clone())
    }

    /// Drop the selector's references for `method`
    pub fn forget(&self, method: MethodId) {
        self.table.lock().unwrap().remove(&method);
    }
}
