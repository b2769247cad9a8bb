//! Per-location value histograms
//!
//! A [`ValueProfileStore`] maps `(location, kind, source)` to a profiling
//! site holding the values instrumentation observed there. Three writable
//! backing representations exist (bounded list, bounded array, fixed-capacity
//! hash table) plus a read-only cache of interpreter-sourced histograms; all
//! of them answer reads through the same [`ValueHistogram`] view, so
//! consumers never see the internal shape.
//!
//! List and array sites keep a bounded number of distinct values and evict
//! the least frequent on overflow. Hash-table sites never resize; overflowing
//! samples land in an `other` bucket, and a background eviction pass clears
//! whole slots atomically while instrumentation keeps inserting.
//!
//! # Example
//! ```
//! use std::sync::Arc;
//! use argent_profile::callsite::CallSiteChain;
//! use argent_profile::location::{ByteCodeLocation, MethodId};
//! use argent_profile::values::{ProfiledValue, ValueKind, ValueProfileStore, ValueSource};
//!
//! let store = ValueProfileStore::new(Arc::new(CallSiteChain::empty()), MethodId(1));
//! let site = store
//!     .get_or_create(
//!         ByteCodeLocation::outermost(4),
//!         ValueKind::Address,
//!         ValueSource::BoundedList,
//!         None,
//!     )
//!     .unwrap();
//! site.record(ProfiledValue::Word(0xbeef));
//! site.record(ProfiledValue::Word(0xbeef));
//! assert_eq!(site.histogram(None).top().unwrap().1, 2);
//! ```

use crate::callsite::CallSiteChain;
use crate::external::ExternalProfiler;
use crate::location::{ByteCodeLocation, MethodId};
use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Most distinct values a bounded-list site keeps
pub const LIST_MAX_VALUES: usize = 20;
/// Most distinct values a bounded-array site keeps
pub const ARRAY_MAX_VALUES: usize = 5;
/// Slot count of a hash-table site (never resized)
pub const TABLE_CAPACITY: usize = 32;
/// Count given to a seeded initial value
pub const SEED_FREQUENCY: u32 = 10;

const EMPTY_KEY: u64 = u64::MAX;

/// What shape of value a site records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ValueKind {
    /// 32-bit integers (zero-extended into the word)
    Int32,
    /// 64-bit integers
    Int64,
    /// Machine addresses (receiver classes, call targets)
    Address,
    /// Decomposed arbitrary-precision numerics
    DecomposedNumeric,
    /// Decomposed text shapes
    DecomposedText,
}

impl ValueKind {
    /// Whether values of this kind fit in a single machine word
    pub fn is_word(self) -> bool {
        matches!(self, ValueKind::Int32 | ValueKind::Int64 | ValueKind::Address)
    }
}

/// Which backing representation a site uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ValueSource {
    /// Bounded list of distinct values, any kind
    BoundedList,
    /// Bounded inline array, word kinds only
    BoundedArray,
    /// Fixed-capacity open-addressed table, word kinds only
    HashTable,
    /// Read-only histogram fetched from the interpreter profiler
    ExternalInterpreter,
}

/// One observed value
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum ProfiledValue {
    /// Word-sized value (int32, int64, address)
    Word(u64),
    /// Decomposed payload for the non-word kinds
    Bytes(Box<[u8]>),
}

/// Uniform read view over any backing representation
///
/// Entries are ordered by descending count. For table-backed sites
/// `total_samples` also covers overflowed and evicted samples through the
/// `other` bucket; list and array sites count only the entries they kept,
/// so a value displaced on overflow takes its samples with it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValueHistogram {
    /// Distinct values with their observed counts, most frequent first
    pub entries: Vec<(ProfiledValue, u64)>,
    /// Samples the site can account for; see the type docs for what each
    /// backing includes
    pub total_samples: u64,
}

impl ValueHistogram {
    /// Most frequent entry, if any sample was recorded
    pub fn top(&self) -> Option<&(ProfiledValue, u64)> {
        self.entries.first()
    }

    /// Share of all samples the top entry accounts for, 0.0 when empty
    pub fn top_probability(&self) -> f64 {
        match (self.top(), self.total_samples) {
            (Some((_, count)), total) if total > 0 => *count as f64 / total as f64,
            _ => 0.0,
        }
    }
}

#[derive(Debug, Default)]
struct BoundedBacking {
    entries: Vec<(ProfiledValue, u32)>,
}

impl BoundedBacking {
    fn record(&mut self, value: ProfiledValue, weight: u32, capacity: usize) {
        if let Some(entry) = self.entries.iter_mut().find(|(v, _)| *v == value) {
            entry.1 = entry.1.saturating_add(weight);
            return;
        }
        if self.entries.len() < capacity {
            self.entries.push((value, weight));
            return;
        }
        // Full. The least frequent entry makes room for the newcomer.
        let min = self
            .entries
            .iter()
            .enumerate()
            .min_by_key(|(_, (_, count))| *count)
            .map(|(i, _)| i);
        if let Some(i) = min {
            self.entries[i] = (value, weight);
        }
    }

    fn histogram(&self) -> ValueHistogram {
        let mut entries: Vec<(ProfiledValue, u64)> = self
            .entries
            .iter()
            .map(|(v, c)| (v.clone(), *c as u64))
            .collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1));
        let total_samples = entries.iter().map(|(_, c)| c).sum();
        ValueHistogram {
            entries,
            total_samples,
        }
    }
}

struct TableSlot {
    key: AtomicU64,
    count: AtomicU32,
}

/// Open-addressed table mutated by instrumentation concurrently with the
/// worker's eviction pass. Slots are only ever cleared whole, never moved,
/// so a racing insert can at worst land in a slot being cleared and lose
/// its sample.
struct TableBacking {
    slots: Box<[TableSlot]>,
    other: AtomicU32,
}

impl TableBacking {
    fn new() -> Self {
        Self {
            slots: (0..TABLE_CAPACITY)
                .map(|_| TableSlot {
                    key: AtomicU64::new(EMPTY_KEY),
                    count: AtomicU32::new(0),
                })
                .collect(),
            other: AtomicU32::new(0),
        }
    }

    fn slot_of(key: u64) -> usize {
        // Fibonacci hashing; capacity is a power of two.
        (key.wrapping_mul(0x9e37_79b9_7f4a_7c15) >> 32) as usize % TABLE_CAPACITY
    }

    fn record(&self, key: u64, weight: u32) {
        debug_assert_ne!(key, EMPTY_KEY, "sentinel key cannot be profiled");
        let start = Self::slot_of(key);
        for probe in 0..TABLE_CAPACITY {
            let slot = &self.slots[(start + probe) % TABLE_CAPACITY];
            let current = slot.key.load(Ordering::Relaxed);
            if current == key {
                slot.count.fetch_add(weight, Ordering::Relaxed);
                return;
            }
            if current == EMPTY_KEY {
                match slot.key.compare_exchange(
                    EMPTY_KEY,
                    key,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        slot.count.fetch_add(weight, Ordering::Relaxed);
                        return;
                    }
                    Err(actual) if actual == key => {
                        slot.count.fetch_add(weight, Ordering::Relaxed);
                        return;
                    }
                    // Someone claimed the slot for a different key.
                    Err(_) => continue,
                }
            }
        }
        self.other.fetch_add(weight, Ordering::Relaxed);
    }

    fn matched_samples(&self) -> u64 {
        self.slots
            .iter()
            .map(|s| s.count.load(Ordering::Relaxed) as u64)
            .sum()
    }

    fn is_full(&self) -> bool {
        self.slots
            .iter()
            .all(|s| s.key.load(Ordering::Relaxed) != EMPTY_KEY)
    }

    fn clear_slot(slot: &TableSlot) {
        slot.key.store(EMPTY_KEY, Ordering::Relaxed);
        slot.count.store(0, Ordering::Relaxed);
    }

    fn evict_low_frequency(&self, threshold_ratio: f64) -> bool {
        if !self.is_full() {
            return false;
        }
        let total = self.matched_samples() + self.other.load(Ordering::Relaxed) as u64;
        let floor = threshold_ratio * total as f64;
        let mut changed = false;
        for slot in self.slots.iter() {
            if slot.key.load(Ordering::Relaxed) == EMPTY_KEY {
                continue;
            }
            if (slot.count.load(Ordering::Relaxed) as f64) < floor {
                Self::clear_slot(slot);
                changed = true;
            }
        }
        changed
    }

    fn reset_if_dominated(&self) -> bool {
        let matched = self.matched_samples();
        let other = self.other.load(Ordering::Relaxed) as u64;
        if 2 * matched >= other {
            return false;
        }
        for slot in self.slots.iter() {
            Self::clear_slot(slot);
        }
        self.other.store(0, Ordering::Relaxed);
        true
    }

    fn histogram(&self) -> ValueHistogram {
        let mut entries: Vec<(ProfiledValue, u64)> = Vec::new();
        for slot in self.slots.iter() {
            let key = slot.key.load(Ordering::Relaxed);
            let count = slot.count.load(Ordering::Relaxed);
            if key != EMPTY_KEY && count > 0 {
                entries.push((ProfiledValue::Word(key), count as u64));
            }
        }
        entries.sort_by(|a, b| b.1.cmp(&a.1));
        let matched: u64 = entries.iter().map(|(_, c)| c).sum();
        ValueHistogram {
            entries,
            total_samples: matched + self.other.load(Ordering::Relaxed) as u64,
        }
    }
}

enum Backing {
    List(Mutex<BoundedBacking>),
    Array(Mutex<BoundedBacking>),
    Table(TableBacking),
    External(Mutex<Option<ValueHistogram>>),
}

/// One profiling site: a `(location, kind, source)` triple with its backing
pub struct ValueSite {
    location: ByteCodeLocation,
    kind: ValueKind,
    source: ValueSource,
    /// Method containing `location`, used to query the interpreter profiler
    method: MethodId,
    backing: Backing,
}

impl ValueSite {
    /// Program point this site observes
    pub fn location(&self) -> ByteCodeLocation {
        self.location
    }

    /// Kind of value recorded here
    pub fn kind(&self) -> ValueKind {
        self.kind
    }

    /// Backing representation of this site
    pub fn source(&self) -> ValueSource {
        self.source
    }

    /// Record one observation of `value`
    ///
    /// Ignored on interpreter-sourced sites, which are read-only to the
    /// compiler, and on word-only backings handed a byte payload.
    pub fn record(&self, value: ProfiledValue) {
        self.record_weighted(value, 1);
    }

    fn record_weighted(&self, value: ProfiledValue, weight: u32) {
        match &self.backing {
            Backing::List(list) => {
                let mut list = list.lock().unwrap();
                list.record(value, weight, LIST_MAX_VALUES);
            }
            Backing::Array(array) => {
                let ProfiledValue::Word(_) = value else {
                    debug_assert!(false, "array sites hold word values only");
                    return;
                };
                let mut array = array.lock().unwrap();
                array.record(value, weight, ARRAY_MAX_VALUES);
            }
            Backing::Table(table) => {
                let ProfiledValue::Word(key) = value else {
                    debug_assert!(false, "table sites hold word values only");
                    return;
                };
                table.record(key, weight);
            }
            Backing::External(_) => {
                debug_assert!(false, "interpreter-sourced sites are read-only");
            }
        }
    }

    /// Uniform top-K view of this site
    ///
    /// Interpreter-sourced sites fetch through `external` on first read and
    /// cache the result for the life of the record.
    pub fn histogram(&self, external: Option<&dyn ExternalProfiler>) -> ValueHistogram {
        match &self.backing {
            Backing::List(list) => list.lock().unwrap().histogram(),
            Backing::Array(array) => array.lock().unwrap().histogram(),
            Backing::Table(table) => table.histogram(),
            Backing::External(cache) => {
                let mut cache = cache.lock().unwrap();
                if cache.is_none() {
                    *cache = external
                        .and_then(|ext| ext.value_histogram(self.method, self.location.offset));
                }
                cache.clone().unwrap_or_default()
            }
        }
    }

    /// Whether a hash-table site has no empty slot left
    pub fn is_full(&self) -> bool {
        match &self.backing {
            Backing::Table(table) => table.is_full(),
            _ => false,
        }
    }

    /// Drop table entries whose count falls below `threshold_ratio` of the
    /// site's total samples; reports whether anything was removed
    ///
    /// Only full hash-table sites are eligible; list and array sites
    /// self-evict on insert. Running twice with no intervening inserts is a
    /// no-op the second time.
    pub fn evict_low_frequency(&self, threshold_ratio: f64) -> bool {
        match &self.backing {
            Backing::Table(table) => {
                let changed = table.evict_low_frequency(threshold_ratio);
                if changed {
                    debug!(location = %self.location, threshold_ratio, "evicted low-frequency values");
                }
                changed
            }
            _ => false,
        }
    }

    /// Clear a hash-table site whose overflow bucket dominates its kept
    /// entries, so future samples can repopulate it
    pub fn reset_if_dominated(&self) -> bool {
        match &self.backing {
            Backing::Table(table) => {
                let reset = table.reset_if_dominated();
                if reset {
                    debug!(location = %self.location, "reset value table dominated by unmatched samples");
                }
                reset
            }
            _ => false,
        }
    }
}

/// Per-compilation collection of value profiling sites
pub struct ValueProfileStore {
    chain: Arc<CallSiteChain>,
    root_method: MethodId,
    sites: Mutex<Vec<Arc<ValueSite>>>,
}

impl ValueProfileStore {
    /// Empty store for a compilation of `root_method` under `chain`
    pub fn new(chain: Arc<CallSiteChain>, root_method: MethodId) -> Self {
        Self {
            chain,
            root_method,
            sites: Mutex::new(Vec::new()),
        }
    }

    /// Chain this store's locations are recorded against
    pub fn chain(&self) -> &Arc<CallSiteChain> {
        &self.chain
    }

    fn method_of(&self, loc: ByteCodeLocation) -> MethodId {
        if loc.has_caller() {
            self.chain.entry(loc.caller_index as usize).callee
        } else {
            self.root_method
        }
    }

    /// Find the site for `(loc, kind, source)`, creating it if absent
    ///
    /// Returns `None` for unsupported combinations (non-word kinds on the
    /// array and table backings). `seed` pre-loads the new site with one
    /// value at [`SEED_FREQUENCY`].
    pub fn get_or_create(
        &self,
        loc: ByteCodeLocation,
        kind: ValueKind,
        source: ValueSource,
        seed: Option<ProfiledValue>,
    ) -> Option<Arc<ValueSite>> {
        let word_only = matches!(source, ValueSource::BoundedArray | ValueSource::HashTable);
        if word_only && !kind.is_word() {
            return None;
        }

        let mut sites = self.sites.lock().unwrap();
        if let Some(site) = sites
            .iter()
            .find(|s| {
                s.kind == kind
                    && s.source == source
                    && CallSiteChain::exact_match(s.location, &self.chain, loc, &self.chain)
            })
            .cloned()
        {
            return Some(site);
        }

        let backing = match source {
            ValueSource::BoundedList => Backing::List(Mutex::new(BoundedBacking::default())),
            ValueSource::BoundedArray => Backing::Array(Mutex::new(BoundedBacking::default())),
            ValueSource::HashTable => Backing::Table(TableBacking::new()),
            ValueSource::ExternalInterpreter => Backing::External(Mutex::new(None)),
        };
        let site = Arc::new(ValueSite {
            location: loc,
            kind,
            source,
            method: self.method_of(loc),
            backing,
        });
        if let Some(value) = seed {
            if source != ValueSource::ExternalInterpreter {
                site.record_weighted(value, SEED_FREQUENCY);
            }
        }
        sites.push(site.clone());
        Some(site)
    }

    /// Find an existing site for `(loc, kind, source)`
    ///
    /// With `allow_fuzzy`, a failed exact match falls back to the same-kind,
    /// same-source site with the deepest partial match against `loc`,
    /// requiring at least one matching ancestor level. Ties keep the first
    /// site found.
    pub fn lookup(
        &self,
        loc: ByteCodeLocation,
        kind: ValueKind,
        source: ValueSource,
        allow_fuzzy: bool,
    ) -> Option<Arc<ValueSite>> {
        let sites = self.sites.lock().unwrap();
        let mut best: Option<&Arc<ValueSite>> = None;
        let mut best_depth = 0;
        for site in sites.iter() {
            if site.kind != kind || site.source != source {
                continue;
            }
            if CallSiteChain::exact_match(site.location, &self.chain, loc, &self.chain) {
                return Some(site.clone());
            }
            if allow_fuzzy {
                let depth =
                    CallSiteChain::partial_match_depth(site.location, &self.chain, loc, &self.chain);
                if depth > best_depth {
                    best = Some(site);
                    best_depth = depth;
                }
            }
        }
        best.cloned()
    }

    /// Snapshot of all sites, for the reclamation worker's eviction pass
    /// and the debug dump
    pub fn sites(&self) -> Vec<Arc<ValueSite>> {
        self.sites.lock().unwrap().clone()
    }
}
