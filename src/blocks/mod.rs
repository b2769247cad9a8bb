//! Block execution frequencies
//!
//! A [`BlockFrequencyStore`] holds one compilation's raw execution counters
//! plus an optional derivation table that reconstructs each logical block's
//! count from a minimized set of raw counters (sum of an add set minus sum
//! of a sub set). Instrumentation bumps the raw slots with relaxed atomics;
//! lost updates under contention are tolerated because every consumer treats
//! frequencies as advisory.
//!
//! Queries resolve through three layers: an exact match against this store's
//! own chain, a grafting walk that projects an estimate through other
//! records' stores when the inlining shape differs, and finally the external
//! interpreter profiler. Frequencies are reported in parts per 10000 of the
//! maximum observed count.
//!
//! # Example
//! ```
//! use std::sync::Arc;
//! use std::sync::atomic::Ordering;
//! use argent_profile::blocks::{BlockEntry, BlockFrequencyStore, FrequencyQuery, QueryContext};
//! use argent_profile::callsite::CallSiteChain;
//! use argent_profile::location::{ByteCodeLocation, MethodId};
//!
//! let chain = Arc::new(CallSiteChain::empty());
//! let store = BlockFrequencyStore::direct(
//!     chain.clone(),
//!     vec![BlockEntry::at(ByteCodeLocation::outermost(0))],
//!     0,
//! );
//! store.record_slot(0).fetch_add(42, Ordering::Relaxed);
//!
//! let query = FrequencyQuery {
//!     method: MethodId(1),
//!     location: ByteCodeLocation::outermost(0),
//!     chain: &chain,
//!     normalize_across_callers: true,
//! };
//! assert_eq!(store.frequency(&query, &QueryContext::empty()), Some(10000));
//! ```

use crate::callsite::CallSiteChain;
use crate::external::{ExternalProfiler, ProfileResolver};
use crate::location::{ByteCodeLocation, LocationFlags, MethodId, NO_CALLER};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Small bit set over raw counter indices, stored as u64 words
///
/// Local replacement for the usual fixed-universe bit vector; only the few
/// operations the derivation algebra needs.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BitSet {
    words: Vec<u64>,
}

impl BitSet {
    /// Empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `index` to the set, growing the word array as needed
    pub fn insert(&mut self, index: usize) {
        let word = index / 64;
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1u64 << (index % 64);
    }

    /// Whether `index` is in the set
    pub fn contains(&self, index: usize) -> bool {
        let word = index / 64;
        word < self.words.len() && self.words[word] & (1u64 << (index % 64)) != 0
    }

    /// Number of set indices
    pub fn len(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Whether no index is set
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    /// Iterate set indices in ascending order
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(wi, &w)| {
            (0..64).filter_map(move |bit| {
                if w & (1u64 << bit) != 0 {
                    Some(wi * 64 + bit)
                } else {
                    None
                }
            })
        })
    }

    /// Backing words, low indices first
    pub fn words(&self) -> &[u64] {
        &self.words
    }

    /// Reconstruct from backing words
    pub fn from_words(words: Vec<u64>) -> Self {
        Self { words }
    }
}

impl FromIterator<usize> for BitSet {
    fn from_iter<T: IntoIterator<Item = usize>>(iter: T) -> Self {
        let mut set = Self::new();
        for index in iter {
            set.insert(index);
        }
        set
    }
}

/// How one side of a logical block's count is reconstructed
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DerivationSlot {
    /// Contributes nothing
    #[default]
    Absent,
    /// The single raw counter at this index
    Direct(u32),
    /// Sum of the raw counters in the set (an empty set contributes 0)
    Set(BitSet),
}

/// Add and subtract slots for one logical block
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DerivationPair {
    /// Counters summed into the block's count
    pub add: DerivationSlot,
    /// Counters subtracted from the block's count
    pub sub: DerivationSlot,
}

/// One logical block: where it is, plus metadata bits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockEntry {
    /// Program point of the block's start
    pub location: ByteCodeLocation,
    /// Per-block metadata
    pub flags: LocationFlags,
}

impl BlockEntry {
    /// Entry with default flags
    pub fn at(location: ByteCodeLocation) -> Self {
        Self {
            location,
            flags: LocationFlags::default(),
        }
    }
}

/// A frequency question posed to a store
///
/// The location is interpreted under `chain`, which may belong to a
/// different compilation than the store being asked.
pub struct FrequencyQuery<'a> {
    /// Identity of the method containing `location` (innermost callee for
    /// inlined locations); used only for the external-profiler fallback
    pub method: MethodId,
    /// Program point being asked about
    pub location: ByteCodeLocation,
    /// Chain `location` was recorded against
    pub chain: &'a CallSiteChain,
    /// Scale against the store-wide maximum rather than the maximum among
    /// blocks sharing the matched block's caller index
    pub normalize_across_callers: bool,
}

/// Collaborators available to a frequency query
pub struct QueryContext<'a> {
    /// Maps a method to a record holding profile data for it (grafting)
    pub resolver: Option<&'a dyn ProfileResolver>,
    /// Interpreter-side profiler, the fallback of last resort
    pub external: Option<&'a dyn ExternalProfiler>,
}

impl<'a> QueryContext<'a> {
    /// Context with no collaborators; queries resolve from this store only
    pub fn empty() -> Self {
        Self {
            resolver: None,
            external: None,
        }
    }
}

/// Per-compilation block counters with optional derivation table
#[derive(Debug)]
pub struct BlockFrequencyStore {
    chain: Arc<CallSiteChain>,
    blocks: Box<[BlockEntry]>,
    raw: Box<[AtomicU32]>,
    derivation: Option<Box<[DerivationPair]>>,
    /// Index of the method's entry block, or -1 if not designated
    entry_block: i32,
}

fn make_counters(count: usize) -> Box<[AtomicU32]> {
    (0..count).map(|_| AtomicU32::new(0)).collect()
}

impl BlockFrequencyStore {
    /// Store with one raw counter per block and no derivation table
    pub fn direct(chain: Arc<CallSiteChain>, blocks: Vec<BlockEntry>, entry_block: i32) -> Self {
        let raw = make_counters(blocks.len());
        Self::from_parts(chain, blocks, raw, None, entry_block)
    }

    /// Store whose block counts are reconstructed from `num_counters` raw
    /// slots via `derivation`
    ///
    /// Panics if the table's length differs from the block count or any
    /// referenced counter index is out of range.
    pub fn derived(
        chain: Arc<CallSiteChain>,
        blocks: Vec<BlockEntry>,
        num_counters: usize,
        derivation: Vec<DerivationPair>,
        entry_block: i32,
    ) -> Self {
        assert_eq!(
            derivation.len(),
            blocks.len(),
            "derivation table length must equal block count"
        );
        let raw = make_counters(num_counters);
        Self::from_parts(chain, blocks, raw, Some(derivation.into_boxed_slice()), entry_block)
    }

    pub(crate) fn from_parts(
        chain: Arc<CallSiteChain>,
        blocks: Vec<BlockEntry>,
        raw: Box<[AtomicU32]>,
        derivation: Option<Box<[DerivationPair]>>,
        entry_block: i32,
    ) -> Self {
        let store = Self {
            chain,
            blocks: blocks.into_boxed_slice(),
            raw,
            derivation,
            entry_block,
        };
        if let Some(pairs) = &store.derivation {
            for pair in pairs.iter() {
                store.check_slot(&pair.add);
                store.check_slot(&pair.sub);
            }
        }
        assert!(
            store.entry_block == NO_CALLER
                || (store.entry_block >= 0 && (store.entry_block as usize) < store.blocks.len()),
            "entry block {} out of range ({} blocks)",
            store.entry_block,
            store.blocks.len()
        );
        store
    }

    fn check_slot(&self, slot: &DerivationSlot) {
        let in_range = |i: usize| {
            assert!(
                i < self.raw.len(),
                "derivation references counter {} of {}",
                i,
                self.raw.len()
            );
        };
        match slot {
            DerivationSlot::Absent => {}
            DerivationSlot::Direct(i) => in_range(*i as usize),
            DerivationSlot::Set(bits) => bits.iter().for_each(in_range),
        }
    }

    /// Chain this store's locations are recorded against
    pub fn chain(&self) -> &Arc<CallSiteChain> {
        &self.chain
    }

    /// Logical blocks in store order
    pub fn blocks(&self) -> &[BlockEntry] {
        &self.blocks
    }

    /// Number of logical blocks
    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Number of raw counter slots
    pub fn num_counters(&self) -> usize {
        self.raw.len()
    }

    /// Derivation table, if the counter set was minimized
    pub fn derivation(&self) -> Option<&[DerivationPair]> {
        self.derivation.as_deref()
    }

    /// Designated entry block index, or -1
    pub fn entry_block(&self) -> i32 {
        self.entry_block
    }

    /// The mutable slot instrumentation bumps for raw counter `counter`
    ///
    /// In a direct store the counter index equals the block index.
    pub fn record_slot(&self, counter: usize) -> &AtomicU32 {
        assert!(
            counter < self.raw.len(),
            "counter index {} out of range ({} slots)",
            counter,
            self.raw.len()
        );
        &self.raw[counter]
    }

    /// Relaxed snapshot of all raw counters
    pub fn raw_snapshot(&self) -> Vec<u32> {
        self.raw.iter().map(|c| c.load(Ordering::Relaxed)).collect()
    }

    fn slot_sum(&self, slot: &DerivationSlot) -> i64 {
        match slot {
            DerivationSlot::Absent => 0,
            DerivationSlot::Direct(i) => self.raw[*i as usize].load(Ordering::Relaxed) as i64,
            DerivationSlot::Set(bits) => bits
                .iter()
                .map(|i| self.raw[i].load(Ordering::Relaxed) as i64)
                .sum(),
        }
    }

    /// Reconstructed count of logical block `block`
    ///
    /// May go negative when subtracted counters raced ahead of added ones;
    /// not clamped, since consumers treat every count as an estimate.
    pub fn derived_count(&self, block: usize) -> i64 {
        assert!(
            block < self.blocks.len(),
            "block index {} out of range ({} blocks)",
            block,
            self.blocks.len()
        );
        match &self.derivation {
            None => self.raw[block].load(Ordering::Relaxed) as i64,
            Some(pairs) => self.slot_sum(&pairs[block].add) - self.slot_sum(&pairs[block].sub),
        }
    }

    /// Maximum reconstructed count, optionally restricted to blocks whose
    /// stored location has the given caller index
    pub fn max_raw_count(&self, caller_filter: Option<i32>) -> i64 {
        let mut max = 0;
        for (i, entry) in self.blocks.iter().enumerate() {
            if let Some(filter) = caller_filter {
                if entry.location.caller_index != filter {
                    continue;
                }
            }
            max = max.max(self.derived_count(i));
        }
        max
    }

    /// How many times the method body was entered, per the entry block
    pub fn call_count(&self) -> Option<i64> {
        if self.entry_block < 0 {
            return None;
        }
        Some(self.derived_count(self.entry_block as usize))
    }

    /// Combined count of all blocks at `loc`, matched by plain field
    /// equality in this store's own coordinates
    pub fn raw_count_at(&self, loc: ByteCodeLocation) -> Option<i64> {
        self.combine_matches(|entry| entry.location == loc)
    }

    /// Combined count of all blocks matching `loc` under `chain`
    pub fn matched_raw(&self, loc: ByteCodeLocation, chain: &CallSiteChain) -> Option<i64> {
        self.matched_raw_with_caller(loc, chain).map(|(raw, _)| raw)
    }

    fn matched_raw_with_caller(
        &self,
        loc: ByteCodeLocation,
        chain: &CallSiteChain,
    ) -> Option<(i64, i32)> {
        let mut caller = NO_CALLER;
        let mut first = true;
        let raw = self.combine_matches(|entry| {
            let matched = CallSiteChain::exact_match(entry.location, &self.chain, loc, chain);
            if matched && first {
                caller = entry.location.caller_index;
                first = false;
            }
            matched
        })?;
        Some((raw, caller))
    }

    /// Several blocks may share one bytecode location. Direct counts are
    /// summed; reconstructed counts are averaged, since a minimized counter
    /// can feed more than one of the matching blocks.
    fn combine_matches(&self, mut matches: impl FnMut(&BlockEntry) -> bool) -> Option<i64> {
        let mut total = 0i64;
        let mut count = 0i64;
        for (i, entry) in self.blocks.iter().enumerate() {
            if matches(entry) {
                total += self.derived_count(i);
                count += 1;
            }
        }
        if count == 0 {
            None
        } else if self.derivation.is_some() && count > 1 {
            Some(total / count)
        } else {
            Some(total)
        }
    }

    /// Estimated execution frequency of `query.location`, in parts per
    /// 10000 of the maximum observed count
    ///
    /// Resolution order: exact match against this store's own chain, then a
    /// grafting walk through other records via `ctx.resolver`, then the
    /// external interpreter profiler. `None` means no source had data, an
    /// everyday outcome when inlining shapes differ.
    pub fn frequency(&self, query: &FrequencyQuery<'_>, ctx: &QueryContext<'_>) -> Option<i32> {
        if let Some((raw, caller)) = self.matched_raw_with_caller(query.location, query.chain) {
            let filter = if query.normalize_across_callers {
                None
            } else {
                Some(caller)
            };
            return Some(self.scale(raw, filter));
        }

        // Counter minimization implies the producer kept full block
        // coverage, which is what makes a projected estimate meaningful.
        if self.derivation.is_some() {
            if let Some(raw) = self.graft_frequency(query, ctx) {
                trace!(location = %query.location, raw, "grafted frequency estimate");
                return Some(self.scale(raw, None));
            }
        }

        ctx.external
            .and_then(|ext| ext.frequency(query.method, query.location.offset))
            .map(|f| f as i32)
    }

    fn scale(&self, raw: i64, caller_filter: Option<i32>) -> i32 {
        let max = self.max_raw_count(caller_filter);
        if max <= 0 {
            return 0;
        }
        (raw.saturating_mul(10000) / max) as i32
    }

    /// Project a count for a location recorded under a foreign inlining
    /// shape, walking its call stack outward-in
    ///
    /// Each level either finds the frame inlined in the current store's own
    /// chain (descend at no cost) or hops to another record via the
    /// resolver, scaling by call-site count over callee entry count. The
    /// product of the scale factors projects the innermost count into this
    /// store's units.
    fn graft_frequency(&self, query: &FrequencyQuery<'_>, ctx: &QueryContext<'_>) -> Option<i64> {
        let resolver = ctx.resolver?;
        let stack = query.chain.call_stack_of(query.location);
        if stack.is_empty() {
            return None;
        }

        let outermost = stack.len() - 1;
        // The outermost frame's call location is in the shared root method,
        // so its coordinates are valid in this store directly.
        let mut site_raw = self.raw_count_at(stack[outermost].location)?;
        let mut num = 1i64;
        let mut den = 1i64;

        // None stands for self; resolved stores are kept alive by the Arc.
        let mut cur: Option<Arc<BlockFrequencyStore>> = None;
        let mut frame_pos = outermost;
        loop {
            let sub_stack = &stack[frame_pos..];
            let store = cur.as_deref().unwrap_or(self);
            let (next, idx) = match store.chain.graft_search(sub_stack) {
                Some(idx) => (cur.clone(), idx),
                None => {
                    let guard = resolver.record_for(stack[frame_pos].callee)?;
                    let resolved = guard.blocks()?;
                    let idx = resolved.chain.graft_search(sub_stack)?;
                    let entry_raw =
                        resolved.raw_count_at(ByteCodeLocation::new(idx as i32, 0))?;
                    if entry_raw <= 0 {
                        return None;
                    }
                    num = num.checked_mul(site_raw)?;
                    den = den.checked_mul(entry_raw)?;
                    (Some(resolved), idx)
                }
            };
            cur = next;
            let store = cur.as_deref().unwrap_or(self);

            if frame_pos == 0 {
                let inner =
                    store.raw_count_at(ByteCodeLocation::new(idx as i32, query.location.offset))?;
                return Some(inner.checked_mul(num)? / den);
            }
            frame_pos -= 1;
            site_raw = store
                .raw_count_at(ByteCodeLocation::new(idx as i32, stack[frame_pos].location.offset))?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn entry(caller: i32, offset: u32) -> BlockEntry {
        BlockEntry::at(ByteCodeLocation::new(caller, offset))
    }

    fn query<'a>(
        chain: &'a CallSiteChain,
        loc: ByteCodeLocation,
        across: bool,
    ) -> FrequencyQuery<'a> {
        FrequencyQuery {
            method: MethodId(1),
            location: loc,
            chain,
            normalize_across_callers: across,
        }
    }

    #[test]
    fn test_bitset_basics() {
        let mut set = BitSet::new();
        assert!(set.is_empty());
        set.insert(0);
        set.insert(63);
        set.insert(64);
        set.insert(130);
        assert_eq!(set.len(), 4);
        assert!(set.contains(64));
        assert!(!set.contains(65));
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![0, 63, 64, 130]);
        assert_eq!(BitSet::from_words(set.words().to_vec()), set);
    }

    #[test]
    fn test_counter_reconstruction() {
        let chain = Arc::new(CallSiteChain::empty());
        let store = BlockFrequencyStore::derived(
            chain,
            vec![entry(NO_CALLER, 0), entry(NO_CALLER, 8)],
            3,
            vec![
                DerivationPair {
                    add: DerivationSlot::Direct(0),
                    sub: DerivationSlot::Absent,
                },
                DerivationPair {
                    add: DerivationSlot::Set([0usize, 1].into_iter().collect()),
                    sub: DerivationSlot::Set([2usize].into_iter().collect()),
                },
            ],
            0,
        );
        store.record_slot(0).store(100, Ordering::Relaxed);
        store.record_slot(1).store(40, Ordering::Relaxed);
        store.record_slot(2).store(10, Ordering::Relaxed);

        assert_eq!(store.derived_count(0), 100);
        assert_eq!(store.derived_count(1), 130);
        assert_eq!(store.max_raw_count(None), 130);

        // The larger block scales to full parts-per-10000.
        let chain = store.chain().clone();
        let q = query(&chain, ByteCodeLocation::outermost(8), true);
        assert_eq!(store.frequency(&q, &QueryContext::empty()), Some(10000));
        let q = query(&chain, ByteCodeLocation::outermost(0), true);
        assert_eq!(store.frequency(&q, &QueryContext::empty()), Some(7692));
    }

    #[test]
    fn test_negative_difference_not_clamped() {
        let chain = Arc::new(CallSiteChain::empty());
        let store = BlockFrequencyStore::derived(
            chain,
            vec![entry(NO_CALLER, 0)],
            2,
            vec![DerivationPair {
                add: DerivationSlot::Direct(0),
                sub: DerivationSlot::Direct(1),
            }],
            NO_CALLER,
        );
        store.record_slot(0).store(5, Ordering::Relaxed);
        store.record_slot(1).store(9, Ordering::Relaxed);
        assert_eq!(store.derived_count(0), -4);
    }

    #[test]
    fn test_empty_set_contributes_zero() {
        let chain = Arc::new(CallSiteChain::empty());
        let store = BlockFrequencyStore::derived(
            chain,
            vec![entry(NO_CALLER, 0)],
            1,
            vec![DerivationPair {
                add: DerivationSlot::Set(BitSet::new()),
                sub: DerivationSlot::Absent,
            }],
            NO_CALLER,
        );
        store.record_slot(0).store(77, Ordering::Relaxed);
        assert_eq!(store.derived_count(0), 0);
    }

    #[test]
    fn test_max_raw_count_caller_filter() {
        use crate::callsite::InlinedCallSite;
        let chain = Arc::new(CallSiteChain::new(vec![InlinedCallSite {
            callee: MethodId(2),
            at_caller: ByteCodeLocation::outermost(4),
        }]));
        let store = BlockFrequencyStore::direct(
            chain,
            vec![entry(NO_CALLER, 0), entry(0, 0), entry(0, 6)],
            0,
        );
        store.record_slot(0).store(1000, Ordering::Relaxed);
        store.record_slot(1).store(300, Ordering::Relaxed);
        store.record_slot(2).store(200, Ordering::Relaxed);

        assert_eq!(store.max_raw_count(None), 1000);
        assert_eq!(store.max_raw_count(Some(0)), 300);
        assert_eq!(store.max_raw_count(Some(NO_CALLER)), 1000);

        // Per-caller normalization scales against the inlined region's max.
        let chain = store.chain().clone();
        let q = query(&chain, ByteCodeLocation::new(0, 6), false);
        assert_eq!(store.frequency(&q, &QueryContext::empty()), Some(6666));
        let q = query(&chain, ByteCodeLocation::new(0, 6), true);
        assert_eq!(store.frequency(&q, &QueryContext::empty()), Some(2000));
    }

    #[test]
    fn test_call_count() {
        let chain = Arc::new(CallSiteChain::empty());
        let store =
            BlockFrequencyStore::direct(chain, vec![entry(NO_CALLER, 0), entry(NO_CALLER, 9)], 0);
        store.record_slot(0).store(12, Ordering::Relaxed);
        assert_eq!(store.call_count(), Some(12));

        let chain = Arc::new(CallSiteChain::empty());
        let store = BlockFrequencyStore::direct(chain, vec![entry(NO_CALLER, 0)], NO_CALLER);
        assert_eq!(store.call_count(), None);
    }

    #[test]
    fn test_unknown_location_is_none() {
        let chain = Arc::new(CallSiteChain::empty());
        let store = BlockFrequencyStore::direct(chain, vec![entry(NO_CALLER, 0)], 0);
        let chain = store.chain().clone();
        let q = query(&chain, ByteCodeLocation::outermost(99), true);
        assert_eq!(store.frequency(&q, &QueryContext::empty()), None);
    }

    #[test]
    fn test_zero_samples_scale_to_zero() {
        let chain = Arc::new(CallSiteChain::empty());
        let store = BlockFrequencyStore::direct(chain, vec![entry(NO_CALLER, 0)], 0);
        let chain = store.chain().clone();
        let q = query(&chain, ByteCodeLocation::outermost(0), true);
        assert_eq!(store.frequency(&q, &QueryContext::empty()), Some(0));
    }

    #[test]
    #[should_panic(expected = "derivation references counter")]
    fn test_out_of_range_derivation_is_fatal() {
        let chain = Arc::new(CallSiteChain::empty());
        let _ = BlockFrequencyStore::derived(
            chain,
            vec![entry(NO_CALLER, 0)],
            1,
            vec![DerivationPair {
                add: DerivationSlot::Direct(3),
                sub: DerivationSlot::Absent,
            }],
            NO_CALLER,
        );
    }
}
