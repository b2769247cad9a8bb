//! Call-site chains and location matching
//!
//! A [`CallSiteChain`] is the immutable, per-compilation record of which
//! methods were inlined into which. Each entry holds the identity of the
//! inlined method and the location of the call in its parent; parent links
//! are plain indices that always point to an earlier entry, so the structure
//! is a forest with strictly backward edges and every chain walk terminates
//! in at most `depth` steps.
//!
//! The matcher answers the central identity question of the store: does a
//! location recorded under one inlining shape denote the same program point
//! as a location queried under another?
//!
//! # Example
//! ```
//! use argent_profile::callsite::{CallSiteChain, InlinedCallSite};
//! use argent_profile::location::{ByteCodeLocation, MethodId};
//!
//! // `bar` inlined into the root method at offset 12
//! let chain = CallSiteChain::new(vec![InlinedCallSite {
//!     callee: MethodId(7),
//!     at_caller: ByteCodeLocation::outermost(12),
//! }]);
//! let inside_bar = ByteCodeLocation::new(0, 3);
//! assert!(CallSiteChain::exact_match(inside_bar, &chain, inside_bar, &chain));
//! ```

use crate::location::{ByteCodeLocation, MethodId, NO_CALLER};
use serde::Serialize;

/// One inlining decision: `callee` was inlined at `at_caller`
///
/// Immutable once its owning chain is published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InlinedCallSite {
    /// Identity of the inlined method
    pub callee: MethodId,
    /// Location of the call in the parent; `caller_index` refers to an
    /// earlier entry of the same chain or [`NO_CALLER`]
    pub at_caller: ByteCodeLocation,
}

/// One frame of a logical call stack, innermost first
///
/// Mirrors the content of an [`InlinedCallSite`], but detached from any
/// particular chain so it can be searched for in a foreign one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallStackFrame {
    /// Method the frame executes in
    pub callee: MethodId,
    /// Location of the call that entered the frame, in its parent
    pub location: ByteCodeLocation,
}

/// Immutable snapshot of one compilation's inlining decisions
///
/// Owned by the [`ProfileRecord`](crate::record::ProfileRecord) that created
/// it. Never edited in place: if a later compilation's inlining set changed,
/// the record replaces the chain wholesale with a new object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSiteChain {
    entries: Box<[InlinedCallSite]>,
}

impl CallSiteChain {
    /// Build a chain, checking the strictly-backward edge invariant
    ///
    /// Panics on a forward or out-of-range parent link; that indicates a
    /// corrupted producer, not a recoverable condition.
    pub fn new(entries: Vec<InlinedCallSite>) -> Self {
        for (i, entry) in entries.iter().enumerate() {
            let parent = entry.at_caller.caller_index;
            assert!(
                parent == NO_CALLER || (parent as usize) < i,
                "call site {} has non-backward parent link {}",
                i,
                parent
            );
        }
        Self {
            entries: entries.into_boxed_slice(),
        }
    }

    /// Chain with no inlined call sites (outermost-only compilation)
    pub fn empty() -> Self {
        Self {
            entries: Box::new([]),
        }
    }

    /// Number of inlined call sites
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the compilation inlined nothing
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entries in chain order
    pub fn entries(&self) -> &[InlinedCallSite] {
        &self.entries
    }

    /// Entry at `index`; out of range is a fatal structural violation
    pub fn entry(&self, index: usize) -> &InlinedCallSite {
        assert!(
            index < self.entries.len(),
            "call site index {} out of range ({} entries)",
            index,
            self.entries.len()
        );
        &self.entries[index]
    }

    /// Whether `index` is a valid caller index for this chain
    pub fn contains_index(&self, index: i32) -> bool {
        index == NO_CALLER || (index >= 0 && (index as usize) < self.entries.len())
    }

    /// Exact identity match of two locations under their respective chains
    ///
    /// Walks both caller chains toward the root in lockstep, requiring the
    /// call offset and callee identity to agree at every level. Succeeds iff
    /// both walks reach the outermost method together. O(min depth), fails
    /// fast on the first mismatch.
    pub fn exact_match(
        loc_a: ByteCodeLocation,
        chain_a: &CallSiteChain,
        loc_b: ByteCodeLocation,
        chain_b: &CallSiteChain,
    ) -> bool {
        if loc_a.offset != loc_b.offset {
            return false;
        }

        let mut a = loc_a.caller_index;
        let mut b = loc_b.caller_index;
        while a != NO_CALLER && b != NO_CALLER {
            let site_a = chain_a.entry(a as usize);
            let site_b = chain_b.entry(b as usize);
            if site_a.at_caller.offset != site_b.at_caller.offset {
                break;
            }
            if site_a.callee != site_b.callee {
                break;
            }
            a = site_a.at_caller.caller_index;
            b = site_b.at_caller.caller_index;
        }

        a == NO_CALLER && b == NO_CALLER
    }

    /// Count of consecutive matching ancestor levels before divergence
    ///
    /// Returns 0 whenever the immediate offsets differ. Used to rank
    /// imperfect candidates when an exact match across a different chain
    /// failed; ties are broken by encounter order (first found wins).
    pub fn partial_match_depth(
        loc_a: ByteCodeLocation,
        chain_a: &CallSiteChain,
        loc_b: ByteCodeLocation,
        chain_b: &CallSiteChain,
    ) -> u32 {
        if loc_a.offset != loc_b.offset {
            return 0;
        }

        let mut a = loc_a.caller_index;
        let mut b = loc_b.caller_index;
        let mut depth = 0;
        while a != NO_CALLER && b != NO_CALLER {
            let site_a = chain_a.entry(a as usize);
            let site_b = chain_b.entry(b as usize);
            if site_a.at_caller.offset != site_b.at_caller.offset {
                break;
            }
            if site_a.callee != site_b.callee {
                break;
            }
            a = site_a.at_caller.caller_index;
            b = site_b.at_caller.caller_index;
            depth += 1;
        }

        depth
    }

    /// Find the entry whose ancestor sequence equals `target` exactly
    ///
    /// `target` is innermost first and must describe the full stack down to
    /// the outermost method. Returns the index of the matching entry, used
    /// to re-express a location recorded under a foreign inlining shape in
    /// this chain's coordinates (grafting).
    pub fn graft_search(&self, target: &[CallStackFrame]) -> Option<usize> {
        if target.is_empty() {
            return None;
        }

        'candidates: for start in 0..self.entries.len() {
            let mut cursor = Some(start);
            for frame in target {
                let index = match cursor {
                    Some(i) => i,
                    // Ran out of chain before consuming the stack
                    None => continue 'candidates,
                };
                let entry = &self.entries[index];
                if entry.callee != frame.callee
                    || entry.at_caller.offset != frame.location.offset
                {
                    continue 'candidates;
                }
                cursor = match entry.at_caller.caller_index {
                    NO_CALLER => None,
                    parent => Some(parent as usize),
                };
            }
            // Both the stack and the chain walk terminated together
            if cursor.is_none() {
                return Some(start);
            }
        }

        None
    }

    /// The logical call stack of `loc` under this chain, innermost first
    ///
    /// Each frame mirrors the inlined call site it passes through; the last
    /// frame's call location is always in the outermost method. Empty when
    /// `loc` has no caller.
    pub fn call_stack_of(&self, loc: ByteCodeLocation) -> Vec<CallStackFrame> {
        let mut frames = Vec::new();
        let mut caller = loc.caller_index;
        while caller != NO_CALLER {
            let entry = self.entry(caller as usize);
            frames.push(CallStackFrame {
                callee: entry.callee,
                location: entry.at_caller,
            });
            caller = entry.at_caller.caller_index;
        }
        frames
    }
}
