//! Profiling-data store for a tiered JIT compiler
//!
//! `argent_profile` records, matches, persists, and reclaims the runtime
//! statistics a dynamic compiler feeds back into itself: block execution
//! frequencies, observed operand values, and simple event counters, all
//! keyed by program locations that may appear under different inlining
//! shapes across successive compilations.
//!
//! The pieces, leaves first:
//!
//! - [`location`] / [`callsite`]: program points, per-compilation inlining
//!   chains, and the matcher that decides when two locations recorded under
//!   different chains mean the same program point.
//! - [`blocks`]: raw atomic counters plus the derivation algebra that
//!   reconstructs block counts from a minimized counter set, with grafting
//!   across records when shapes differ.
//! - [`values`]: bounded per-location value histograms in interchangeable
//!   backing representations.
//! - [`record`]: the reference-counted aggregate per compiled body, the
//!   lock-free registry of live records, and the per-method selector.
//! - [`reclaim`]: the background worker that frees zero-referenced records
//!   and trims value tables.
//! - [`serialize`]: the byte-exact persisted format.
//! - [`external`]: the traits the embedding runtime implements.
//! - [`dump`]: text and JSON debug snapshots.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::sync::atomic::Ordering;
//! use argent_profile::blocks::{BlockEntry, BlockFrequencyStore, FrequencyQuery, QueryContext};
//! use argent_profile::callsite::CallSiteChain;
//! use argent_profile::location::{ByteCodeLocation, MethodId};
//! use argent_profile::record::{ProfileRecord, ProfileRegistry};
//!
//! let registry = ProfileRegistry::new();
//! let chain = Arc::new(CallSiteChain::empty());
//! let record = ProfileRecord::new(MethodId(1), chain.clone());
//!
//! // The compilation lays out one counter per block; instrumentation bumps
//! // them while the compiled body runs.
//! let blocks = record.install_blocks(BlockFrequencyStore::direct(
//!     chain.clone(),
//!     vec![
//!         BlockEntry::at(ByteCodeLocation::outermost(0)),
//!         BlockEntry::at(ByteCodeLocation::outermost(9)),
//!     ],
//!     0,
//! ));
//! registry.publish(&record);
//! blocks.record_slot(0).fetch_add(80, Ordering::Relaxed);
//! blocks.record_slot(1).fetch_add(20, Ordering::Relaxed);
//!
//! // A later compilation asks for the hot block's relative frequency.
//! let query = FrequencyQuery {
//!     method: MethodId(1),
//!     location: ByteCodeLocation::outermost(9),
//!     chain: &chain,
//!     normalize_across_callers: true,
//! };
//! assert_eq!(blocks.frequency(&query, &QueryContext::empty()), Some(2500));
//! ```

pub mod blocks;
pub mod callsite;
pub mod dump;
pub mod error;
pub mod external;
pub mod location;
pub mod reclaim;
pub mod record;
pub mod serialize;
pub mod values;

pub use error::{Error, Result};
pub use location::{ByteCodeLocation, MethodId, NO_CALLER};
pub use record::{ProfileRecord, ProfileRegistry, ProfileSelector, RecordGuard};
pub use reclaim::{ReclaimConfig, ReclamationWorker};
