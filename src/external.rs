//! Collaborator interfaces consumed by the store
//!
//! The store never looks up method metadata or talks to the interpreter
//! itself; the embedding runtime implements these traits and hands them in
//! through a [`QueryContext`](crate::blocks::QueryContext).

use crate::location::MethodId;
use crate::record::RecordGuard;
use crate::values::ValueHistogram;

/// Maps a method to a live record holding profile data for it
///
/// Used by the grafting walk to project frequencies through other
/// compilations' stores. The returned guard keeps the record referenced for
/// as long as the query reads it. A typical implementation consults a
/// [`ProfileSelector`](crate::record::ProfileSelector).
pub trait ProfileResolver {
    /// A record whose block store covers `method`, or `None`
    fn record_for(&self, method: MethodId) -> Option<RecordGuard>;
}

/// Interpreter-side profiler, consumed read-only
///
/// The fallback of last resort for frequency queries, and the source behind
/// interpreter-kind value sites. Both lookups are keyed by the containing
/// method plus a bytecode offset, since the interpreter never saw any
/// inlining.
pub trait ExternalProfiler {
    /// Raw invocation-weighted frequency the interpreter observed at
    /// `offset` in `method`
    fn frequency(&self, method: MethodId, offset: u32) -> Option<u32>;

    /// Value histogram the interpreter collected at `offset` in `method`
    fn value_histogram(&self, method: MethodId, offset: u32) -> Option<ValueHistogram>;
}
