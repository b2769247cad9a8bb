//! Bytecode locations and method identity
//!
//! A [`ByteCodeLocation`] names a program point as an offset within a method
//! plus the index of the inlined call site that introduced that method, or
//! [`NO_CALLER`] for the outermost method. Caller indices only mean something
//! together with the [`CallSiteChain`](crate::callsite::CallSiteChain) they
//! were recorded against; comparing locations across chains is the job of the
//! matcher in [`callsite`](crate::callsite).

use bitflags::bitflags;
use serde::Serialize;
use std::fmt;

/// Sentinel caller index for the outermost method (no inlined caller)
pub const NO_CALLER: i32 = -1;

/// Opaque method identity
///
/// Compared only for equality; the store never interprets the payload.
/// The embedding runtime decides what the bits mean (a method table index,
/// a pointer, an interned symbol).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct MethodId(pub u64);

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m{:#x}", self.0)
    }
}

/// A program point: bytecode offset plus caller index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ByteCodeLocation {
    /// Index of the inlined call site that introduced the enclosing method,
    /// or [`NO_CALLER`] for the outermost method. Always >= -1.
    pub caller_index: i32,
    /// Bytecode offset within the enclosing method
    pub offset: u32,
}

impl ByteCodeLocation {
    /// Create a location with an explicit caller index
    pub fn new(caller_index: i32, offset: u32) -> Self {
        assert!(caller_index >= NO_CALLER, "caller index below sentinel");
        Self {
            caller_index,
            offset,
        }
    }

    /// Create a location in the outermost method
    pub fn outermost(offset: u32) -> Self {
        Self {
            caller_index: NO_CALLER,
            offset,
        }
    }

    /// Whether this location sits inside an inlined method
    pub fn has_caller(&self) -> bool {
        self.caller_index != NO_CALLER
    }

    /// Same offset, different caller index
    pub fn with_caller(self, caller_index: i32) -> Self {
        Self::new(caller_index, self.offset)
    }
}

impl fmt::Display for ByteCodeLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.caller_index, self.offset)
    }
}

bitflags! {
    /// Per-block metadata bits carried alongside a stored location
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct LocationFlags: u8 {
        /// Instrumentation must not be attached to this block
        const DO_NOT_PROFILE = 0b0000_0001;
        /// The receiver at this site is known to match the enclosing one
        const SAME_RECEIVER = 0b0000_0010;
    }
}
