//! Debug rendering of profile records
//!
//! A [`ProfileDump`] is a point-in-time snapshot of one record, rendered
//! either as indented text via `Display` or as JSON for tooling. Counts are
//! the reconstructed per-block values, not the raw counters, so a dump
//! shows what consumers would actually read.

use crate::callsite::InlinedCallSite;
use crate::error::Result;
use crate::external::ExternalProfiler;
use crate::location::{ByteCodeLocation, MethodId};
use crate::record::ProfileRecord;
use crate::values::{ValueHistogram, ValueKind, ValueSource};
use serde::Serialize;
use std::fmt;

/// One block's reconstructed count
#[derive(Debug, Serialize)]
pub struct BlockDump {
    /// Where the block starts
    pub location: ByteCodeLocation,
    /// Reconstructed execution count
    pub count: i64,
}

/// The record's simple event counters
#[derive(Debug, Serialize)]
pub struct EventDump {
    /// Caught exceptions
    pub catches: u32,
    /// Thrown exceptions
    pub throws: u32,
}

/// One value profiling site with its current histogram
#[derive(Debug, Serialize)]
pub struct ValueSiteDump {
    /// Program point of the site
    pub location: ByteCodeLocation,
    /// Kind of value recorded there
    pub kind: ValueKind,
    /// Backing representation
    pub source: ValueSource,
    /// Current top-K view
    pub histogram: ValueHistogram,
}

/// Snapshot of everything one record holds
#[derive(Debug, Serialize)]
pub struct ProfileDump {
    /// Method the record profiles
    pub method: MethodId,
    /// Reference count at snapshot time
    pub ref_count: i32,
    /// Whether the owning body is still installed
    pub active: bool,
    /// Inlining decisions, in chain order
    pub chain: Vec<InlinedCallSite>,
    /// Per-block counts, present if a block store was installed
    pub blocks: Vec<BlockDump>,
    /// Catch/throw counters
    pub events: EventDump,
    /// All value sites with their histograms
    pub values: Vec<ValueSiteDump>,
}

impl ProfileDump {
    /// Snapshot `record` now
    ///
    /// `external` lets interpreter-sourced value sites resolve their
    /// histograms; pass `None` to dump only what is cached.
    pub fn of(record: &ProfileRecord, external: Option<&dyn ExternalProfiler>) -> Self {
        let chain = record.chain().entries().to_vec();
        let blocks = record
            .blocks()
            .map(|store| {
                store
                    .blocks()
                    .iter()
                    .enumerate()
                    .map(|(i, block)| BlockDump {
                        location: block.location,
                        count: store.derived_count(i),
                    })
                    .collect()
            })
            .unwrap_or_default();
        let values = record
            .values()
            .map(|store| {
                store
                    .sites()
                    .iter()
                    .map(|site| ValueSiteDump {
                        location: site.location(),
                        kind: site.kind(),
                        source: site.source(),
                        histogram: site.histogram(external),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Self {
            method: record.method(),
            ref_count: record.ref_count(),
            active: record.is_active(),
            chain,
            blocks,
            events: EventDump {
                catches: record.events().catches(),
                throws: record.events().throws(),
            },
            values,
        }
    }

    /// Pretty-printed JSON rendering
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl fmt::Display for ProfileDump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "profile {} refs={} active={}",
            self.method, self.ref_count, self.active
        )?;
        writeln!(f, "  chain ({} call sites):", self.chain.len())?;
        for (i, site) in self.chain.iter().enumerate() {
            writeln!(f, "    [{}] {} at {}", i, site.callee, site.at_caller)?;
        }
        writeln!(f, "  blocks ({}):", self.blocks.len())?;
        for block in &self.blocks {
            writeln!(f, "    {} count={}", block.location, block.count)?;
        }
        writeln!(
            f,
            "  events: catches={} throws={}",
            self.events.catches, self.events.throws
        )?;
        writeln!(f, "  values ({} sites):", self.values.len())?;
        for site in &self.values {
            write!(
                f,
                "    {} {:?}/{:?} total={}",
                site.location, site.kind, site.source, site.histogram.total_samples
            )?;
            if let Some((value, count)) = site.histogram.top() {
                write!(f, " top={:?}x{}", value, count)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocks::{BlockEntry, BlockFrequencyStore};
    use crate::callsite::CallSiteChain;
    use crate::values::ProfiledValue;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    fn sample_record() -> Arc<ProfileRecord> {
        let chain = Arc::new(CallSiteChain::new(vec![InlinedCallSite {
            callee: MethodId(0xaa),
            at_caller: ByteCodeLocation::outermost(12),
        }]));
        let record = ProfileRecord::new(MethodId(0x2a), chain.clone());
        let blocks = record.install_blocks(BlockFrequencyStore::direct(
            chain,
            vec![
                BlockEntry::at(ByteCodeLocation::outermost(0)),
                BlockEntry::at(ByteCodeLocation::new(0, 4)),
            ],
            0,
        ));
        blocks.record_slot(0).store(25, Ordering::Relaxed);
        record.events().record_throw();
        let site = record
            .get_or_create_values()
            .get_or_create(
                ByteCodeLocation::new(0, 4),
                ValueKind::Address,
                ValueSource::BoundedList,
                None,
            )
            .unwrap();
        site.record(ProfiledValue::Word(0x1000));
        record
    }

    #[test]
    fn test_text_dump() {
        let dump = ProfileDump::of(&sample_record(), None);
        let text = dump.to_string();
        assert!(text.contains("profile m0x2a refs=1 active=false"));
        assert!(text.contains("[0] m0xaa at -1:12"));
        assert!(text.contains("-1:0 count=25"));
        assert!(text.contains("catches=0 throws=1"));
        assert!(text.contains("total=1"));
    }

    #[test]
    fn test_json_dump() {
        let dump = ProfileDump::of(&sample_record(), None);
        let json = dump.to_json().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["method"], 0x2a);
        assert_eq!(parsed["blocks"][0]["count"], 25);
        assert_eq!(parsed["events"]["throws"], 1);
        assert_eq!(parsed["values"][0]["kind"], "Address");
    }
}
