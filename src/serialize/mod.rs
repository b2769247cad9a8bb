//! Byte-exact persisted format
//!
//! Profile data travels out of process (remote compilation, ahead-of-time
//! caches) in a hand-written little-endian layout: a chain section, a block
//! section, and a record envelope with presence flags, wrapped in a magic
//! plus format-version header for files. The round-trip guarantee is
//! semantic: a reloaded block store answers every frequency and max-count
//! query bit-identically to the store that was written.
//!
//! Malformed input is always an [`Error::InvalidFormat`], never a panic;
//! the reader validates every size and index before building anything.
//!
//! # Example
//! ```no_run
//! use std::sync::Arc;
//! use argent_profile::callsite::CallSiteChain;
//! use argent_profile::location::MethodId;
//! use argent_profile::record::ProfileRecord;
//! use argent_profile::serialize::{load_record, save_record};
//!
//! # fn main() -> argent_profile::Result<()> {
//! let record = ProfileRecord::new(MethodId(1), Arc::new(CallSiteChain::empty()));
//! save_record("method.agp", &record)?;
//! let reloaded = load_record("method.agp", MethodId(1))?;
//! # Ok(())
//! # }
//! ```

use crate::blocks::{BitSet, BlockEntry, BlockFrequencyStore, DerivationPair, DerivationSlot};
use crate::callsite::{CallSiteChain, InlinedCallSite};
use crate::error::{Error, Result};
use crate::location::{ByteCodeLocation, MethodId, NO_CALLER};
use crate::record::{EventCounters, ProfileRecord};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::atomic::AtomicU32;
use std::sync::Arc;

/// File header magic
pub const MAGIC: [u8; 4] = *b"AGP\x01";
/// Current format version
pub const FORMAT_VERSION: u32 = 1;

/// Upper bound on any serialized element count; larger values mean a
/// corrupt or hostile producer
const MAX_ELEMENTS: u32 = 1 << 20;

fn write_u8<W: Write>(w: &mut W, v: u8) -> Result<()> {
    w.write_all(&[v])?;
    Ok(())
}

fn write_u32<W: Write>(w: &mut W, v: u32) -> Result<()> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

fn write_i32<W: Write>(w: &mut W, v: i32) -> Result<()> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

fn write_u64<W: Write>(w: &mut W, v: u64) -> Result<()> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

fn read_u8<R: Read>(r: &mut R) -> Result<u8> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_u32<R: Read>(r: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_i32<R: Read>(r: &mut R) -> Result<i32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(i32::from_le_bytes(buf))
}

fn read_u64<R: Read>(r: &mut R) -> Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_count<R: Read>(r: &mut R, what: &str) -> Result<u32> {
    let count = read_u32(r)?;
    if count > MAX_ELEMENTS {
        return Err(Error::invalid(format!("{} count {} out of range", what, count)));
    }
    Ok(count)
}

/// Write a chain: entry count, then fixed-size entries in chain order
pub fn write_chain<W: Write>(w: &mut W, chain: &CallSiteChain) -> Result<()> {
    write_u32(w, chain.len() as u32)?;
    for entry in chain.entries() {
        write_u64(w, entry.callee.0)?;
        write_i32(w, entry.at_caller.caller_index)?;
        write_u32(w, entry.at_caller.offset)?;
    }
    Ok(())
}

/// Read a chain written by [`write_chain`]
pub fn read_chain<R: Read>(r: &mut R) -> Result<CallSiteChain> {
    let num_entries = read_count(r, "call site")? as usize;
    let mut entries = Vec::with_capacity(num_entries);
    for i in 0..num_entries {
        let callee = MethodId(read_u64(r)?);
        let caller_index = read_i32(r)?;
        let offset = read_u32(r)?;
        if caller_index != NO_CALLER && !(0..i as i32).contains(&caller_index) {
            return Err(Error::invalid(format!(
                "call site {} has caller index {}",
                i, caller_index
            )));
        }
        entries.push(InlinedCallSite {
            callee,
            at_caller: ByteCodeLocation::new(caller_index, offset),
        });
    }
    Ok(CallSiteChain::new(entries))
}

fn write_slot<W: Write>(w: &mut W, slot: &DerivationSlot) -> Result<()> {
    match slot {
        DerivationSlot::Absent => write_u64(w, 0),
        DerivationSlot::Direct(index) => write_u64(w, ((*index as u64) << 1) | 1),
        DerivationSlot::Set(_) => write_u64(w, 2),
    }
}

fn write_slot_blob<W: Write>(w: &mut W, slot: &DerivationSlot) -> Result<()> {
    if let DerivationSlot::Set(bits) = slot {
        write_u32(w, bits.words().len() as u32)?;
        for word in bits.words() {
            write_u64(w, *word)?;
        }
    }
    Ok(())
}

fn read_slot<R: Read>(r: &mut R, num_counters: usize) -> Result<DerivationSlot> {
    let descriptor = read_u64(r)?;
    if descriptor == 0 {
        return Ok(DerivationSlot::Absent);
    }
    if descriptor == 2 {
        // Placeholder; the bit set body follows the descriptor table.
        return Ok(DerivationSlot::Set(BitSet::new()));
    }
    if descriptor & 1 == 1 {
        let index = descriptor >> 1;
        if index >= num_counters as u64 {
            return Err(Error::invalid(format!(
                "derivation counter index {} out of range",
                index
            )));
        }
        return Ok(DerivationSlot::Direct(index as u32));
    }
    Err(Error::invalid(format!(
        "unrecognized derivation descriptor {:#x}",
        descriptor
    )))
}

fn read_slot_blob<R: Read>(r: &mut R, slot: &mut DerivationSlot, num_counters: usize) -> Result<()> {
    if let DerivationSlot::Set(bits) = slot {
        let num_words = read_count(r, "bit set word")? as usize;
        let mut words = Vec::with_capacity(num_words);
        for _ in 0..num_words {
            words.push(read_u64(r)?);
        }
        let set = BitSet::from_words(words);
        if let Some(max) = set.iter().last() {
            if max >= num_counters {
                return Err(Error::invalid(format!(
                    "derivation counter index {} out of range",
                    max
                )));
            }
        }
        *bits = set;
    }
    Ok(())
}

/// Write a block store: sizes, locations, a raw-counter snapshot, then the
/// derivation descriptor table with its bit-set blobs
pub fn write_blocks<W: Write>(w: &mut W, store: &BlockFrequencyStore) -> Result<()> {
    write_u32(w, store.num_blocks() as u32)?;
    write_i32(w, store.entry_block())?;
    for block in store.blocks() {
        write_i32(w, block.location.caller_index)?;
        write_u32(w, block.location.offset)?;
    }
    write_u32(w, store.num_counters() as u32)?;
    for raw in store.raw_snapshot() {
        write_u32(w, raw)?;
    }
    match store.derivation() {
        None => write_u8(w, 0)?,
        Some(pairs) => {
            write_u8(w, 1)?;
            for pair in pairs {
                write_slot(w, &pair.add)?;
                write_slot(w, &pair.sub)?;
            }
            for pair in pairs {
                write_slot_blob(w, &pair.add)?;
                write_slot_blob(w, &pair.sub)?;
            }
        }
    }
    Ok(())
}

/// Read a block store written by [`write_blocks`], attaching it to `chain`
pub fn read_blocks<R: Read>(r: &mut R, chain: Arc<CallSiteChain>) -> Result<BlockFrequencyStore> {
    let num_blocks = read_count(r, "block")? as usize;
    let entry_block = read_i32(r)?;
    if entry_block != NO_CALLER && !(0..num_blocks as i32).contains(&entry_block) {
        return Err(Error::invalid(format!("entry block {} out of range", entry_block)));
    }

    let mut blocks = Vec::with_capacity(num_blocks);
    for i in 0..num_blocks {
        let caller_index = read_i32(r)?;
        let offset = read_u32(r)?;
        if !chain.contains_index(caller_index) {
            return Err(Error::invalid(format!(
                "block {} references call site {}",
                i, caller_index
            )));
        }
        blocks.push(BlockEntry::at(ByteCodeLocation::new(caller_index, offset)));
    }

    let num_counters = read_count(r, "counter")? as usize;
    let raw: Box<[AtomicU32]> = (0..num_counters)
        .map(|_| read_u32(r).map(AtomicU32::new))
        .collect::<Result<_>>()?;

    let derivation = match read_u8(r)? {
        0 => None,
        1 => {
            let mut pairs = Vec::with_capacity(num_blocks);
            for _ in 0..num_blocks {
                pairs.push(DerivationPair {
                    add: read_slot(r, num_counters)?,
                    sub: read_slot(r, num_counters)?,
                });
            }
            for pair in pairs.iter_mut() {
                read_slot_blob(r, &mut pair.add, num_counters)?;
                read_slot_blob(r, &mut pair.sub, num_counters)?;
            }
            Some(pairs.into_boxed_slice())
        }
        flag => return Err(Error::invalid(format!("bad derivation flag {}", flag))),
    };

    Ok(BlockFrequencyStore::from_parts(
        chain,
        blocks,
        raw,
        derivation,
        entry_block,
    ))
}

/// Write a record envelope: presence flags, present sections in fixed
/// order, then the event counters
///
/// Value tables are never shipped; the flag is written for layout
/// stability and must be zero.
pub fn write_record<W: Write>(w: &mut W, record: &ProfileRecord) -> Result<()> {
    let chain = record.chain();
    let blocks = record.blocks();
    write_u8(w, 1)?;
    write_u8(w, blocks.is_some() as u8)?;
    write_u8(w, 0)?;
    write_chain(w, &chain)?;
    if let Some(blocks) = &blocks {
        write_blocks(w, blocks)?;
    }
    write_u32(w, record.events().catches())?;
    write_u32(w, record.events().throws())?;
    Ok(())
}

/// Read a record written by [`write_record`]; the method identity is
/// supplied by the caller, since the envelope does not carry it
pub fn read_record<R: Read>(r: &mut R, method: MethodId) -> Result<Arc<ProfileRecord>> {
    let has_chain = read_u8(r)?;
    let has_blocks = read_u8(r)?;
    let has_values = read_u8(r)?;
    if has_chain != 1 {
        return Err(Error::invalid("record without a chain"));
    }
    if has_blocks > 1 {
        return Err(Error::invalid(format!("bad block flag {}", has_blocks)));
    }
    if has_values != 0 {
        return Err(Error::invalid("record claims serialized value tables"));
    }

    let chain = Arc::new(read_chain(r)?);
    let blocks = if has_blocks == 1 {
        Some(read_blocks(r, chain.clone())?)
    } else {
        None
    };
    let catches = read_u32(r)?;
    let throws = read_u32(r)?;
    Ok(ProfileRecord::from_parts(
        method,
        chain,
        blocks,
        EventCounters::preset(catches, throws),
    ))
}

/// Write the file header: magic plus format version
pub fn write_header<W: Write>(w: &mut W) -> Result<()> {
    w.write_all(&MAGIC)?;
    write_u32(w, FORMAT_VERSION)?;
    Ok(())
}

/// Validate the file header
pub fn read_header<R: Read>(r: &mut R) -> Result<()> {
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic)?;
    if magic != MAGIC {
        return Err(Error::invalid("bad magic bytes"));
    }
    let version = read_u32(r)?;
    if version != FORMAT_VERSION {
        return Err(Error::UnsupportedVersion {
            found: version,
            supported: FORMAT_VERSION,
        });
    }
    Ok(())
}

/// Save one record to `path` with the file header
pub fn save_record<P: AsRef<Path>>(path: P, record: &ProfileRecord) -> Result<()> {
    let mut w = BufWriter::new(File::create(path)?);
    write_header(&mut w)?;
    write_record(&mut w, record)?;
    w.flush()?;
    Ok(())
}

/// Load one record from `path`, verifying the header
pub fn load_record<P: AsRef<Path>>(path: P, method: MethodId) -> Result<Arc<ProfileRecord>> {
    let mut r = BufReader::new(File::open(path)?);
    read_header(&mut r)?;
    read_record(&mut r, method)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocks::{FrequencyQuery, QueryContext};
    use pretty_assertions::assert_eq;
    use std::io::Cursor;
    use std::sync::atomic::Ordering;

    fn sample_chain() -> CallSiteChain {
        CallSiteChain::new(vec![
            InlinedCallSite {
                callee: MethodId(0xaa),
                at_caller: ByteCodeLocation::outermost(12),
            },
            InlinedCallSite {
                callee: MethodId(0xbb),
                at_caller: ByteCodeLocation::new(0, 30),
            },
        ])
    }

    fn sample_store(chain: Arc<CallSiteChain>) -> BlockFrequencyStore {
        let store = BlockFrequencyStore::derived(
            chain,
            vec![
                BlockEntry::at(ByteCodeLocation::outermost(0)),
                BlockEntry::at(ByteCodeLocation::new(0, 4)),
                BlockEntry::at(ByteCodeLocation::new(1, 2)),
            ],
            3,
            vec![
                DerivationPair {
                    add: DerivationSlot::Direct(0),
                    sub: DerivationSlot::Absent,
                },
                DerivationPair {
                    add: DerivationSlot::Set([0usize, 1].into_iter().collect()),
                    sub: DerivationSlot::Direct(2),
                },
                DerivationPair {
                    add: DerivationSlot::Set([2usize].into_iter().collect()),
                    sub: DerivationSlot::Set(BitSet::new()),
                },
            ],
            0,
        );
        store.record_slot(0).store(100, Ordering::Relaxed);
        store.record_slot(1).store(40, Ordering::Relaxed);
        store.record_slot(2).store(10, Ordering::Relaxed);
        store
    }

    #[test]
    fn test_chain_round_trip() {
        let chain = sample_chain();
        let mut buf = Vec::new();
        write_chain(&mut buf, &chain).unwrap();
        let reloaded = read_chain(&mut Cursor::new(buf)).unwrap();
        assert_eq!(reloaded, chain);
    }

    #[test]
    fn test_blocks_round_trip_preserves_answers() {
        let chain = Arc::new(sample_chain());
        let store = sample_store(chain.clone());
        let mut buf = Vec::new();
        write_blocks(&mut buf, &store).unwrap();
        let reloaded = read_blocks(&mut Cursor::new(buf), chain.clone()).unwrap();

        assert_eq!(reloaded.max_raw_count(None), store.max_raw_count(None));
        assert_eq!(reloaded.max_raw_count(Some(0)), store.max_raw_count(Some(0)));
        assert_eq!(reloaded.call_count(), store.call_count());
        let ctx = QueryContext::empty();
        for block in store.blocks() {
            let query = FrequencyQuery {
                method: MethodId(1),
                location: block.location,
                chain: &chain,
                normalize_across_callers: true,
            };
            assert_eq!(reloaded.frequency(&query, &ctx), store.frequency(&query, &ctx));
        }
    }

    #[test]
    fn test_record_round_trip() {
        let chain = Arc::new(sample_chain());
        let record = ProfileRecord::new(MethodId(5), chain.clone());
        record.install_blocks(sample_store(chain));
        record.events().record_catch();
        record.events().record_throw();
        record.events().record_throw();

        let mut buf = Vec::new();
        write_record(&mut buf, &record).unwrap();
        let reloaded = read_record(&mut Cursor::new(buf), MethodId(5)).unwrap();

        assert_eq!(reloaded.method(), MethodId(5));
        assert_eq!(*reloaded.chain(), *record.chain());
        assert_eq!(reloaded.events().catches(), 1);
        assert_eq!(reloaded.events().throws(), 2);
        let blocks = reloaded.blocks().unwrap();
        assert_eq!(blocks.max_raw_count(None), 130);
    }

    #[test]
    fn test_bad_magic() {
        let err = read_header(&mut Cursor::new(b"NOPE\x01\x00\x00\x00".to_vec())).unwrap_err();
        assert!(matches!(err, Error::InvalidFormat { .. }));
    }

    #[test]
    fn test_unsupported_version() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&MAGIC);
        buf.extend_from_slice(&9u32.to_le_bytes());
        let err = read_header(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, Error::UnsupportedVersion { found: 9, .. }));
    }

    #[test]
    fn test_value_flag_rejected() {
        let buf = vec![1u8, 0, 1];
        let err = read_record(&mut Cursor::new(buf), MethodId(1)).unwrap_err();
        assert!(matches!(err, Error::InvalidFormat { .. }));
    }

    #[test]
    fn test_truncated_input() {
        let chain = sample_chain();
        let mut buf = Vec::new();
        write_chain(&mut buf, &chain).unwrap();
        buf.truncate(buf.len() - 3);
        let err = read_chain(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_forward_caller_index_rejected() {
        let mut buf = Vec::new();
        write_u32(&mut buf, 1).unwrap();
        write_u64(&mut buf, 7).unwrap();
        write_i32(&mut buf, 3).unwrap(); // points past itself
        write_u32(&mut buf, 0).unwrap();
        let err = read_chain(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, Error::InvalidFormat { .. }));
    }

    #[test]
    fn test_bad_descriptor_rejected() {
        let chain = Arc::new(CallSiteChain::empty());
        let mut buf = Vec::new();
        write_u32(&mut buf, 1).unwrap(); // one block
        write_i32(&mut buf, NO_CALLER).unwrap(); // no entry block
        write_i32(&mut buf, NO_CALLER).unwrap(); // block location
        write_u32(&mut buf, 0).unwrap();
        write_u32(&mut buf, 1).unwrap(); // one counter
        write_u32(&mut buf, 0).unwrap();
        write_u8(&mut buf, 1).unwrap(); // derivation present
        write_u64(&mut buf, 4).unwrap(); // even, not a marker
        let err = read_blocks(&mut Cursor::new(buf), chain).unwrap_err();
        assert!(matches!(err, Error::InvalidFormat { .. }));
    }
}
