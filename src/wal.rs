//! Append-only transaction log for the tag/blob catalog.
//!
//! Shared-memory regions are volatile; every catalog mutation is
//! recorded here first and replayed on restart. The on-disk grammar is
//! fixed and self-contained:
//!
//! ```text
//! record := [type: u8][payload_size: u32][payload bytes]
//! string := [length: u32][bytes]
//! block  := [bdev_major: u32][bdev_minor: u32][query: 16 bytes]
//!           [target_offset: u64][size: u64]
//! ```
//!
//! All integers are host-native byte order, constant between writer and
//! reader. `log` may buffer; `sync` makes everything previously logged
//! durable in program order. `load` replays sequentially and swallows a
//! torn final record silently — a crash mid-append loses at most the
//! record being written.

use crate::error::{Error, Result};
use bytes::{BufMut, BytesMut};
use smallvec::SmallVec;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// Length of the opaque placement query carried per block.
pub const POOL_QUERY_LEN: usize = 16;

/// Opaque placement-query bytes; the log stores them verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolQuery(pub [u8; POOL_QUERY_LEN]);

impl Default for PoolQuery {
    fn default() -> Self {
        Self([0; POOL_QUERY_LEN])
    }
}

/// Identifier of a tag (and, reused, of a block device pool).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TagId {
    /// Major component.
    pub major: u32,
    /// Minor component.
    pub minor: u32,
}

impl TagId {
    /// Create a tag id.
    #[inline]
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

/// One block of a blob: a device, a placement query, and a byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockEntry {
    /// Block-device major id.
    pub bdev_major: u32,
    /// Block-device minor id.
    pub bdev_minor: u32,
    /// Opaque placement query.
    pub query: PoolQuery,
    /// Byte offset on the target.
    pub target_offset: u64,
    /// Byte length.
    pub size: u64,
}

/// Block lists are almost always a handful of entries.
pub type BlockList = SmallVec<[BlockEntry; 4]>;

/// Transaction types, as stored in the record's leading byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TxnType {
    /// Create a blob's metadata (no blocks yet).
    CreateNewBlob = 0,
    /// Append blocks to a blob.
    ExtendBlob = 1,
    /// Drop all of a blob's blocks.
    ClearBlob = 2,
    /// Delete a blob.
    DelBlob = 3,
    /// Create a tag.
    CreateTag = 4,
    /// Delete a tag.
    DelTag = 5,
}

impl TxnType {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::CreateNewBlob),
            1 => Some(Self::ExtendBlob),
            2 => Some(Self::ClearBlob),
            3 => Some(Self::DelBlob),
            4 => Some(Self::CreateTag),
            5 => Some(Self::DelTag),
            _ => None,
        }
    }
}

/// A decoded catalog mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum TxnRecord {
    /// Create a blob's metadata under a tag.
    CreateNewBlob {
        /// Owning tag.
        tag: TagId,
        /// Blob name, unique within the tag.
        blob_name: String,
        /// Placement score.
        score: f32,
    },
    /// Append blocks to a blob.
    ExtendBlob {
        /// Owning tag.
        tag: TagId,
        /// Blob name.
        blob_name: String,
        /// Blocks to append, in order.
        blocks: BlockList,
    },
    /// Drop all blocks from a blob, keeping its metadata.
    ClearBlob {
        /// Owning tag.
        tag: TagId,
        /// Blob name.
        blob_name: String,
    },
    /// Delete a blob entirely.
    DelBlob {
        /// Owning tag.
        tag: TagId,
        /// Blob name.
        blob_name: String,
    },
    /// Create a tag.
    CreateTag {
        /// Tag name.
        tag_name: String,
        /// Assigned id.
        tag: TagId,
    },
    /// Delete a tag.
    DelTag {
        /// Tag name.
        tag_name: String,
        /// Id being deleted.
        tag: TagId,
    },
}

impl TxnRecord {
    /// The wire type byte for this record.
    pub fn txn_type(&self) -> TxnType {
        match self {
            Self::CreateNewBlob { .. } => TxnType::CreateNewBlob,
            Self::ExtendBlob { .. } => TxnType::ExtendBlob,
            Self::ClearBlob { .. } => TxnType::ClearBlob,
            Self::DelBlob { .. } => TxnType::DelBlob,
            Self::CreateTag { .. } => TxnType::CreateTag,
            Self::DelTag { .. } => TxnType::DelTag,
        }
    }

    fn encode_payload(&self, buf: &mut BytesMut) {
        match self {
            Self::CreateNewBlob {
                tag,
                blob_name,
                score,
            } => {
                put_tag(buf, *tag);
                put_string(buf, blob_name);
                buf.put_f32_ne(*score);
            }
            Self::ExtendBlob {
                tag,
                blob_name,
                blocks,
            } => {
                put_tag(buf, *tag);
                put_string(buf, blob_name);
                buf.put_u32_ne(blocks.len() as u32);
                for b in blocks {
                    buf.put_u32_ne(b.bdev_major);
                    buf.put_u32_ne(b.bdev_minor);
                    buf.put_slice(&b.query.0);
                    buf.put_u64_ne(b.target_offset);
                    buf.put_u64_ne(b.size);
                }
            }
            Self::ClearBlob { tag, blob_name } | Self::DelBlob { tag, blob_name } => {
                put_tag(buf, *tag);
                put_string(buf, blob_name);
            }
            Self::CreateTag { tag_name, tag } | Self::DelTag { tag_name, tag } => {
                put_string(buf, tag_name);
                put_tag(buf, *tag);
            }
        }
    }

    /// Decode one payload. `None` means the payload ran short or was
    /// malformed; replay treats that as the truncation point.
    fn decode(ty: TxnType, mut p: &[u8]) -> Option<TxnRecord> {
        let rec = match ty {
            TxnType::CreateNewBlob => Self::CreateNewBlob {
                tag: get_tag(&mut p)?,
                blob_name: get_string(&mut p)?,
                score: get_f32(&mut p)?,
            },
            TxnType::ExtendBlob => {
                let tag = get_tag(&mut p)?;
                let blob_name = get_string(&mut p)?;
                let nblocks = get_u32(&mut p)?;
                let mut blocks = BlockList::new();
                for _ in 0..nblocks {
                    blocks.push(BlockEntry {
                        bdev_major: get_u32(&mut p)?,
                        bdev_minor: get_u32(&mut p)?,
                        query: get_query(&mut p)?,
                        target_offset: get_u64(&mut p)?,
                        size: get_u64(&mut p)?,
                    });
                }
                Self::ExtendBlob {
                    tag,
                    blob_name,
                    blocks,
                }
            }
            TxnType::ClearBlob => Self::ClearBlob {
                tag: get_tag(&mut p)?,
                blob_name: get_string(&mut p)?,
            },
            TxnType::DelBlob => Self::DelBlob {
                tag: get_tag(&mut p)?,
                blob_name: get_string(&mut p)?,
            },
            TxnType::CreateTag => Self::CreateTag {
                tag_name: get_string(&mut p)?,
                tag: get_tag(&mut p)?,
            },
            TxnType::DelTag => Self::DelTag {
                tag_name: get_string(&mut p)?,
                tag: get_tag(&mut p)?,
            },
        };
        Some(rec)
    }
}

// ---- serialization primitives (host-native order) ----

fn put_tag(buf: &mut BytesMut, tag: TagId) {
    buf.put_u32_ne(tag.major);
    buf.put_u32_ne(tag.minor);
}

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u32_ne(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn get_u32(p: &mut &[u8]) -> Option<u32> {
    let (head, rest) = p.split_first_chunk::<4>()?;
    *p = rest;
    Some(u32::from_ne_bytes(*head))
}

fn get_u64(p: &mut &[u8]) -> Option<u64> {
    let (head, rest) = p.split_first_chunk::<8>()?;
    *p = rest;
    Some(u64::from_ne_bytes(*head))
}

fn get_f32(p: &mut &[u8]) -> Option<f32> {
    let (head, rest) = p.split_first_chunk::<4>()?;
    *p = rest;
    Some(f32::from_ne_bytes(*head))
}

fn get_query(p: &mut &[u8]) -> Option<PoolQuery> {
    let (head, rest) = p.split_first_chunk::<POOL_QUERY_LEN>()?;
    *p = rest;
    Some(PoolQuery(*head))
}

fn get_tag(p: &mut &[u8]) -> Option<TagId> {
    Some(TagId::new(get_u32(p)?, get_u32(p)?))
}

fn get_string(p: &mut &[u8]) -> Option<String> {
    let len = get_u32(p)? as usize;
    if p.len() < len {
        return None;
    }
    let s = String::from_utf8_lossy(&p[..len]).into_owned();
    *p = &p[len..];
    Some(s)
}

/// The write-ahead transaction log.
///
/// Single writer; replay is permitted only while no writer holds the
/// file.
pub struct TransactionLog {
    path: PathBuf,
    capacity: u64,
    writer: Option<BufWriter<File>>,
    scratch: BytesMut,
}

impl TransactionLog {
    /// Open (or create) the log in append mode.
    pub fn open(path: impl AsRef<Path>, capacity: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            capacity,
            writer: Some(BufWriter::new(file)),
            scratch: BytesMut::with_capacity(4096),
        })
    }

    /// Advisory capacity the caller sized the log for.
    #[inline]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// The log's on-disk path.
    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record. May buffer; call [`TransactionLog::sync`] for
    /// durability.
    pub fn log(&mut self, record: &TxnRecord) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| std::io::Error::other("transaction log is closed"))?;

        self.scratch.clear();
        record.encode_payload(&mut self.scratch);

        writer.write_all(&[record.txn_type() as u8])?;
        writer.write_all(&(self.scratch.len() as u32).to_ne_bytes())?;
        writer.write_all(&self.scratch)?;
        Ok(())
    }

    /// Make every previously appended record durable, in program order.
    pub fn sync(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
            writer.get_ref().sync_data()?;
        }
        Ok(())
    }

    /// Current on-disk size in bytes.
    pub fn size(&self) -> u64 {
        std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
    }

    /// Replay every decodable record from disk.
    ///
    /// A torn tail — a record whose header or payload extends past the
    /// end of the file, or whose payload does not decode — ends the
    /// replay silently; everything before it is returned.
    pub fn load(&self) -> Result<Vec<TxnRecord>> {
        let mut records = Vec::new();
        let mut bytes = Vec::new();
        match File::open(&self.path) {
            Ok(mut f) => {
                f.read_to_end(&mut bytes)?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(records),
            Err(e) => return Err(Error::Io(e)),
        }

        let mut p = &bytes[..];
        while p.len() >= 5 {
            let ty = p[0];
            let len = u32::from_ne_bytes([p[1], p[2], p[3], p[4]]) as usize;
            let rest = &p[5..];
            if rest.len() < len {
                tracing::debug!(
                    declared = len,
                    present = rest.len(),
                    "dropping torn record at log tail"
                );
                break;
            }
            let Some(ty) = TxnType::from_u8(ty) else {
                tracing::debug!(ty, "stopping replay at unknown record type");
                break;
            };
            let Some(rec) = TxnRecord::decode(ty, &rest[..len]) else {
                tracing::debug!(?ty, "stopping replay at undecodable payload");
                break;
            };
            records.push(rec);
            p = &rest[len..];
        }
        Ok(records)
    }

    /// Replace the log with an empty one after a successful snapshot.
    ///
    /// Close, reopen truncating, close, reopen appending: a crash in
    /// between leaves either the old contents or an empty file, never a
    /// partial overwrite.
    pub fn truncate(&mut self) -> Result<()> {
        self.close()?;
        let truncating = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        truncating.sync_all()?;
        drop(truncating);
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = Some(BufWriter::new(file));
        tracing::debug!(path = %self.path.display(), "truncated transaction log");
        Ok(())
    }

    /// Flush and close the file handle. Later appends fail until the
    /// log is reopened.
    pub fn close(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        Ok(())
    }
}

impl Drop for TransactionLog {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
