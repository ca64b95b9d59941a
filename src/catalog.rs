//! In-memory tag/blob catalog.
//!
//! The catalog is the state the transaction log protects: tags own
//! blobs, blobs own an ordered list of blocks. Mutations are logged
//! before they are applied; on restart [`Catalog::replay`] folds the log
//! back into an equivalent catalog.

use crate::error::Result;
use crate::wal::{BlockList, TagId, TransactionLog, TxnRecord};
use std::collections::HashMap;

/// A named tag.
#[derive(Debug, Clone, PartialEq)]
pub struct Tag {
    /// Human-readable name.
    pub name: String,
    /// Assigned id.
    pub id: TagId,
}

/// A blob under a tag.
#[derive(Debug, Clone, PartialEq)]
pub struct Blob {
    /// Owning tag.
    pub tag: TagId,
    /// Name, unique within the tag.
    pub name: String,
    /// Placement score.
    pub score: f32,
    /// Ordered block list.
    pub blocks: BlockList,
}

/// The catalog: every tag and blob currently alive.
#[derive(Debug, Default)]
pub struct Catalog {
    tags: HashMap<TagId, Tag>,
    blobs: HashMap<(TagId, String), Blob>,
}

impl Catalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one decoded record.
    ///
    /// Replay is tolerant: records referring to entities that no longer
    /// exist (the log can legitimately contain stale sequences after
    /// compaction races were ruled out) are ignored rather than failing
    /// the whole recovery.
    pub fn apply(&mut self, record: &TxnRecord) {
        match record {
            TxnRecord::CreateTag { tag_name, tag } => {
                self.tags.insert(
                    *tag,
                    Tag {
                        name: tag_name.clone(),
                        id: *tag,
                    },
                );
            }
            TxnRecord::DelTag { tag, .. } => {
                self.tags.remove(tag);
                self.blobs.retain(|(owner, _), _| owner != tag);
            }
            TxnRecord::CreateNewBlob {
                tag,
                blob_name,
                score,
            } => {
                self.blobs.insert(
                    (*tag, blob_name.clone()),
                    Blob {
                        tag: *tag,
                        name: blob_name.clone(),
                        score: *score,
                        blocks: BlockList::new(),
                    },
                );
            }
            TxnRecord::ExtendBlob {
                tag,
                blob_name,
                blocks,
            } => {
                if let Some(blob) = self.blobs.get_mut(&(*tag, blob_name.clone())) {
                    blob.blocks.extend(blocks.iter().copied());
                }
            }
            TxnRecord::ClearBlob { tag, blob_name } => {
                if let Some(blob) = self.blobs.get_mut(&(*tag, blob_name.clone())) {
                    blob.blocks.clear();
                }
            }
            TxnRecord::DelBlob { tag, blob_name } => {
                self.blobs.remove(&(*tag, blob_name.clone()));
            }
        }
    }

    /// Rebuild a catalog from the log, from empty state.
    pub fn replay(log: &TransactionLog) -> Result<Self> {
        let mut catalog = Self::new();
        for record in log.load()? {
            catalog.apply(&record);
        }
        Ok(catalog)
    }

    /// Look up a tag by id.
    pub fn tag(&self, id: TagId) -> Option<&Tag> {
        self.tags.get(&id)
    }

    /// Look up a blob by owning tag and name.
    pub fn blob(&self, tag: TagId, name: &str) -> Option<&Blob> {
        self.blobs.get(&(tag, name.to_string()))
    }

    /// Number of live tags.
    pub fn tag_count(&self) -> usize {
        self.tags.len()
    }

    /// Number of live blobs.
    pub fn blob_count(&self) -> usize {
        self.blobs.len()
    }
}
