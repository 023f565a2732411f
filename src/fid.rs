//! Per-connection fid handles.
//!
//! A fid names a current position in the tree for one connection. Fids are
//! created by attach and walk, destroyed by clunk, remove, or connection
//! teardown. The table is only ever touched from the dispatcher, so it needs
//! no locking of its own.

use std::collections::HashMap;

use crate::error::{Result, VufsError};
use crate::tree::NodeId;

#[derive(Debug, Clone)]
pub struct Fid {
    /// Handle into the tree arena.
    pub node: NodeId,
    /// The uid that attached; fixed for the life of the fid.
    pub uid: String,
    /// Set exactly once, by open or create.
    pub open: bool,
    /// The open mode, meaningful only when `open`.
    pub open_mode: u8,
    /// Byte offset at which the next directory read may continue.
    pub dir_offset: u64,
    /// Child index matching `dir_offset`.
    pub dir_index: usize,
}

impl Fid {
    pub fn new(node: NodeId, uid: impl Into<String>) -> Fid {
        Fid {
            node,
            uid: uid.into(),
            open: false,
            open_mode: 0,
            dir_offset: 0,
            dir_index: 0,
        }
    }
}

/// The fid table of one connection.
#[derive(Debug, Default)]
pub struct FidTable {
    fids: HashMap<u32, Fid>,
}

impl FidTable {
    pub fn new() -> FidTable {
        FidTable::default()
    }

    /// Bind `fid` to a new handle. Fails if the number is already bound.
    pub fn insert(&mut self, fid: u32, f: Fid) -> Result<()> {
        match self.fids.entry(fid) {
            std::collections::hash_map::Entry::Occupied(_) => Err(VufsError::FidInUse),
            std::collections::hash_map::Entry::Vacant(e) => {
                e.insert(f);
                Ok(())
            }
        }
    }

    pub fn lookup(&self, fid: u32) -> Result<&Fid> {
        self.fids.get(&fid).ok_or(VufsError::FidNotFound)
    }

    pub fn lookup_mut(&mut self, fid: u32) -> Result<&mut Fid> {
        self.fids.get_mut(&fid).ok_or(VufsError::FidNotFound)
    }

    pub fn contains(&self, fid: u32) -> bool {
        self.fids.contains_key(&fid)
    }

    pub fn remove(&mut self, fid: u32) -> Option<Fid> {
        self.fids.remove(&fid)
    }

    /// Empty the table, yielding every fid. Used at connection teardown and
    /// on session reset.
    pub fn drain(&mut self) -> Vec<Fid> {
        self.fids.drain().map(|(_, f)| f).collect()
    }

    pub fn len(&self) -> usize {
        self.fids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fids.is_empty()
    }
}
