//! In-memory checkpoints and the named cursors that traverse them.

use hashbrown::HashMap;

use tide_common::error::{DcpError, DcpResult};
use tide_common::ids::{Seqno, Vbid};

use crate::item::Item;

/// One entry yielded to a draining cursor.
///
/// Control meta-entries delimit checkpoints so the reader can emit exactly one snapshot marker
/// per contiguous sequence range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CursorEntry {
    /// Start of a checkpoint; all following items share one snapshot.
    CheckpointStart {
        /// Id of the checkpoint being entered.
        checkpoint_id: u64,
    },
    /// One sequenced item.
    Item(Item),
    /// End of a closed checkpoint.
    CheckpointEnd {
        /// Id of the checkpoint being left.
        checkpoint_id: u64,
    },
}

/// An in-memory grouping of sequenced mutations.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Checkpoint {
    id: u64,
    items: Vec<Item>,
    open: bool,
}

impl Checkpoint {
    fn first_seqno(&self) -> Option<Seqno> {
        self.items.first().map(|item| item.by_seqno)
    }
}

/// Named read position inside the checkpoint sequence.
///
/// `offset == 0` means the checkpoint-start meta-entry has not been yielded yet; offset `n >= 1`
/// means `n - 1` items have been consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CursorPosition {
    checkpoint_id: u64,
    offset: usize,
    drained: u64,
}

/// Checkpoint bookkeeping for one vBucket.
#[derive(Debug)]
pub struct CheckpointManager {
    vbid: Vbid,
    checkpoints: Vec<Checkpoint>,
    cursors: HashMap<String, CursorPosition>,
    /// Highest seqno already reclaimed from memory; history at or below it needs backfill.
    purge_floor: Seqno,
    last_queued_seqno: Seqno,
}

impl CheckpointManager {
    /// Creates the manager with one open checkpoint, id 1.
    #[must_use]
    pub fn new(vbid: Vbid) -> Self {
        Self {
            vbid,
            checkpoints: vec![Checkpoint {
                id: 1,
                items: Vec::new(),
                open: true,
            }],
            cursors: HashMap::new(),
            purge_floor: 0,
            last_queued_seqno: 0,
        }
    }

    /// Returns the owning vBucket id.
    #[must_use]
    pub fn vbid(&self) -> Vbid {
        self.vbid
    }

    /// Id of the current open checkpoint.
    #[must_use]
    pub fn open_checkpoint_id(&self) -> u64 {
        self.checkpoints
            .last()
            .map_or(0, |checkpoint| checkpoint.id)
    }

    /// Renumbers the current open checkpoint.
    ///
    /// A replica entering a disk snapshot phase sets the id to zero.
    pub fn set_open_checkpoint_id(&mut self, id: u64) {
        if let Some(checkpoint) = self.checkpoints.last_mut() {
            checkpoint.id = id;
        }
    }

    /// Number of checkpoints currently held, open checkpoint included.
    #[must_use]
    pub fn num_checkpoints(&self) -> usize {
        self.checkpoints.len()
    }

    /// Closes the open checkpoint and opens a fresh one with the next id.
    ///
    /// Returns the new open-checkpoint id.
    pub fn create_checkpoint(&mut self) -> u64 {
        let next_id = self.open_checkpoint_id().saturating_add(1);
        if let Some(checkpoint) = self.checkpoints.last_mut() {
            checkpoint.open = false;
        }
        self.checkpoints.push(Checkpoint {
            id: next_id,
            items: Vec::new(),
            open: true,
        });
        next_id
    }

    /// Appends one sequenced item to the open checkpoint.
    ///
    /// # Errors
    ///
    /// Returns `DcpError::InvalidArgument` when the item's seqno does not advance the sequence.
    pub fn queue_item(&mut self, item: Item) -> DcpResult<()> {
        if item.by_seqno <= self.last_queued_seqno {
            return Err(DcpError::InvalidArgument(format!(
                "seqno {} does not advance checkpoint sequence past {}",
                item.by_seqno, self.last_queued_seqno
            )));
        }
        self.last_queued_seqno = item.by_seqno;
        let checkpoint = self
            .checkpoints
            .last_mut()
            .expect("manager always holds an open checkpoint");
        checkpoint.items.push(item);
        Ok(())
    }

    /// Highest seqno queued into checkpoints so far.
    #[must_use]
    pub fn last_queued_seqno(&self) -> Seqno {
        self.last_queued_seqno
    }

    /// Returns whether in-memory history still covers a stream starting at `start_seqno`.
    #[must_use]
    pub fn covers_start_seqno(&self, start_seqno: Seqno) -> bool {
        start_seqno >= self.purge_floor
    }

    /// Registers a named cursor positioned just past `start_seqno`.
    ///
    /// # Errors
    ///
    /// Returns `DcpError::TempFail` when history past `start_seqno` has been reclaimed and the
    /// reader must backfill from disk instead.
    pub fn register_cursor(&mut self, name: &str, start_seqno: Seqno) -> DcpResult<()> {
        if !self.covers_start_seqno(start_seqno) {
            return Err(DcpError::TempFail("start seqno precedes retained history"));
        }

        let mut position = CursorPosition {
            checkpoint_id: self.open_checkpoint_id(),
            offset: 0,
            drained: 0,
        };
        for checkpoint in &self.checkpoints {
            let skipped = checkpoint
                .items
                .iter()
                .take_while(|item| item.by_seqno <= start_seqno)
                .count();
            if skipped < checkpoint.items.len() || checkpoint.open {
                position.checkpoint_id = checkpoint.id;
                position.offset = if skipped == 0 { 0 } else { skipped + 1 };
                break;
            }
        }
        self.cursors.insert(name.to_owned(), position);
        Ok(())
    }

    /// Removes a named cursor.
    pub fn deregister_cursor(&mut self, name: &str) {
        let _ = self.cursors.remove(name);
    }

    /// Returns whether a cursor with this name is registered.
    #[must_use]
    pub fn has_cursor(&self, name: &str) -> bool {
        self.cursors.contains_key(name)
    }

    /// Items drained through a cursor since registration.
    #[must_use]
    pub fn cursor_drained(&self, name: &str) -> u64 {
        self.cursors
            .get(name)
            .map_or(0, |position| position.drained)
    }

    /// Drains up to `max_items` sequenced items through the named cursor.
    ///
    /// Checkpoint start/end meta-entries are interleaved where crossed and do not count toward
    /// the bound. Returns an empty batch when the cursor has caught up.
    pub fn drain_cursor(&mut self, name: &str, max_items: usize) -> Vec<CursorEntry> {
        let Some(mut position) = self.cursors.get(name).copied() else {
            return Vec::new();
        };

        let mut batch = Vec::new();
        let mut items_taken = 0_usize;

        'checkpoints: loop {
            let Some(index) = self
                .checkpoints
                .iter()
                .position(|checkpoint| checkpoint.id == position.checkpoint_id)
            else {
                // The cursor's checkpoint was renumbered or reclaimed; restart at the oldest.
                let Some(oldest) = self.checkpoints.first() else {
                    break;
                };
                position.checkpoint_id = oldest.id;
                position.offset = 0;
                continue;
            };

            if position.offset == 0 {
                batch.push(CursorEntry::CheckpointStart {
                    checkpoint_id: position.checkpoint_id,
                });
                position.offset = 1;
            }

            loop {
                let checkpoint = &self.checkpoints[index];
                let item_index = position.offset - 1;
                if item_index < checkpoint.items.len() {
                    if items_taken == max_items {
                        break 'checkpoints;
                    }
                    batch.push(CursorEntry::Item(checkpoint.items[item_index].clone()));
                    position.offset += 1;
                    position.drained += 1;
                    items_taken += 1;
                    continue;
                }
                if checkpoint.open {
                    break 'checkpoints;
                }
                batch.push(CursorEntry::CheckpointEnd {
                    checkpoint_id: position.checkpoint_id,
                });
                match self.checkpoints.get(index + 1) {
                    Some(next) => {
                        position.checkpoint_id = next.id;
                        position.offset = 0;
                        continue 'checkpoints;
                    }
                    None => break 'checkpoints,
                }
            }
        }

        if let Some(stored) = self.cursors.get_mut(name) {
            *stored = position;
        }
        batch
    }

    /// Drops closed checkpoints every cursor has fully passed.
    ///
    /// Returns the number of items reclaimed from memory.
    pub fn remove_closed_unreferenced_checkpoints(&mut self) -> usize {
        let mut reclaimed = 0_usize;
        while self.checkpoints.len() > 1 {
            let candidate = &self.checkpoints[0];
            if candidate.open {
                break;
            }
            let candidate_id = candidate.id;
            let passed_by_all = self
                .cursors
                .values()
                .all(|cursor| cursor.checkpoint_id > candidate_id);
            if !passed_by_all {
                break;
            }
            let removed = self.checkpoints.remove(0);
            reclaimed += removed.items.len();
            if let Some(last) = removed.items.last() {
                self.purge_floor = self.purge_floor.max(last.by_seqno);
            }
        }
        reclaimed
    }

    /// First seqno still retained in memory, if any items are held.
    #[must_use]
    pub fn oldest_retained_seqno(&self) -> Option<Seqno> {
        self.checkpoints
            .iter()
            .find_map(Checkpoint::first_seqno)
    }
}
