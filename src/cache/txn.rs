use crate::cache::BlockVersion;
use crate::cache::arena::ArenaId;
use crate::cache::backindex::{BackindexBag, IndexStore};
use crate::cache::current::CurrentPage;
use crate::cache::page::PageSlot;
use crate::cache::sync::{OneShot, SemaphoreAcq};
use crate::serializer::{BlockId, CacheAccount, Recency};

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

pub(crate) type TxnId = ArenaId<TxnState>;

/// Surfaced to every transaction whose flush set failed to commit.
/// Durability state of the whole set is ambiguous after a failed
/// batch write, so the error is terminal for those transactions.
#[derive(Error, Debug, Clone)]
pub enum FlushError {
    #[error("flush failed: {0}")]
    Serializer(String),
}

/// Permits for this transaction's outstanding unflushed changes: one
/// per dirty page plus one for the index write itself.
pub(crate) struct ThrottlerAcq {
    acq: SemaphoreAcq,
}

impl ThrottlerAcq {
    pub fn new(acq: SemaphoreAcq) -> Self {
        Self { acq }
    }

    pub fn update_dirty_page_count(&mut self, modify_count: u64) {
        self.acq.change_count(modify_count + 1);
    }
}

#[derive(Debug)]
pub(crate) enum ChangeKind {
    /// New bytes for the block; holds a reference on the page slot
    /// until the flush installs a token and releases it.
    Modify(PageSlot),
    /// Recency-only update.
    Touch,
    Delete,
}

/// Net modification a transaction holds for one block.
#[derive(Debug)]
pub(crate) struct Change {
    pub block_version: BlockVersion,
    pub kind: ChangeKind,
    pub recency: Recency,
}

/// Collapse two changes for the same block into one, later version
/// winning. A touch never supersedes a modify's bytes: the modify's
/// buffer is kept under the touch's version and recency. Returns the
/// page slot whose reference the merge released, if any.
pub(crate) fn merge_change(existing: Change, incoming: Change) -> (Change, Option<PageSlot>) {
    let (mut winner, loser) = if incoming.block_version >= existing.block_version {
        (incoming, existing)
    } else {
        (existing, incoming)
    };
    match (&winner.kind, loser.kind) {
        (ChangeKind::Touch, ChangeKind::Modify(slot)) => {
            winner.kind = ChangeKind::Modify(slot);
            (winner, None)
        }
        (_, ChangeKind::Modify(slot)) => (winner, Some(slot)),
        (_, _) => (winner, None),
    }
}

/// A set of block changes that commit together, ordered against other
/// transactions by the preceder/subseqer graph.
pub(crate) struct TxnState {
    pub throttler: Option<ThrottlerAcq>,
    /// I/O account demand loads for this transaction are charged to.
    pub account: CacheAccount,
    /// Blocks whose latest write acquirer is this transaction.
    pub pages_write_acquired_last: BackindexBag<BlockId>,
    /// Blocks whose latest dirtier is this transaction.
    pub pages_dirtied_last: BackindexBag<BlockId>,
    /// Transactions that must flush no later than this one.
    pub preceders: Vec<TxnId>,
    pub subseqers: Vec<TxnId>,
    pub changes: HashMap<BlockId, Change>,
    /// Acquisitions not yet released.
    pub live_acqs: usize,
    pub began_waiting_for_flush: bool,
    pub spawned_flush: bool,
    pub flush_complete: Arc<OneShot<Result<(), FlushError>>>,
}

impl TxnState {
    pub fn new(throttler: Option<ThrottlerAcq>, account: CacheAccount) -> Self {
        Self {
            throttler,
            account,
            pages_write_acquired_last: BackindexBag::new(),
            pages_dirtied_last: BackindexBag::new(),
            preceders: Vec::new(),
            subseqers: Vec::new(),
            changes: HashMap::new(),
            live_acqs: 0,
            began_waiting_for_flush: false,
            spawned_flush: false,
            flush_complete: OneShot::new(),
        }
    }

    pub fn modify_count(&self) -> u64 {
        self.changes
            .values()
            .filter(|change| matches!(change.kind, ChangeKind::Modify(_)))
            .count() as u64
    }
}

/// Backindex store for [`TxnState::pages_write_acquired_last`]; the
/// index lives on the block's `CurrentPage`.
pub(crate) struct WriteAcqIndex<'a>(pub &'a mut HashMap<BlockId, CurrentPage>);

impl IndexStore<BlockId> for WriteAcqIndex<'_> {
    fn backindex(&self, item: BlockId) -> Option<usize> {
        self.0.get(&item).and_then(|cp| cp.write_acq_backindex)
    }

    fn set_backindex(&mut self, item: BlockId, index: Option<usize>) {
        if let Some(cp) = self.0.get_mut(&item) {
            cp.write_acq_backindex = index;
        }
    }
}

/// Backindex store for [`TxnState::pages_dirtied_last`].
pub(crate) struct DirtiedIndex<'a>(pub &'a mut HashMap<BlockId, CurrentPage>);

impl IndexStore<BlockId> for DirtiedIndex<'_> {
    fn backindex(&self, item: BlockId) -> Option<usize> {
        self.0.get(&item).and_then(|cp| cp.dirtied_backindex)
    }

    fn set_backindex(&mut self, item: BlockId, index: Option<usize>) {
        if let Some(cp) = self.0.get_mut(&item) {
            cp.dirtied_backindex = index;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::cache::arena::Arena;
    use crate::cache::page::Page;

    fn slot(pages: &mut Arena<Page>, id: u32) -> PageSlot {
        pages.insert(Page::with_buf(BlockId::new(id), vec![id as u8]))
    }

    #[test]
    fn later_modify_wins_and_releases_earlier_buffer() {
        let mut pages = Arena::new();
        let old = slot(&mut pages, 1);
        let new = slot(&mut pages, 1);

        let (merged, released) = merge_change(
            Change {
                block_version: BlockVersion::ZERO.next(),
                kind: ChangeKind::Modify(old),
                recency: Recency::new(1),
            },
            Change {
                block_version: BlockVersion::ZERO.next().next(),
                kind: ChangeKind::Modify(new),
                recency: Recency::new(2),
            },
        );
        assert_eq!(released, Some(old));
        assert!(matches!(merged.kind, ChangeKind::Modify(s) if s == new));
        assert_eq!(merged.recency, Recency::new(2));
    }

    #[test]
    fn touch_after_modify_keeps_bytes_under_later_version() {
        let mut pages = Arena::new();
        let modified = slot(&mut pages, 1);

        let (merged, released) = merge_change(
            Change {
                block_version: BlockVersion::ZERO.next(),
                kind: ChangeKind::Modify(modified),
                recency: Recency::new(1),
            },
            Change {
                block_version: BlockVersion::ZERO.next().next(),
                kind: ChangeKind::Touch,
                recency: Recency::new(5),
            },
        );
        assert_eq!(released, None);
        assert!(matches!(merged.kind, ChangeKind::Modify(s) if s == modified));
        assert_eq!(merged.block_version, BlockVersion::ZERO.next().next());
        assert_eq!(merged.recency, Recency::new(5));
    }

    #[test]
    fn delete_after_modify_releases_the_buffer() {
        let mut pages = Arena::new();
        let modified = slot(&mut pages, 1);

        let (merged, released) = merge_change(
            Change {
                block_version: BlockVersion::ZERO.next(),
                kind: ChangeKind::Modify(modified),
                recency: Recency::new(1),
            },
            Change {
                block_version: BlockVersion::ZERO.next().next(),
                kind: ChangeKind::Delete,
                recency: Recency::new(2),
            },
        );
        assert_eq!(released, Some(modified));
        assert!(matches!(merged.kind, ChangeKind::Delete));
    }

    #[test]
    fn modify_count_ignores_touches_and_deletes() {
        let mut pages = Arena::new();
        let mut txn = TxnState::new(None, CacheAccount::new(crate::serializer::IoPriority::READS));
        txn.changes.insert(
            BlockId::new(0),
            Change {
                block_version: BlockVersion::ZERO.next(),
                kind: ChangeKind::Modify(slot(&mut pages, 0)),
                recency: Recency::new(1),
            },
        );
        txn.changes.insert(
            BlockId::new(1),
            Change {
                block_version: BlockVersion::ZERO.next(),
                kind: ChangeKind::Touch,
                recency: Recency::new(2),
            },
        );
        txn.changes.insert(
            BlockId::new(2),
            Change {
                block_version: BlockVersion::ZERO.next(),
                kind: ChangeKind::Delete,
                recency: Recency::new(3),
            },
        );
        assert_eq!(txn.modify_count(), 1);
    }
}
