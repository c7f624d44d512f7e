use crate::cache::arena::{Arena, ArenaId};
use crate::cache::page::PageSlot;
use crate::cache::sync::OneShot;
use crate::cache::txn::TxnId;
use crate::cache::{AccessKind, BlockVersion};
use crate::serializer::BlockId;

use std::collections::VecDeque;
use std::sync::Arc;

pub(crate) type AcqId = ArenaId<AcqState>;

/// One transaction's claim on one block, queued behind earlier
/// acquirers of the same block.
pub(crate) struct AcqState {
    pub block_id: BlockId,
    pub access: AccessKind,
    /// Version this acquirer observes (readers) or writes (writers).
    pub block_version: BlockVersion,
    pub declared_snapshotted: bool,
    pub snapshotted_page: Option<PageSlot>,
    pub read_signal: Arc<OneShot<()>>,
    pub write_signal: Arc<OneShot<()>>,
    pub txn: TxnId,
    pub dirtied: bool,
    pub deleted: bool,
}

impl AcqState {
    pub fn new(
        block_id: BlockId,
        access: AccessKind,
        block_version: BlockVersion,
        txn: TxnId,
    ) -> Self {
        Self {
            block_id,
            access,
            block_version,
            declared_snapshotted: false,
            snapshotted_page: None,
            read_signal: OneShot::new(),
            write_signal: OneShot::new(),
            txn,
            dirtied: false,
            deleted: false,
        }
    }
}

/// The stable logical owner for a block id. Holds at most one live
/// page at a time and grants queued acquirers access in FIFO order.
pub(crate) struct CurrentPage {
    pub page: Option<PageSlot>,
    pub is_deleted: bool,
    pub last_write_acquirer: Option<TxnId>,
    pub last_write_version: BlockVersion,
    pub last_dirtier: Option<TxnId>,
    pub acquirers: VecDeque<AcqId>,
    /// Position in the last write acquirer's per-txn block bag.
    pub write_acq_backindex: Option<usize>,
    /// Position in the last dirtier's per-txn block bag.
    pub dirtied_backindex: Option<usize>,
}

impl CurrentPage {
    pub fn new() -> Self {
        Self {
            page: None,
            is_deleted: false,
            last_write_acquirer: None,
            last_write_version: BlockVersion::ZERO,
            last_dirtier: None,
            acquirers: VecDeque::new(),
            write_acq_backindex: None,
            dirtied_backindex: None,
        }
    }

    /// Grant availability to queued acquirers. Readers at the front
    /// proceed concurrently up to and including the first writer's
    /// read view; the writer's exclusive access is granted only once
    /// everything ahead of it has released.
    pub fn pump(&self, acqs: &Arena<AcqState>) {
        for (position, acq_id) in self.acquirers.iter().enumerate() {
            let acq = acqs.get(*acq_id).expect("queued acquirer destroyed");
            acq.read_signal.pulse_if_unpulsed(());
            if acq.access == AccessKind::Write {
                if position == 0 {
                    acq.write_signal.pulse_if_unpulsed(());
                }
                break;
            }
        }
    }

    pub fn remove_acquirer(&mut self, acq_id: AcqId) {
        let position = self
            .acquirers
            .iter()
            .position(|id| *id == acq_id)
            .expect("acquirer not queued");
        self.acquirers.remove(position);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push(
        cp: &mut CurrentPage,
        acqs: &mut Arena<AcqState>,
        access: AccessKind,
        txn: TxnId,
    ) -> AcqId {
        let version = match access {
            AccessKind::Write => {
                cp.last_write_version = cp.last_write_version.next();
                cp.last_write_version
            }
            AccessKind::Read => cp.last_write_version,
        };
        let id = acqs.insert(AcqState::new(BlockId::new(0), access, version, txn));
        cp.acquirers.push_back(id);
        cp.pump(acqs);
        id
    }

    #[test]
    fn readers_proceed_concurrently_writer_waits() {
        let mut txns = Arena::new();
        let txn = txns.insert(crate::cache::txn::TxnState::new(
            None,
            crate::serializer::CacheAccount::new(crate::serializer::IoPriority::READS),
        ));

        let mut acqs = Arena::new();
        let mut cp = CurrentPage::new();

        let r1 = push(&mut cp, &mut acqs, AccessKind::Read, txn);
        let r2 = push(&mut cp, &mut acqs, AccessKind::Read, txn);
        let w = push(&mut cp, &mut acqs, AccessKind::Write, txn);
        let r3 = push(&mut cp, &mut acqs, AccessKind::Read, txn);

        assert!(acqs.get(r1).unwrap().read_signal.is_pulsed());
        assert!(acqs.get(r2).unwrap().read_signal.is_pulsed());
        // the writer may read its own version but not write yet
        assert!(acqs.get(w).unwrap().read_signal.is_pulsed());
        assert!(!acqs.get(w).unwrap().write_signal.is_pulsed());
        assert!(!acqs.get(r3).unwrap().read_signal.is_pulsed());

        cp.remove_acquirer(r1);
        cp.remove_acquirer(r2);
        cp.pump(&acqs);
        assert!(acqs.get(w).unwrap().write_signal.is_pulsed());
        assert!(!acqs.get(r3).unwrap().read_signal.is_pulsed());

        cp.remove_acquirer(w);
        cp.pump(&acqs);
        assert!(acqs.get(r3).unwrap().read_signal.is_pulsed());
    }

    #[test]
    fn write_versions_strictly_increase() {
        let mut txns = Arena::new();
        let txn = txns.insert(crate::cache::txn::TxnState::new(
            None,
            crate::serializer::CacheAccount::new(crate::serializer::IoPriority::READS),
        ));

        let mut acqs = Arena::new();
        let mut cp = CurrentPage::new();

        let w1 = push(&mut cp, &mut acqs, AccessKind::Write, txn);
        let w2 = push(&mut cp, &mut acqs, AccessKind::Write, txn);
        let v1 = acqs.get(w1).unwrap().block_version;
        let v2 = acqs.get(w2).unwrap().block_version;
        assert!(v1 < v2);

        // second writer is granted strictly after the first releases
        assert!(acqs.get(w1).unwrap().write_signal.is_pulsed());
        assert!(!acqs.get(w2).unwrap().write_signal.is_pulsed());
        cp.remove_acquirer(w1);
        cp.pump(&acqs);
        assert!(acqs.get(w2).unwrap().write_signal.is_pulsed());
    }
}
