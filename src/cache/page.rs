use crate::cache::arena::ArenaId;
use crate::cache::evicter::BagKind;
use crate::cache::pagecache::CacheShared;
use crate::cache::sync::OneShot;
use crate::serializer::{BlockId, BlockToken};

use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::Arc;

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{RawRwLock, RwLock};

pub(crate) type PageSlot = ArenaId<Page>;

/// Resident bytes of one page. The buffer is shared with guards that
/// outlive the shard lock, so reads and writes happen outside it.
pub(crate) struct PageBuf {
    pub data: Arc<RwLock<Vec<u8>>>,
    pub size: usize,
}

impl PageBuf {
    pub fn new(bytes: Vec<u8>) -> Self {
        let size = bytes.len();
        Self {
            data: Arc::new(RwLock::new(bytes)),
            size,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum LoadState {
    Idle,
    /// A background fetch of just the index entry is in flight.
    FetchingToken,
    /// A full block load is in flight.
    Loading,
}

/// The value of one on-disk block, in one of its versions.
///
/// A page is never value-less: at all times a load is in flight, the
/// buffer is resident, or a disk token tells us where to reload from.
pub(crate) struct Page {
    pub block_id: BlockId,
    pub buf: Option<PageBuf>,
    pub token: Option<BlockToken>,
    pub load: LoadState,
    /// Rolling counter sample used by approximate-LRU victim probing.
    pub access_time: u64,
    /// Pulsed when an in-flight load or copy finishes.
    pub waiters: Vec<Arc<OneShot<()>>>,
    /// Snapshot acquirers plus unflushed changes holding this version.
    pub refs: usize,
    /// Guards currently dereferencing the buffer; blocks eviction.
    pub pins: usize,
    pub bag: Option<BagKind>,
    pub backindex: Option<usize>,
}

impl Page {
    pub fn new(block_id: BlockId) -> Self {
        Self {
            block_id,
            buf: None,
            token: None,
            load: LoadState::Idle,
            access_time: 0,
            waiters: Vec::new(),
            refs: 0,
            pins: 0,
            bag: None,
            backindex: None,
        }
    }

    pub fn with_buf(block_id: BlockId, bytes: Vec<u8>) -> Self {
        let mut page = Self::new(block_id);
        page.buf = Some(PageBuf::new(bytes));
        page
    }

    pub fn is_loading(&self) -> bool {
        self.load != LoadState::Idle
    }

    pub fn buf_bytes(&self) -> usize {
        self.buf.as_ref().map_or(0, |buf| buf.size)
    }

    /// Discard the resident buffer. Only legal once the page has been
    /// flushed; the token is the sole remaining copy of the value.
    pub fn evict_self(&mut self) -> usize {
        assert!(self.token.is_some(), "evicting a page with no disk copy");
        assert_eq!(self.pins, 0, "evicting a pinned page");
        let buf = self.buf.take().expect("evicting a page with no buffer");
        buf.size
    }
}

/// Shared read access to a page's bytes. Holding the guard pins the
/// page against eviction; dropping it unpins. The lifetime ties the
/// guard to its acquisition, so a guard can never outlive the claim
/// it was granted under.
pub struct PageReadGuard<'acq> {
    guard: ArcRwLockReadGuard<RawRwLock, Vec<u8>>,
    shared: Arc<CacheShared>,
    slot: PageSlot,
    _acq: PhantomData<&'acq ()>,
}

impl PageReadGuard<'_> {
    pub(crate) fn new(
        guard: ArcRwLockReadGuard<RawRwLock, Vec<u8>>,
        shared: Arc<CacheShared>,
        slot: PageSlot,
    ) -> Self {
        Self {
            guard,
            shared,
            slot,
            _acq: PhantomData,
        }
    }
}

impl Deref for PageReadGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.guard
    }
}

impl Drop for PageReadGuard<'_> {
    fn drop(&mut self) {
        self.shared.unpin_page(self.slot);
    }
}

/// Exclusive write access to a page's bytes.
pub struct PageWriteGuard<'acq> {
    guard: ArcRwLockWriteGuard<RawRwLock, Vec<u8>>,
    shared: Arc<CacheShared>,
    slot: PageSlot,
    _acq: PhantomData<&'acq ()>,
}

impl PageWriteGuard<'_> {
    pub(crate) fn new(
        guard: ArcRwLockWriteGuard<RawRwLock, Vec<u8>>,
        shared: Arc<CacheShared>,
        slot: PageSlot,
    ) -> Self {
        Self {
            guard,
            shared,
            slot,
            _acq: PhantomData,
        }
    }

    /// Replace the buffer's contents wholesale.
    pub fn overwrite(&mut self, bytes: &[u8]) {
        self.guard.clear();
        self.guard.extend_from_slice(bytes);
    }
}

impl Deref for PageWriteGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.guard
    }
}

impl std::ops::DerefMut for PageWriteGuard<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.guard
    }
}

impl Drop for PageWriteGuard<'_> {
    fn drop(&mut self) {
        self.shared.note_page_resized(self.slot, self.guard.len());
        self.shared.unpin_page(self.slot);
    }
}
