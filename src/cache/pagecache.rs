use crate::cache::arena::Arena;
use crate::cache::current::{AcqId, AcqState, CurrentPage};
use crate::cache::evicter::Evicter;
use crate::cache::page::{LoadState, Page, PageBuf, PageReadGuard, PageSlot, PageWriteGuard};
use crate::cache::sync::{OneShot, Semaphore};
use crate::cache::txn::{
    Change, ChangeKind, DirtiedIndex, FlushError, ThrottlerAcq, TxnId, TxnState, WriteAcqIndex,
    merge_change,
};
use crate::cache::AccessKind;
use crate::config::CacheConfig;
use crate::serializer::{
    BlockId, BlockToken, BufferWrite, CacheAccount, IoPriority, Recency, Serializer, WritePayload,
};

use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;
use std::sync::mpsc;
use std::sync::{Arc, Weak};
use std::thread;

use parking_lot::Mutex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("block was deleted")]
    BlockDeleted,
    #[error(transparent)]
    Flush(#[from] FlushError),
}

#[derive(Debug, Clone, Copy)]
pub struct CacheStats {
    pub resident_bytes: usize,
    pub memory_limit: usize,
    pub resident_pages: usize,
    pub evicted_pages: usize,
}

enum LoadJob {
    /// Prefetch just the index entry for a deferred page.
    FetchToken { slot: PageSlot, block_id: BlockId },
    /// Load a block's bytes from its durable token.
    LoadBlock {
        slot: PageSlot,
        block_id: BlockId,
        token: BlockToken,
        account: CacheAccount,
    },
}

/// All cache bookkeeping. One mutex owns the lot; blocking waits
/// happen on one-shot signals outside it.
struct Shard {
    pages: Arena<Page>,
    current_pages: HashMap<BlockId, CurrentPage>,
    acqs: Arena<AcqState>,
    txns: Arena<TxnState>,
    evicter: Evicter,
    free_ids: Vec<BlockId>,
    next_block_id: u32,
    recency_counter: u64,
}

impl Shard {
    fn next_recency(&mut self) -> Recency {
        self.recency_counter += 1;
        Recency::new(self.recency_counter)
    }
}

pub(crate) struct CacheShared {
    shard: Mutex<Shard>,
    serializer: Arc<dyn Serializer>,
    /// Dropped to `None` on cache shutdown, which closes the channel
    /// and stops the loader threads.
    loader_tx: Mutex<Option<mpsc::Sender<LoadJob>>>,
    reads_account: CacheAccount,
    throttler_limit: u64,
}

/// The page cache. Owns the per-block handles, the eviction budget,
/// the block id allocator and the flush dependency graph.
pub struct PageCache {
    shared: Arc<CacheShared>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl PageCache {
    pub fn new(serializer: Arc<dyn Serializer>, config: CacheConfig) -> Self {
        let (tx, rx) = mpsc::channel();
        let shared = Arc::new(CacheShared {
            shard: Mutex::new(Shard {
                pages: Arena::new(),
                current_pages: HashMap::new(),
                acqs: Arena::new(),
                txns: Arena::new(),
                evicter: Evicter::new(config.memory_limit),
                free_ids: Vec::new(),
                next_block_id: serializer.end_block_id().get(),
                recency_counter: 0,
            }),
            serializer,
            loader_tx: Mutex::new(Some(tx)),
            reads_account: CacheAccount::new(config.read_priority),
            throttler_limit: config.throttler_limit,
        });

        let rx = Arc::new(Mutex::new(rx));
        let workers = (0..config.loader_threads)
            .map(|i| {
                let shared = Arc::downgrade(&shared);
                let rx = Arc::clone(&rx);
                thread::Builder::new()
                    .name(format!("cachette-loader-{i}"))
                    .spawn(move || loader_loop(shared, rx))
                    .expect("failed to spawn loader thread")
            })
            .collect();

        Self { shared, workers }
    }

    pub fn connect(&self) -> CacheConn {
        self.connect_with_account(self.shared.reads_account)
    }

    /// Like [`connect`](Self::connect), but demand loads issued on
    /// behalf of this connection's transactions are accounted against
    /// the given I/O account instead of the default read queue.
    pub fn connect_with_account(&self, account: CacheAccount) -> CacheConn {
        CacheConn {
            shared: Arc::clone(&self.shared),
            throttler: Semaphore::new(self.shared.throttler_limit),
            account,
        }
    }

    /// Hint that a block will be needed soon. Creates its handle and
    /// prefetches the index entry in the background; no bytes are read
    /// until someone actually waits on the page.
    pub fn page_for_block_id(&self, block_id: BlockId) {
        let mut shard = self.shared.shard.lock();
        self.shared.ensure_current_page(&mut shard, block_id);
    }

    /// Allocate a fresh block id backed by an empty resident page.
    /// Ids of flushed deletions are recycled before new ones are cut.
    pub fn page_for_new_block_id(&self) -> BlockId {
        let mut shard = self.shared.shard.lock();
        let block_id = loop {
            match shard.free_ids.pop() {
                // the handle was re-created since the id was freed
                Some(id) if shard.current_pages.contains_key(&id) => continue,
                Some(id) => break id,
                None => {
                    let id = shard.next_block_id;
                    shard.next_block_id += 1;
                    break BlockId::new(id);
                }
            }
        };
        debug_assert!(!shard.current_pages.contains_key(&block_id));
        let slot = shard.pages.insert(Page::with_buf(block_id, Vec::new()));
        {
            let Shard { pages, evicter, .. } = &mut *shard;
            evicter.add_page(pages, slot);
            evicter.touch(pages, slot);
        }
        let mut cp = CurrentPage::new();
        cp.page = Some(slot);
        shard.current_pages.insert(block_id, cp);
        block_id
    }

    pub fn create_cache_account(&self, priority: IoPriority) -> CacheAccount {
        CacheAccount::new(priority)
    }

    pub fn set_memory_limit(&self, memory_limit: usize) {
        let mut shard = self.shared.shard.lock();
        let Shard { pages, evicter, .. } = &mut *shard;
        evicter.set_memory_limit(pages, memory_limit);
    }

    pub fn stats(&self) -> CacheStats {
        let shard = self.shared.shard.lock();
        CacheStats {
            resident_bytes: shard.evicter.in_memory_size(),
            memory_limit: shard.evicter.memory_limit(),
            resident_pages: shard.evicter.resident_len(),
            evicted_pages: shard.evicter.evicted_len(),
        }
    }
}

impl Drop for PageCache {
    fn drop(&mut self) {
        *self.shared.loader_tx.lock() = None;
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn loader_loop(shared: Weak<CacheShared>, rx: Arc<Mutex<mpsc::Receiver<LoadJob>>>) {
    loop {
        let job = {
            let rx = rx.lock();
            rx.recv()
        };
        let Ok(job) = job else { return };
        // the cache may be gone; abandoned jobs are dropped silently
        let Some(shared) = shared.upgrade() else { return };
        shared.run_load_job(job);
    }
}

/// One caller's connection. Carries the per-connection throttler that
/// bounds outstanding unflushed block changes.
pub struct CacheConn {
    shared: Arc<CacheShared>,
    throttler: Arc<Semaphore>,
    account: CacheAccount,
}

impl CacheConn {
    /// Begin a transaction. Blocks while the connection's unflushed
    /// changes exceed the throttler budget.
    pub fn begin_txn(&self) -> CacheTxn {
        let permit = self.throttler.acquire(1);
        let txn = {
            let mut shard = self.shared.shard.lock();
            shard
                .txns
                .insert(TxnState::new(Some(ThrottlerAcq::new(permit)), self.account))
        };
        CacheTxn {
            shared: Arc::clone(&self.shared),
            txn,
            ended: false,
        }
    }
}

/// A unit of related block changes that flush together, ordered
/// against other transactions by who touched each block last.
pub struct CacheTxn {
    shared: Arc<CacheShared>,
    txn: TxnId,
    ended: bool,
}

impl CacheTxn {
    pub fn acquire(&self, block_id: BlockId, access: AccessKind) -> PageAcq<'_> {
        let acq = self.shared.acquire(self.txn, block_id, access);
        PageAcq {
            shared: Arc::clone(&self.shared),
            acq,
            _txn: PhantomData,
        }
    }

    /// End the transaction and wait for its flush to become durable.
    pub fn commit(mut self) -> Result<(), FlushError> {
        self.ended = true;
        self.shared.end_txn(self.txn).wait()
    }
}

impl Drop for CacheTxn {
    fn drop(&mut self) {
        if !self.ended {
            // flushed opportunistically; the outcome is not awaited
            let _ = self.shared.end_txn(self.txn);
        }
    }
}

/// One transaction's claim on one block. Dropping it releases the
/// claim and records the net change (if any) in the transaction.
pub struct PageAcq<'txn> {
    shared: Arc<CacheShared>,
    acq: AcqId,
    _txn: PhantomData<&'txn CacheTxn>,
}

impl PageAcq<'_> {
    /// Wait for read availability and pin the block's bytes.
    pub fn read(&self) -> Result<PageReadGuard<'_>, CacheError> {
        self.shared.buf_for_read(self.acq)
    }

    /// Wait for exclusive write availability and pin the block's bytes
    /// for mutation. The page's durable token is invalidated; the new
    /// bytes reach disk at flush time.
    pub fn write(&mut self) -> Result<PageWriteGuard<'_>, CacheError> {
        self.shared.buf_for_write(self.acq)
    }

    /// Pin the currently visible page version so this acquirer keeps
    /// observing it even after later writers move the handle on. Read
    /// acquirers only; leaves the acquisition queue.
    pub fn declare_snapshotted(&mut self) {
        self.shared.declare_snapshotted(self.acq);
    }

    /// Delete the block. Later readers observe absence; the id returns
    /// to the allocator once the deletion is flushed.
    pub fn mark_deleted(&mut self) {
        self.shared.mark_deleted(self.acq);
    }
}

impl Drop for PageAcq<'_> {
    fn drop(&mut self) {
        self.shared.release_acq(self.acq);
    }
}

fn add_dependency(txns: &mut Arena<TxnState>, from: TxnId, to: TxnId) {
    if from == to || !txns.contains(from) {
        return;
    }
    if !txns.get(from).unwrap().subseqers.contains(&to) {
        txns.get_mut(from).unwrap().subseqers.push(to);
        txns.get_mut(to).unwrap().preceders.push(from);
    }
}

/// Transitive closure of `start`'s unflushed preceders. `None` when
/// any of them is not yet waiting to flush (or is mid-flush), in which
/// case `start` cannot flush now. Members of `satisfied` count as
/// already taken care of.
fn preceder_closure(
    txns: &Arena<TxnState>,
    start: TxnId,
    satisfied: &HashSet<TxnId>,
) -> Option<HashSet<TxnId>> {
    let mut closure = HashSet::new();
    closure.insert(start);
    let mut stack = vec![start];
    while let Some(t) = stack.pop() {
        for p in &txns.get(t).expect("closure over destroyed txn").preceders {
            if !txns.contains(*p) || satisfied.contains(p) || closure.contains(p) {
                continue;
            }
            let preceder = txns.get(*p).unwrap();
            if !preceder.began_waiting_for_flush || preceder.spawned_flush {
                return None;
            }
            closure.insert(*p);
            stack.push(*p);
        }
    }
    Some(closure)
}

/// Maximal flushable set rooted at `root`: the mandatory preceder
/// closure, greedily extended with waiting subseqers whose own
/// preceders are satisfied. Cycles land in the closure and flush
/// atomically in one batch.
fn compute_flush_set(txns: &Arena<TxnState>, root: TxnId) -> Option<HashSet<TxnId>> {
    let mut set = preceder_closure(txns, root, &HashSet::new())?;
    loop {
        let mut candidates = Vec::new();
        for t in &set {
            for s in &txns.get(*t).unwrap().subseqers {
                if !txns.contains(*s) || set.contains(s) {
                    continue;
                }
                let subseqer = txns.get(*s).unwrap();
                if subseqer.began_waiting_for_flush && !subseqer.spawned_flush {
                    candidates.push(*s);
                }
            }
        }
        let mut changed = false;
        for candidate in candidates {
            if set.contains(&candidate) {
                continue;
            }
            if let Some(extra) = preceder_closure(txns, candidate, &set) {
                set.extend(extra);
                changed = true;
            }
        }
        if !changed {
            return Some(set);
        }
    }
}

enum FlushEntryKind {
    Modify {
        slot: PageSlot,
        data: Arc<parking_lot::RwLock<Vec<u8>>>,
    },
    Touch,
    Delete,
}

struct FlushEntry {
    block_id: BlockId,
    recency: Recency,
    kind: FlushEntryKind,
}

impl CacheShared {
    fn send_job(&self, job: LoadJob) {
        if let Some(tx) = self.loader_tx.lock().as_ref() {
            let _ = tx.send(job);
        }
    }

    fn ensure_current_page(&self, shard: &mut Shard, block_id: BlockId) {
        if shard.current_pages.contains_key(&block_id) {
            return;
        }
        // the allocator must never reissue an id with a live handle
        shard.next_block_id = shard.next_block_id.max(block_id.get() + 1);
        let mut page = Page::new(block_id);
        page.load = LoadState::FetchingToken;
        let slot = shard.pages.insert(page);
        {
            let Shard { pages, evicter, .. } = &mut *shard;
            evicter.add_page(pages, slot);
        }
        let mut cp = CurrentPage::new();
        cp.page = Some(slot);
        shard.current_pages.insert(block_id, cp);
        self.send_job(LoadJob::FetchToken { slot, block_id });
    }

    fn run_load_job(&self, job: LoadJob) {
        match job {
            LoadJob::FetchToken { slot, block_id } => {
                // a failed load would leave the page value-less
                let entry = match self.serializer.index_read(block_id) {
                    Ok(entry) => entry,
                    Err(err) => panic!("index read failed: {err}"),
                };
                let mut shard = self.shard.lock();
                if shard
                    .pages
                    .get(slot)
                    .is_none_or(|page| page.load != LoadState::FetchingToken)
                {
                    return;
                }
                match entry {
                    Some(entry) => {
                        let has_waiters = {
                            let page = shard.pages.get_mut(slot).unwrap();
                            page.token = Some(entry.token);
                            !page.waiters.is_empty()
                        };
                        shard.recency_counter = shard.recency_counter.max(entry.recency.get());
                        if has_waiters {
                            shard.pages.get_mut(slot).unwrap().load = LoadState::Loading;
                            self.send_job(LoadJob::LoadBlock {
                                slot,
                                block_id,
                                token: entry.token,
                                account: self.reads_account,
                            });
                        } else {
                            shard.pages.get_mut(slot).unwrap().load = LoadState::Idle;
                            let Shard { pages, evicter, .. } = &mut *shard;
                            evicter.reclassify(pages, slot);
                        }
                    }
                    None => {
                        // never written; the value is an empty block
                        let waiters;
                        {
                            let Shard { pages, evicter, .. } = &mut *shard;
                            evicter.remove_page(pages, slot);
                            let page = pages.get_mut(slot).unwrap();
                            page.buf = Some(PageBuf::new(Vec::new()));
                            page.load = LoadState::Idle;
                            waiters = std::mem::take(&mut page.waiters);
                            evicter.add_page(pages, slot);
                        }
                        drop(shard);
                        for waiter in waiters {
                            waiter.pulse(());
                        }
                    }
                }
            }
            LoadJob::LoadBlock {
                slot,
                block_id,
                token,
                account,
            } => {
                let bytes = match self.serializer.block_read(token, &account) {
                    Ok(bytes) => bytes,
                    Err(err) => panic!("block load failed: {err}"),
                };
                tracing::trace!(block_id = block_id.get(), len = bytes.len(), "loaded block");
                let mut shard = self.shard.lock();
                if shard
                    .pages
                    .get(slot)
                    .is_none_or(|page| page.load != LoadState::Loading)
                {
                    return;
                }
                let waiters;
                {
                    let Shard { pages, evicter, .. } = &mut *shard;
                    evicter.remove_page(pages, slot);
                    let page = pages.get_mut(slot).unwrap();
                    page.buf = Some(PageBuf::new(bytes));
                    page.load = LoadState::Idle;
                    waiters = std::mem::take(&mut page.waiters);
                    evicter.add_page(pages, slot);
                    evicter.touch(pages, slot);
                    evicter.evict_if_necessary(pages);
                }
                drop(shard);
                for waiter in waiters {
                    waiter.pulse(());
                }
            }
        }
    }

    fn ensure_load_spawned(&self, shard: &mut Shard, slot: PageSlot, account: CacheAccount) {
        let page = shard.pages.get_mut(slot).expect("loading a destroyed page");
        if page.load == LoadState::Idle && page.buf.is_none() {
            let token = page.token.expect("page has no value to load");
            page.load = LoadState::Loading;
            let block_id = page.block_id;
            self.send_job(LoadJob::LoadBlock {
                slot,
                block_id,
                token,
                account,
            });
        }
    }

    fn page_unref(shard: &mut Shard, slot: PageSlot) {
        {
            let page = shard.pages.get_mut(slot).expect("unref of destroyed page");
            assert!(page.refs > 0, "unref of an unreferenced page");
            page.refs -= 1;
        }
        Self::maybe_destroy_page(shard, slot);
    }

    fn maybe_destroy_page(shard: &mut Shard, slot: PageSlot) {
        let Some(page) = shard.pages.get(slot) else {
            return;
        };
        if page.refs > 0 || page.pins > 0 || !page.waiters.is_empty() {
            return;
        }
        let live = shard
            .current_pages
            .get(&page.block_id)
            .is_some_and(|cp| cp.page == Some(slot));
        if live {
            return;
        }
        let Shard { pages, evicter, .. } = &mut *shard;
        evicter.remove_page(pages, slot);
        pages.remove(slot);
    }

    pub(crate) fn unpin_page(&self, slot: PageSlot) {
        let mut shard = self.shard.lock();
        {
            let page = shard.pages.get_mut(slot).expect("unpin of destroyed page");
            assert!(page.pins > 0);
            page.pins -= 1;
        }
        {
            let Shard { pages, evicter, .. } = &mut *shard;
            evicter.reclassify(pages, slot);
            evicter.evict_if_necessary(pages);
        }
        Self::maybe_destroy_page(&mut shard, slot);
    }

    pub(crate) fn note_page_resized(&self, slot: PageSlot, new_size: usize) {
        let mut shard = self.shard.lock();
        let Shard { pages, evicter, .. } = &mut *shard;
        evicter.note_resized(pages, slot, new_size);
        evicter.evict_if_necessary(pages);
    }

    fn acquire(&self, txn_id: TxnId, block_id: BlockId, access: AccessKind) -> AcqId {
        let mut shard = self.shard.lock();
        self.ensure_current_page(&mut shard, block_id);

        if access == AccessKind::Write {
            // writers resurrect deleted handles with a fresh empty page
            let Shard {
                current_pages,
                pages,
                evicter,
                ..
            } = &mut *shard;
            let cp = current_pages.get_mut(&block_id).unwrap();
            if cp.is_deleted {
                cp.is_deleted = false;
                let slot = pages.insert(Page::with_buf(block_id, Vec::new()));
                evicter.add_page(pages, slot);
                cp.page = Some(slot);
            }
        }

        let (version, prev_writer, prev_dirtier) = {
            let cp = shard.current_pages.get_mut(&block_id).unwrap();
            let prev_writer = cp.last_write_acquirer;
            let prev_dirtier = cp.last_dirtier;
            if access == AccessKind::Write {
                cp.last_write_version = cp.last_write_version.next();
            }
            (cp.last_write_version, prev_writer, prev_dirtier)
        };

        if access == AccessKind::Write {
            let Shard {
                current_pages,
                txns,
                ..
            } = &mut *shard;
            if let Some(prev) = prev_writer {
                add_dependency(txns, prev, txn_id);
            }
            if let Some(prev) = prev_dirtier {
                add_dependency(txns, prev, txn_id);
            }
            if prev_writer != Some(txn_id) {
                if let Some(prev) = prev_writer {
                    if txns.contains(prev) {
                        let mut store = WriteAcqIndex(current_pages);
                        let bag = &mut txns.get_mut(prev).unwrap().pages_write_acquired_last;
                        if bag.has(&store, block_id) {
                            bag.remove(&mut store, block_id);
                        }
                    }
                }
                let mut store = WriteAcqIndex(current_pages);
                txns.get_mut(txn_id)
                    .expect("acquire on ended txn")
                    .pages_write_acquired_last
                    .add(&mut store, block_id);
                current_pages.get_mut(&block_id).unwrap().last_write_acquirer = Some(txn_id);
            }
        }

        let acq_id = shard
            .acqs
            .insert(AcqState::new(block_id, access, version, txn_id));
        shard
            .current_pages
            .get_mut(&block_id)
            .unwrap()
            .acquirers
            .push_back(acq_id);
        shard
            .txns
            .get_mut(txn_id)
            .expect("acquire on ended txn")
            .live_acqs += 1;

        let shard = &*shard;
        shard
            .current_pages
            .get(&block_id)
            .unwrap()
            .pump(&shard.acqs);
        acq_id
    }

    fn buf_for_read<'a>(self: &Arc<Self>, acq_id: AcqId) -> Result<PageReadGuard<'a>, CacheError> {
        let signal = {
            let shard = self.shard.lock();
            shard
                .acqs
                .get(acq_id)
                .expect("unknown acquisition")
                .read_signal
                .clone()
        };
        signal.wait();

        loop {
            let mut shard = self.shard.lock();
            let (slot, account) = {
                let acq = shard.acqs.get(acq_id).unwrap();
                let account = shard
                    .txns
                    .get(acq.txn)
                    .expect("acquisition outlived its transaction")
                    .account;
                let slot = match acq.snapshotted_page {
                    Some(slot) => slot,
                    None => {
                        if acq.deleted {
                            return Err(CacheError::BlockDeleted);
                        }
                        let cp = shard
                            .current_pages
                            .get(&acq.block_id)
                            .expect("acquired block has no handle");
                        if cp.is_deleted {
                            return Err(CacheError::BlockDeleted);
                        }
                        cp.page.expect("live handle with no page")
                    }
                };
                (slot, account)
            };

            if shard.pages.get(slot).unwrap().buf.is_some() {
                shard.pages.get_mut(slot).unwrap().pins += 1;
                let data = {
                    let Shard { pages, evicter, .. } = &mut *shard;
                    evicter.reclassify(pages, slot);
                    evicter.touch(pages, slot);
                    Arc::clone(&pages.get(slot).unwrap().buf.as_ref().unwrap().data)
                };
                drop(shard);
                let guard = data.read_arc();
                return Ok(PageReadGuard::new(guard, Arc::clone(self), slot));
            }

            // evicted; wait for a reload
            let waiter = OneShot::new();
            shard
                .pages
                .get_mut(slot)
                .unwrap()
                .waiters
                .push(Arc::clone(&waiter));
            {
                let Shard { pages, evicter, .. } = &mut *shard;
                evicter.reclassify(pages, slot);
            }
            self.ensure_load_spawned(&mut shard, slot, account);
            drop(shard);
            waiter.wait();
        }
    }

    fn buf_for_write<'a>(
        self: &Arc<Self>,
        acq_id: AcqId,
    ) -> Result<PageWriteGuard<'a>, CacheError> {
        let signal = {
            let shard = self.shard.lock();
            let acq = shard.acqs.get(acq_id).expect("unknown acquisition");
            assert_eq!(
                acq.access,
                AccessKind::Write,
                "write access on a read acquisition"
            );
            acq.write_signal.clone()
        };
        signal.wait();

        loop {
            let mut shard = self.shard.lock();
            let block_id = shard.acqs.get(acq_id).unwrap().block_id;
            let slot = {
                let Shard {
                    current_pages,
                    pages,
                    evicter,
                    ..
                } = &mut *shard;
                let cp = current_pages
                    .get_mut(&block_id)
                    .expect("acquired block has no handle");
                if cp.is_deleted {
                    // a deleter ahead of us in the queue released; the
                    // writer starts over from a fresh empty page
                    cp.is_deleted = false;
                    let slot = pages.insert(Page::with_buf(block_id, Vec::new()));
                    evicter.add_page(pages, slot);
                    cp.page = Some(slot);
                }
                cp.page.expect("live handle with no page")
            };

            if shard.pages.get(slot).unwrap().buf.is_none() {
                let account = {
                    let txn = shard.acqs.get(acq_id).unwrap().txn;
                    shard
                        .txns
                        .get(txn)
                        .expect("acquisition outlived its transaction")
                        .account
                };
                let waiter = OneShot::new();
                shard
                    .pages
                    .get_mut(slot)
                    .unwrap()
                    .waiters
                    .push(Arc::clone(&waiter));
                {
                    let Shard { pages, evicter, .. } = &mut *shard;
                    evicter.reclassify(pages, slot);
                }
                self.ensure_load_spawned(&mut shard, slot, account);
                drop(shard);
                waiter.wait();
                continue;
            }

            // copy on write while snapshots or unflushed changes hold
            // this version. No write guard can exist on the old page
            // here (the previous writer released before we were
            // granted), so reading its buffer under the shard lock
            // cannot block on a guard that needs the shard lock.
            let slot = if shard.pages.get(slot).unwrap().refs > 0 {
                let bytes = shard
                    .pages
                    .get(slot)
                    .unwrap()
                    .buf
                    .as_ref()
                    .unwrap()
                    .data
                    .read()
                    .clone();
                let copy = shard.pages.insert(Page::with_buf(block_id, bytes));
                {
                    let Shard { pages, evicter, .. } = &mut *shard;
                    evicter.add_page(pages, copy);
                }
                shard.current_pages.get_mut(&block_id).unwrap().page = Some(copy);
                copy
            } else {
                slot
            };

            // the buffer is about to diverge from the durable copy
            {
                let page = shard.pages.get_mut(slot).unwrap();
                page.token = None;
                page.pins += 1;
            }
            {
                let Shard { pages, evicter, .. } = &mut *shard;
                evicter.reclassify(pages, slot);
                evicter.touch(pages, slot);
            }
            {
                // a write after a deletion recreates the block
                let acq = shard.acqs.get_mut(acq_id).unwrap();
                acq.dirtied = true;
                acq.deleted = false;
            }
            let txn_id = shard.acqs.get(acq_id).unwrap().txn;
            self.update_last_dirtier(&mut shard, block_id, txn_id);

            let data = Arc::clone(&shard.pages.get(slot).unwrap().buf.as_ref().unwrap().data);
            drop(shard);
            let guard = data.write_arc();
            return Ok(PageWriteGuard::new(guard, Arc::clone(self), slot));
        }
    }

    fn update_last_dirtier(&self, shard: &mut Shard, block_id: BlockId, txn_id: TxnId) {
        let prev = shard.current_pages.get(&block_id).unwrap().last_dirtier;
        if prev == Some(txn_id) {
            return;
        }
        let Shard {
            current_pages,
            txns,
            ..
        } = &mut *shard;
        if let Some(prev) = prev {
            if txns.contains(prev) {
                let mut store = DirtiedIndex(current_pages);
                let bag = &mut txns.get_mut(prev).unwrap().pages_dirtied_last;
                if bag.has(&store, block_id) {
                    bag.remove(&mut store, block_id);
                }
            }
        }
        let mut store = DirtiedIndex(current_pages);
        txns.get_mut(txn_id)
            .expect("dirty on ended txn")
            .pages_dirtied_last
            .add(&mut store, block_id);
        current_pages.get_mut(&block_id).unwrap().last_dirtier = Some(txn_id);
    }

    fn declare_snapshotted(&self, acq_id: AcqId) {
        let mut shard = self.shard.lock();
        let block_id = {
            let acq = shard.acqs.get(acq_id).expect("unknown acquisition");
            assert_eq!(
                acq.access,
                AccessKind::Read,
                "only read acquirers may snapshot"
            );
            assert!(
                acq.read_signal.is_pulsed(),
                "snapshot before read availability"
            );
            if acq.declared_snapshotted {
                return;
            }
            acq.block_id
        };

        let cp = shard.current_pages.get(&block_id).unwrap();
        if cp.is_deleted {
            let acq = shard.acqs.get_mut(acq_id).unwrap();
            acq.deleted = true;
            acq.declared_snapshotted = true;
        } else {
            let slot = cp.page.expect("live handle with no page");
            shard.pages.get_mut(slot).unwrap().refs += 1;
            let acq = shard.acqs.get_mut(acq_id).unwrap();
            acq.snapshotted_page = Some(slot);
            acq.declared_snapshotted = true;
        }

        // a snapshotter no longer gates later writers
        shard
            .current_pages
            .get_mut(&block_id)
            .unwrap()
            .remove_acquirer(acq_id);
        let shard = &*shard;
        shard
            .current_pages
            .get(&block_id)
            .unwrap()
            .pump(&shard.acqs);
    }

    fn mark_deleted(&self, acq_id: AcqId) {
        let signal = {
            let shard = self.shard.lock();
            let acq = shard.acqs.get(acq_id).expect("unknown acquisition");
            assert_eq!(acq.access, AccessKind::Write, "delete needs write access");
            acq.write_signal.clone()
        };
        signal.wait();

        let mut shard = self.shard.lock();
        let block_id = {
            let acq = shard.acqs.get_mut(acq_id).unwrap();
            acq.deleted = true;
            acq.block_id
        };
        let slot = {
            let cp = shard.current_pages.get_mut(&block_id).unwrap();
            cp.is_deleted = true;
            cp.page.take()
        };
        if let Some(slot) = slot {
            Self::maybe_destroy_page(&mut shard, slot);
        }
    }

    fn release_acq(&self, acq_id: AcqId) {
        let mut shard = self.shard.lock();
        let acq = shard
            .acqs
            .remove(acq_id)
            .expect("releasing unknown acquisition");

        if let Some(slot) = acq.snapshotted_page {
            Self::page_unref(&mut shard, slot);
        }
        if !acq.declared_snapshotted {
            if let Some(cp) = shard.current_pages.get_mut(&acq.block_id) {
                cp.remove_acquirer(acq_id);
            }
        }

        if acq.access == AccessKind::Write {
            let recency = shard.next_recency();
            let kind = if acq.deleted {
                ChangeKind::Delete
            } else if acq.dirtied {
                let slot = shard
                    .current_pages
                    .get(&acq.block_id)
                    .and_then(|cp| cp.page)
                    .expect("dirtied block has no page");
                shard
                    .pages
                    .get_mut(slot)
                    .expect("dirtied page destroyed")
                    .refs += 1;
                ChangeKind::Modify(slot)
            } else {
                ChangeKind::Touch
            };
            let change = Change {
                block_version: acq.block_version,
                kind,
                recency,
            };
            let released = {
                let txn = shard
                    .txns
                    .get_mut(acq.txn)
                    .expect("acquisition outlived its transaction");
                match txn.changes.remove(&acq.block_id) {
                    Some(existing) => {
                        let (merged, released) = merge_change(existing, change);
                        txn.changes.insert(acq.block_id, merged);
                        released
                    }
                    None => {
                        txn.changes.insert(acq.block_id, change);
                        None
                    }
                }
            };
            if let Some(slot) = released {
                Self::page_unref(&mut shard, slot);
            }
            let txn = shard.txns.get_mut(acq.txn).unwrap();
            let modify_count = txn.modify_count();
            if let Some(throttler) = txn.throttler.as_mut() {
                throttler.update_dirty_page_count(modify_count);
            }
        }

        shard
            .txns
            .get_mut(acq.txn)
            .expect("acquisition outlived its transaction")
            .live_acqs -= 1;

        if let Some(cp) = shard.current_pages.get(&acq.block_id) {
            cp.pump(&shard.acqs);
        }
    }

    fn end_txn(&self, txn_id: TxnId) -> Arc<OneShot<Result<(), FlushError>>> {
        let signal = {
            let mut shard = self.shard.lock();
            let txn = shard.txns.get_mut(txn_id).expect("ending unknown txn");
            debug_assert_eq!(txn.live_acqs, 0, "txn ended with live acquisitions");
            txn.began_waiting_for_flush = true;
            txn.flush_complete.clone()
        };

        let mut worklist = vec![txn_id];
        while let Some(root) = worklist.pop() {
            worklist.append(&mut self.try_flush_from(root));
        }
        signal
    }

    /// Attempt one flush rooted at `root`. Returns transactions that
    /// became flushable as a consequence.
    fn try_flush_from(&self, root: TxnId) -> Vec<TxnId> {
        let entries: Vec<FlushEntry>;
        let set: Vec<TxnId>;
        {
            let mut shard = self.shard.lock();
            if !shard.txns.contains(root) {
                return Vec::new();
            }
            {
                let txn = shard.txns.get(root).unwrap();
                if !txn.began_waiting_for_flush || txn.spawned_flush {
                    return Vec::new();
                }
            }
            let Some(flush_set) = compute_flush_set(&shard.txns, root) else {
                return Vec::new();
            };
            for t in &flush_set {
                shard.txns.get_mut(*t).unwrap().spawned_flush = true;
            }

            // collapse all per-block changes across the set into one
            // net change per block id
            let mut net: HashMap<BlockId, Change> = HashMap::new();
            for t in &flush_set {
                let changes = std::mem::take(&mut shard.txns.get_mut(*t).unwrap().changes);
                for (block_id, change) in changes {
                    match net.remove(&block_id) {
                        Some(existing) => {
                            let (merged, released) = merge_change(existing, change);
                            net.insert(block_id, merged);
                            if let Some(slot) = released {
                                Self::page_unref(&mut shard, slot);
                            }
                        }
                        None => {
                            net.insert(block_id, change);
                        }
                    }
                }
            }
            let mut list: Vec<(BlockId, Change)> = net.into_iter().collect();
            list.sort_by_key(|(block_id, _)| *block_id);
            entries = list
                .into_iter()
                .map(|(block_id, change)| FlushEntry {
                    block_id,
                    recency: change.recency,
                    kind: match change.kind {
                        ChangeKind::Modify(slot) => FlushEntryKind::Modify {
                            slot,
                            data: Arc::clone(
                                &shard
                                    .pages
                                    .get(slot)
                                    .expect("change references a destroyed page")
                                    .buf
                                    .as_ref()
                                    .expect("change references an evicted page")
                                    .data,
                            ),
                        },
                        ChangeKind::Touch => FlushEntryKind::Touch,
                        ChangeKind::Delete => FlushEntryKind::Delete,
                    },
                })
                .collect();
            set = flush_set.into_iter().collect();
        }

        // serializer I/O outside the shard lock. The buffers are never
        // mutated while a change references them (later writers copy),
        // so reading them here is race free.
        let result = if entries.is_empty() {
            Ok(Vec::new())
        } else {
            let writes = entries
                .iter()
                .map(|entry| BufferWrite {
                    block_id: entry.block_id,
                    payload: match &entry.kind {
                        FlushEntryKind::Modify { data, .. } => {
                            WritePayload::Modify(data.read().clone())
                        }
                        FlushEntryKind::Touch => WritePayload::Touch,
                        FlushEntryKind::Delete => WritePayload::Delete,
                    },
                    recency: entry.recency,
                })
                .collect();
            self.serializer.block_write(writes)
        };

        let mut shard = self.shard.lock();
        let mut next_roots = Vec::new();
        match result {
            Ok(tokens) => {
                let mut deleted_blocks = Vec::new();
                for (i, entry) in entries.iter().enumerate() {
                    match &entry.kind {
                        FlushEntryKind::Modify { slot, .. } => {
                            let token = tokens[i].expect("modify write produced no token");
                            shard
                                .pages
                                .get_mut(*slot)
                                .expect("flushed page destroyed")
                                .token = Some(token);
                            {
                                let Shard { pages, evicter, .. } = &mut *shard;
                                evicter.reclassify(pages, *slot);
                            }
                            Self::page_unref(&mut shard, *slot);
                        }
                        FlushEntryKind::Touch => {}
                        FlushEntryKind::Delete => deleted_blocks.push(entry.block_id),
                    }
                }
                for t in &set {
                    Self::finish_txn(&mut shard, *t, Ok(()), &mut next_roots);
                }
                for block_id in deleted_blocks {
                    let removable = shard.current_pages.get(&block_id).is_some_and(|cp| {
                        cp.is_deleted
                            && cp.page.is_none()
                            && cp.acquirers.is_empty()
                            && cp.write_acq_backindex.is_none()
                            && cp.dirtied_backindex.is_none()
                    });
                    if removable {
                        shard.current_pages.remove(&block_id);
                        shard.free_ids.push(block_id);
                    }
                }
            }
            Err(err) => {
                tracing::error!(error = %err, "flush failed");
                let message = err.to_string();
                for entry in &entries {
                    if let FlushEntryKind::Modify { slot, .. } = &entry.kind {
                        Self::page_unref(&mut shard, *slot);
                    }
                }
                for t in &set {
                    Self::finish_txn(
                        &mut shard,
                        *t,
                        Err(FlushError::Serializer(message.clone())),
                        &mut next_roots,
                    );
                }
            }
        }
        next_roots
    }

    fn finish_txn(
        shard: &mut Shard,
        txn_id: TxnId,
        result: Result<(), FlushError>,
        next_roots: &mut Vec<TxnId>,
    ) {
        let mut txn = shard.txns.remove(txn_id).expect("flushed txn missing");

        {
            let Shard {
                current_pages,
                txns,
                ..
            } = &mut *shard;
            while !txn.pages_write_acquired_last.is_empty() {
                let block_id = txn.pages_write_acquired_last.access_random(0);
                let mut store = WriteAcqIndex(current_pages);
                txn.pages_write_acquired_last.remove(&mut store, block_id);
                if let Some(cp) = current_pages.get_mut(&block_id) {
                    if cp.last_write_acquirer == Some(txn_id) {
                        cp.last_write_acquirer = None;
                    }
                }
            }
            while !txn.pages_dirtied_last.is_empty() {
                let block_id = txn.pages_dirtied_last.access_random(0);
                let mut store = DirtiedIndex(current_pages);
                txn.pages_dirtied_last.remove(&mut store, block_id);
                if let Some(cp) = current_pages.get_mut(&block_id) {
                    if cp.last_dirtier == Some(txn_id) {
                        cp.last_dirtier = None;
                    }
                }
            }
            for s in &txn.subseqers {
                if let Some(subseqer) = txns.get(*s) {
                    if subseqer.began_waiting_for_flush && !subseqer.spawned_flush {
                        next_roots.push(*s);
                    }
                }
            }
        }

        txn.flush_complete.pulse(result);
        // dropping the txn releases its throttler permits
    }
}
