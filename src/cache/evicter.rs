use crate::cache::arena::Arena;
use crate::cache::backindex::{BackindexBag, IndexStore};
use crate::cache::page::{Page, PageSlot};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

/// Victim selection probes this many random slots of the disk-backed
/// bag and evicts the least recently touched candidate. Approximate
/// LRU at bounded cost; the bags have no recency order to walk.
const EVICT_PROBE_COUNT: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BagKind {
    /// Loading, waited-on or pinned; must stay resident.
    Unevictable,
    /// Resident with a durable copy; droppable at any time.
    EvictableDiskBacked,
    /// Resident with no durable copy; the buffer is the only value.
    EvictableUnbacked,
    /// Not resident; only a disk token (or a pending token fetch).
    Evicted,
}

impl IndexStore<PageSlot> for Arena<Page> {
    fn backindex(&self, item: PageSlot) -> Option<usize> {
        self.get(item).and_then(|page| page.backindex)
    }

    fn set_backindex(&mut self, item: PageSlot, index: Option<usize>) {
        if let Some(page) = self.get_mut(item) {
            page.backindex = index;
        }
    }
}

struct EvictionBag {
    bag: BackindexBag<PageSlot>,
    bytes: usize,
}

impl EvictionBag {
    fn new() -> Self {
        Self {
            bag: BackindexBag::new(),
            bytes: 0,
        }
    }
}

/// Classifies every live page into one of four bags and drops
/// disk-backed buffers whenever resident bytes exceed the budget.
pub(crate) struct Evicter {
    unevictable: EvictionBag,
    evictable_disk_backed: EvictionBag,
    evictable_unbacked: EvictionBag,
    evicted: EvictionBag,
    memory_limit: usize,
    /// Suppresses re-entrant eviction from eviction's own bookkeeping.
    evicting: bool,
    rng: SmallRng,
    access_time_counter: u64,
}

impl Evicter {
    pub fn new(memory_limit: usize) -> Self {
        Self {
            unevictable: EvictionBag::new(),
            evictable_disk_backed: EvictionBag::new(),
            evictable_unbacked: EvictionBag::new(),
            evicted: EvictionBag::new(),
            memory_limit,
            evicting: false,
            rng: SmallRng::seed_from_u64(0x5eed),
            access_time_counter: 0,
        }
    }

    pub fn correct_eviction_category(page: &Page) -> BagKind {
        if page.is_loading() || !page.waiters.is_empty() || page.pins > 0 {
            BagKind::Unevictable
        } else if page.buf.is_none() {
            BagKind::Evicted
        } else if page.token.is_some() {
            BagKind::EvictableDiskBacked
        } else {
            BagKind::EvictableUnbacked
        }
    }

    fn bag_mut(&mut self, kind: BagKind) -> &mut EvictionBag {
        match kind {
            BagKind::Unevictable => &mut self.unevictable,
            BagKind::EvictableDiskBacked => &mut self.evictable_disk_backed,
            BagKind::EvictableUnbacked => &mut self.evictable_unbacked,
            BagKind::Evicted => &mut self.evicted,
        }
    }

    pub fn add_page(&mut self, pages: &mut Arena<Page>, slot: PageSlot) {
        let page = pages.get_mut(slot).expect("adding a destroyed page");
        assert!(page.bag.is_none(), "page already in a bag");
        let kind = Self::correct_eviction_category(page);
        let bytes = page.buf_bytes();
        page.bag = Some(kind);
        let bag = self.bag_mut(kind);
        bag.bag.add(pages, slot);
        bag.bytes += bytes;
    }

    /// Must run before any mutation that changes the page's buffer,
    /// while the byte accounting still matches.
    pub fn remove_page(&mut self, pages: &mut Arena<Page>, slot: PageSlot) {
        let page = pages.get_mut(slot).expect("removing a destroyed page");
        let kind = page.bag.take().expect("page not in a bag");
        let bytes = page.buf_bytes();
        let bag = self.bag_mut(kind);
        bag.bag.remove(pages, slot);
        bag.bytes -= bytes;
    }

    /// Move the page to the bag its current state names, if it moved.
    pub fn reclassify(&mut self, pages: &mut Arena<Page>, slot: PageSlot) {
        let page = pages.get(slot).expect("reclassifying a destroyed page");
        let current = page.bag.expect("page not in a bag");
        if Self::correct_eviction_category(page) != current {
            self.remove_page(pages, slot);
            self.add_page(pages, slot);
        }
    }

    pub fn note_resized(&mut self, pages: &mut Arena<Page>, slot: PageSlot, new_size: usize) {
        let page = pages.get_mut(slot).expect("resizing a destroyed page");
        let kind = page.bag.expect("page not in a bag");
        let buf = page.buf.as_mut().expect("resizing a page with no buffer");
        let old_size = buf.size;
        buf.size = new_size;
        let bag = self.bag_mut(kind);
        bag.bytes = bag.bytes - old_size + new_size;
    }

    pub fn touch(&mut self, pages: &mut Arena<Page>, slot: PageSlot) {
        self.access_time_counter += 1;
        if let Some(page) = pages.get_mut(slot) {
            page.access_time = self.access_time_counter;
        }
    }

    pub fn in_memory_size(&self) -> usize {
        self.unevictable.bytes + self.evictable_disk_backed.bytes + self.evictable_unbacked.bytes
    }

    pub fn memory_limit(&self) -> usize {
        self.memory_limit
    }

    pub fn set_memory_limit(&mut self, pages: &mut Arena<Page>, memory_limit: usize) {
        self.memory_limit = memory_limit;
        self.evict_if_necessary(pages);
    }

    pub fn evicted_len(&self) -> usize {
        self.evicted.bag.len()
    }

    pub fn resident_len(&self) -> usize {
        self.unevictable.bag.len()
            + self.evictable_disk_backed.bag.len()
            + self.evictable_unbacked.bag.len()
    }

    /// Drop disk-backed buffers until resident bytes fit the budget or
    /// nothing evictable remains.
    pub fn evict_if_necessary(&mut self, pages: &mut Arena<Page>) {
        if self.evicting {
            return;
        }
        self.evicting = true;
        while self.in_memory_size() > self.memory_limit && !self.evictable_disk_backed.bag.is_empty()
        {
            let victim = self.pick_victim(pages);
            self.remove_page(pages, victim);
            let (block_id, freed) = {
                let page = pages.get_mut(victim).expect("victim destroyed");
                (page.block_id, page.evict_self())
            };
            self.add_page(pages, victim);
            tracing::trace!(block_id = block_id.get(), freed, "evicted page");
        }
        self.evicting = false;
    }

    fn pick_victim(&mut self, pages: &Arena<Page>) -> PageSlot {
        let len = self.evictable_disk_backed.bag.len();
        let mut victim = None;
        for _ in 0..EVICT_PROBE_COUNT.min(len) {
            let slot = self
                .evictable_disk_backed
                .bag
                .access_random(self.rng.random_range(0..len));
            let access_time = pages.get(slot).expect("bagged page destroyed").access_time;
            match victim {
                Some((_, best)) if best <= access_time => {}
                _ => victim = Some((slot, access_time)),
            }
        }
        victim.expect("picking a victim from an empty bag").0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::serializer::{BlockId, BlockToken};

    fn resident_page(id: u32, bytes: usize, token: Option<u64>) -> Page {
        let mut page = Page::with_buf(BlockId::new(id), vec![0; bytes]);
        page.token = token.map(BlockToken::new);
        page
    }

    #[test]
    fn category_is_a_pure_function_of_page_state() {
        let mut loading = Page::new(BlockId::new(0));
        loading.load = crate::cache::page::LoadState::Loading;
        assert_eq!(
            Evicter::correct_eviction_category(&loading),
            BagKind::Unevictable
        );

        let mut pinned = resident_page(1, 8, Some(1));
        pinned.pins = 1;
        assert_eq!(
            Evicter::correct_eviction_category(&pinned),
            BagKind::Unevictable
        );

        assert_eq!(
            Evicter::correct_eviction_category(&resident_page(2, 8, Some(1))),
            BagKind::EvictableDiskBacked
        );
        assert_eq!(
            Evicter::correct_eviction_category(&resident_page(3, 8, None)),
            BagKind::EvictableUnbacked
        );

        let mut evicted = Page::new(BlockId::new(4));
        evicted.token = Some(BlockToken::new(9));
        assert_eq!(
            Evicter::correct_eviction_category(&evicted),
            BagKind::Evicted
        );
    }

    #[test]
    fn budget_is_enforced_by_evicting_disk_backed_pages() {
        let mut pages = Arena::new();
        let mut evicter = Evicter::new(2 * 64);

        let mut slots = Vec::new();
        for id in 0..4 {
            let slot = pages.insert(resident_page(id, 64, Some(id as u64)));
            evicter.add_page(&mut pages, slot);
            evicter.touch(&mut pages, slot);
            slots.push(slot);
        }
        assert_eq!(evicter.in_memory_size(), 4 * 64);

        evicter.evict_if_necessary(&mut pages);
        assert!(evicter.in_memory_size() <= 2 * 64);
        assert_eq!(evicter.evicted_len(), 2);
        // evicted pages keep their token and lose their buffer
        let evicted: Vec<_> = slots
            .iter()
            .filter(|slot| pages.get(**slot).unwrap().buf.is_none())
            .collect();
        assert_eq!(evicted.len(), 2);
        for slot in evicted {
            assert!(pages.get(*slot).unwrap().token.is_some());
        }
    }

    #[test]
    fn unbacked_pages_are_never_evicted() {
        let mut pages = Arena::new();
        let mut evicter = Evicter::new(16);

        let slot = pages.insert(resident_page(0, 64, None));
        evicter.add_page(&mut pages, slot);
        evicter.evict_if_necessary(&mut pages);

        // over budget, but the buffer is the only copy of the value
        assert_eq!(evicter.in_memory_size(), 64);
        assert!(pages.get(slot).unwrap().buf.is_some());
    }

    #[test]
    fn reclassify_follows_state_changes() {
        let mut pages = Arena::new();
        let mut evicter = Evicter::new(1024);

        let slot = pages.insert(resident_page(0, 32, None));
        evicter.add_page(&mut pages, slot);
        assert_eq!(pages.get(slot).unwrap().bag, Some(BagKind::EvictableUnbacked));

        pages.get_mut(slot).unwrap().token = Some(BlockToken::new(1));
        evicter.reclassify(&mut pages, slot);
        assert_eq!(
            pages.get(slot).unwrap().bag,
            Some(BagKind::EvictableDiskBacked)
        );

        pages.get_mut(slot).unwrap().pins = 1;
        evicter.reclassify(&mut pages, slot);
        assert_eq!(pages.get(slot).unwrap().bag, Some(BagKind::Unevictable));
    }

    #[test]
    fn lower_limit_triggers_eviction_immediately() {
        let mut pages = Arena::new();
        let mut evicter = Evicter::new(1024);

        for id in 0..3 {
            let slot = pages.insert(resident_page(id, 64, Some(id as u64)));
            evicter.add_page(&mut pages, slot);
            evicter.touch(&mut pages, slot);
        }
        assert_eq!(evicter.in_memory_size(), 3 * 64);

        evicter.set_memory_limit(&mut pages, 64);
        assert!(evicter.in_memory_size() <= 64);
    }
}
