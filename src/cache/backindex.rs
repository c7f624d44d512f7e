/// Storage for the "element knows its own bag index" pattern.
///
/// The index lives on the element itself, in whatever structure owns
/// the elements, so bag membership changes never have to search.
pub trait IndexStore<T> {
    fn backindex(&self, item: T) -> Option<usize>;
    fn set_backindex(&mut self, item: T, index: Option<usize>);
}

/// Unordered bag with O(1) add, remove and random access.
///
/// `remove` swaps the victim with the last element and pops, patching
/// the moved element's stored index. `has` cross-checks the stored
/// index against the slot's contents, so a stale index on an element
/// that was moved to another bag never reads as membership.
pub struct BackindexBag<T> {
    items: Vec<T>,
}

impl<T: Copy + Eq> BackindexBag<T> {
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    pub fn add<S: IndexStore<T>>(&mut self, store: &mut S, item: T) {
        debug_assert!(!self.has(store, item));
        store.set_backindex(item, Some(self.items.len()));
        self.items.push(item);
    }

    pub fn remove<S: IndexStore<T>>(&mut self, store: &mut S, item: T) {
        let index = store.backindex(item).expect("item not in bag");
        debug_assert!(self.items[index] == item);

        let last = self.items.len() - 1;
        self.items.swap(index, last);
        self.items.pop();
        if index != last {
            store.set_backindex(self.items[index], Some(index));
        }
        store.set_backindex(item, None);
    }

    pub fn has<S: IndexStore<T>>(&self, store: &S, item: T) -> bool {
        match store.backindex(item) {
            Some(index) => index < self.items.len() && self.items[index] == item,
            None => false,
        }
    }

    /// Element at raw slot `i`. No ordering is implied; callers use
    /// this with a random index to pick eviction victims.
    pub fn access_random(&self, i: usize) -> T {
        self.items[i]
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<T: Copy + Eq> Default for BackindexBag<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;

    struct Store(HashMap<u32, Option<usize>>);

    impl IndexStore<u32> for Store {
        fn backindex(&self, item: u32) -> Option<usize> {
            self.0.get(&item).copied().flatten()
        }

        fn set_backindex(&mut self, item: u32, index: Option<usize>) {
            self.0.insert(item, index);
        }
    }

    fn check_indices(bag: &BackindexBag<u32>, store: &Store) {
        for (i, item) in bag.items.iter().enumerate() {
            assert_eq!(store.backindex(*item), Some(i));
        }
    }

    #[test]
    fn add_remove_keeps_indices_consistent() {
        let mut store = Store(HashMap::new());
        let mut bag = BackindexBag::new();

        for item in 0..10 {
            bag.add(&mut store, item);
            check_indices(&bag, &store);
        }
        // remove from the middle, the front and the back
        for item in [4, 0, 9, 5, 1] {
            bag.remove(&mut store, item);
            assert!(!bag.has(&store, item));
            check_indices(&bag, &store);
        }
        assert_eq!(bag.len(), 5);
        for item in [2, 3, 6, 7, 8] {
            assert!(bag.has(&store, item));
        }
    }

    #[test]
    fn has_rejects_stale_index_pointing_at_another_element() {
        let mut store = Store(HashMap::new());
        let mut bag_a = BackindexBag::new();
        let mut bag_b = BackindexBag::new();

        bag_a.add(&mut store, 1);
        bag_a.remove(&mut store, 1);
        bag_b.add(&mut store, 1);
        bag_a.add(&mut store, 2);

        // 1 now has index 0 in bag_b while bag_a's slot 0 holds 2
        assert!(!bag_a.has(&store, 1));
        assert!(bag_b.has(&store, 1));
    }

    #[test]
    fn access_random_covers_all_elements() {
        let mut store = Store(HashMap::new());
        let mut bag = BackindexBag::new();
        for item in 0..4 {
            bag.add(&mut store, item);
        }
        let mut seen: Vec<u32> = (0..bag.len()).map(|i| bag.access_random(i)).collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }
}
