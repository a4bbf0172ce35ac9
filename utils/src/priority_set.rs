use std::collections::{BTreeSet, HashMap};
use std::hash::Hash;

/// A set of items ordered by priority, lowest first.
///
/// Updating an item's priority is `O(log n)`.
#[derive(Clone)]
pub struct PrioritySet<I: Ord + Hash + Clone, P: Ord + Copy> {
    entries: BTreeSet<(P, I)>,
    keys: HashMap<I, P>,
}

impl<I: Ord + Hash + Clone, P: Ord + Copy> Default for PrioritySet<I, P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: Ord + Hash + Clone, P: Ord + Copy> PrioritySet<I, P> {
    pub fn new() -> Self {
        Self {
            entries: BTreeSet::new(),
            keys: HashMap::new(),
        }
    }

    /// Insert `item` with `priority`, replacing any previous priority.
    pub fn put(&mut self, item: I, priority: P) {
        if let Some(old) = self.keys.insert(item.clone(), priority) {
            self.entries.remove(&(old, item.clone()));
        }
        self.entries.insert((priority, item));
    }

    /// Current priority of `item`.
    pub fn get(&self, item: &I) -> Option<P> {
        self.keys.get(item).copied()
    }

    /// Remove `item`, returning whether it was present.
    pub fn remove(&mut self, item: &I) -> bool {
        let Some(priority) = self.keys.remove(item) else {
            return false;
        };
        self.entries.remove(&(priority, item.clone()));
        true
    }

    /// Replace the tracked items with `items`, keeping the priority of items already present and
    /// assigning `initial` to new ones.
    pub fn reconcile(&mut self, items: &[I], initial: P) {
        let keep: BTreeSet<&I> = items.iter().collect();
        let stale: Vec<I> = self
            .keys
            .keys()
            .filter(|item| !keep.contains(item))
            .cloned()
            .collect();
        for item in stale {
            self.remove(&item);
        }
        for item in items {
            if !self.keys.contains_key(item) {
                self.put(item.clone(), initial);
            }
        }
    }

    /// The item with the lowest priority.
    pub fn peek(&self) -> Option<(&I, &P)> {
        self.entries.iter().next().map(|(p, i)| (i, p))
    }

    /// Remove and return the item with the lowest priority.
    pub fn pop(&mut self) -> Option<(I, P)> {
        let (priority, item) = self.entries.pop_first()?;
        self.keys.remove(&item);
        Some((item, priority))
    }

    /// Iterate in priority order.
    pub fn iter(&self) -> impl Iterator<Item = (&I, &P)> {
        self.entries.iter().map(|(p, i)| (i, p))
    }

    pub fn contains(&self, item: &I) -> bool {
        self.keys.contains_key(item)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_and_iter() {
        let mut set = PrioritySet::new();
        set.put("a", 10);
        set.put("b", 5);
        let entries: Vec<_> = set.iter().collect();
        assert_eq!(entries, vec![(&"b", &5), (&"a", &10)]);
    }

    #[test]
    fn test_update() {
        let mut set = PrioritySet::new();
        set.put("a", 10);
        set.put("a", 1);
        assert_eq!(set.len(), 1);
        assert_eq!(set.peek(), Some((&"a", &1)));
    }

    #[test]
    fn test_reconcile() {
        let mut set = PrioritySet::new();
        set.put(1u32, 10u64);
        set.put(2, 5);
        set.reconcile(&[1, 3], 2);
        assert_eq!(set.get(&1), Some(10));
        assert_eq!(set.get(&2), None);
        assert_eq!(set.get(&3), Some(2));
    }

    #[test]
    fn test_pop() {
        let mut set = PrioritySet::new();
        set.put(7u64, 3u64);
        set.put(8, 1);
        assert_eq!(set.pop(), Some((8, 1)));
        assert_eq!(set.pop(), Some((7, 3)));
        assert!(set.pop().is_none());
        assert!(set.is_empty());
    }
}
