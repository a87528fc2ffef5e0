use std::collections::{HashSet, VecDeque};
use std::hash::Hash;

/// How many cancelled temp ids and deleted server ids the engine remembers.
pub const REMEMBERED_IDS: usize = 4096;

/// Set that forgets its oldest member once `capacity` is reached.
#[derive(Debug)]
pub struct RecentSet<T> {
    capacity: usize,
    order: VecDeque<T>,
    members: HashSet<T>,
}

impl<T: Copy + Eq + Hash> RecentSet<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            members: HashSet::new(),
        }
    }

    /// Returns false when `value` was already present.
    pub fn insert(&mut self, value: T) -> bool {
        if !self.members.insert(value) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
        self.order.push_back(value);
        true
    }

    pub fn contains(&self, value: &T) -> bool {
        self.members.contains(value)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forgets_oldest_past_capacity() {
        let mut set = RecentSet::new(3);
        for n in 0..5u64 {
            assert!(set.insert(n));
        }
        assert!(!set.insert(4));
        assert_eq!(set.len(), 3);
        assert!(!set.contains(&0));
        assert!(!set.contains(&1));
        assert!(set.contains(&2));
        assert!(set.contains(&4));
    }
}
