//! Reusable visited marks for graph traversal.
//!
//! Each mark array is stamped with an epoch; starting a new traversal bumps the
//! epoch instead of zeroing the array. Arrays are parked in a small
//! thread-local pool between searches.

use std::cell::RefCell;

const POOL_LIMIT: usize = 4;
const MIN_CAPACITY: usize = 1024;

thread_local! {
    static POOL: RefCell<Vec<Marks>> = const { RefCell::new(Vec::new()) };
}

struct Marks {
    stamps: Vec<u32>,
    epoch: u32,
}

impl Marks {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            stamps: vec![0; capacity.max(MIN_CAPACITY)],
            epoch: 0,
        }
    }

    fn next_epoch(&mut self) {
        self.epoch = self.epoch.wrapping_add(1);
        if self.epoch == 0 {
            // wrapped: stale stamps could alias the new epoch
            self.stamps.fill(0);
            self.epoch = 1;
        }
    }
}

/// Visited set for one traversal; returns its storage to the pool on drop.
pub(crate) struct Visited {
    marks: Option<Marks>,
}

impl Visited {
    /// Borrow a cleared set able to hold ids below `capacity` without growing.
    pub(crate) fn acquire(capacity: usize) -> Self {
        let mut marks = POOL.with(|pool| {
            let mut pool = pool.borrow_mut();
            match pool.iter().position(|m| m.stamps.len() >= capacity) {
                Some(idx) => pool.swap_remove(idx),
                None => Marks::with_capacity(capacity),
            }
        });
        marks.next_epoch();
        Self { marks: Some(marks) }
    }

    /// Mark `id`; returns `true` if it was not already marked.
    #[inline]
    pub(crate) fn insert(&mut self, id: usize) -> bool {
        let Some(marks) = self.marks.as_mut() else {
            return false;
        };
        if id >= marks.stamps.len() {
            let len = id.saturating_add(1).next_power_of_two().max(MIN_CAPACITY);
            marks.stamps.resize(len, 0);
        }
        if marks.stamps[id] == marks.epoch {
            return false;
        }
        marks.stamps[id] = marks.epoch;
        true
    }
}

impl Drop for Visited {
    fn drop(&mut self) {
        if let Some(marks) = self.marks.take() {
            POOL.with(|pool| {
                let mut pool = pool.borrow_mut();
                if pool.len() < POOL_LIMIT {
                    pool.push(marks);
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_reports_first_visit() {
        let mut visited = Visited::acquire(100);
        assert!(visited.insert(0));
        assert!(visited.insert(50));
        assert!(!visited.insert(0));
        assert!(!visited.insert(50));
        assert!(visited.insert(25));
    }

    #[test]
    fn test_reacquired_set_is_clear() {
        {
            let mut visited = Visited::acquire(100);
            visited.insert(42);
        }
        let mut visited = Visited::acquire(100);
        assert!(visited.insert(42));
    }

    #[test]
    fn test_grows_past_capacity() {
        let mut visited = Visited::acquire(16);
        assert!(visited.insert(5000));
        assert!(!visited.insert(5000));
        assert!(visited.insert(5001));
    }
}
