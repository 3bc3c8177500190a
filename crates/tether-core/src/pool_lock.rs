//! Address-hashed mutex pool guarding per-object connection data.
//!
//! Objects do not carry their own mutex. Each object's connection data lives
//! in a [`PoolCell`], and the cell's address selects one mutex out of a fixed
//! pool. Two cells may share a mutex; that only costs contention.
//!
//! Code that needs two objects locked at once (connect, disconnect, teardown)
//! uses [`MutexPool::lock_pair`], which always acquires the lower-addressed
//! mutex first regardless of argument order.

use std::cell::UnsafeCell;

use parking_lot::{Mutex, MutexGuard};

/// Prime pool size, so address strides spread evenly.
pub(crate) const DEFAULT_POOL_SIZE: usize = 131;

pub(crate) struct MutexPool {
    mutexes: Box<[Mutex<()>]>,
}

impl MutexPool {
    pub(crate) fn new(size: usize) -> Self {
        let mutexes = (0..size.max(1)).map(|_| Mutex::new(())).collect();
        Self { mutexes }
    }

    pub(crate) fn len(&self) -> usize {
        self.mutexes.len()
    }

    fn slot_for(&self, addr: usize) -> usize {
        (addr >> 3) % self.mutexes.len()
    }

    fn mutex_addr(&self, slot: usize) -> usize {
        &self.mutexes[slot] as *const Mutex<()> as usize
    }

    /// Two slots ordered by the address of their mutex, lower first.
    fn address_order(&self, a: usize, b: usize) -> (usize, usize) {
        if self.mutex_addr(a) <= self.mutex_addr(b) {
            (a, b)
        } else {
            (b, a)
        }
    }

    /// Lock the mutex guarding `cell`.
    pub(crate) fn lock<'a, T>(&'a self, cell: &PoolCell<T>) -> PoolGuard<'a> {
        let slot = self.slot_for(cell.addr());
        PoolGuard {
            pool: self,
            slot,
            guard: self.mutexes[slot].lock(),
        }
    }

    /// Lock the mutexes guarding two cells in address order.
    pub(crate) fn lock_pair<'a, A, B>(&'a self, a: &PoolCell<A>, b: &PoolCell<B>) -> PairGuard<'a> {
        let sa = self.slot_for(a.addr());
        let sb = self.slot_for(b.addr());
        let (first, second) = self.address_order(sa, sb);
        let first_guard = self.mutexes[first].lock();
        let second_guard = (second != first).then(|| self.mutexes[second].lock());
        PairGuard {
            pool: self,
            slots: [first, second],
            _first: first_guard,
            _second: second_guard,
        }
    }
}

/// Data reachable only while the matching pool mutex is held.
pub(crate) struct PoolCell<T> {
    value: UnsafeCell<T>,
}

// SAFETY: every shared access goes through a guard holding the pool mutex
// selected by the cell's address, so at most one thread touches the value.
unsafe impl<T: Send> Sync for PoolCell<T> {}

impl<T> PoolCell<T> {
    pub(crate) fn new(value: T) -> Self {
        Self {
            value: UnsafeCell::new(value),
        }
    }

    fn addr(&self) -> usize {
        self as *const Self as usize
    }

    /// Exclusive access without locking.
    pub(crate) fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }
}

pub(crate) struct PoolGuard<'a> {
    pool: &'a MutexPool,
    slot: usize,
    guard: MutexGuard<'a, ()>,
}

impl PoolGuard<'_> {
    /// Borrow the contents of a cell guarded by this lock.
    ///
    /// # Panics
    ///
    /// If `cell` hashes to a different mutex.
    pub(crate) fn data<'g, T>(&'g mut self, cell: &'g PoolCell<T>) -> &'g mut T {
        assert_eq!(
            self.pool.slot_for(cell.addr()),
            self.slot,
            "pool cell accessed under the wrong mutex"
        );
        // SAFETY: the guard holds the cell's mutex and `&mut self` prevents a
        // second live borrow through this guard.
        unsafe { &mut *cell.value.get() }
    }

    /// Run `f` with the mutex released, reacquiring it afterwards.
    pub(crate) fn unlocked<R>(&mut self, f: impl FnOnce() -> R) -> R {
        MutexGuard::unlocked(&mut self.guard, f)
    }
}

pub(crate) struct PairGuard<'a> {
    pool: &'a MutexPool,
    slots: [usize; 2],
    _first: MutexGuard<'a, ()>,
    _second: Option<MutexGuard<'a, ()>>,
}

impl PairGuard<'_> {
    fn check<T>(&self, cell: &PoolCell<T>) {
        let slot = self.pool.slot_for(cell.addr());
        assert!(
            self.slots.contains(&slot),
            "pool cell accessed under the wrong mutex"
        );
    }

    /// Borrow one cell guarded by this pair.
    pub(crate) fn data<'g, T>(&'g mut self, cell: &'g PoolCell<T>) -> &'g mut T {
        self.check(cell);
        // SAFETY: as for `PoolGuard::data`.
        unsafe { &mut *cell.value.get() }
    }

    /// Borrow both cells. The second is `None` when both name the same cell.
    pub(crate) fn both<'g, T>(
        &'g mut self,
        a: &'g PoolCell<T>,
        b: &'g PoolCell<T>,
    ) -> (&'g mut T, Option<&'g mut T>) {
        self.check(a);
        self.check(b);
        // SAFETY: both mutexes are held; distinct cells never alias and the
        // same cell is handed out once.
        unsafe {
            let first = &mut *a.value.get();
            let second = (!std::ptr::eq(a, b)).then(|| &mut *b.value.get());
            (first, second)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_guarded_access() {
        let pool = MutexPool::new(DEFAULT_POOL_SIZE);
        let cell = PoolCell::new(1);
        let mut guard = pool.lock(&cell);
        *guard.data(&cell) += 1;
        assert_eq!(*guard.data(&cell), 2);
    }

    #[test]
    fn test_pair_same_cell_hands_out_once() {
        let pool = MutexPool::new(7);
        let cell = PoolCell::new(0);
        let mut guard = pool.lock_pair(&cell, &cell);
        let (a, b) = guard.both(&cell, &cell);
        *a = 5;
        assert!(b.is_none());
    }

    #[test]
    fn test_single_mutex_pool_pair() {
        let pool = MutexPool::new(1);
        let a = PoolCell::new(1);
        let b = PoolCell::new(2);
        let mut guard = pool.lock_pair(&a, &b);
        let (x, y) = guard.both(&a, &b);
        std::mem::swap(x, y.unwrap());
        drop(guard);
        let mut guard = pool.lock(&a);
        assert_eq!(*guard.data(&a), 2);
    }

    #[test]
    #[should_panic(expected = "wrong mutex")]
    fn test_wrong_mutex_panics() {
        let pool = MutexPool::new(2);
        let cells: Vec<PoolCell<u64>> = (0u64..4).map(PoolCell::new).collect();
        let first = pool.slot_for(cells[0].addr());
        let other = cells
            .iter()
            .find(|c| pool.slot_for(c.addr()) != first)
            .unwrap();
        let mut guard = pool.lock(&cells[0]);
        guard.data(other);
    }

    #[test]
    fn test_pair_locks_lower_address_first() {
        let pool = MutexPool::new(DEFAULT_POOL_SIZE);
        let (low, high) = pool.address_order(9, 4);
        assert!(pool.mutex_addr(low) < pool.mutex_addr(high));
        assert_eq!(pool.address_order(low, high), pool.address_order(high, low));

        let a = PoolCell::new(0u8);
        let b = PoolCell::new(0u8);
        let guard = pool.lock_pair(&b, &a);
        let [first, second] = guard.slots;
        assert!(pool.mutex_addr(first) <= pool.mutex_addr(second));
    }

    #[test]
    fn test_unlocked_allows_other_thread() {
        let pool = Arc::new(MutexPool::new(1));
        let cell = Arc::new(PoolCell::new(0u32));
        let mut guard = pool.lock(&*cell);
        guard.unlocked(|| {
            let pool = pool.clone();
            let cell = cell.clone();
            std::thread::spawn(move || {
                let mut g = pool.lock(&*cell);
                *g.data(&*cell) = 9;
            })
            .join()
            .unwrap();
        });
        assert_eq!(*guard.data(&*cell), 9);
    }

    #[test]
    fn test_opposite_order_pairs_do_not_deadlock() {
        let pool = Arc::new(MutexPool::new(3));
        let a = Arc::new(PoolCell::new(0u64));
        let b = Arc::new(PoolCell::new(0u64));
        let threads: Vec<_> = (0..2)
            .map(|i| {
                let (pool, a, b) = (pool.clone(), a.clone(), b.clone());
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        let (x, y) = if i == 0 { (&*a, &*b) } else { (&*b, &*a) };
                        let mut g = pool.lock_pair(x, y);
                        let (x, y) = g.both(x, y);
                        *x += 1;
                        if let Some(y) = y {
                            *y += 1;
                        }
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        let mut g = pool.lock(&*a);
        assert_eq!(*g.data(&*a), 2000);
    }
}
