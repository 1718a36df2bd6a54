// Copyright 2025 eraflo
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Object reuse pools for promise slots.
//!
//! A [`Pool`] is a slab of reusable instances addressed by index. Rented slots are
//! never handed out a second time until they are returned, and returned slots are
//! never freed: they stay in the slab and are recycled by the next rent. Instances
//! implementing [`PoolAware`] are told when they are rented and returned so they
//! can reset themselves.
//!
//! The [`PoolRegistry`] maps the *type* of a pool to its single shared instance,
//! the same way the engine's service registry maps a service type to its value.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Permits a pooled object to respond to pool callbacks.
pub trait PoolAware {
    /// Called each time the instance is handed out by [`Pool::create_or_rent`].
    fn on_rent(&mut self);
    /// Called each time the instance is given back with [`Pool::give_back`].
    fn on_return(&mut self);
}

struct Entry<T> {
    value: T,
    rented: bool,
}

/// A slab of reusable `T` instances with a free list of indices.
pub struct Pool<T> {
    entries: Vec<Entry<T>>,
    free: Vec<u32>,
}

impl<T: PoolAware> Pool<T> {
    /// Creates an empty pool with room for `capacity` instances.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            free: Vec::with_capacity(capacity),
        }
    }

    /// Rents a recycled instance, or creates one with `factory` when none is free.
    ///
    /// Returns the index of the rented slot together with the instance.
    pub fn create_or_rent(&mut self, factory: impl FnOnce() -> T) -> (u32, &mut T) {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                let index = self.entries.len() as u32;
                self.entries.push(Entry {
                    value: factory(),
                    rented: false,
                });
                index
            }
        };

        let entry = &mut self.entries[index as usize];
        entry.rented = true;
        entry.value.on_rent();
        (index, &mut entry.value)
    }

    /// Returns the instance at `index` to the free list.
    ///
    /// Returns `false` without touching the pool if the slot is not currently rented.
    pub fn give_back(&mut self, index: u32) -> bool {
        match self.entries.get_mut(index as usize) {
            Some(entry) if entry.rented => {
                entry.rented = false;
                entry.value.on_return();
                self.free.push(index);
                true
            }
            _ => false,
        }
    }
}

impl<T> Pool<T> {
    /// Returns a reference to the instance at `index`, rented or not.
    pub fn get(&self, index: u32) -> Option<&T> {
        self.entries.get(index as usize).map(|entry| &entry.value)
    }

    /// Returns a mutable reference to the instance at `index`, rented or not.
    pub fn get_mut(&mut self, index: u32) -> Option<&mut T> {
        self.entries.get_mut(index as usize).map(|entry| &mut entry.value)
    }

    /// Returns `true` if the slot at `index` is currently rented.
    pub fn is_rented(&self, index: u32) -> bool {
        self.entries
            .get(index as usize)
            .is_some_and(|entry| entry.rented)
    }

    /// Total number of slots ever created by this pool.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the pool has never created a slot.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of slots waiting on the free list.
    pub fn free_count(&self) -> usize {
        self.free.len()
    }
}

/// A registry holding one shared pool per pool type.
#[derive(Default)]
pub(crate) struct PoolRegistry {
    pools: Mutex<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl PoolRegistry {
    /// Returns the pool of type `P`, creating it with `create` on first use.
    pub fn get_or_insert_with<P: Send + Sync + 'static>(&self, create: impl FnOnce() -> P) -> Arc<P> {
        let mut pools = lock(&self.pools);
        let pool = pools
            .entry(TypeId::of::<P>())
            .or_insert_with(|| Arc::new(create()) as Arc<dyn Any + Send + Sync>);

        match Arc::clone(pool).downcast::<P>() {
            Ok(pool) => pool,
            Err(_) => unreachable!("pool registry entries are keyed by their own TypeId"),
        }
    }

    /// Number of distinct pool types created so far.
    pub fn len(&self) -> usize {
        lock(&self.pools).len()
    }
}

/// Counters shared by every pool of one runtime.
#[derive(Debug, Default)]
pub(crate) struct PoolCounters {
    pub rented: AtomicU64,
    pub returned: AtomicU64,
    pub unobserved_failures: AtomicU64,
}

impl PoolCounters {
    pub fn snapshot(&self) -> FiberStats {
        FiberStats {
            rented: self.rented.load(Ordering::Relaxed),
            returned: self.returned.load(Ordering::Relaxed),
            unobserved_failures: self.unobserved_failures.load(Ordering::Relaxed),
        }
    }
}

/// A snapshot of promise pool activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FiberStats {
    /// Promise slots handed out since the runtime was created.
    pub rented: u64,
    /// Promise slots given back to their pool.
    pub returned: u64,
    /// Faulted promises recycled without their failure ever being read.
    pub unobserved_failures: u64,
}

impl FiberStats {
    /// Number of promise slots currently rented.
    pub fn in_flight(&self) -> u64 {
        self.rented.saturating_sub(self.returned)
    }
}

/// Locks a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Counter {
        rents: u32,
        returns: u32,
    }

    impl PoolAware for Counter {
        fn on_rent(&mut self) {
            self.rents += 1;
        }

        fn on_return(&mut self) {
            self.returns += 1;
        }
    }

    #[test]
    fn test_rent_creates_then_recycles() {
        let mut pool = Pool::<Counter>::with_capacity(4);

        let (first, _) = pool.create_or_rent(Counter::default);
        assert_eq!(first, 0);
        assert!(pool.give_back(first));

        let (second, _) = pool.create_or_rent(|| panic!("a free slot should be reused"));
        assert_eq!(second, first, "The returned slot should be recycled");
        assert_eq!(pool.len(), 1);

        let counter = pool.get(second).unwrap();
        assert_eq!(counter.rents, 2);
        assert_eq!(counter.returns, 1);
    }

    #[test]
    fn test_rented_slot_is_never_handed_out_twice() {
        let mut pool = Pool::<Counter>::with_capacity(0);
        let (a, _) = pool.create_or_rent(Counter::default);
        let (b, _) = pool.create_or_rent(Counter::default);
        assert_ne!(a, b);
        assert!(pool.is_rented(a));
        assert!(pool.is_rented(b));
    }

    #[test]
    fn test_double_return_is_rejected() {
        let mut pool = Pool::<Counter>::with_capacity(1);
        let (index, _) = pool.create_or_rent(Counter::default);

        assert!(pool.give_back(index));
        assert!(!pool.give_back(index), "A free slot cannot be returned again");
        assert_eq!(pool.free_count(), 1);
        assert_eq!(pool.get(index).unwrap().returns, 1);

        // Two rents after a double return must still yield distinct slots.
        let (a, _) = pool.create_or_rent(Counter::default);
        let (b, _) = pool.create_or_rent(Counter::default);
        assert_ne!(a, b);
    }

    #[test]
    fn test_give_back_unknown_index() {
        let mut pool = Pool::<Counter>::with_capacity(0);
        assert!(!pool.give_back(7));
        assert!(pool.is_empty());
    }

    #[test]
    fn test_registry_returns_one_pool_per_type() {
        let registry = PoolRegistry::default();
        let a = registry.get_or_insert_with(|| Mutex::new(Vec::<u8>::new()));
        lock(&a).push(1);

        let b = registry.get_or_insert_with(|| Mutex::new(Vec::<u8>::new()));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(lock(&b).as_slice(), &[1]);

        let _other = registry.get_or_insert_with(|| Mutex::new(Vec::<u16>::new()));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_stats_in_flight() {
        let stats = FiberStats {
            rented: 5,
            returned: 3,
            unobserved_failures: 0,
        };
        assert_eq!(stats.in_flight(), 2);
    }
}
