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

use khora_fiber::{FiberTaskStatus, Fibers};
use std::sync::{Arc, Mutex};
use std::time::Duration;

mod common;

const FRAME: Duration = Duration::from_millis(16);

#[test]
fn test_recycled_promise_rejects_every_stale_operation() {
    common::init_logger();
    // --- 1. ARRANGE ---
    let fibers = Fibers::default();
    let source = fibers.source::<u32>();
    let stale = source.task();
    source.resolve(1).unwrap();

    // The handle stays readable for the rest of the frame it completed in.
    assert_eq!(stale.result().unwrap(), 1);

    // --- 2. ACT ---
    // The next tick recycles the slot, and a new operation reuses it.
    fibers.tick(FRAME);
    let occupant = fibers.source::<u32>();
    let fresh = occupant.task();

    // --- 3. ASSERT ---
    assert_eq!(
        fresh.generation(),
        stale.generation().map(|generation| generation.wrapping_add(1)),
        "The reused slot should carry the next generation"
    );
    assert!(stale.status().unwrap_err().is_stale());
    assert!(stale.result().unwrap_err().is_stale());
    assert!(stale.cancel().unwrap_err().is_stale());
    assert!(stale.awaiter().get_result().unwrap_err().is_stale());

    occupant.resolve(2).unwrap();
    assert_eq!(fresh.result().unwrap(), 2, "The new occupant keeps its own value");
}

#[test]
fn test_stale_cancel_leaves_the_new_occupant_untouched() {
    common::init_logger();
    // --- 1. ARRANGE ---
    let fibers = Fibers::default();
    let first = fibers.source::<u32>();
    let stale = first.task();
    assert_eq!(stale.generation(), Some(0));
    first.resolve(10).unwrap();
    fibers.tick(FRAME);

    let second = fibers.source::<u32>();
    let fresh = second.task();
    assert_eq!(fresh.generation(), Some(1));

    // --- 2. ACT ---
    let canceled = stale.cancel();

    // --- 3. ASSERT ---
    assert!(canceled.is_err());
    assert_eq!(fresh.status().unwrap(), FiberTaskStatus::Pending);
    assert!(!second.is_canceled());
    assert!(second.resolve(20).unwrap());
    assert_eq!(fresh.result().unwrap(), 20);
}

#[test]
fn test_continuations_run_in_registration_order() {
    // --- 1. ARRANGE ---
    let fibers = Fibers::default();
    let source = fibers.source::<()>();
    let awaiter = source.task().awaiter();
    let order = Arc::new(Mutex::new(Vec::new()));

    for name in ["C1", "C2", "C3"] {
        let order = Arc::clone(&order);
        awaiter
            .on_completed(move || order.lock().unwrap().push(name))
            .unwrap();
    }
    assert!(!awaiter.is_completed());

    // --- 2. ACT ---
    source.resolve(()).unwrap();

    // --- 3. ASSERT ---
    assert_eq!(*order.lock().unwrap(), vec!["C1", "C2", "C3"]);
}

#[test]
fn test_cancel_is_one_way() {
    let fibers = Fibers::default();
    let source = fibers.source::<u32>();
    let task = source.task();

    assert!(task.cancel().unwrap());
    assert!(!task.cancel().unwrap(), "A second cancel is a no-op");
    assert!(source.is_canceled());
    assert!(!source.resolve(5).unwrap(), "Resolving a canceled task is ignored");

    assert_eq!(task.status().unwrap(), FiberTaskStatus::Canceled);
    assert!(task.result().unwrap_err().is_canceled());
}

#[test]
fn test_dropped_source_faults_its_task() {
    common::init_logger();
    let fibers = Fibers::default();
    let source = fibers.source::<String>();
    let task = source.task();

    drop(source);

    assert_eq!(task.status().unwrap(), FiberTaskStatus::Faulted);
    assert!(matches!(
        task.result(),
        Err(khora_fiber::FiberError::SourceDropped)
    ));
}

#[test]
fn test_every_slot_returns_to_its_pool() {
    // --- 1. ARRANGE ---
    let fibers = Fibers::default();
    let tasks: Vec<_> = (0..8)
        .map(|value| {
            let source = fibers.source::<u32>();
            let task = source.task();
            source.resolve(value).unwrap();
            task
        })
        .collect();
    assert_eq!(fibers.stats().in_flight(), 8);

    // --- 2. ACT ---
    fibers.tick(FRAME);

    // --- 3. ASSERT ---
    let stats = fibers.stats();
    assert_eq!(stats.rented, 8);
    assert_eq!(stats.returned, 8);
    assert_eq!(stats.in_flight(), 0);
    assert!(tasks.iter().all(|task| task.status().is_err()));
}
