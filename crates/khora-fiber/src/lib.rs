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

//! # Khora Fiber
//!
//! A cooperative, pooled task runtime for tick-driven hosts such as a game loop.
//!
//! Every pending operation is a promise slot rented from a per-type pool. A
//! [`FiberTask`] handle stores the slot's index together with the generation it
//! observed, so a handle that outlives its operation is detected instead of
//! silently reading whatever reused the slot. All continuations run from inside
//! [`Fibers::tick`], which the host calls once per frame.
//!
//! ```ignore
//! let fibers = Fibers::default();
//! let task = fibers.spawn({
//!     let fibers = fibers.clone();
//!     async move {
//!         fibers.delay(Duration::from_millis(250)).await?;
//!         Ok(42)
//!     }
//! });
//! while !task.is_completed() {
//!     fibers.tick(frame_time);
//! }
//! ```

#![warn(missing_docs)]

mod combinators;
pub mod config;
pub mod error;
pub mod pool;
mod promise;
mod runtime;
pub mod scheduler;
pub mod task;

pub use combinators::when_all::WhenAllBuilder;
pub use combinators::when_any::WhenAnyBuilder;
pub use config::FiberConfig;
pub use error::{FiberError, FiberResult};
pub use pool::{FiberStats, Pool, PoolAware};
pub use promise::bridge::StateMachine;
pub use promise::source::FiberTaskSource;
pub use promise::FiberTaskStatus;
pub use runtime::Fibers;
pub use scheduler::{Scheduler, SendReceipt, TickReport, YieldAwaitable};
pub use task::{FiberTask, FiberTaskAwaiter};
