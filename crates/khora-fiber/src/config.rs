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

//! Configuration of a fiber runtime.

/// Configuration for a [`Fibers`](crate::Fibers) runtime.
#[derive(Debug, Clone)]
pub struct FiberConfig {
    /// Number of promise slots reserved up front by each promise pool.
    pub initial_pool_capacity: usize,
    /// Whether cancelling a pending promise immediately runs its waiting continuations.
    ///
    /// When disabled, continuations queued on a canceled promise are never run;
    /// waiters only observe the cancellation by polling the task's status.
    /// WhenAll and WhenAny are still told, so a canceled child never stalls them.
    pub wake_on_cancel: bool,
    /// Whether a faulted promise recycled without anyone reading its result is
    /// logged as an unobserved failure.
    pub report_unobserved_failures: bool,
}

impl Default for FiberConfig {
    fn default() -> Self {
        Self {
            initial_pool_capacity: 32,
            wake_on_cancel: true,
            report_unobserved_failures: true,
        }
    }
}
