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

//! Time delays measured in tick time.

use crate::promise::{FiberTaskStatus, PromiseKind, PromisePool};
use crate::task::FiberTask;
use std::sync::Arc;
use std::time::Duration;

/// Timer of a delay promise.
pub(crate) struct DelayState {
    duration: Duration,
    elapsed: Duration,
}

impl DelayState {
    /// Advances the timer. Returns `true` once it has expired.
    fn advance(&mut self, delta: Duration) -> bool {
        self.elapsed = self.elapsed.saturating_add(delta);
        self.elapsed >= self.duration
    }
}

impl PromisePool<()> {
    /// Rents a promise that succeeds once `duration` of tick time has elapsed.
    ///
    /// The timer only advances during ticks that follow this call, so even a
    /// zero delay completes on the next tick.
    pub(crate) fn delay(self: &Arc<Self>, duration: Duration) -> FiberTask<()> {
        let (index, generation) = self.rent(PromiseKind::Delay(DelayState {
            duration,
            elapsed: Duration::ZERO,
        }));
        self.schedule_delay_step(index, generation);
        FiberTask::pooled(Arc::clone(self), index, generation)
    }

    fn schedule_delay_step(self: &Arc<Self>, index: u32, generation: u16) {
        let pool = Arc::clone(self);
        self.scheduler
            .schedule_next_tick(move || pool.delay_step(index, generation));
    }

    fn delay_step(self: &Arc<Self>, index: u32, generation: u16) {
        let delta = self.scheduler.delta_time();
        let expired = self.with_slot(index, generation, |slot| {
            if slot.status() != FiberTaskStatus::Pending {
                return None;
            }
            match &mut slot.kind {
                PromiseKind::Delay(timer) => Some(timer.advance(delta)),
                _ => None,
            }
        });

        match expired {
            Ok(Some(true)) => {
                let _ = self.complete(index, generation, Ok(()));
            }
            Ok(Some(false)) => self.schedule_delay_step(index, generation),
            // Canceled or recycled.
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_expires_on_cumulative_delta() {
        let mut timer = DelayState {
            duration: Duration::from_millis(25),
            elapsed: Duration::ZERO,
        };

        assert!(!timer.advance(Duration::from_millis(10)));
        assert!(!timer.advance(Duration::from_millis(10)));
        assert!(timer.advance(Duration::from_millis(10)));
    }

    #[test]
    fn test_zero_delay_expires_on_first_step() {
        let mut timer = DelayState {
            duration: Duration::ZERO,
            elapsed: Duration::ZERO,
        };
        assert!(timer.advance(Duration::ZERO));
    }
}
