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

//! Immediate failures for synchronous error paths.

use crate::error::FiberError;
use crate::promise::FiberTaskStatus;

/// A promise that is already faulted when it is created.
///
/// It carries no pending state, so it is never pooled and never goes stale.
#[derive(Debug, Clone)]
pub(crate) struct FailedPromise {
    error: FiberError,
}

impl FailedPromise {
    pub(crate) fn new(error: FiberError) -> Self {
        Self { error }
    }

    /// `Canceled` for a cancellation, `Faulted` for everything else.
    pub(crate) fn status(&self) -> FiberTaskStatus {
        if self.error.is_canceled() {
            FiberTaskStatus::Canceled
        } else {
            FiberTaskStatus::Faulted
        }
    }

    pub(crate) fn error(&self) -> FiberError {
        self.error.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_promise_reports_its_status() {
        let faulted = FailedPromise::new(FiberError::faulted(anyhow::anyhow!("missing shader")));
        assert_eq!(faulted.status(), FiberTaskStatus::Faulted);
        assert_eq!(
            faulted.error().to_string(),
            "The fiber task faulted: missing shader"
        );

        let canceled = FailedPromise::new(FiberError::Canceled);
        assert_eq!(canceled.status(), FiberTaskStatus::Canceled);
    }
}
