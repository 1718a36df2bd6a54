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

//! Defines the error taxonomy of the fiber runtime.

use std::any::Any;
use std::sync::Arc;
use thiserror::Error;

/// A convenient alias for results produced by fiber operations.
pub type FiberResult<T> = Result<T, FiberError>;

/// An error surfaced by a [`FiberTask`](crate::FiberTask) or one of its promises.
///
/// Cancellation is reported through its own variant so callers can tell it apart
/// from an operation that actually failed.
#[derive(Debug, Clone, Error)]
pub enum FiberError {
    /// A handle was used after its promise slot was recycled for another operation.
    #[error("Mis-matched fiber version: handle holds generation {held}, promise slot is at {current}")]
    StaleHandle {
        /// The generation captured by the handle.
        held: u16,
        /// The generation currently stored in the promise slot.
        current: u16,
    },
    /// The operation was canceled before it produced a value.
    #[error("The fiber task was canceled")]
    Canceled,
    /// A result was requested from an operation that is still pending.
    #[error("The fiber task has not completed yet")]
    NotCompleted,
    /// The operation failed. The captured failure is shared by every observer.
    #[error("The fiber task faulted: {0}")]
    Faulted(Arc<anyhow::Error>),
    /// A completion source was dropped without being resolved or rejected.
    #[error("The fiber task source was dropped before it was resolved")]
    SourceDropped,
}

impl FiberError {
    /// Wraps an arbitrary failure as a [`FiberError::Faulted`].
    pub fn faulted(error: impl Into<anyhow::Error>) -> Self {
        FiberError::Faulted(Arc::new(error.into()))
    }

    /// Returns `true` if this error reports a recycled (stale) handle.
    pub fn is_stale(&self) -> bool {
        matches!(self, FiberError::StaleHandle { .. })
    }

    /// Returns `true` if this error reports a cancellation.
    pub fn is_canceled(&self) -> bool {
        matches!(self, FiberError::Canceled)
    }

    /// Converts a caught panic payload into a fault.
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        FiberError::faulted(anyhow::anyhow!(
            "fiber panicked: {}",
            panic_message(payload.as_ref())
        ))
    }
}

impl From<anyhow::Error> for FiberError {
    fn from(error: anyhow::Error) -> Self {
        FiberError::Faulted(Arc::new(error))
    }
}

/// Extracts a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn faulted_error_keeps_the_wrapped_message() {
        let error = FiberError::faulted(anyhow::anyhow!("asset not found"));
        assert_eq!(error.to_string(), "The fiber task faulted: asset not found");
        assert!(!error.is_stale());
        assert!(!error.is_canceled());
    }

    #[test]
    fn cloned_faults_share_the_same_failure() {
        let error = FiberError::faulted(anyhow::anyhow!("boom"));
        let copy = error.clone();
        match (error, copy) {
            (FiberError::Faulted(a), FiberError::Faulted(b)) => assert!(Arc::ptr_eq(&a, &b)),
            other => panic!("Unexpected variants: {other:?}"),
        }
    }

    #[test]
    fn panic_payloads_become_faults() {
        let error = FiberError::from_panic(Box::new("exploded"));
        assert_eq!(error.to_string(), "The fiber task faulted: fiber panicked: exploded");

        let error = FiberError::from_panic(Box::new(String::from("owned")));
        assert!(error.to_string().ends_with("owned"));
    }

    #[test]
    fn stale_handle_reports_both_generations() {
        let error = FiberError::StaleHandle { held: 0, current: 1 };
        assert!(error.is_stale());
        assert!(error.to_string().contains("generation 0"));
        assert!(error.to_string().contains("at 1"));
    }
}
