//! In-memory trigger target for testing.
//!
//! [`InMemoryTriggerTarget`] records every accepted [`TriggerPayload`] and can
//! be told to fail, so tests can assert exactly how many times each arc was
//! triggered.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: triggers go nowhere
//! - **No deduplication**: every accepted call is recorded, which is what lets
//!   tests detect duplicate dispatch

use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use ulid::Ulid;

use super::{TriggerAck, TriggerError, TriggerPayload, TriggerTarget};
use crate::error::Result;

#[derive(Debug, Default)]
struct TargetState {
    invocations: Vec<TriggerPayload>,
    fail_next: u32,
    unavailable: bool,
    rejection: Option<String>,
}

/// In-memory [`TriggerTarget`] with failure injection.
#[derive(Debug)]
pub struct InMemoryTriggerTarget {
    name: String,
    state: RwLock<TargetState>,
}

impl Default for InMemoryTriggerTarget {
    fn default() -> Self {
        Self::new("memory")
    }
}

fn poison_err<T>(_: PoisonError<T>) -> crate::error::Error {
    weir_core::Error::Internal {
        message: "trigger target lock poisoned".into(),
    }
    .into()
}

impl InMemoryTriggerTarget {
    /// Creates a target that accepts every trigger.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: RwLock::new(TargetState::default()),
        }
    }

    /// Makes the next `count` triggers fail as unavailable.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn fail_next(&self, count: u32) -> Result<()> {
        self.state.write().map_err(poison_err)?.fail_next = count;
        Ok(())
    }

    /// Makes every trigger fail as unavailable until cleared.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn set_unavailable(&self, unavailable: bool) -> Result<()> {
        self.state.write().map_err(poison_err)?.unavailable = unavailable;
        Ok(())
    }

    /// Makes every trigger fail permanently with `reason`.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn reject(&self, reason: impl Into<String>) -> Result<()> {
        self.state.write().map_err(poison_err)?.rejection = Some(reason.into());
        Ok(())
    }

    /// Returns accepted payloads in call order.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn invocations(&self) -> Result<Vec<TriggerPayload>> {
        Ok(self.state.read().map_err(poison_err)?.invocations.clone())
    }

    /// Number of accepted triggers.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn call_count(&self) -> Result<usize> {
        Ok(self.state.read().map_err(poison_err)?.invocations.len())
    }
}

#[async_trait]
impl TriggerTarget for InMemoryTriggerTarget {
    async fn trigger(&self, payload: &TriggerPayload) -> std::result::Result<TriggerAck, TriggerError> {
        let mut state = self
            .state
            .write()
            .map_err(|_| TriggerError::Unavailable("trigger target lock poisoned".into()))?;

        if let Some(reason) = &state.rejection {
            return Err(TriggerError::Rejected(reason.clone()));
        }
        if state.unavailable {
            return Err(TriggerError::Unavailable(format!("{} is down", self.name)));
        }
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(TriggerError::Unavailable(format!("{} is busy", self.name)));
        }

        state.invocations.push(payload.clone());
        drop(state);
        Ok(TriggerAck {
            invocation_id: Ulid::new().to_string(),
        })
    }

    fn target_name(&self) -> &str {
        &self.name
    }
}
