//! Maps a run to the `CancellationToken` its driver task is racing
//! against, so `POST /runs/{id}/cancel` can signal a task it does not
//! otherwise hold a handle to.

use shiioo_core::RunId;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
pub struct CancellationRegistry {
    tokens: Mutex<HashMap<RunId, CancellationToken>>,
}

impl CancellationRegistry {
    /// Registers a fresh token for a run about to start driving. Overwrites
    /// any stale entry left by a prior run with the same id, which cannot
    /// happen in practice since run ids are never reused.
    pub fn register(&self, run_id: RunId) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens.lock().unwrap().insert(run_id, token.clone());
        token
    }

    /// Signals cancellation for a run, if it is still being driven.
    /// Returns `false` if the run has already finished and been removed.
    pub fn cancel(&self, run_id: RunId) -> bool {
        match self.tokens.lock().unwrap().get(&run_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Drops the registry entry once a run's driver task has finished,
    /// so the map doesn't grow without bound.
    pub fn remove(&self, run_id: RunId) {
        self.tokens.lock().unwrap().remove(&run_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_of_unregistered_run_is_false() {
        let registry = CancellationRegistry::default();
        assert!(!registry.cancel(RunId::new()));
    }

    #[test]
    fn register_then_cancel_signals_the_token() {
        let registry = CancellationRegistry::default();
        let run_id = RunId::new();
        let token = registry.register(run_id);
        assert!(!token.is_cancelled());
        assert!(registry.cancel(run_id));
        assert!(token.is_cancelled());
    }

    #[test]
    fn remove_then_cancel_is_false() {
        let registry = CancellationRegistry::default();
        let run_id = RunId::new();
        registry.register(run_id);
        registry.remove(run_id);
        assert!(!registry.cancel(run_id));
    }
}
