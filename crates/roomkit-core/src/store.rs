use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;

use crate::state::SessionState;
use crate::transitions::{Transition, reduce};

/// Result of one committed transition.
pub struct Commit<T> {
    pub previous: Arc<SessionState>,
    pub current: Arc<SessionState>,
    /// Whatever the caller computed while the store lock was held.
    pub observed: T,
}

/// The single owner of session state.
///
/// Transitions are applied one at a time under a lock; the new snapshot is
/// published to `watch` subscribers before the lock is released, so
/// subscribers observe transitions in commit order.
pub struct SessionStore {
    state: Mutex<Arc<SessionState>>,
    tx: watch::Sender<Arc<SessionState>>,
}

impl SessionStore {
    pub fn new(initial: SessionState) -> Self {
        let initial = Arc::new(initial);
        let (tx, _) = watch::channel(initial.clone());
        Self {
            state: Mutex::new(initial),
            tx,
        }
    }

    pub fn snapshot(&self) -> Arc<SessionState> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<SessionState>> {
        self.tx.subscribe()
    }

    /// Apply `transition` if `guard` holds for the current state.
    ///
    /// `observe` runs under the lock with `(previous, current)` so callers can
    /// derive follow-up work from exactly this pair of states, in commit order.
    pub fn apply_if<T>(
        &self,
        transition: &Transition,
        guard: impl FnOnce(&SessionState) -> bool,
        observe: impl FnOnce(&SessionState, &SessionState) -> T,
    ) -> Option<Commit<T>> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !guard(&state) {
            return None;
        }
        Some(self.commit(&mut state, transition, observe))
    }

    pub fn apply<T>(
        &self,
        transition: &Transition,
        observe: impl FnOnce(&SessionState, &SessionState) -> T,
    ) -> Commit<T> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.commit(&mut state, transition, observe)
    }

    fn commit<T>(
        &self,
        state: &mut Arc<SessionState>,
        transition: &Transition,
        observe: impl FnOnce(&SessionState, &SessionState) -> T,
    ) -> Commit<T> {
        let previous = state.clone();
        let current = Arc::new(reduce(&previous, transition));
        *state = current.clone();
        let observed = observe(&previous, &current);
        self.tx.send_replace(current.clone());
        tracing::trace!(transition = transition.name(), "transition applied");
        Commit {
            previous,
            current,
            observed,
        }
    }
}
