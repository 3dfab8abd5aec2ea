use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// Monotonic identifier for one chart selection. Async work captures the
/// generation it was started under and checks it before publishing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Generation(u64);

impl Generation {
    pub fn value(self) -> u64 {
        self.0
    }
}

/// Hands out a fresh generation and cancellation token per selection, and
/// cancels the predecessor's token on every advance. Tokens are children of
/// the engine root so shutdown fans out to everything in flight.
pub struct SelectionGuard {
    root: CancellationToken,
    generation: AtomicU64,
    active: Mutex<CancellationToken>,
}

impl SelectionGuard {
    pub fn new(root: CancellationToken) -> Self {
        let active = root.child_token();
        Self {
            root,
            generation: AtomicU64::new(0),
            active: Mutex::new(active),
        }
    }

    pub fn advance(&self) -> (Generation, CancellationToken) {
        let mut active = self.active.lock();
        active.cancel();
        let token = self.root.child_token();
        *active = token.clone();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        (Generation(generation), token)
    }

    pub fn current(&self) -> Generation {
        Generation(self.generation.load(Ordering::SeqCst))
    }

    pub fn is_current(&self, generation: Generation) -> bool {
        self.current() == generation
    }

    pub fn token(&self) -> CancellationToken {
        self.active.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advancing_invalidates_the_previous_generation() {
        let guard = SelectionGuard::new(CancellationToken::new());

        let (first, first_token) = guard.advance();
        assert!(guard.is_current(first));
        assert!(!first_token.is_cancelled());

        let (second, second_token) = guard.advance();
        assert!(!guard.is_current(first));
        assert!(guard.is_current(second));
        assert!(first_token.is_cancelled(), "predecessor token must cancel");
        assert!(!second_token.is_cancelled());
        assert!(second > first);
    }

    #[test]
    fn token_returns_the_active_child() {
        let guard = SelectionGuard::new(CancellationToken::new());
        let (_, token) = guard.advance();
        assert!(!guard.token().is_cancelled());
        token.cancel();
        assert!(guard.token().is_cancelled());
    }

    #[test]
    fn root_cancellation_reaches_the_active_token() {
        let root = CancellationToken::new();
        let guard = SelectionGuard::new(root.clone());
        let (_, token) = guard.advance();

        root.cancel();
        assert!(token.is_cancelled());
    }
}
