use std::sync::atomic::{AtomicUsize, Ordering};

/// Client connections being served plus CONNECT tunnels being relayed
pub static ACTIVE_SESSIONS: AtomicUsize = AtomicUsize::new(0);

/// RAII guard to ensure the session count is properly decremented
pub struct SessionGuard {
    counter: &'static AtomicUsize,
}

impl SessionGuard {
    /// Register a new session in [`ACTIVE_SESSIONS`]
    pub fn new() -> Self {
        Self::on(&ACTIVE_SESSIONS)
    }

    fn on(counter: &'static AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self { counter }
    }

    /// Get the current active session count
    pub fn active_count() -> usize {
        ACTIVE_SESSIONS.load(Ordering::Relaxed)
    }
}

impl Default for SessionGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}
