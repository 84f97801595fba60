use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Per-call transient cookie state. Owned by the invocation that created it
/// and discarded at invocation end unless cookie reset is disabled on the
/// Runner.
#[derive(Debug, Clone, Default)]
pub struct CookieJar {
    inner: Arc<Mutex<BTreeMap<String, String>>>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<String> {
        self.inner
            .lock()
            .expect("cookie jar lock should not be poisoned")
            .get(name)
            .cloned()
    }

    pub fn set(&self, name: impl Into<String>, value: impl Into<String>) {
        self.inner
            .lock()
            .expect("cookie jar lock should not be poisoned")
            .insert(name.into(), value.into());
    }

    pub fn entries(&self) -> Vec<(String, String)> {
        self.inner
            .lock()
            .expect("cookie jar lock should not be poisoned")
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .expect("cookie jar lock should not be poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Cancellation and deadline handle driving one invocation. Clones share the
/// cancellation flag and cookie jar; `with_fresh_cookies` is the one place a
/// clone detaches its transient state.
#[derive(Debug, Clone, Default)]
pub struct InvocationContext {
    deadline: Option<Instant>,
    cancelled: Arc<AtomicBool>,
    cookies: CookieJar,
}

impl InvocationContext {
    /// A context with no deadline, equivalent to the original's background
    /// context.
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            ..Self::default()
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn deadline_elapsed(&self) -> bool {
        self.deadline
            .map(|deadline| Instant::now() > deadline)
            .unwrap_or(false)
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// True once the engine's interruption hook should fire.
    pub fn should_interrupt(&self) -> bool {
        self.is_cancelled() || self.deadline_elapsed()
    }

    pub fn cookies(&self) -> &CookieJar {
        &self.cookies
    }

    /// Same deadline and cancellation flag, fresh cookie jar.
    pub fn with_fresh_cookies(&self) -> Self {
        Self {
            deadline: self.deadline,
            cancelled: Arc::clone(&self.cancelled),
            cookies: CookieJar::new(),
        }
    }
}
