/// Start-lock hook keyed by resource name.
///
/// The idempotent start protocol is check-then-act. Two concurrent starts for
/// the same key can both pass the existence check. Callers that need
/// exactly-once start plug a lock in here; a distributed implementation keyed
/// by the same resource name extends the guarantee across hosts.
///
/// A granted lock is held by a `StartGuard` and released when the guard is
/// dropped, so a start future canceled by its caller never leaves the name held.
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

/// Holds a start lock until dropped
pub struct StartGuard {
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl StartGuard {
    /// Run `release` exactly once, when the guard goes away
    pub fn new(release: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// Guard with nothing to release
    pub fn unlocked() -> Self {
        Self { release: None }
    }
}

impl Drop for StartGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for StartGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StartGuard")
            .field("held", &self.release.is_some())
            .finish()
    }
}

#[async_trait]
pub trait StartLock: Send + Sync {
    /// Returns None when another start for `resource_name` holds the lock
    async fn try_acquire(&self, resource_name: &str) -> Option<StartGuard>;
}

/// Best-effort default: never blocks, never rejects
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopStartLock;

#[async_trait]
impl StartLock for NoopStartLock {
    async fn try_acquire(&self, _resource_name: &str) -> Option<StartGuard> {
        Some(StartGuard::unlocked())
    }
}

/// Serializes starts within one process
#[derive(Debug, Default)]
pub struct LocalStartLock {
    held: Arc<Mutex<HashSet<String>>>,
}

// The set stays consistent even if a holder panicked
fn lock_set(held: &Mutex<HashSet<String>>) -> MutexGuard<'_, HashSet<String>> {
    held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl LocalStartLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self, resource_name: &str) -> bool {
        lock_set(&self.held).contains(resource_name)
    }
}

#[async_trait]
impl StartLock for LocalStartLock {
    async fn try_acquire(&self, resource_name: &str) -> Option<StartGuard> {
        if !lock_set(&self.held).insert(resource_name.to_string()) {
            return None;
        }

        let held = Arc::clone(&self.held);
        let name = resource_name.to_string();
        Some(StartGuard::new(move || {
            lock_set(&held).remove(&name);
        }))
    }
}
