//! Fleet-wide mutual exclusion over the configuration registry
//!
//! Serializes "pick an unused cluster and mark it in-use" across processes
//! and hosts. The lock is a registry key written with `set_if_absent`; the
//! holder's token guards the release so a timed-out acquirer can never
//! delete someone else's lock.

use crate::error::{InstallerError, Result};
use crate::registry::ConfigRegistry;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

const LOCK_PREFIX: &str = "/ovs/locks";

/// Pause between acquisition attempts
const ACQUIRE_POLL: Duration = Duration::from_millis(100);

static TOKEN_SEQUENCE: AtomicU64 = AtomicU64::new(0);

fn next_token() -> String {
    format!(
        "{}-{}",
        std::process::id(),
        TOKEN_SEQUENCE.fetch_add(1, Ordering::Relaxed)
    )
}

/// Cross-process mutex backed by a registry key.
///
/// Acquire with a bounded wait, do the critical section, then call
/// [`FleetMutex::release`]; the lock is not released on drop.
pub struct FleetMutex {
    registry: Arc<dyn ConfigRegistry>,
    name: String,
    key: String,
    token: String,
    acquired: bool,
}

impl FleetMutex {
    pub fn new(registry: Arc<dyn ConfigRegistry>, name: impl Into<String>) -> Self {
        let name = name.into();
        let key = format!("{}/{}", LOCK_PREFIX, name);
        FleetMutex {
            registry,
            name,
            key,
            token: next_token(),
            acquired: false,
        }
    }

    /// Acquire the lock, waiting at most `timeout`.
    pub async fn acquire(&mut self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.registry.set_if_absent(&self.key, &self.token).await? {
                debug!("Acquired fleet lock {}", self.name);
                self.acquired = true;
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(InstallerError::Lock(format!(
                    "Could not acquire lock {} within {:?}",
                    self.name, timeout
                )));
            }
            tokio::time::sleep(ACQUIRE_POLL).await;
        }
    }

    /// Release the lock if this instance holds it.
    pub async fn release(&mut self) -> Result<()> {
        if !self.acquired {
            return Ok(());
        }
        self.acquired = false;
        match self.registry.get(&self.key).await {
            Ok(owner) if owner == self.token => {
                self.registry.delete(&self.key).await?;
                debug!("Released fleet lock {}", self.name);
                Ok(())
            }
            Ok(_) | Err(_) => Ok(()),
        }
    }
}
