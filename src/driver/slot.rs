//! Single-slot supervisor for configure/build operations
//!
//! At most one operation holds the slot. A second caller is rejected as
//! busy, or, with auto-restart enabled, cancels the running operation and
//! takes the slot once it has wound down.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{Mutex as AsyncMutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("Another operation is already running: {running}")]
pub struct SlotBusy {
    pub running: &'static str,
}

struct Running {
    id: u64,
    name: &'static str,
    token: CancellationToken,
}

pub struct OperationSlot {
    gate: AsyncMutex<()>,
    current: Mutex<Option<Running>>,
    next_id: AtomicU64,
    auto_restart: AtomicBool,
}

/// Holding this guard means owning the slot
pub struct SlotGuard<'a> {
    _gate: MutexGuard<'a, ()>,
    slot: &'a OperationSlot,
    id: u64,
    token: CancellationToken,
}

impl SlotGuard<'_> {
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut current) = self.slot.current.lock() {
            if current.as_ref().is_some_and(|r| r.id == self.id) {
                *current = None;
            }
        }
    }
}

impl OperationSlot {
    pub fn new(auto_restart: bool) -> Self {
        Self {
            gate: AsyncMutex::new(()),
            current: Mutex::new(None),
            next_id: AtomicU64::new(1),
            auto_restart: AtomicBool::new(auto_restart),
        }
    }

    pub fn set_auto_restart(&self, enabled: bool) {
        self.auto_restart.store(enabled, Ordering::SeqCst);
    }

    pub fn running(&self) -> Option<&'static str> {
        self.current
            .lock()
            .ok()
            .and_then(|c| c.as_ref().map(|r| r.name))
    }

    pub fn is_busy(&self) -> bool {
        self.running().is_some()
    }

    /// Cancel whatever holds the slot; returns `false` if it was idle
    pub fn cancel_current(&self) -> bool {
        let current = self.current.lock().ok().and_then(|c| {
            c.as_ref()
                .map(|r| (r.name, r.token.clone()))
        });
        match current {
            Some((name, token)) => {
                info!("Cancelling running {}", name);
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn acquire(&self, name: &'static str) -> Result<SlotGuard<'_>, SlotBusy> {
        let gate = match self.gate.try_lock() {
            Ok(gate) => gate,
            Err(_) => {
                let running = self.running().unwrap_or("operation");
                if !self.auto_restart.load(Ordering::SeqCst) {
                    debug!("Rejecting {}: {} is running", name, running);
                    return Err(SlotBusy { running });
                }
                info!("Restarting: {} replaces running {}", name, running);
                self.cancel_current();
                self.gate.lock().await
            }
        };

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let token = CancellationToken::new();
        if let Ok(mut current) = self.current.lock() {
            *current = Some(Running {
                id,
                name,
                token: token.clone(),
            });
        }
        Ok(SlotGuard {
            _gate: gate,
            slot: self,
            id,
            token,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_second_acquire_is_rejected() {
        let slot = OperationSlot::new(false);
        let guard = slot.acquire("configure").await.unwrap();
        assert_eq!(slot.running(), Some("configure"));

        let err = slot.acquire("build").await.err();
        assert_eq!(err, Some(SlotBusy { running: "configure" }));

        drop(guard);
        assert!(!slot.is_busy());
        assert!(slot.acquire("build").await.is_ok());
    }

    #[tokio::test]
    async fn test_auto_restart_cancels_running() {
        let slot = Arc::new(OperationSlot::new(true));
        let first = Arc::clone(&slot);
        let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();

        let running = tokio::spawn(async move {
            let guard = first.acquire("build").await.unwrap();
            let token = guard.token();
            let _ = ready_tx.send(());
            token.cancelled().await;
            "cancelled"
        });
        ready_rx.await.unwrap();

        let guard = tokio::time::timeout(Duration::from_secs(5), slot.acquire("build"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(running.await.unwrap(), "cancelled");
        assert!(!guard.token().is_cancelled());
        assert_eq!(slot.running(), Some("build"));
    }

    #[tokio::test]
    async fn test_cancel_idle_slot() {
        let slot = OperationSlot::new(false);
        assert!(!slot.cancel_current());
        let guard = slot.acquire("configure").await.unwrap();
        assert!(slot.cancel_current());
        assert!(guard.token().is_cancelled());
    }
}
