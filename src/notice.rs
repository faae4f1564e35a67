//! Transient user-visible notices

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::watch;

/// How long a notice stays visible
pub const NOTICE_TTL: Duration = Duration::from_secs(5);

/// A message shown to the user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub id: u64,
    pub message: String,
}

/// The single notice slot
///
/// A newer notice replaces the current one; each notice clears itself
/// after [`NOTICE_TTL`] unless it was already replaced.
#[derive(Clone)]
pub struct Notices {
    current: Arc<watch::Sender<Option<Notice>>>,
    seq: Arc<AtomicU64>,
    ttl: Duration,
}

impl Default for Notices {
    fn default() -> Self {
        Self::new()
    }
}

impl Notices {
    #[must_use]
    pub fn new() -> Self {
        Self::with_ttl(NOTICE_TTL)
    }

    #[must_use]
    pub fn with_ttl(ttl: Duration) -> Self {
        let (current, _) = watch::channel(None);
        Self {
            current: Arc::new(current),
            seq: Arc::new(AtomicU64::new(0)),
            ttl,
        }
    }

    /// Show a notice; must be called inside a Tokio runtime
    pub fn show(&self, message: impl Into<String>) -> u64 {
        let id = self.seq.fetch_add(1, Ordering::AcqRel) + 1;
        let message = message.into();
        tracing::info!(id, %message, "notice");
        self.current.send_replace(Some(Notice { id, message }));

        let current = Arc::clone(&self.current);
        let ttl = self.ttl;
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            current.send_if_modified(|slot| {
                if slot.as_ref().is_some_and(|n| n.id == id) {
                    *slot = None;
                    true
                } else {
                    false
                }
            });
        });

        id
    }

    #[must_use]
    pub fn current(&self) -> Option<Notice> {
        self.current.borrow().clone()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Option<Notice>> {
        self.current.subscribe()
    }
}
