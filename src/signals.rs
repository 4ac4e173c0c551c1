//! Shutdown flag and operator signal handling.
//!
//! The first SIGTERM or SIGINT sets the shutdown flag and wakes the
//! scheduler; a second signal of the same kind terminates the process
//! immediately without waiting for drain.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use tracing::{info, warn};

/// Cooperative shutdown flag shared across the engine.
///
/// Checked at stage boundaries and between coder turns; waited on by the
/// scheduler alongside its heartbeat sleep.
#[derive(Clone, Default)]
pub struct Shutdown {
    inner: Arc<ShutdownInner>,
}

#[derive(Default)]
struct ShutdownInner {
    triggered: AtomicBool,
    notify: Notify,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request graceful shutdown and wake every waiter.
    pub fn trigger(&self) {
        self.inner.triggered.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::SeqCst)
    }

    /// Wait until shutdown is triggered.
    pub async fn wait(&self) {
        while !self.is_triggered() {
            self.inner.notify.notified().await;
        }
    }
}

/// Install SIGTERM/SIGINT handlers.
///
/// The returned task runs for the life of the process. Each signal kind
/// escalates independently: the first occurrence requests drain, the second
/// occurrence of the same signal exits immediately.
pub fn install_handlers(shutdown: Shutdown) -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::spawn(async move {
        let mut term_seen = false;
        let mut int_seen = false;
        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    if term_seen {
                        warn!("second SIGTERM; terminating immediately");
                        std::process::exit(130);
                    }
                    term_seen = true;
                    info!("SIGTERM received; draining");
                    shutdown.trigger();
                }
                _ = sigint.recv() => {
                    if int_seen {
                        warn!("second SIGINT; terminating immediately");
                        std::process::exit(130);
                    }
                    int_seen = true;
                    info!("SIGINT received; draining");
                    shutdown.trigger();
                }
            }
        }
    });
    Ok(())
}
