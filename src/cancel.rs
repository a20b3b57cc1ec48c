//! Two-stage operator interrupt handling.
//!
//! The first signal asks the running phase to drain: finish in-flight items,
//! start no new ones, record a `partial` checkpoint. The second signal
//! aborts: the abort token fires, waiting rate-limit reservations return,
//! and no further checkpoint is written.
//!
//! Signals are injected through [`CancellationController::signal`], so tests
//! drive the state machine without raising real OS signals.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU8, Ordering};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelState {
    Normal,
    Draining,
    Aborted,
}

type Callback = Box<dyn Fn() + Send + Sync>;

struct Inner {
    signals: AtomicU8,
    drain: CancellationToken,
    abort: CancellationToken,
    on_abort: Mutex<Vec<Callback>>,
}

#[derive(Clone)]
pub struct CancellationController {
    inner: Arc<Inner>,
}

impl Default for CancellationController {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationController {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                signals: AtomicU8::new(0),
                drain: CancellationToken::new(),
                abort: CancellationToken::new(),
                on_abort: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Deliver one interrupt and return the resulting state.
    pub fn signal(&self) -> CancelState {
        let previous = self
            .inner
            .signals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < 2).then_some(n + 1))
            .unwrap_or(2);
        match previous {
            0 => {
                info!("Interrupt received, finishing in-flight items before stopping");
                self.inner.drain.cancel();
                CancelState::Draining
            }
            1 => {
                warn!("Second interrupt received, aborting");
                self.inner.drain.cancel();
                self.inner.abort.cancel();
                let callbacks = match self.inner.on_abort.lock() {
                    Ok(mut guard) => std::mem::take(&mut *guard),
                    Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
                };
                for callback in callbacks {
                    callback();
                }
                CancelState::Aborted
            }
            _ => CancelState::Aborted,
        }
    }

    pub fn state(&self) -> CancelState {
        match self.inner.signals.load(Ordering::SeqCst) {
            0 => CancelState::Normal,
            1 => CancelState::Draining,
            _ => CancelState::Aborted,
        }
    }

    /// Polled between items: true once any interrupt has been received.
    pub fn should_stop_now(&self) -> bool {
        self.state() != CancelState::Normal
    }

    pub fn is_aborted(&self) -> bool {
        self.state() == CancelState::Aborted
    }

    /// Register a callback run once, synchronously, on the second signal.
    /// Registering after the abort runs the callback immediately.
    pub fn on_second_signal<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        if self.is_aborted() {
            callback();
            return;
        }
        match self.inner.on_abort.lock() {
            Ok(mut guard) => guard.push(Box::new(callback)),
            Err(poisoned) => poisoned.into_inner().push(Box::new(callback)),
        }
    }

    /// Fires on the first signal.
    pub fn drain_token(&self) -> CancellationToken {
        self.inner.drain.clone()
    }

    /// Fires on the second signal.
    pub fn abort_token(&self) -> CancellationToken {
        self.inner.abort.clone()
    }

    /// Forward Ctrl-C presses into this controller until it aborts.
    pub fn spawn_ctrl_c_listener(&self) -> tokio::task::JoinHandle<()> {
        let controller = self.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!(error = %e, "Could not listen for Ctrl-C");
                    return;
                }
                if controller.signal() == CancelState::Aborted {
                    return;
                }
            }
        })
    }
}
