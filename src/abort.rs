//! Cancellation primitives: abort tokens, timeout/caller-signal fusion, and
//! the `race` helper that lets the orchestrator run an executor under a
//! deadline without blocking on it past cancellation.

use std::sync::Arc;
use tokio::sync::watch;

/// Why an [`AbortSignal`] fired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// The caller supplied signal was aborted directly.
    Caller(String),
    /// The per-attempt timeout elapsed.
    Timeout,
}

/// A cloneable, idempotent cancellation token.
///
/// Built on `tokio::sync::watch` rather than callback-listener registration
/// (the source's `addListener`/`once` pattern): Rust's async model favors
/// awaiting a future over registering a callback, and `watch::Receiver` gives
/// every clone an independent "has this fired yet" view for free.
#[derive(Clone)]
pub struct AbortSignal {
    rx: watch::Receiver<Option<AbortReason>>,
}

/// The mutator half. Dropped once no further aborts can occur.
#[derive(Clone)]
pub struct AbortController {
    tx: Arc<watch::Sender<Option<AbortReason>>>,
}

impl AbortController {
    pub fn new() -> (Self, AbortSignal) {
        let (tx, rx) = watch::channel(None);
        (
            AbortController { tx: Arc::new(tx) },
            AbortSignal { rx },
        )
    }

    /// Abort with a reason. Idempotent: subsequent calls are no-ops.
    pub fn abort(&self, reason: AbortReason) {
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                false
            } else {
                *current = Some(reason);
                true
            }
        });
    }
}

impl AbortSignal {
    pub fn aborted(&self) -> bool {
        self.rx.borrow().is_some()
    }

    pub fn reason(&self) -> Option<AbortReason> {
        self.rx.borrow().clone()
    }

    /// Resolves once the signal fires. Resolves immediately if already fired.
    pub async fn wait(&self) -> AbortReason {
        let mut rx = self.rx.clone();
        if let Some(reason) = rx.borrow().clone() {
            return reason;
        }
        loop {
            if rx.changed().await.is_err() {
                // Sender dropped without ever aborting — park forever, matching
                // a signal that simply never fires.
                std::future::pending::<()>().await;
            }
            if let Some(reason) = rx.borrow().clone() {
                return reason;
            }
        }
    }
}

/// A fused signal combining an optional caller-supplied signal with a
/// per-attempt timeout. Distinguishes which one fired via [`RunSignal::did_timeout`].
pub struct RunSignal {
    pub signal: AbortSignal,
    did_timeout: Arc<std::sync::atomic::AtomicBool>,
    _timer: Option<tokio::task::JoinHandle<()>>,
    _forward: Option<tokio::task::JoinHandle<()>>,
}

impl RunSignal {
    /// Build a fused run signal. `timeout_ms = 0` disables the timeout leg.
    pub fn new(timeout_ms: i64, caller_signal: Option<AbortSignal>) -> Self {
        let (controller, signal) = AbortController::new();
        let did_timeout = Arc::new(std::sync::atomic::AtomicBool::new(false));

        // A pre-aborted caller signal short-circuits before any timer is armed.
        if let Some(ref caller) = caller_signal {
            if let Some(reason) = caller.reason() {
                controller.abort(reason);
                return RunSignal {
                    signal,
                    did_timeout,
                    _timer: None,
                    _forward: None,
                };
            }
        }

        let forward = caller_signal.map(|caller| {
            let controller = controller.clone();
            tokio::spawn(async move {
                let reason = caller.wait().await;
                controller.abort(reason);
            })
        });

        let timer = if timeout_ms > 0 {
            let controller = controller.clone();
            let flag = did_timeout.clone();
            Some(tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(timeout_ms as u64)).await;
                flag.store(true, std::sync::atomic::Ordering::SeqCst);
                controller.abort(AbortReason::Timeout);
            }))
        } else {
            None
        };

        RunSignal {
            signal,
            did_timeout,
            _timer: timer,
            _forward: forward,
        }
    }

    pub fn did_timeout(&self) -> bool {
        self.did_timeout.load(std::sync::atomic::Ordering::SeqCst)
    }
}

impl Drop for RunSignal {
    fn drop(&mut self) {
        if let Some(h) = self._timer.take() {
            h.abort();
        }
        if let Some(h) = self._forward.take() {
            h.abort();
        }
    }
}

/// Marker error returned by [`race`] and [`sleep_with_abort`] when the
/// signal fires before the awaited future/duration completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Aborted(pub AbortReason);

/// Await `fut` and `signal` concurrently. If the signal fires first, `fut`'s
/// result is discarded and `Err(Aborted)` is returned.
pub async fn race<F, T>(signal: &AbortSignal, fut: F) -> Result<T, Aborted>
where
    F: std::future::Future<Output = T>,
{
    tokio::select! {
        biased;
        reason = signal.wait() => Err(Aborted(reason)),
        value = fut => Ok(value),
    }
}

/// Sleep for `ms`, honoring cancellation via `signal` if supplied.
pub async fn sleep_with_abort(ms: i64, signal: Option<&AbortSignal>) -> Result<(), Aborted> {
    let duration = std::time::Duration::from_millis(ms.max(0) as u64);
    match signal {
        Some(signal) => {
            tokio::select! {
                biased;
                reason = signal.wait() => Err(Aborted(reason)),
                _ = tokio::time::sleep(duration) => Ok(()),
            }
        }
        None => {
            tokio::time::sleep(duration).await;
            Ok(())
        }
    }
}
