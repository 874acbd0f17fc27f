//! Revocable cancellation for one attachment record.
//!
//! A record owns one [`CancelHandle`]. Each pipeline run takes the current
//! [`CancellationToken`]; `cancel()` fires it and raises a short-lived
//! "cancelled" indicator. A single timer lowers the indicator again and
//! swaps in a fresh token so the record can be reused.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

struct CancelState {
    token: CancellationToken,
    /// Deadline of the pending indicator reset, if any.
    deadline: Option<Instant>,
    /// A timer task is alive and will honor `deadline`.
    timer_armed: bool,
}

#[derive(Clone)]
pub struct CancelHandle {
    state: Arc<Mutex<CancelState>>,
    indicator: Arc<watch::Sender<bool>>,
    delay: Duration,
}

impl CancelHandle {
    pub fn new(delay: Duration) -> Self {
        let (indicator, _) = watch::channel(false);
        Self {
            state: Arc::new(Mutex::new(CancelState {
                token: CancellationToken::new(),
                deadline: None,
                timer_armed: false,
            })),
            indicator: Arc::new(indicator),
            delay,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CancelState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The token the next suspension point should observe.
    pub fn token(&self) -> CancellationToken {
        self.lock().token.clone()
    }

    /// Hand out a usable token for a new operation, replacing a fired one.
    pub fn reset(&self) -> CancellationToken {
        let mut state = self.lock();
        if state.token.is_cancelled() {
            state.token = CancellationToken::new();
        }
        state.token.clone()
    }

    /// Fire the token and (re)arm the indicator reset timer.
    ///
    /// A second call while the timer is pending moves its deadline; it
    /// never starts another timer.
    pub fn cancel(&self) {
        let mut state = self.lock();
        state.token.cancel();
        state.deadline = Some(Instant::now() + self.delay);
        self.indicator.send_replace(true);

        if state.timer_armed {
            debug!("Cancel reset timer re-armed");
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                state.timer_armed = true;
                runtime.spawn(reset_timer(self.clone()));
            }
            Err(_) => {
                warn!("No async runtime; cancelled indicator stays up until the next operation");
                state.deadline = None;
            }
        }
    }

    /// `true` while the "cancelled" indicator is raised.
    pub fn is_cancelled(&self) -> bool {
        *self.indicator.borrow()
    }

    /// Number of reset timers currently pending (0 or 1).
    pub fn pending_resets(&self) -> usize {
        usize::from(self.lock().timer_armed)
    }

    /// Watch the "cancelled" indicator.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.indicator.subscribe()
    }
}

async fn reset_timer(handle: CancelHandle) {
    loop {
        let deadline = {
            let mut state = handle.lock();
            match state.deadline {
                Some(deadline) if Instant::now() < deadline => deadline,
                _ => {
                    state.deadline = None;
                    state.timer_armed = false;
                    if state.token.is_cancelled() {
                        state.token = CancellationToken::new();
                    }
                    handle.indicator.send_replace(false);
                    debug!("Cancelled indicator reset");
                    return;
                }
            }
        };
        tokio::time::sleep_until(deadline).await;
    }
}
