//! One-shot sleep timer.

use std::thread;
use std::time::Duration;

use crossbeam_channel::{RecvTimeoutError, Sender};

/// Runs a callback once after a delay unless dropped first.
///
/// Dropping the handle disconnects the channel the timer thread waits on,
/// which cancels it without joining.
pub struct PauseTimer {
    _cancel: Sender<()>,
    duration: Duration,
}

impl PauseTimer {
    pub fn arm<F>(duration: Duration, on_expire: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let (cancel, rx) = crossbeam_channel::bounded::<()>(1);
        let spawned = thread::Builder::new()
            .name("pause-timer".to_string())
            .spawn(move || match rx.recv_timeout(duration) {
                Err(RecvTimeoutError::Timeout) => {
                    tracing::info!(secs = duration.as_secs(), "pause timer expired");
                    on_expire();
                }
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {}
            });
        if let Err(e) = spawned {
            tracing::warn!("pause timer thread failed to start: {e}");
        }
        tracing::debug!(secs = duration.as_secs(), "pause timer armed");
        Self {
            _cancel: cancel,
            duration,
        }
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }
}
