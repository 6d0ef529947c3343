use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use talkbook_types::{FragmentEndReason, PlaybackStatus};

/// Push-style progress notifications, called from the playback worker.
///
/// Implementations must return quickly; they run between device writes.
pub trait StatusObserver: Send + Sync {
    /// A fragment became live.
    fn fragment_started(&self, _index: usize, _count: usize, _duration: Duration) {}

    /// Position inside the live fragment after a chunk was written.
    fn elapsed(&self, _position: Duration) {}

    /// The fragment stopped producing audio.
    fn fragment_ended(&self, _index: usize, _reason: FragmentEndReason) {}
}

/// Observer that ignores every notification.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopObserver;

impl StatusObserver for NoopObserver {}

/// Last values reported through [`StatusObserver`].
#[derive(Debug, Default)]
struct PlayerStatusState {
    live: bool,
    fragment_index: usize,
    fragment_count: usize,
    elapsed: Option<Duration>,
    duration: Option<Duration>,
    end_reason: Option<FragmentEndReason>,
}

/// Observer that keeps a snapshot for a UI to poll.
#[derive(Debug, Default)]
pub struct SharedStatus {
    state: Mutex<PlayerStatusState>,
}

impl SharedStatus {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Snapshot of the reported fields; transport fields come from the player.
    pub fn snapshot(&self) -> PlaybackStatus {
        let st = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        PlaybackStatus {
            playing: st.live,
            fragment_index: st.fragment_index,
            fragment_count: st.fragment_count,
            elapsed_ms: st.elapsed.map(|d| d.as_millis() as u64),
            duration_ms: st.duration.map(|d| d.as_millis() as u64),
            end_reason: st.end_reason,
            ..PlaybackStatus::default()
        }
    }
}

impl StatusObserver for SharedStatus {
    fn fragment_started(&self, index: usize, count: usize, duration: Duration) {
        let mut st = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        st.live = true;
        st.fragment_index = index;
        st.fragment_count = count;
        st.elapsed = Some(Duration::ZERO);
        st.duration = Some(duration);
        st.end_reason = None;
    }

    fn elapsed(&self, position: Duration) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed = Some(position);
    }

    fn fragment_ended(&self, index: usize, reason: FragmentEndReason) {
        let mut st = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if st.fragment_index == index {
            st.live = false;
            st.end_reason = Some(reason);
        }
    }
}
