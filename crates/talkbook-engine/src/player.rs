//! Playlist sequencer and transport controls.
//!
//! A listening session owns one worker thread that opens each fragment in turn
//! and runs its playback loop. Control calls may come from any thread:
//! - `transport` serializes `play_pause`, `stop` and `set_fragment`
//! - `state` guards the mutable fields and is never held across a device write
//! - the live fragment has its own locks (see [`Fragment`])
//!
//! Lock order is `transport`, then `state`, then the fragment's locks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use talkbook_types::{FragmentEndReason, PlaybackStatus, SavedPosition};

use crate::context::PlayerContext;
use crate::error::{PlayerError, Result};
use crate::fragment::{Fragment, FragmentSettings, RunOutcome};
use crate::playlist::{PlayList, open_payload};
use crate::position::PositionStore;
use crate::timer::PauseTimer;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

struct PlayerState {
    index: usize,
    /// Applied once to the next fragment that opens.
    pending_offset: Duration,
    /// Position reported while no fragment is live.
    saved_offset: Duration,
    /// Pause asked for while no fragment was live; applied when one starts.
    pause_requested: bool,
    speed: f32,
    pitch: f32,
    volume: f32,
    device: Option<String>,
    timer_duration: Option<Duration>,
    timer: Option<PauseTimer>,
    /// Identifies the armed timer so a superseded one cannot fire.
    timer_generation: u64,
    fragment: Option<Arc<Fragment>>,
    worker: Option<JoinHandle<()>>,
    end_reason: Option<FragmentEndReason>,
}

struct PlayerShared {
    ctx: PlayerContext,
    playlist: PlayList,
    store: Arc<dyn PositionStore>,
    state: Mutex<PlayerState>,
    playing: AtomicBool,
    transport: Mutex<()>,
}

/// Plays one book's playlist and keeps its position.
pub struct Player {
    shared: Arc<PlayerShared>,
}

impl Player {
    /// Build a player, restoring index, offset and speed from `store`.
    pub fn open(playlist: PlayList, ctx: PlayerContext, store: Arc<dyn PositionStore>) -> Self {
        let config = &ctx.config;
        let mut index = 0;
        let mut offset = Duration::ZERO;
        let mut speed = config.clamp_speed(1.0);
        if let Some(saved) = store.load() {
            let last = playlist.len().saturating_sub(1);
            index = saved.fragment_index.min(last);
            if index == saved.fragment_index {
                offset = Duration::from_millis(saved.elapsed_ms);
            }
            speed = config.clamp_speed(saved.speed);
            tracing::info!(
                index,
                offset_ms = offset.as_millis() as u64,
                speed,
                "restored position"
            );
        }

        let state = PlayerState {
            index,
            pending_offset: offset,
            saved_offset: offset,
            pause_requested: false,
            speed,
            pitch: config.clamp_pitch(1.0),
            volume: config.clamp_volume(1.0),
            device: config.default_device.clone(),
            timer_duration: None,
            timer: None,
            timer_generation: 0,
            fragment: None,
            worker: None,
            end_reason: None,
        };
        Self {
            shared: Arc::new(PlayerShared {
                ctx,
                playlist,
                store,
                state: Mutex::new(state),
                playing: AtomicBool::new(false),
                transport: Mutex::new(()),
            }),
        }
    }

    /// Start a session at the current index, or toggle pause on the live one.
    pub fn play_pause(&self) -> Result<()> {
        let _transport = lock(&self.shared.transport);
        if !self.shared.playing.load(Ordering::Acquire) {
            return self.start_locked();
        }

        let mut st = lock(&self.shared.state);
        let Some(fragment) = st.fragment.clone() else {
            st.pause_requested = !st.pause_requested;
            if st.pause_requested {
                st.timer = None;
            } else {
                self.shared.arm_timer(&mut st);
            }
            tracing::info!(paused = st.pause_requested, index = st.index, "toggled pause while opening");
            return Ok(());
        };
        let pause = !fragment.is_paused();
        fragment.pause(pause);
        if pause {
            st.timer = None;
        } else {
            self.shared.arm_timer(&mut st);
        }
        tracing::info!(paused = pause, index = fragment.index(), "toggled pause");
        Ok(())
    }

    fn start_locked(&self) -> Result<()> {
        if self.shared.playlist.is_empty() {
            return Err(PlayerError::State("playlist is empty".to_string()));
        }
        let previous = lock(&self.shared.state).worker.take();
        if let Some(handle) = previous {
            join_worker(handle);
        }

        self.shared.playing.store(true, Ordering::Release);
        let shared = self.shared.clone();
        let spawned = thread::Builder::new()
            .name("talkbook-player".to_string())
            .spawn(move || shared.worker_loop());
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.shared.playing.store(false, Ordering::Release);
                return Err(PlayerError::State(format!("failed to start worker: {e}")));
            }
        };

        let mut st = lock(&self.shared.state);
        st.worker = Some(handle);
        st.pause_requested = false;
        self.shared.arm_timer(&mut st);
        tracing::info!(index = st.index, "playback started");
        Ok(())
    }

    /// End the session; returns after the worker has exited.
    pub fn stop(&self) {
        let _transport = lock(&self.shared.transport);
        self.stop_locked();
    }

    fn stop_locked(&self) {
        self.shared.playing.store(false, Ordering::Release);
        let (fragment, worker) = {
            let mut st = lock(&self.shared.state);
            st.timer = None;
            st.pause_requested = false;
            (st.fragment.clone(), st.worker.take())
        };
        if let Some(fragment) = &fragment {
            fragment.stop();
        }
        drop(fragment);
        if let Some(handle) = worker {
            join_worker(handle);
            tracing::info!("playback stopped");
        }
        lock(&self.shared.state).pending_offset = Duration::ZERO;
    }

    /// Jump to fragment `index` (clamped to the playlist), from its start.
    pub fn set_fragment(&self, index: usize) -> Result<()> {
        let _transport = lock(&self.shared.transport);
        let len = self.shared.playlist.len();
        if len == 0 {
            return Err(PlayerError::State("playlist is empty".to_string()));
        }
        let index = index.min(len - 1);
        let was_playing = self.shared.playing.load(Ordering::Acquire);
        if was_playing {
            self.stop_locked();
        }
        {
            let mut st = lock(&self.shared.state);
            st.index = index;
            st.pending_offset = Duration::ZERO;
            st.saved_offset = Duration::ZERO;
        }
        tracing::debug!(index, "fragment selected");
        if was_playing {
            self.start_locked()?;
        }
        Ok(())
    }

    /// Move by `delta_ms` within the current fragment.
    pub fn change_offset(&self, delta_ms: i64) -> Result<()> {
        let current = self.position().as_millis() as i64;
        let target = current.saturating_add(delta_ms).max(0) as u64;
        self.set_position(Duration::from_millis(target))
    }

    /// Seek the live fragment, or remember the offset for the next one.
    pub fn set_position(&self, target: Duration) -> Result<()> {
        let fragment = {
            let mut st = lock(&self.shared.state);
            match st.fragment.clone() {
                Some(fragment) => fragment,
                None => {
                    st.pending_offset = target;
                    st.saved_offset = target;
                    return Ok(());
                }
            }
        };
        fragment.set_position(clamp_offset(&fragment, target))
    }

    pub fn set_speed(&self, speed: f32) -> f32 {
        let (speed, fragment) = {
            let mut st = lock(&self.shared.state);
            st.speed = self.shared.ctx.config.clamp_speed(speed);
            (st.speed, st.fragment.clone())
        };
        if let Some(fragment) = fragment {
            fragment.set_speed(speed);
        }
        speed
    }

    /// Add `delta` to the current speed; returns the clamped result.
    pub fn change_speed(&self, delta: f32) -> f32 {
        let (speed, fragment) = {
            let mut st = lock(&self.shared.state);
            st.speed = self.shared.ctx.config.clamp_speed(st.speed + delta);
            (st.speed, st.fragment.clone())
        };
        if let Some(fragment) = fragment {
            fragment.set_speed(speed);
        }
        speed
    }

    pub fn set_pitch(&self, pitch: f32) -> Result<f32> {
        let (pitch, fragment) = {
            let mut st = lock(&self.shared.state);
            st.pitch = self.shared.ctx.config.clamp_pitch(pitch);
            (st.pitch, st.fragment.clone())
        };
        if let Some(fragment) = fragment {
            fragment.set_pitch(pitch)?;
        }
        Ok(pitch)
    }

    pub fn set_volume(&self, volume: f32) -> f32 {
        let (volume, fragment) = {
            let mut st = lock(&self.shared.state);
            st.volume = self.shared.ctx.config.clamp_volume(volume);
            (st.volume, st.fragment.clone())
        };
        if let Some(fragment) = fragment {
            fragment.set_volume(volume);
        }
        volume
    }

    /// Add `delta` to the current volume; returns the clamped result.
    pub fn change_volume(&self, delta: f32) -> f32 {
        let (volume, fragment) = {
            let mut st = lock(&self.shared.state);
            st.volume = self.shared.ctx.config.clamp_volume(st.volume + delta);
            (st.volume, st.fragment.clone())
        };
        if let Some(fragment) = fragment {
            fragment.set_volume(volume);
        }
        volume
    }

    /// Switch output; the stored default changes only if the live switch worked.
    pub fn set_output_device(&self, name: Option<&str>) -> Result<()> {
        let fragment = lock(&self.shared.state).fragment.clone();
        if let Some(fragment) = fragment {
            if let Err(e) = fragment.set_output_device(name) {
                tracing::warn!(device = ?name, "output device switch failed: {e}");
                return Err(e);
            }
        }
        lock(&self.shared.state).device = name.map(str::to_string);
        tracing::info!(device = ?name, "output device set");
        Ok(())
    }

    /// Set or clear the sleep timer; it is armed on every resume.
    pub fn set_timer_duration(&self, duration: Option<Duration>) {
        let mut st = lock(&self.shared.state);
        st.timer_duration = duration;
        if self.shared.running(&st) {
            self.shared.arm_timer(&mut st);
        } else {
            st.timer = None;
        }
    }

    pub fn is_playing(&self) -> bool {
        self.shared.playing.load(Ordering::Acquire)
    }

    pub fn is_paused(&self) -> bool {
        paused(&lock(&self.shared.state))
    }

    pub fn fragment_index(&self) -> usize {
        lock(&self.shared.state).index
    }

    pub fn fragment_count(&self) -> usize {
        self.shared.playlist.len()
    }

    /// Offset inside the current fragment.
    pub fn position(&self) -> Duration {
        let st = lock(&self.shared.state);
        match &st.fragment {
            Some(fragment) => fragment.position(),
            None => st.saved_offset,
        }
    }

    pub fn speed(&self) -> f32 {
        lock(&self.shared.state).speed
    }

    pub fn pitch(&self) -> f32 {
        lock(&self.shared.state).pitch
    }

    pub fn volume(&self) -> f32 {
        lock(&self.shared.state).volume
    }

    pub fn output_device(&self) -> Option<String> {
        lock(&self.shared.state).device.clone()
    }

    pub fn timer_duration(&self) -> Option<Duration> {
        lock(&self.shared.state).timer_duration
    }

    pub fn status(&self) -> PlaybackStatus {
        let st = lock(&self.shared.state);
        let live = st.fragment.as_ref();
        let elapsed = live.map_or(st.saved_offset, |f| f.position());
        PlaybackStatus {
            playing: self.is_playing(),
            paused: paused(&st),
            fragment_index: st.index,
            fragment_count: self.shared.playlist.len(),
            elapsed_ms: Some(elapsed.as_millis() as u64),
            duration_ms: live.map(|f| f.duration().as_millis() as u64),
            speed: st.speed,
            device: live.and_then(|f| f.device_name()).or_else(|| st.device.clone()),
            end_reason: st.end_reason,
        }
    }

    /// Persist index, offset and speed.
    pub fn save(&self) -> Result<()> {
        let position = SavedPosition {
            fragment_index: self.fragment_index(),
            elapsed_ms: self.position().as_millis() as u64,
            speed: self.speed(),
        };
        self.shared
            .store
            .save(&position)
            .map_err(|e| PlayerError::from_io(&e))?;
        tracing::debug!(
            index = position.fragment_index,
            elapsed_ms = position.elapsed_ms,
            "position saved"
        );
        Ok(())
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.stop();
    }
}

impl PlayerShared {
    fn settings(&self, st: &PlayerState) -> FragmentSettings {
        FragmentSettings {
            speed: st.speed,
            pitch: st.pitch,
            volume: st.volume,
            device: st.device.clone(),
        }
    }

    /// Playing and not paused, whether or not a fragment is live yet.
    fn running(&self, st: &PlayerState) -> bool {
        if !self.playing.load(Ordering::Acquire) {
            return false;
        }
        match &st.fragment {
            Some(fragment) => !fragment.is_paused(),
            None => !st.pause_requested,
        }
    }

    fn arm_timer(self: &Arc<Self>, st: &mut PlayerState) {
        st.timer_generation += 1;
        st.timer = st.timer_duration.map(|duration| {
            let weak: Weak<Self> = Arc::downgrade(self);
            let generation = st.timer_generation;
            PauseTimer::arm(duration, move || {
                if let Some(shared) = weak.upgrade() {
                    shared.timer_expired(generation);
                }
            })
        });
    }

    fn timer_expired(&self, generation: u64) {
        let mut st = lock(&self.state);
        if st.timer_generation != generation {
            return;
        }
        st.timer = None;
        match &st.fragment {
            Some(fragment) => {
                fragment.pause(true);
            }
            None if self.playing.load(Ordering::Acquire) => {
                tracing::debug!(index = st.index, "timer expired between fragments");
                st.pause_requested = true;
            }
            None => {}
        }
    }

    fn open_fragment(&self, index: usize, settings: &FragmentSettings, offset: Duration) -> Result<Fragment> {
        let entry = self
            .playlist
            .get(index)
            .ok_or_else(|| PlayerError::State(format!("fragment {index} out of range")))?;
        let (source, hint) = open_payload(entry, &self.ctx)?;
        let fragment = Fragment::open(index, source, hint, &self.ctx, settings)?;
        if offset > Duration::ZERO {
            if let Err(e) = fragment.set_position(clamp_offset(&fragment, offset)) {
                tracing::warn!(index, "could not restore offset, starting from the top: {e}");
            }
        }
        Ok(fragment)
    }

    /// Record how fragment `index` ended and move past it.
    ///
    /// Returns `false` when the playlist is exhausted.
    fn advance(&self, index: usize, reason: FragmentEndReason) -> bool {
        self.ctx.observer.fragment_ended(index, reason);
        self.advance_locked(&mut lock(&self.state), index, reason)
    }

    fn advance_locked(&self, st: &mut PlayerState, index: usize, reason: FragmentEndReason) -> bool {
        st.end_reason = Some(reason);
        st.pending_offset = Duration::ZERO;
        st.saved_offset = Duration::ZERO;
        if index + 1 < self.playlist.len() {
            st.index = index + 1;
            true
        } else {
            st.index = index;
            false
        }
    }

    fn worker_loop(self: Arc<Self>) {
        let count = self.playlist.len();
        while self.playing.load(Ordering::Acquire) {
            let (index, offset, settings) = {
                let st = lock(&self.state);
                (st.index, st.pending_offset, self.settings(&st))
            };

            let fragment = match self.open_fragment(index, &settings, offset) {
                Ok(fragment) => Arc::new(fragment),
                Err(e) => {
                    if !self.playing.load(Ordering::Acquire) {
                        break;
                    }
                    tracing::warn!(index, "skipping fragment: {e}");
                    if self.advance(index, FragmentEndReason::Error) {
                        continue;
                    }
                    break;
                }
            };

            {
                let mut st = lock(&self.state);
                if !self.playing.load(Ordering::Acquire) {
                    tracing::debug!(index, "stopped while opening, fragment abandoned");
                    break;
                }
                // Seeks and pauses that arrived while the fragment was opening.
                if st.pending_offset != offset {
                    let target = clamp_offset(&fragment, st.pending_offset);
                    if let Err(e) = fragment.set_position(target) {
                        tracing::warn!(index, "could not apply seek made while opening: {e}");
                    }
                }
                if std::mem::take(&mut st.pause_requested) {
                    fragment.pause(true);
                }
                st.fragment = Some(fragment.clone());
                st.pending_offset = Duration::ZERO;
            }
            tracing::info!(index, count, "fragment started");
            self.ctx
                .observer
                .fragment_started(index, count, fragment.duration());

            let outcome = fragment.run(self.ctx.observer.as_ref());
            if let Err(e) = &outcome {
                if self.playing.load(Ordering::Acquire) {
                    tracing::warn!(index, "skipping fragment: {e}");
                }
            }
            // Unpublish and advance under one lock.
            let ended = {
                let mut st = lock(&self.state);
                st.saved_offset = fragment.position();
                st.fragment = None;
                match &outcome {
                    Ok(RunOutcome::Finished) => {
                        let more = self.advance_locked(&mut st, index, FragmentEndReason::Eof);
                        Some((FragmentEndReason::Eof, more))
                    }
                    Ok(RunOutcome::Stopped) => {
                        st.end_reason = Some(FragmentEndReason::Stopped);
                        Some((FragmentEndReason::Stopped, false))
                    }
                    Err(_) if !self.playing.load(Ordering::Acquire) => None,
                    Err(_) => {
                        let more = self.advance_locked(&mut st, index, FragmentEndReason::Error);
                        Some((FragmentEndReason::Error, more))
                    }
                }
            };
            drop(fragment);

            let Some((reason, more)) = ended else {
                break;
            };
            self.ctx.observer.fragment_ended(index, reason);
            if reason == FragmentEndReason::Stopped {
                break;
            }
            if !more {
                tracing::info!("end of book");
                break;
            }
        }

        if self.playing.swap(false, Ordering::AcqRel) {
            let mut st = lock(&self.state);
            st.timer = None;
            st.pause_requested = false;
        }
    }
}

fn paused(st: &PlayerState) -> bool {
    match &st.fragment {
        Some(fragment) => fragment.is_paused(),
        None => st.pause_requested,
    }
}

/// Keep `offset` inside the fragment when its duration is known.
fn clamp_offset(fragment: &Fragment, offset: Duration) -> Duration {
    let duration = fragment.duration();
    if duration > Duration::ZERO {
        offset.min(duration)
    } else {
        offset
    }
}

fn join_worker(handle: JoinHandle<()>) {
    if handle.join().is_err() {
        tracing::error!("player worker panicked");
    }
}
