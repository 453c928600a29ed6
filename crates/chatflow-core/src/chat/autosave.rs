//! Throttled, coalescing background persistence of session snapshots.
//!
//! Producers call [`AutosaveHandle::request`] after every mutation. Only the
//! newest snapshot is kept; the background loop writes it immediately when
//! idle, otherwise once the current cooldown window has elapsed. This gives
//! at most one write per cooldown and always persists the last state before
//! a quiet period.
//!
//! The loop only ever sees owned snapshots handed over by the producer.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chatflow_types::session::SessionSnapshot;
use tokio::sync::{Notify, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::repository::SessionPersistence;

#[derive(Debug, Default)]
struct PendingState {
    pending: Option<SessionSnapshot>,
    cooldown_until: Option<Instant>,
    bypass_cooldown: bool,
    writing: bool,
    /// Bumped by `reset` so an in-flight write does not restore a cooldown.
    epoch: u64,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<PendingState>,
    kick: Notify,
    idle: watch::Sender<bool>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PendingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Producer side of the autosave loop. Cheap to clone.
#[derive(Debug, Clone)]
pub struct AutosaveHandle {
    shared: Arc<Shared>,
    shutdown: CancellationToken,
}

enum Step {
    Idle,
    Wait(Instant),
    Write(SessionSnapshot, u64),
}

/// Spawns the autosave loop for a persistence backend.
pub struct AutosaveCoordinator;

impl AutosaveCoordinator {
    /// Start the background loop on the current tokio runtime.
    pub fn spawn<P: SessionPersistence>(persistence: Arc<P>, cooldown: Duration) -> AutosaveHandle {
        let (idle, _) = watch::channel(true);
        let shared = Arc::new(Shared {
            state: Mutex::new(PendingState::default()),
            kick: Notify::new(),
            idle,
        });
        let shutdown = CancellationToken::new();

        tokio::spawn(run_loop(
            Arc::clone(&shared),
            persistence,
            cooldown,
            shutdown.clone(),
        ));

        AutosaveHandle { shared, shutdown }
    }
}

impl AutosaveHandle {
    /// Replace any pending snapshot with `snapshot` and wake the loop.
    pub fn request(&self, snapshot: SessionSnapshot) {
        {
            let mut state = self.shared.lock();
            state.pending = Some(snapshot);
            self.shared.idle.send_replace(false);
        }
        self.shared.kick.notify_one();
    }

    /// Write now, ignoring the cooldown, and wait until nothing is pending.
    ///
    /// With `None` only an already pending snapshot is written.
    pub async fn flush(&self, snapshot: Option<SessionSnapshot>) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let mut idle = {
            let mut state = self.shared.lock();
            if let Some(snapshot) = snapshot {
                state.pending = Some(snapshot);
            }
            if state.pending.is_some() {
                state.bypass_cooldown = true;
                self.shared.idle.send_replace(false);
            }
            self.shared.idle.subscribe()
        };
        self.shared.kick.notify_one();

        tokio::select! {
            _ = idle.wait_for(|idle| *idle) => {}
            _ = self.shutdown.cancelled() => {}
        }
    }

    /// Drop any pending snapshot and clear the cooldown.
    pub fn reset(&self) {
        let mut state = self.shared.lock();
        state.pending = None;
        state.cooldown_until = None;
        state.bypass_cooldown = false;
        state.epoch += 1;
        if !state.writing {
            self.shared.idle.send_replace(true);
        }
    }

    /// Whether a snapshot is waiting to be written.
    pub fn has_pending(&self) -> bool {
        self.shared.lock().pending.is_some()
    }

    /// Stop the background loop. Pending snapshots are discarded.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

async fn run_loop<P: SessionPersistence>(
    shared: Arc<Shared>,
    persistence: Arc<P>,
    cooldown: Duration,
    shutdown: CancellationToken,
) {
    tracing::debug!(cooldown_ms = cooldown.as_millis() as u64, "Autosave loop started");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = shared.kick.notified() => {}
        }

        loop {
            let step = {
                let mut state = shared.lock();
                let now = Instant::now();
                let cooling = state
                    .cooldown_until
                    .filter(|until| now < *until && !state.bypass_cooldown);
                match (state.pending.is_some(), cooling) {
                    (false, _) => {
                        state.bypass_cooldown = false;
                        shared.idle.send_replace(true);
                        Step::Idle
                    }
                    (true, Some(until)) => Step::Wait(until),
                    (true, None) => match state.pending.take() {
                        Some(snapshot) => {
                            state.bypass_cooldown = false;
                            state.writing = true;
                            Step::Write(snapshot, state.epoch)
                        }
                        None => Step::Idle,
                    },
                }
            };

            match step {
                Step::Idle => break,
                Step::Wait(until) => {
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = tokio::time::sleep_until(until) => {}
                        _ = shared.kick.notified() => {}
                    }
                }
                Step::Write(snapshot, epoch) => {
                    match persistence.save(&snapshot).await {
                        Ok(()) => tracing::debug!(
                            chat_id = %snapshot.chat_id,
                            messages = snapshot.messages.len(),
                            "Session saved"
                        ),
                        Err(e) => tracing::warn!(
                            chat_id = %snapshot.chat_id,
                            error = %e,
                            "Autosave failed"
                        ),
                    }
                    let mut state = shared.lock();
                    state.writing = false;
                    if state.epoch == epoch {
                        state.cooldown_until = Some(Instant::now() + cooldown);
                    }
                }
            }
        }
    }

    tracing::debug!("Autosave loop stopped");
}
