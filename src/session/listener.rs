use super::device_session::DeviceSession;
use crate::error::SessionError;
use crate::state::DeviceSnapshot;
use statum::{machine, state};
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

// Listener settings
#[derive(Clone, Debug, Default)]
pub struct ListenerSettings {
    /// Re-request the full state on this interval while running
    pub refresh_interval: Option<Duration>,
}

#[state]
#[derive(Debug, Clone)]
pub enum ListenerState {
    Idle,
    Running,
    Stopped,
}

/// Keeps the session's state model current without a caller waiting on it
///
/// `Idle -> Running -> Stopped`. A stopped listener cannot be restarted;
/// ask the session for a new one instead.
#[machine]
#[derive(Debug)]
pub struct BackgroundListener<S: ListenerState> {
    session: DeviceSession,
    settings: ListenerSettings,

    // Stop signal for the supervising task
    cancel: CancellationToken,

    // Cancels the task if the listener is dropped while running
    guard: Option<DropGuard>,

    task: Option<JoinHandle<()>>,
}

impl<S: ListenerState> BackgroundListener<S> {
    pub fn settings(&self) -> &ListenerSettings {
        &self.settings
    }

    pub fn session(&self) -> &DeviceSession {
        &self.session
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        self.session.current_snapshot()
    }
}

impl BackgroundListener<Idle> {
    pub fn create(session: DeviceSession, settings: ListenerSettings) -> Self {
        debug!("Creating background listener with settings: {:?}", settings);
        Self::new(session, settings, CancellationToken::new(), None, None)
    }

    /// Subscribes, asks for an initial full state and spawns the supervising task
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(mut self) -> Result<BackgroundListener<Running>, SessionError> {
        self.session.subscribe_status()?;
        self.session.request_current_state()?;

        let task = tokio::spawn(supervise(
            self.session.clone(),
            self.settings.refresh_interval,
            self.cancel.clone(),
        ));
        self.guard = Some(self.cancel.clone().drop_guard());
        self.task = Some(task);

        info!(
            "Background listener running on {}",
            self.session.topics().status
        );
        Ok(self.transition())
    }

    /// Runs the listener for `duration`, then stops it
    pub async fn run_for(
        self,
        duration: Duration,
    ) -> Result<BackgroundListener<Stopped>, SessionError> {
        self.run_until(tokio::time::sleep(duration)).await
    }

    /// Runs the listener until `signal` resolves, then stops it
    pub async fn run_until<F>(self, signal: F) -> Result<BackgroundListener<Stopped>, SessionError>
    where
        F: Future<Output = ()>,
    {
        let running = self.start()?;
        signal.await;
        Ok(running.stop().await)
    }
}

impl BackgroundListener<Running> {
    /// Signals the task to end and waits until it has
    pub async fn stop(mut self) -> BackgroundListener<Stopped> {
        self.cancel.cancel();
        drop(self.guard.take());

        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Background listener task ended abnormally: {}", e);
            }
        }

        info!("Background listener stopped");
        self.transition()
    }

    /// Waits until a full state has been merged, or `timeout` elapses
    pub async fn wait_for_state(&self, timeout: Duration) -> bool {
        self.session.state().wait_for_full_state(timeout).await
    }

    /// Receiver notified with the state revision after every merge
    pub fn updates(&self) -> watch::Receiver<u64> {
        self.session.state().subscribe()
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }
}

// The router keeps the state model current; this task only owns the refresh
// timer and the session handle until it is cancelled.
async fn supervise(
    session: DeviceSession,
    refresh_interval: Option<Duration>,
    cancel: CancellationToken,
) {
    let mut refresh = refresh_interval.map(|period| {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        interval
    });

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = next_refresh(&mut refresh) => {
                debug!("Refreshing device state");
                if let Err(e) = session.request_current_state() {
                    warn!("Periodic state refresh failed: {}", e);
                }
            }
        }
    }
    debug!(
        "Background listener task ending at revision {}",
        session.state().revision()
    );
}

async fn next_refresh(refresh: &mut Option<Interval>) {
    match refresh {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
