use crate::mqtt::message_manager::{DeviceMessage, Readings};
use chrono::{DateTime, Local};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, trace};

/// Immutable copy of everything known about the appliance
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeviceSnapshot {
    /// Settings from the last `CURRENT-STATE`, with later changes merged in
    pub product_state: Readings,
    /// Readings from the last environmental sensor report
    pub environmental: Readings,
    /// Set once the first `CURRENT-STATE` has been merged
    pub has_full_state: bool,
    /// Device-reported time of the last merged state message
    pub device_time: Option<String>,
    /// Device-reported time of the last environmental report
    pub environmental_time: Option<String>,
    /// Local time of the last merge
    pub last_update: Option<DateTime<Local>>,
}

impl DeviceSnapshot {
    pub fn setting(&self, key: &str) -> Option<&str> {
        self.product_state.get(key).map(String::as_str)
    }

    pub fn reading(&self, key: &str) -> Option<&str> {
        self.environmental.get(key).map(String::as_str)
    }
}

/// Thread-safe aggregate of the appliance's state
///
/// Cloning is cheap and every clone sees the same state. Writers are the
/// router thread; readers get copies through [`StateModel::snapshot`] so they
/// never observe a half-merged message. Every merge bumps a revision counter
/// that async callers can watch.
#[derive(Debug, Clone)]
pub struct StateModel {
    inner: Arc<Mutex<DeviceSnapshot>>,
    revision: Arc<watch::Sender<u64>>,
}

impl Default for StateModel {
    fn default() -> Self {
        Self::new()
    }
}

impl StateModel {
    pub fn new() -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            inner: Arc::new(Mutex::new(DeviceSnapshot::default())),
            revision: Arc::new(revision),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DeviceSnapshot> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Merges one message, returning whether it touched the state
    ///
    /// Full snapshots replace the whole settings map, changes overwrite only
    /// the keys they name, environmental reports replace the sensor map.
    /// Location, fault and unknown messages are not merged.
    pub fn apply(&self, message: &DeviceMessage) -> bool {
        {
            let mut state = self.lock();
            match message {
                DeviceMessage::CurrentState {
                    time,
                    product_state,
                } => {
                    debug!("Replacing device state ({} settings)", product_state.len());
                    state.product_state = product_state.clone();
                    state.has_full_state = true;
                    state.device_time = time.clone();
                }
                DeviceMessage::StateChange { time, changes } => {
                    debug!("Applying {} setting changes", changes.len());
                    for (key, change) in changes {
                        state
                            .product_state
                            .insert(key.clone(), change.current.clone());
                    }
                    if time.is_some() {
                        state.device_time = time.clone();
                    }
                }
                DeviceMessage::Environmental { time, data } => {
                    debug!("Replacing environmental data ({} readings)", data.len());
                    state.environmental = data.clone();
                    state.environmental_time = time.clone();
                }
                other => {
                    trace!("Not merging {:?} message", other.kind());
                    return false;
                }
            }
            state.last_update = Some(Local::now());
        }

        self.revision.send_modify(|revision| *revision += 1);
        true
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        self.lock().clone()
    }

    /// Number of merges so far
    pub fn revision(&self) -> u64 {
        *self.revision.borrow()
    }

    /// Receiver notified after every merge
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    /// Waits until a full state has been merged, or `timeout` elapses
    pub async fn wait_for_full_state(&self, timeout: Duration) -> bool {
        let mut updates = self.subscribe();
        let wait = async {
            while !self.snapshot().has_full_state {
                if updates.changed().await.is_err() {
                    break;
                }
            }
        };

        let _ = tokio::time::timeout(timeout, wait).await;
        self.snapshot().has_full_state
    }
}
