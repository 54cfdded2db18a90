use super::listener::{BackgroundListener, Idle, ListenerSettings};
use super::pending::{CancelOnDrop, Delivery, Predicate, RequestSlot, Ticket};
use super::router::MessageRouter;
use crate::error::SessionError;
use crate::mqtt::config::{ConnectionConfig, TopicSet};
use crate::mqtt::message_manager::{
    request_state_payload, state_set_payload, CommandFields, DeviceMessage, MessageKind, Readings,
};
use crate::mqtt::mqtt_handler::{MqttHandler, Transport};
use crate::state::{DeviceSnapshot, StateModel};
use chrono::Utc;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Answer to a combined state request
///
/// `state` comes from the `CURRENT-STATE` reply, `environmental` from the
/// sensor report. Either may be missing when the deadline passed first, in
/// which case `partial` is set.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateReport {
    pub state: Option<Readings>,
    pub environmental: Option<Readings>,
    pub partial: bool,
}

impl StateReport {
    fn from_delivery(delivery: Delivery) -> Self {
        let state = match delivery.first(MessageKind::CurrentState) {
            Some(DeviceMessage::CurrentState { product_state, .. }) => Some(product_state.clone()),
            _ => None,
        };
        let environmental = match delivery.first(MessageKind::Environmental) {
            Some(DeviceMessage::Environmental { data, .. }) => Some(data.clone()),
            _ => None,
        };

        StateReport {
            state,
            environmental,
            partial: !delivery.complete,
        }
    }
}

struct SessionInner {
    config: ConnectionConfig,
    topics: TopicSet,
    transport: Arc<dyn Transport>,
    state: StateModel,
    requests: Arc<RequestSlot>,
    router: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl SessionInner {
    /// Marks the session closed and fails the pending request
    ///
    /// Returns the blocking part of the teardown, or `None` when another
    /// caller already closed the session.
    fn begin_shutdown(&self) -> Option<Closing> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return None;
        }

        info!("Disconnecting device session for {}", self.config.serial_number);
        self.requests.abort();

        let router = self
            .router
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        Some(Closing {
            transport: self.transport.clone(),
            router,
        })
    }
}

// Joins the transport and router threads
struct Closing {
    transport: Arc<dyn Transport>,
    router: Option<JoinHandle<()>>,
}

impl Closing {
    fn finish(self) {
        self.transport.disconnect();
        if let Some(handle) = self.router {
            if handle.join().is_err() {
                error!("Message router thread panicked");
            }
        }
        debug!("Device session closed");
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        let Some(closing) = self.begin_shutdown() else {
            return;
        };

        // Thread joins must not run on a runtime worker.
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                debug!("Finishing session teardown on the blocking pool");
                runtime.spawn_blocking(move || closing.finish());
            }
            Err(_) => closing.finish(),
        }
    }
}

/// Connected session with one appliance
///
/// Handles are cheap to clone and share one transport, one state model and
/// one request slot. The connection is closed by [`DeviceSession::disconnect`]
/// or when the last handle is dropped. Dropping the last handle inside a tokio
/// runtime hands the thread joins to the blocking pool and returns before
/// they finish; call `disconnect` (via `spawn_blocking` from async code) to
/// know the connection is gone.
#[derive(Clone)]
pub struct DeviceSession {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSession")
            .field("serial_number", &self.inner.config.serial_number)
            .field("topics", &self.inner.topics)
            .field("closed", &self.inner.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl DeviceSession {
    /// Connects to the broker described by `config`
    ///
    /// Blocks until the broker acknowledged the connection or the configured
    /// connect timeout elapsed.
    pub fn connect(config: ConnectionConfig) -> Result<Self, SessionError> {
        config.validate()?;
        info!(
            "Connecting to {}:{} as {}",
            config.host, config.port, config.client_id
        );
        let transport = Arc::new(MqttHandler::new(&config));
        Self::with_transport(config, transport)
    }

    /// Builds a session on top of an arbitrary transport
    pub fn with_transport(
        config: ConnectionConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, SessionError> {
        config.validate()?;
        let topics = config.topics();
        let state = StateModel::new();
        let requests = Arc::new(RequestSlot::new());

        let (sink, receiver) = mpsc::unbounded_channel();
        let router = MessageRouter::new(state.clone(), requests.clone())
            .spawn(receiver)
            .map_err(|e| SessionError::Connection(format!("Failed to spawn router: {}", e)))?;

        // On failure the router exits by itself once the transport drops the sink.
        transport.start(sink)?;

        let session = DeviceSession {
            inner: Arc::new(SessionInner {
                config,
                topics,
                transport,
                state,
                requests,
                router: Mutex::new(Some(router)),
                closed: AtomicBool::new(false),
            }),
        };

        if let Err(e) = session.subscribe_status() {
            error!("Failed to subscribe to status topic: {}", e);
            session.disconnect();
            return Err(e);
        }

        info!("Device session ready on {}", session.inner.topics.command);
        Ok(session)
    }

    /// Subscribes to the status filter; repeated calls are no-ops
    pub fn subscribe_status(&self) -> Result<(), SessionError> {
        self.inner.transport.subscribe(&self.inner.topics.status)
    }

    /// Publishes a `STATE-SET` command without waiting for the appliance
    pub fn publish_command(&self, fields: &CommandFields) -> Result<(), SessionError> {
        self.ensure_open()?;
        debug!("Publishing STATE-SET with {:?}", fields);
        let payload = state_set_payload(fields, Utc::now())?;
        self.inner.transport.publish(&self.inner.topics.command, payload)
    }

    /// Asks the appliance to report its full state without waiting for it
    pub fn request_current_state(&self) -> Result<(), SessionError> {
        self.ensure_open()?;
        debug!("Requesting current state");
        let payload = request_state_payload(Utc::now())?;
        self.inner.transport.publish(&self.inner.topics.command, payload)
    }

    /// Publishes a command and blocks until messages matching `predicate` arrive
    pub fn publish_and_wait(
        &self,
        fields: &CommandFields,
        predicate: Predicate,
        timeout: Duration,
    ) -> Result<Delivery, SessionError> {
        let ticket = self.inner.requests.install(predicate, timeout)?;
        if let Err(e) = self.publish_command(fields) {
            self.inner.requests.cancel(ticket.id());
            return Err(e);
        }
        self.inner.requests.wait(&ticket)
    }

    /// Fetches full state and environmental data, blocking the calling thread
    ///
    /// Fails with [`SessionError::Busy`] while another request is pending and
    /// with [`SessionError::Timeout`] when nothing arrived before `timeout`.
    pub fn request_state(&self, timeout: Duration) -> Result<StateReport, SessionError> {
        let ticket = self.begin_state_request(timeout)?;
        let delivery = self.inner.requests.wait(&ticket)?;
        Ok(StateReport::from_delivery(delivery))
    }

    /// Same as [`DeviceSession::request_state`] without blocking the caller
    ///
    /// The wait runs on tokio's blocking pool. Dropping the returned future
    /// tears the pending registration down.
    pub async fn request_state_async(&self, timeout: Duration) -> Result<StateReport, SessionError> {
        let ticket = self.begin_state_request(timeout)?;
        let requests = self.inner.requests.clone();
        let guard = CancelOnDrop::new(requests.clone(), ticket.id());

        let result = tokio::task::spawn_blocking(move || requests.wait(&ticket))
            .await
            .map_err(|e| SessionError::Worker(e.to_string()))?;
        drop(guard);

        Ok(StateReport::from_delivery(result?))
    }

    // The slot is installed before the request goes out so that a fast reply
    // cannot slip past the waiter.
    fn begin_state_request(&self, timeout: Duration) -> Result<Ticket, SessionError> {
        self.ensure_open()?;
        let predicate = Predicate::all_of([MessageKind::CurrentState, MessageKind::Environmental]);
        let ticket = self.inner.requests.install(predicate, timeout)?;

        if let Err(e) = self.request_current_state() {
            warn!("State request could not be published: {}", e);
            self.inner.requests.cancel(ticket.id());
            return Err(e);
        }
        Ok(ticket)
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.inner.closed.load(Ordering::Acquire) {
            Err(SessionError::Publish("Session is disconnected".to_string()))
        } else {
            Ok(())
        }
    }

    pub fn current_snapshot(&self) -> DeviceSnapshot {
        self.inner.state.snapshot()
    }

    pub fn state(&self) -> &StateModel {
        &self.inner.state
    }

    pub fn topics(&self) -> &TopicSet {
        &self.inner.topics
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    pub fn is_request_pending(&self) -> bool {
        self.inner.requests.is_pending()
    }

    pub fn is_connected(&self) -> bool {
        !self.inner.closed.load(Ordering::Acquire) && self.inner.transport.is_connected()
    }

    /// New background listener bound to this session
    pub fn listener(&self, settings: ListenerSettings) -> BackgroundListener<Idle> {
        BackgroundListener::create(self.clone(), settings)
    }

    /// Closes the transport and fails any pending request
    ///
    /// Blocks until the transport and router threads have exited. Safe to
    /// call more than once and from any handle.
    pub fn disconnect(&self) {
        if let Some(closing) = self.inner.begin_shutdown() {
            closing.finish();
        }
    }
}
