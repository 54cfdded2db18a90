use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Local;
use rumqttc::{
    Client, ConnectReturnCode, Connection, Event, MqttOptions, Outgoing, Packet, QoS,
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::config::ConnectionConfig;
use super::message_manager::InboundMessage;
use crate::error::SessionError;

const REQUEST_QUEUE_CAPACITY: usize = 32;
const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const MAX_ERROR_MESSAGES: usize = 16;

/// Publish/subscribe primitives the device session is built on
///
/// `start` hands the transport the sink that every inbound message must be
/// posted to, in delivery order, from a single receive context.
pub trait Transport: Send + Sync {
    fn start(&self, sink: mpsc::UnboundedSender<InboundMessage>) -> Result<(), SessionError>;
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), SessionError>;
    fn subscribe(&self, filter: &str) -> Result<(), SessionError>;
    fn is_connected(&self) -> bool;
    fn disconnect(&self);
}

#[derive(Clone, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Failed,
    Reconnecting,
}

#[derive(Clone, Debug, Default)]
pub struct MQTTStatus {
    pub connection_state: ConnectionState,
    pub error_messages: Vec<String>,
    pub messages_received: usize,
    pub messages_sent: usize,
    pub last_activity: Option<chrono::DateTime<chrono::Local>>,
}

impl MQTTStatus {
    fn record_error(&mut self, message: String) {
        if self.error_messages.len() == MAX_ERROR_MESSAGES {
            self.error_messages.remove(0);
        }
        self.error_messages.push(message);
    }
}

// State shared between the handler and its receive thread
#[derive(Default)]
struct Shared {
    status: Mutex<MQTTStatus>,
    subscriptions: Mutex<Vec<String>>,
    shutdown: AtomicBool,
}

impl Shared {
    fn status(&self) -> MutexGuard<'_, MQTTStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn subscriptions(&self) -> MutexGuard<'_, Vec<String>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ConnectionState) {
        self.status().connection_state = state;
    }
}

/// MQTT transport backed by `rumqttc`'s synchronous client
///
/// The network event loop runs on one dedicated thread which forwards every
/// inbound publish to the session's sink. Reconnection after the initial
/// connect is left to `rumqttc`; tracked subscriptions are re-issued on every
/// CONNACK.
pub struct MqttHandler {
    client: Client,
    connection: Mutex<Option<Connection>>,
    connect_timeout: Duration,
    shared: Arc<Shared>,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl MqttHandler {
    pub fn new(config: &ConnectionConfig) -> Self {
        let mut mqtt_options = MqttOptions::new(&config.client_id, &config.host, config.port);
        mqtt_options
            .set_credentials(config.serial_number.clone(), config.password.clone())
            .set_keep_alive(config.keep_alive)
            .set_clean_session(true);

        let (client, connection) = Client::new(mqtt_options, REQUEST_QUEUE_CAPACITY);

        MqttHandler {
            client,
            connection: Mutex::new(Some(connection)),
            connect_timeout: config.connect_timeout,
            shared: Arc::new(Shared::default()),
            receiver: Mutex::new(None),
        }
    }

    pub fn status(&self) -> MQTTStatus {
        self.shared.status().clone()
    }
}

impl Transport for MqttHandler {
    fn start(&self, sink: mpsc::UnboundedSender<InboundMessage>) -> Result<(), SessionError> {
        let connection = self
            .connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| SessionError::Connection("Transport already started".to_string()))?;

        self.shared.set_state(ConnectionState::Connecting);
        let (ready_tx, ready_rx) = std_mpsc::sync_channel(1);
        let client = self.client.clone();
        let shared = self.shared.clone();

        info!("Spawning MQTT receive thread");
        let handle = thread::Builder::new()
            .name("blowcontrol-mqtt".to_string())
            .spawn(move || receive_loop(connection, client, shared, sink, ready_tx))
            .map_err(|e| SessionError::Connection(format!("Failed to spawn receive thread: {}", e)))?;

        match ready_rx.recv_timeout(self.connect_timeout) {
            Ok(Ok(())) => {
                *self.receiver.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
                info!("MQTT session established");
                Ok(())
            }
            Ok(Err(reason)) => {
                self.shared.set_state(ConnectionState::Failed);
                self.shared.shutdown.store(true, Ordering::Release);
                let _ = handle.join();
                error!("Failed to connect to MQTT broker: {}", reason);
                Err(SessionError::Connection(reason))
            }
            Err(_) => {
                // The thread notices the flag once its pending connect attempt fails.
                self.shared.set_state(ConnectionState::Failed);
                self.shared.shutdown.store(true, Ordering::Release);
                let _ = self.client.try_disconnect();
                error!(
                    "No CONNACK from broker within {:?}, giving up",
                    self.connect_timeout
                );
                Err(SessionError::Connection(format!(
                    "Timed out after {:?} waiting for the broker",
                    self.connect_timeout
                )))
            }
        }
    }

    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), SessionError> {
        if !self.is_connected() {
            return Err(SessionError::Publish("Not connected to broker".to_string()));
        }

        debug!("Publishing {} bytes to {}", payload.len(), topic);
        self.client
            .try_publish(topic, QoS::AtMostOnce, false, payload)
            .map_err(|e| SessionError::Publish(e.to_string()))?;

        let mut status = self.shared.status();
        status.messages_sent += 1;
        status.last_activity = Some(Local::now());
        Ok(())
    }

    fn subscribe(&self, filter: &str) -> Result<(), SessionError> {
        {
            let mut subscriptions = self.shared.subscriptions();
            if subscriptions.iter().any(|s| s == filter) {
                debug!("Already subscribed to {}", filter);
                return Ok(());
            }
            subscriptions.push(filter.to_string());
        }

        if self.is_connected() {
            info!("Subscribing to {}", filter);
            self.client
                .try_subscribe(filter, QoS::AtMostOnce)
                .map_err(|e| SessionError::Connection(format!("Subscribe failed: {}", e)))?;
        } else {
            debug!("Subscription to {} deferred until connected", filter);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.shared.status().connection_state == ConnectionState::Connected
    }

    fn disconnect(&self) {
        let handle = self
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.shared.shutdown.store(true, Ordering::Release);

        let Some(handle) = handle else {
            return;
        };

        info!("Disconnecting from MQTT broker");
        if let Err(e) = self.client.try_disconnect() {
            warn!("Failed to queue disconnect: {}", e);
        }
        if handle.join().is_err() {
            error!("MQTT receive thread panicked");
        }
        self.shared.set_state(ConnectionState::Disconnected);
        info!("MQTT receive thread stopped");
    }
}

impl Drop for MqttHandler {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn receive_loop(
    mut connection: Connection,
    client: Client,
    shared: Arc<Shared>,
    sink: mpsc::UnboundedSender<InboundMessage>,
    ready: std_mpsc::SyncSender<Result<(), String>>,
) {
    let mut ready = Some(ready);

    for notification in connection.iter() {
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }

        match notification {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code != ConnectReturnCode::Success {
                    let reason = format!("Broker refused connection: {:?}", ack.code);
                    shared.set_state(ConnectionState::Failed);
                    shared.status().record_error(reason.clone());
                    if let Some(tx) = ready.take() {
                        let _ = tx.send(Err(reason));
                    }
                    break;
                }

                shared.set_state(ConnectionState::Connected);
                for filter in shared.subscriptions().iter() {
                    debug!("(Re)subscribing to {}", filter);
                    if let Err(e) = client.try_subscribe(filter.as_str(), QoS::AtMostOnce) {
                        warn!("Failed to subscribe to {}: {}", filter, e);
                    }
                }
                if let Some(tx) = ready.take() {
                    let _ = tx.send(Ok(()));
                } else {
                    info!("Reconnected to MQTT broker");
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                {
                    let mut status = shared.status();
                    status.messages_received += 1;
                    status.last_activity = Some(Local::now());
                }
                let message = InboundMessage::from_topic(publish.topic, publish.payload.to_vec());
                if sink.send(message).is_err() {
                    debug!("Message sink closed, stopping receive loop");
                    break;
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("Disconnect sent to broker");
                break;
            }
            Ok(event) => {
                debug!("MQTT event: {:?}", event);
            }
            Err(e) => {
                let reason = e.to_string();
                shared.status().record_error(reason.clone());
                if let Some(tx) = ready.take() {
                    shared.set_state(ConnectionState::Failed);
                    let _ = tx.send(Err(reason));
                    break;
                }
                warn!("MQTT connection error, reconnecting: {}", reason);
                shared.set_state(ConnectionState::Reconnecting);
                thread::sleep(RECONNECT_DELAY);
            }
        }
    }

    shared.set_state(ConnectionState::Disconnected);
    debug!("MQTT receive loop finished");
}
