use super::pending::RequestSlot;
use crate::mqtt::message_manager::{DeviceMessage, InboundMessage};
use crate::state::StateModel;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Demultiplexes decoded status messages into the state model and the request slot
///
/// Runs on a single thread fed by the transport's channel, so messages are
/// handled one at a time in delivery order.
#[derive(Debug, Clone)]
pub struct MessageRouter {
    state: StateModel,
    requests: Arc<RequestSlot>,
}

impl MessageRouter {
    pub fn new(state: StateModel, requests: Arc<RequestSlot>) -> Self {
        Self { state, requests }
    }

    /// Handles one inbound message, returning the decoded form when it was valid
    ///
    /// Malformed payloads are logged and dropped here; nothing propagates back
    /// to the transport.
    pub fn route(&self, inbound: &InboundMessage) -> Option<DeviceMessage> {
        let message = match DeviceMessage::decode(&inbound.payload) {
            Ok(message) => message,
            Err(e) => {
                warn!("Discarding malformed message on {}: {}", inbound.topic, e);
                return None;
            }
        };

        trace!("Routing {:?} message {}", message.kind(), inbound);
        self.state.apply(&message);
        if self.requests.offer(&message) {
            debug!("Message {:?} delivered to pending request", message.kind());
        }
        Some(message)
    }

    /// Consumes the channel until every sender is gone
    pub fn run(self, mut receiver: mpsc::UnboundedReceiver<InboundMessage>) {
        let mut routed = 0usize;
        while let Some(inbound) = receiver.blocking_recv() {
            if self.route(&inbound).is_some() {
                routed += 1;
            }
        }
        info!("Message router stopped after {} messages", routed);
    }

    pub fn spawn(
        self,
        receiver: mpsc::UnboundedReceiver<InboundMessage>,
    ) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("blowcontrol-router".to_string())
            .spawn(move || self.run(receiver))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::message_manager::MessageKind;
    use crate::session::pending::Predicate;
    use serde_json::json;
    use std::time::Duration;

    const STATUS_TOPIC: &str = "438M/XX1-EU-ABC1234A/status/current";

    fn router() -> (MessageRouter, StateModel, Arc<RequestSlot>) {
        let state = StateModel::new();
        let requests = Arc::new(RequestSlot::new());
        (
            MessageRouter::new(state.clone(), requests.clone()),
            state,
            requests,
        )
    }

    fn inbound(payload: serde_json::Value) -> InboundMessage {
        InboundMessage::from_topic(STATUS_TOPIC, payload.to_string())
    }

    #[test]
    fn test_malformed_payloads_are_discarded() {
        let (router, state, _) = router();
        router.route(&inbound(json!({"msg": "CURRENT-STATE", "product-state": {"fpwr": "ON"}})));
        let before = state.snapshot();

        assert!(router
            .route(&InboundMessage::from_topic(STATUS_TOPIC, "not json"))
            .is_none());
        assert!(router.route(&inbound(json!(["CURRENT-STATE"]))).is_none());
        assert!(router.route(&inbound(json!({"product-state": {}}))).is_none());

        assert_eq!(state.snapshot(), before);
        assert_eq!(state.revision(), 1);
    }

    #[test]
    fn test_late_message_is_merged_but_not_delivered() {
        let (router, state, requests) = router();
        let ticket = requests
            .install(Predicate::kind(MessageKind::CurrentState), Duration::from_millis(10))
            .unwrap();
        assert!(requests.wait(&ticket).is_err());

        router.route(&inbound(json!({"msg": "CURRENT-STATE", "product-state": {"fnsp": "0004"}})));
        assert_eq!(state.snapshot().setting("fnsp"), Some("0004"));
        assert!(!requests.is_pending());
    }

    #[test]
    fn test_location_reaches_matching_request() {
        let (router, state, requests) = router();
        let ticket = requests
            .install(Predicate::kind(MessageKind::Location), Duration::from_secs(1))
            .unwrap();

        router.route(&inbound(json!({"msg": "LOCATION", "apos": "0090"})));
        let delivery = requests.wait(&ticket).unwrap();

        assert!(delivery.complete);
        assert_eq!(state.revision(), 0);
    }

    #[test]
    fn test_run_drains_channel_in_order() {
        let (router, state, _) = router();
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = router.spawn(rx).unwrap();

        tx.send(inbound(json!({"msg": "CURRENT-STATE", "product-state": {"fnsp": "0001"}})))
            .unwrap();
        for speed in 2..=9 {
            let previous = format!("{:04}", speed - 1);
            let current = format!("{:04}", speed);
            tx.send(inbound(json!({
                "msg": "STATE-CHANGE",
                "product-state": {"fnsp": [previous, current]}
            })))
            .unwrap();
        }
        drop(tx);
        handle.join().unwrap();

        assert_eq!(state.snapshot().setting("fnsp"), Some("0009"));
        assert_eq!(state.revision(), 9);
    }
}
