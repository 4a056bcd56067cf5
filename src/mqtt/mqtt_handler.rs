//! Public handle for the session actor.
//!
//! [`MqttHandle::spawn`] starts the [`Session`] task and hands back a
//! cloneable handle. Every operation is a message with a oneshot reply, so
//! callers await the outcome without ever touching session state directly.
//! State is observed through a `watch` snapshot, device notifications through
//! a `broadcast` channel.

use super::config::BrokerConfig;
use super::link::{Connector, MqttConnector};
use super::session::{
    Ack, DeliveryHook, Session, SessionAction, SessionError, SessionSnapshot,
};
use super::topics::Target;
use crate::config::AppConfig;
use crate::fleet::dispatcher::{Command, CommandKind};
use crate::fleet::reconciler::Notification;
use crate::persistence::SessionStore;
use rumqttc::QoS;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const ACTION_QUEUE: usize = 32;

/// Collects what the session task needs before it starts.
pub struct SessionBuilder {
    config: AppConfig,
    connector: Box<dyn Connector>,
    store: SessionStore,
    delivery_hook: Option<DeliveryHook>,
}

impl SessionBuilder {
    pub fn new(config: AppConfig) -> Self {
        let store = config.session_store();
        Self {
            config,
            connector: Box::new(MqttConnector),
            store,
            delivery_hook: None,
        }
    }

    pub fn with_connector(mut self, connector: impl Connector) -> Self {
        self.connector = Box::new(connector);
        self
    }

    pub fn with_store(mut self, store: SessionStore) -> Self {
        self.store = store;
        self
    }

    /// Called with every outbound message once the broker confirmed it.
    pub fn with_delivery_hook(mut self, hook: DeliveryHook) -> Self {
        self.delivery_hook = Some(hook);
        self
    }

    pub fn spawn(self) -> (MqttHandle, JoinHandle<()>) {
        MqttHandle::spawn(self)
    }
}

#[derive(Clone)]
pub struct MqttHandle {
    action_tx: mpsc::Sender<SessionAction>,
    snapshot_rx: watch::Receiver<SessionSnapshot>,
    notify_tx: broadcast::Sender<Notification>,
}

impl MqttHandle {
    pub fn spawn(builder: SessionBuilder) -> (Self, JoinHandle<()>) {
        info!("Spawning MQTT session for namespace '{}'", builder.config.namespace);
        let (action_tx, action_rx) = mpsc::channel(ACTION_QUEUE);
        let (session, snapshot_rx, notify_tx) = Session::new(
            builder.config,
            builder.connector,
            builder.store,
            builder.delivery_hook,
        );
        let task = tokio::spawn(session.run(action_rx));

        (
            Self {
                action_tx,
                snapshot_rx,
                notify_tx,
            },
            task,
        )
    }

    async fn request<T>(
        &self,
        action: impl FnOnce(oneshot::Sender<T>) -> SessionAction,
    ) -> Result<T, SessionError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.action_tx
            .send(action(response_tx))
            .await
            .map_err(|_| SessionError::ActorGone)?;
        response_rx.await.map_err(|_| SessionError::ActorGone)
    }

    async fn request_ack(&self, action: impl FnOnce(oneshot::Sender<Ack>) -> SessionAction) -> Ack {
        self.request(action).await.unwrap_or_else(|e| {
            warn!("Request not answered: {}", e);
            Ack::Superseded
        })
    }

    /// Starts connecting. Returns once the transport is created, not when the
    /// broker accepted; watch the snapshot for `Connected`.
    pub async fn connect(&self, config: BrokerConfig) -> Result<(), SessionError> {
        self.request(|response_tx| SessionAction::Connect { config, response_tx })
            .await?
    }

    /// Reconnects with the persisted config and subscriptions, if any.
    pub async fn resume(&self) -> Result<bool, SessionError> {
        self.request(|response_tx| SessionAction::Resume { response_tx }).await
    }

    /// Closes the connection and forgets the persisted session.
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        self.request(|response_tx| SessionAction::Disconnect { response_tx })
            .await
    }

    pub async fn subscribe(&self, filter: impl Into<String>) -> Ack {
        let filter = filter.into();
        self.request_ack(|response_tx| SessionAction::Subscribe { filter, response_tx })
            .await
    }

    pub async fn unsubscribe(&self, filter: impl Into<String>) -> Ack {
        let filter = filter.into();
        self.request_ack(|response_tx| SessionAction::Unsubscribe { filter, response_tx })
            .await
    }

    pub async fn publish(&self, topic: impl Into<String>, payload: impl Into<String>, qos: QoS) -> Ack {
        let topic = topic.into();
        let payload = payload.into();
        self.request_ack(|response_tx| SessionAction::Publish {
            topic,
            payload,
            qos,
            response_tx,
        })
        .await
    }

    pub async fn send(&self, command: Command) -> Ack {
        self.request_ack(|response_tx| SessionAction::SendCommand {
            command,
            response_tx,
        })
        .await
    }

    /// Sends a command by name, e.g. `send_command(Target::Device(3), "reboot", json!({}))`.
    pub async fn send_command(&self, target: Target, kind: &str, data: Value) -> Ack {
        match kind.parse::<CommandKind>() {
            Ok(kind) => self.send(Command::new(target, kind, data)).await,
            Err(e) => {
                warn!("Refusing command for {}: {}", target, e);
                Ack::Rejected(e.to_string())
            }
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot_rx.clone()
    }

    pub fn notifications(&self) -> broadcast::Receiver<Notification> {
        debug!("New notification subscriber");
        self.notify_tx.subscribe()
    }

    pub fn status_text(&self) -> String {
        self.snapshot_rx.borrow().status.status_text.clone()
    }
}
