//! Session actor: owns the broker connection, the subscription set, the
//! device registry (through the reconciler) and the message log.
//!
//! All mutation happens inside [`Session::run`], one action or link event at
//! a time, so inbound messages are reconciled strictly in arrival order and
//! the liveness sweep never races with message handling.
//!
//! # Connection states
//!
//! ```text
//! Disconnected ──connect()──► Connecting ──ConnAck──► Connected ◄──┐
//!      ▲                          │                     │          │
//!      │                       failure               link drop   ConnAck
//!      │                          ▼                     ▼          │
//!      └──────disconnect()──── Error ◄──failure── Reconnecting ────┘
//! ```
//!
//! `disconnect()` is accepted in every state and always lands in
//! Disconnected.

use super::codec;
use super::config::BrokerConfig;
use super::link::{
    fresh_client_id, BrokerLink, Connector, LinkEvent, LinkEventKind, LinkOptions, RequestTag,
    TransportError,
};
use super::message_manager::{MessageLog, MqttMessage};
use crate::config::AppConfig;
use crate::fleet::dispatcher::{build_request, Command};
use crate::fleet::reconciler::{Notification, Reconciler};
use crate::fleet::registry::DeviceRecord;
use crate::persistence::SessionStore;
use chrono::{DateTime, Local};
use rumqttc::QoS;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let text = match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Reconnecting => "Reconnecting",
            ConnectionState::Error => "Error",
        };
        write!(f, "{}", text)
    }
}

impl ConnectionState {
    /// A link exists and is (or will be) talking to the broker.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Reconnecting
        )
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SessionStatus {
    pub connection_state: ConnectionState,
    /// Human-readable status line for the UI.
    pub status_text: String,
    pub last_error: Option<String>,
    pub broker: Option<String>,
    pub client_id: Option<String>,
    pub messages_received: usize,
    pub messages_sent: usize,
    pub last_activity: Option<DateTime<Local>>,
}

/// Outcome of a subscribe, unsubscribe, publish or command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ack {
    /// The broker acknowledged the request.
    Confirmed,
    /// Nothing was sent because the session is not Connected.
    NotConnected,
    /// Already subscribed, or a subscribe for the same filter is in flight.
    Duplicate,
    /// The request was refused before reaching the transport.
    Rejected(String),
    /// The transport or broker reported a failure.
    Failed(String),
    /// The connection the request belonged to was torn down first.
    Superseded,
}

impl Ack {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, Ack::Confirmed)
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("a connection is already active ({0})")]
    AlreadyConnected(ConnectionState),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("session task is no longer running")]
    ActorGone,
}

/// Read-only view published after every processed action or event.
#[derive(Clone, Debug, Default)]
pub struct SessionSnapshot {
    pub status: SessionStatus,
    /// Connected and every resubscription acknowledged.
    pub ready: bool,
    pub subscriptions: Vec<String>,
    pub devices: BTreeMap<u32, DeviceRecord>,
    pub settings: BTreeMap<u32, Map<String, Value>>,
    pub options: BTreeMap<u32, Map<String, Value>>,
    /// Bumped whenever a device record, settings or options entry changes.
    pub registry_revision: u64,
    pub messages: Vec<MqttMessage>,
}

/// Observer for confirmed outbound traffic.
pub type DeliveryHook = Arc<dyn Fn(&MqttMessage) + Send + Sync>;

#[derive(Debug)]
pub enum SessionAction {
    Connect {
        config: BrokerConfig,
        response_tx: oneshot::Sender<Result<(), SessionError>>,
    },
    Resume {
        response_tx: oneshot::Sender<bool>,
    },
    Disconnect {
        response_tx: oneshot::Sender<()>,
    },
    Subscribe {
        filter: String,
        response_tx: oneshot::Sender<Ack>,
    },
    Unsubscribe {
        filter: String,
        response_tx: oneshot::Sender<Ack>,
    },
    Publish {
        topic: String,
        payload: String,
        qos: QoS,
        response_tx: oneshot::Sender<Ack>,
    },
    SendCommand {
        command: Command,
        response_tx: oneshot::Sender<Ack>,
    },
}

enum Pending {
    Subscribe {
        filter: String,
        /// Issued by the session itself while (re)establishing the set.
        replay: bool,
        responder: Option<oneshot::Sender<Ack>>,
    },
    Unsubscribe {
        filter: String,
        responder: Option<oneshot::Sender<Ack>>,
    },
    Publish {
        topic: String,
        payload: String,
        responder: Option<oneshot::Sender<Ack>>,
    },
}

impl Pending {
    fn resolve(self, ack: Ack) {
        let responder = match self {
            Pending::Subscribe { responder, .. }
            | Pending::Unsubscribe { responder, .. }
            | Pending::Publish { responder, .. } => responder,
        };
        if let Some(tx) = responder {
            let _ = tx.send(ack);
        }
    }
}

fn respond<T>(tx: oneshot::Sender<T>, value: T) {
    if tx.send(value).is_err() {
        debug!("Requester went away before the response");
    }
}

async fn next_sweep(sweep: &mut Option<Interval>) {
    match sweep {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

pub struct Session {
    config: AppConfig,
    connector: Box<dyn Connector>,
    store: SessionStore,
    status: SessionStatus,
    generation: u64,
    link: Option<Box<dyn BrokerLink>>,
    broker_config: Option<BrokerConfig>,
    /// Confirmed subscriptions; changed only by acknowledgements.
    subscriptions: BTreeSet<String>,
    /// Filters with a subscribe in flight.
    subscribing: HashSet<String>,
    /// Persisted topics to issue once the resumed connection is up.
    replay: BTreeSet<String>,
    pending: HashMap<RequestTag, Pending>,
    next_tag: u64,
    reconciler: Reconciler,
    registry_revision: u64,
    log: MessageLog,
    sweep: Option<Interval>,
    events_tx: mpsc::Sender<LinkEvent>,
    events_rx: mpsc::Receiver<LinkEvent>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    notify_tx: broadcast::Sender<Notification>,
    delivery_hook: Option<DeliveryHook>,
}

impl Session {
    pub fn new(
        config: AppConfig,
        connector: Box<dyn Connector>,
        store: SessionStore,
        delivery_hook: Option<DeliveryHook>,
    ) -> (Self, watch::Receiver<SessionSnapshot>, broadcast::Sender<Notification>) {
        let (events_tx, events_rx) = mpsc::channel(256);
        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::default());
        let (notify_tx, _) = broadcast::channel(64);

        let mut session = Self {
            reconciler: Reconciler::new(config.reconciler_settings()),
            log: MessageLog::with_capacity(config.message_log_capacity),
            config,
            connector,
            store,
            status: SessionStatus::default(),
            generation: 0,
            link: None,
            broker_config: None,
            subscriptions: BTreeSet::new(),
            subscribing: HashSet::new(),
            replay: BTreeSet::new(),
            pending: HashMap::new(),
            next_tag: 0,
            sweep: None,
            registry_revision: 0,
            events_tx,
            events_rx,
            snapshot_tx,
            notify_tx: notify_tx.clone(),
            delivery_hook,
        };
        session.set_state(ConnectionState::Disconnected, "Disconnected".to_string());
        session.publish_snapshot();
        (session, snapshot_rx, notify_tx)
    }

    pub async fn run(mut self, mut actions: mpsc::Receiver<SessionAction>) {
        info!("Session task started");
        loop {
            tokio::select! {
                action = actions.recv() => match action {
                    Some(action) => self.on_action(action).await,
                    None => break,
                },
                Some(event) = self.events_rx.recv() => self.on_link_event(event).await,
                _ = next_sweep(&mut self.sweep) => self.on_sweep(),
            }
            self.publish_snapshot();
        }

        if let Some(link) = self.link.take() {
            link.close();
        }
        info!("Session task stopped");
    }

    fn is_ready(&self) -> bool {
        self.status.connection_state == ConnectionState::Connected
            && !self
                .pending
                .values()
                .any(|pending| matches!(pending, Pending::Subscribe { replay: true, .. }))
    }

    fn publish_snapshot(&self) {
        let registry = self.reconciler.registry();
        self.snapshot_tx.send_replace(SessionSnapshot {
            status: self.status.clone(),
            ready: self.is_ready(),
            subscriptions: self.subscriptions.iter().cloned().collect(),
            devices: registry.devices().clone(),
            settings: registry.settings().clone(),
            options: registry.options().clone(),
            registry_revision: self.registry_revision,
            messages: self.log.to_vec(),
        });
    }

    fn set_state(&mut self, state: ConnectionState, text: String) {
        debug!("Connection state {} -> {}", self.status.connection_state, state);
        self.status.connection_state = state;
        self.status.status_text = text;
    }

    fn system(&mut self, text: impl Into<String>) {
        self.log.push(MqttMessage::system(text));
    }

    fn tag(&mut self) -> RequestTag {
        self.next_tag += 1;
        RequestTag(self.next_tag)
    }

    fn fail_pending(&mut self, ack: Ack) {
        self.subscribing.clear();
        for (_, pending) in self.pending.drain() {
            pending.resolve(ack.clone());
        }
    }

    fn start_sweep(&mut self) {
        if self.sweep.is_some() {
            return;
        }
        let period = self.config.sweep_interval();
        let start = tokio::time::Instant::now()
            .checked_add(period)
            .unwrap_or_else(tokio::time::Instant::now);
        let mut interval = tokio::time::interval_at(start, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.sweep = Some(interval);
        debug!("Liveness sweep every {:?}", period);
    }

    async fn on_action(&mut self, action: SessionAction) {
        match action {
            SessionAction::Connect { config, response_tx } => {
                let result = self.connect(config, Vec::new());
                respond(response_tx, result);
            }
            SessionAction::Resume { response_tx } => {
                let resumed = self.resume().await;
                respond(response_tx, resumed);
            }
            SessionAction::Disconnect { response_tx } => {
                self.disconnect().await;
                respond(response_tx, ());
            }
            SessionAction::Subscribe { filter, response_tx } => {
                if self.status.connection_state != ConnectionState::Connected {
                    respond(response_tx, Ack::NotConnected);
                } else if self.subscriptions.contains(&filter) || self.subscribing.contains(&filter) {
                    debug!("Already subscribed to {}", filter);
                    respond(response_tx, Ack::Duplicate);
                } else {
                    self.issue_subscribe(filter, false, Some(response_tx));
                }
            }
            SessionAction::Unsubscribe { filter, response_tx } => {
                if self.status.connection_state != ConnectionState::Connected {
                    respond(response_tx, Ack::NotConnected);
                } else {
                    self.issue_unsubscribe(filter, response_tx);
                }
            }
            SessionAction::Publish {
                topic,
                payload,
                qos,
                response_tx,
            } => self.issue_publish(topic, payload, qos, Some(response_tx)),
            SessionAction::SendCommand {
                command,
                response_tx,
            } => self.dispatch(command, Some(response_tx)),
        }
    }

    fn connect(&mut self, config: BrokerConfig, replay: Vec<String>) -> Result<(), SessionError> {
        if self.status.connection_state.is_live() {
            warn!("Connect requested while {}", self.status.connection_state);
            return Err(SessionError::AlreadyConnected(self.status.connection_state));
        }

        if let Some(link) = self.link.take() {
            link.close();
        }
        self.generation += 1;
        self.fail_pending(Ack::Superseded);

        let client_id = fresh_client_id();
        let broker = format!("{}:{}", config.host, config.port);
        self.status.broker = Some(broker.clone());
        self.status.client_id = Some(client_id.clone());
        self.replay.extend(replay);

        let options = LinkOptions {
            broker: config.clone(),
            client_id,
            generation: self.generation,
            keep_alive: self.config.keep_alive(),
            reconnect_delay: self.config.reconnect_delay(),
        };

        self.set_state(ConnectionState::Connecting, format!("Connecting to {}", broker));
        self.system(format!("Connecting to {}", broker));
        info!("Connecting to {} (generation {})", broker, self.generation);

        match self.connector.open(options, self.events_tx.clone()) {
            Ok(link) => {
                self.link = Some(link);
                self.broker_config = Some(config);
                Ok(())
            }
            Err(e) => {
                self.fail(e.to_string());
                Err(SessionError::Transport(e))
            }
        }
    }

    async fn resume(&mut self) -> bool {
        if self.status.connection_state.is_live() {
            debug!("Resume ignored, connection already {}", self.status.connection_state);
            return false;
        }

        match self.store.load().await {
            Ok(Some(persisted)) => {
                info!(
                    "Resuming session with {} and {} subscriptions",
                    persisted.config.host,
                    persisted.subscriptions.len()
                );
                self.connect(persisted.config, persisted.subscriptions).is_ok()
            }
            Ok(None) => {
                debug!("No persisted session to resume");
                false
            }
            Err(e) => {
                warn!("Could not load persisted session: {}", e);
                false
            }
        }
    }

    async fn disconnect(&mut self) {
        info!("Disconnecting (state {})", self.status.connection_state);
        self.generation += 1;
        if let Some(link) = self.link.take() {
            link.close();
        }
        self.fail_pending(Ack::Superseded);
        self.subscriptions.clear();
        self.replay.clear();
        self.reconciler.reset_session();
        self.log.clear();
        self.sweep = None;
        self.broker_config = None;
        self.status.client_id = None;
        self.status.broker = None;
        self.status.last_error = None;

        if let Err(e) = self.store.clear().await {
            warn!("Failed to clear persisted session: {}", e);
        }
        self.set_state(ConnectionState::Disconnected, "Disconnected".to_string());
    }

    /// Fatal connection error: no retry here, the transport is closed.
    fn fail(&mut self, reason: String) {
        error!("Connection error: {}", reason);
        if let Some(link) = self.link.take() {
            link.close();
        }
        self.fail_pending(Ack::Failed(reason.clone()));
        self.sweep = None;
        self.status.last_error = Some(reason.clone());
        self.system(format!("Connection error: {}", reason));
        self.set_state(ConnectionState::Error, format!("Error: {}", reason));
    }

    async fn persist_subscriptions(&mut self) {
        let topics: Vec<String> = self.subscriptions.iter().cloned().collect();
        if let Err(e) = self.store.save_subscriptions(&topics).await {
            warn!("Failed to persist subscriptions: {}", e);
        }
    }

    fn issue_subscribe(&mut self, filter: String, replay: bool, responder: Option<oneshot::Sender<Ack>>) {
        let tag = self.tag();
        let Some(link) = self.link.as_mut() else {
            if let Some(tx) = responder {
                respond(tx, Ack::NotConnected);
            }
            return;
        };

        match link.subscribe(tag, &filter) {
            Ok(()) => {
                debug!("Subscribe {} queued as {:?}", filter, tag);
                self.subscribing.insert(filter.clone());
                self.pending.insert(
                    tag,
                    Pending::Subscribe {
                        filter,
                        replay,
                        responder,
                    },
                );
            }
            Err(e) => {
                warn!("Subscribe to {} failed: {}", filter, e);
                self.system(format!("Subscribe to {} failed: {}", filter, e));
                if let Some(tx) = responder {
                    respond(tx, Ack::Failed(e.to_string()));
                }
            }
        }
    }

    fn issue_unsubscribe(&mut self, filter: String, responder: oneshot::Sender<Ack>) {
        let tag = self.tag();
        let Some(link) = self.link.as_mut() else {
            respond(responder, Ack::NotConnected);
            return;
        };

        match link.unsubscribe(tag, &filter) {
            Ok(()) => {
                self.pending.insert(
                    tag,
                    Pending::Unsubscribe {
                        filter,
                        responder: Some(responder),
                    },
                );
            }
            Err(e) => {
                warn!("Unsubscribe from {} failed: {}", filter, e);
                self.system(format!("Unsubscribe from {} failed: {}", filter, e));
                respond(responder, Ack::Failed(e.to_string()));
            }
        }
    }

    fn issue_publish(
        &mut self,
        topic: String,
        payload: String,
        qos: QoS,
        responder: Option<oneshot::Sender<Ack>>,
    ) {
        if self.status.connection_state != ConnectionState::Connected {
            debug!("Publish to {} skipped, not connected", topic);
            if let Some(tx) = responder {
                respond(tx, Ack::NotConnected);
            }
            return;
        }

        let tag = self.tag();
        let Some(link) = self.link.as_mut() else {
            if let Some(tx) = responder {
                respond(tx, Ack::NotConnected);
            }
            return;
        };

        match link.publish(tag, &topic, payload.clone().into_bytes(), qos) {
            Ok(()) => {
                self.pending.insert(
                    tag,
                    Pending::Publish {
                        topic,
                        payload,
                        responder,
                    },
                );
            }
            Err(e) => {
                warn!("Publish to {} failed: {}", topic, e);
                self.system(format!("Publish to {} failed: {}", topic, e));
                if let Some(tx) = responder {
                    respond(tx, Ack::Failed(e.to_string()));
                }
            }
        }
    }

    fn dispatch(&mut self, command: Command, responder: Option<oneshot::Sender<Ack>>) {
        match build_request(&self.config.namespace, &command) {
            Ok(request) => {
                debug!("Dispatching {} to {}", command.kind, command.target);
                self.issue_publish(request.topic, request.payload, request.qos, responder);
            }
            Err(e) => {
                warn!("Command {} for {} rejected: {}", command.kind, command.target, e);
                if let Some(tx) = responder {
                    respond(tx, Ack::Rejected(e.to_string()));
                }
            }
        }
    }

    async fn on_link_event(&mut self, event: LinkEvent) {
        if event.generation != self.generation {
            debug!(
                "Dropping event from superseded link {} (current {})",
                event.generation, self.generation
            );
            return;
        }

        match event.kind {
            LinkEventKind::Connected => self.on_connected().await,
            LinkEventKind::Reconnecting(reason) => {
                warn!("Connection lost, transport reconnecting: {}", reason);
                self.fail_pending(Ack::Failed(TransportError::ConnectionLost.to_string()));
                self.system(format!("Connection lost: {}", reason));
                self.set_state(ConnectionState::Reconnecting, "Reconnecting...".to_string());
            }
            LinkEventKind::Failed(reason) => self.fail(reason),
            LinkEventKind::Message { topic, payload } => self.on_message(topic, payload).await,
            LinkEventKind::Completed { tag, result } => self.on_completed(tag, result).await,
        }
    }

    async fn on_connected(&mut self) {
        let broker = self.status.broker.clone().unwrap_or_default();
        info!("Connected to {}", broker);
        self.set_state(ConnectionState::Connected, format!("Connected to {}", broker));
        self.status.last_error = None;
        self.system(format!(
            "Connected to {} as {}",
            broker,
            self.status.client_id.as_deref().unwrap_or("?")
        ));
        self.reconciler.reset_session();
        self.start_sweep();

        if let Some(config) = &self.broker_config {
            if let Err(e) = self.store.save_config(config).await {
                warn!("Failed to persist connection config: {}", e);
            }
        }

        let mut topics: BTreeSet<String> = self.subscriptions.clone();
        topics.extend(std::mem::take(&mut self.replay));
        topics.extend(self.config.default_subscriptions.iter().cloned());
        for topic in topics {
            if !self.subscribing.contains(&topic) {
                self.issue_subscribe(topic, true, None);
            }
        }
    }

    async fn on_completed(&mut self, tag: RequestTag, result: Result<(), String>) {
        let Some(pending) = self.pending.remove(&tag) else {
            debug!("Completion for unknown request {:?}", tag);
            return;
        };

        match (pending, result) {
            (Pending::Subscribe { filter, responder, .. }, Ok(())) => {
                self.subscribing.remove(&filter);
                info!("Subscribed to {}", filter);
                self.subscriptions.insert(filter);
                self.persist_subscriptions().await;
                if let Some(tx) = responder {
                    respond(tx, Ack::Confirmed);
                }
            }
            (Pending::Subscribe { filter, responder, .. }, Err(reason)) => {
                self.subscribing.remove(&filter);
                warn!("Subscribe to {} failed: {}", filter, reason);
                self.system(format!("Subscribe to {} failed: {}", filter, reason));
                if let Some(tx) = responder {
                    respond(tx, Ack::Failed(reason));
                }
            }
            (Pending::Unsubscribe { filter, responder }, Ok(())) => {
                info!("Unsubscribed from {}", filter);
                self.subscriptions.remove(&filter);
                self.persist_subscriptions().await;
                if let Some(tx) = responder {
                    respond(tx, Ack::Confirmed);
                }
            }
            (Pending::Unsubscribe { filter, responder }, Err(reason)) => {
                self.system(format!("Unsubscribe from {} failed: {}", filter, reason));
                if let Some(tx) = responder {
                    respond(tx, Ack::Failed(reason));
                }
            }
            (Pending::Publish { topic, payload, responder }, Ok(())) => {
                let message = MqttMessage::sent(topic, payload);
                self.status.messages_sent += 1;
                self.status.last_activity = Some(message.timestamp);
                if let Some(hook) = &self.delivery_hook {
                    hook(&message);
                }
                self.log.push(message);
                if let Some(tx) = responder {
                    respond(tx, Ack::Confirmed);
                }
            }
            (Pending::Publish { topic, responder, .. }, Err(reason)) => {
                warn!("Publish to {} failed: {}", topic, reason);
                self.system(format!("Publish to {} failed: {}", topic, reason));
                if let Some(tx) = responder {
                    respond(tx, Ack::Failed(reason));
                }
            }
        }
    }

    async fn on_message(&mut self, topic: String, payload: Vec<u8>) {
        let now = Local::now();
        self.status.messages_received += 1;
        self.status.last_activity = Some(now);
        self.log
            .push(MqttMessage::received(topic.clone(), String::from_utf8_lossy(&payload)));

        let outcome = self.reconciler.handle(&topic, &payload, now);

        if let Some(dropped) = &outcome.dropped {
            debug!("Message on {} not reconciled: {:?}", topic, dropped);
        }
        for id in &outcome.came_online {
            self.system(format!("Device {:02} online", id));
        }
        if outcome.changed || !outcome.came_online.is_empty() {
            self.registry_revision += 1;
        }
        for key in &outcome.skipped_modules {
            self.system(format!("Skipped batched entry '{}' on {}", key, topic));
        }
        for notification in outcome.notifications {
            if !notification.success {
                self.system(notification.to_string());
            }
            // No subscribers is fine: nobody is watching notifications.
            let _ = self.notify_tx.send(notification);
        }
        for command in outcome.follow_ups {
            self.dispatch(command, None);
        }
    }

    fn on_sweep(&mut self) {
        let flipped = self.reconciler.sweep(Local::now());
        for id in &flipped {
            self.system(format!("Device {:02} offline (no message within timeout)", id));
        }
        if !flipped.is_empty() {
            self.registry_revision += 1;
        }
    }
}

/// Decodes a raw payload for display; non-JSON text is returned as-is.
pub fn pretty_payload(payload: &str) -> String {
    match codec::decode(payload) {
        Ok(body) => Value::Object(body).to_string(),
        Err(_) => payload.to_string(),
    }
}
