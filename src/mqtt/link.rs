//! Broker link: the transport seam between the session and the MQTT client.
//!
//! The session never talks to `rumqttc` directly. It asks a [`Connector`] for a
//! [`BrokerLink`], issues non-blocking requests on it, and learns about their
//! completion (and everything else the broker does) through [`LinkEvent`]s on a
//! channel. Each link is stamped with the generation of the connection attempt
//! that created it so the session can discard events from a superseded link.
//!
//! # Link lifecycle
//!
//! ```text
//! Configured ──open()──► Open ──close()──► Closed
//! ```

use super::config::{BrokerConfig, Scheme};
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet, QoS, SubscribeReasonCode, Transport,
};
use statum::{machine, state};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("invalid broker address: {0}")]
    InvalidBrokerUrl(String),

    #[error("broker refused the connection: {0}")]
    Refused(String),

    #[error("connection to broker lost")]
    ConnectionLost,

    #[error("request could not be queued: {0}")]
    Request(String),

    #[error("link is closed")]
    Closed,
}

/// Correlates a request with its later completion event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestTag(pub u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEventKind {
    /// The broker accepted the session (initial connect or after a reconnect).
    Connected,
    /// An established session dropped; the transport keeps retrying.
    Reconnecting(String),
    /// The connection attempt ended for good.
    Failed(String),
    Message { topic: String, payload: Vec<u8> },
    Completed { tag: RequestTag, result: Result<(), String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkEvent {
    pub generation: u64,
    pub kind: LinkEventKind,
}

#[derive(Debug, Clone)]
pub struct LinkOptions {
    pub broker: BrokerConfig,
    pub client_id: String,
    pub generation: u64,
    pub keep_alive: Duration,
    pub reconnect_delay: Duration,
}

/// Fresh client id per connection attempt, so a stale session on the broker
/// never collides with the new one.
pub fn fresh_client_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("bmtl-web-{}", &id[..12])
}

pub trait Connector: Send + 'static {
    fn open(
        &mut self,
        options: LinkOptions,
        events: mpsc::Sender<LinkEvent>,
    ) -> Result<Box<dyn BrokerLink>, TransportError>;
}

/// Requests are queued without waiting; results arrive as
/// [`LinkEventKind::Completed`] carrying the same tag.
pub trait BrokerLink: Send {
    fn subscribe(&mut self, tag: RequestTag, filter: &str) -> Result<(), TransportError>;

    fn unsubscribe(&mut self, tag: RequestTag, filter: &str) -> Result<(), TransportError>;

    fn publish(
        &mut self,
        tag: RequestTag,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
    ) -> Result<(), TransportError>;

    fn close(self: Box<Self>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outbound {
    Subscribe,
    Unsubscribe,
    Publish(QoS),
}

/// Requests queued on the client but not yet assigned a packet id, and
/// requests waiting for their acknowledgement by packet id.
#[derive(Debug, Default)]
struct InFlight {
    queued: VecDeque<(Outbound, RequestTag)>,
    by_pkid: HashMap<u16, RequestTag>,
}

impl InFlight {
    fn clear(&mut self) {
        self.queued.clear();
        self.by_pkid.clear();
    }
}

#[state]
#[derive(Debug, Clone)]
pub enum LinkState {
    Configured,
    Open,
    Closed,
}

/// `rumqttc`-backed link.
#[machine]
pub struct MqttLink<S: LinkState> {
    generation: u64,
    client_id: String,
    reconnect_delay: Duration,
    mqtt_options: Option<MqttOptions>,
    client: Option<AsyncClient>,
    in_flight: Arc<Mutex<InFlight>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl<S: LinkState> MqttLink<S> {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl MqttLink<Configured> {
    pub fn create(options: &LinkOptions) -> Result<Self, TransportError> {
        let address = options.broker.address()?;
        debug!(
            "Configuring link {} to {}:{} as {}",
            options.generation, address.host, address.port, options.client_id
        );

        let mut mqtt_options =
            MqttOptions::new(options.client_id.clone(), address.host.clone(), address.port);
        mqtt_options
            .set_keep_alive(options.keep_alive)
            .set_clean_session(true);
        if options.broker.has_credentials() {
            mqtt_options.set_credentials(
                options.broker.username.clone(),
                options.broker.password.clone(),
            );
        }
        if address.scheme == Scheme::WebSocket {
            mqtt_options.set_transport(Transport::Ws);
        }

        Ok(Self::new(
            options.generation,
            options.client_id.clone(),
            options.reconnect_delay,
            Some(mqtt_options),
            None,
            Arc::new(Mutex::new(InFlight::default())),
            CancellationToken::new(),
            None,
        ))
    }

    /// Creates the client and starts polling its event loop.
    pub fn open(mut self, events: mpsc::Sender<LinkEvent>) -> Result<MqttLink<Open>, TransportError> {
        let mqtt_options = self
            .mqtt_options
            .take()
            .ok_or_else(|| TransportError::Request("link options already consumed".to_string()))?;

        let (client, eventloop) = AsyncClient::new(mqtt_options, 100);
        let driver = LinkDriver {
            generation: self.generation,
            events,
            in_flight: self.in_flight.clone(),
            reconnect_delay: self.reconnect_delay,
        };
        let cancel = self.cancel.clone();
        info!("Opening link {} ({})", self.generation, self.client_id);
        self.task = Some(tokio::spawn(driver.run(eventloop, cancel)));
        self.client = Some(client);

        Ok(self.transition())
    }
}

impl MqttLink<Open> {
    fn client(&self) -> Result<&AsyncClient, TransportError> {
        self.client.as_ref().ok_or(TransportError::Closed)
    }

    /// Records the request before handing it to the client, so the driver can
    /// match the outgoing packet id; undone if the client rejects it.
    fn enqueue<F>(&self, outbound: Outbound, tag: RequestTag, send: F) -> Result<(), TransportError>
    where
        F: FnOnce(&AsyncClient) -> Result<(), rumqttc::ClientError>,
    {
        let client = self.client()?;
        let mut in_flight = self
            .in_flight
            .lock()
            .map_err(|_| TransportError::Request("in-flight table poisoned".to_string()))?;
        in_flight.queued.push_back((outbound, tag));

        if let Err(e) = send(client) {
            in_flight.queued.pop_back();
            return Err(TransportError::Request(e.to_string()));
        }
        Ok(())
    }

    pub fn shut_down(mut self) -> MqttLink<Closed> {
        info!("Closing link {} ({})", self.generation, self.client_id);
        self.cancel.cancel();
        if let Some(client) = self.client.take() {
            if let Err(e) = client.try_disconnect() {
                debug!("Disconnect request not queued: {}", e);
            }
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.transition()
    }
}

impl BrokerLink for MqttLink<Open> {
    fn subscribe(&mut self, tag: RequestTag, filter: &str) -> Result<(), TransportError> {
        self.enqueue(Outbound::Subscribe, tag, |client| {
            client.try_subscribe(filter, QoS::ExactlyOnce)
        })
    }

    fn unsubscribe(&mut self, tag: RequestTag, filter: &str) -> Result<(), TransportError> {
        self.enqueue(Outbound::Unsubscribe, tag, |client| client.try_unsubscribe(filter))
    }

    fn publish(
        &mut self,
        tag: RequestTag,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
    ) -> Result<(), TransportError> {
        self.enqueue(Outbound::Publish(qos), tag, |client| {
            client.try_publish(topic, qos, false, payload)
        })
    }

    fn close(self: Box<Self>) {
        let closed = (*self).shut_down();
        debug!("Link {} for {} closed", closed.generation(), closed.client_id());
    }
}

/// Opens `rumqttc` links.
#[derive(Debug, Default)]
pub struct MqttConnector;

impl Connector for MqttConnector {
    fn open(
        &mut self,
        options: LinkOptions,
        events: mpsc::Sender<LinkEvent>,
    ) -> Result<Box<dyn BrokerLink>, TransportError> {
        let link = MqttLink::create(&options)?.open(events)?;
        Ok(Box::new(link))
    }
}

struct LinkDriver {
    generation: u64,
    events: mpsc::Sender<LinkEvent>,
    in_flight: Arc<Mutex<InFlight>>,
    reconnect_delay: Duration,
}

impl LinkDriver {
    async fn emit(&self, kind: LinkEventKind) -> bool {
        self.events
            .send(LinkEvent {
                generation: self.generation,
                kind,
            })
            .await
            .is_ok()
    }

    fn with_in_flight<T>(&self, f: impl FnOnce(&mut InFlight) -> T) -> Option<T> {
        match self.in_flight.lock() {
            Ok(mut guard) => Some(f(&mut guard)),
            Err(_) => {
                error!("In-flight table poisoned on link {}", self.generation);
                None
            }
        }
    }

    /// Assigns the packet id of an outgoing request to the oldest queued tag.
    /// QoS 0 publishes have no acknowledgement and complete right away.
    async fn on_outgoing(&self, outbound: Outbound, pkid: u16) -> bool {
        let assigned = self.with_in_flight(|in_flight| {
            let (queued, tag) = in_flight.queued.pop_front()?;
            if std::mem::discriminant(&queued) != std::mem::discriminant(&outbound) {
                warn!("Outgoing {:?} matched queued {:?}", outbound, queued);
            }
            if queued == Outbound::Publish(QoS::AtMostOnce) {
                return Some(Some(tag));
            }
            in_flight.by_pkid.insert(pkid, tag);
            Some(None)
        });

        match assigned.flatten() {
            Some(Some(tag)) => self.emit(LinkEventKind::Completed { tag, result: Ok(()) }).await,
            _ => true,
        }
    }

    async fn on_ack(&self, pkid: u16, result: Result<(), String>) -> bool {
        let tag = self
            .with_in_flight(|in_flight| in_flight.by_pkid.remove(&pkid))
            .flatten();
        match tag {
            Some(tag) => self.emit(LinkEventKind::Completed { tag, result }).await,
            None => {
                debug!("Ack for unknown packet id {} on link {}", pkid, self.generation);
                true
            }
        }
    }

    async fn on_event(&self, event: Event, online: &mut bool) -> bool {
        match event {
            Event::Incoming(Packet::ConnAck(ack)) => {
                if ack.code == ConnectReturnCode::Success {
                    *online = true;
                    self.emit(LinkEventKind::Connected).await
                } else {
                    self.emit(LinkEventKind::Failed(format!("{:?}", ack.code))).await;
                    false
                }
            }
            Event::Incoming(Packet::Publish(publish)) => {
                self.emit(LinkEventKind::Message {
                    topic: publish.topic,
                    payload: publish.payload.to_vec(),
                })
                .await
            }
            Event::Incoming(Packet::SubAck(ack)) => {
                let result = if ack
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure))
                {
                    Err("broker rejected subscription".to_string())
                } else {
                    Ok(())
                };
                self.on_ack(ack.pkid, result).await
            }
            Event::Incoming(Packet::UnsubAck(ack)) => self.on_ack(ack.pkid, Ok(())).await,
            Event::Incoming(Packet::PubAck(ack)) => self.on_ack(ack.pkid, Ok(())).await,
            Event::Incoming(Packet::PubComp(ack)) => self.on_ack(ack.pkid, Ok(())).await,
            Event::Outgoing(Outgoing::Subscribe(pkid)) => {
                self.on_outgoing(Outbound::Subscribe, pkid).await
            }
            Event::Outgoing(Outgoing::Unsubscribe(pkid)) => {
                self.on_outgoing(Outbound::Unsubscribe, pkid).await
            }
            Event::Outgoing(Outgoing::Publish(pkid)) => {
                // The QoS is taken from the queued entry; this value only
                // selects the variant.
                self.on_outgoing(Outbound::Publish(QoS::AtMostOnce), pkid).await
            }
            _ => true,
        }
    }

    async fn run(self, mut eventloop: EventLoop, cancel: CancellationToken) {
        let mut online = false;
        let mut connected_once = false;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Link {} cancelled", self.generation);
                    break;
                }
                polled = eventloop.poll() => match polled {
                    Ok(event) => {
                        let was_online = online;
                        if !self.on_event(event, &mut online).await {
                            break;
                        }
                        if online && !was_online {
                            connected_once = true;
                        }
                    }
                    Err(e) => {
                        let fatal = matches!(e, ConnectionError::ConnectionRefused(_));
                        if fatal || !connected_once {
                            error!("Link {} failed: {}", self.generation, e);
                            let reason = match e {
                                ConnectionError::ConnectionRefused(code) => {
                                    TransportError::Refused(format!("{:?}", code)).to_string()
                                }
                                other => other.to_string(),
                            };
                            self.emit(LinkEventKind::Failed(reason)).await;
                            break;
                        }

                        self.with_in_flight(InFlight::clear);
                        if online {
                            online = false;
                            warn!("Link {} lost connection: {}", self.generation, e);
                            if !self.emit(LinkEventKind::Reconnecting(e.to_string())).await {
                                break;
                            }
                        }
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(self.reconnect_delay) => {}
                        }
                    }
                }
            }
        }

        debug!("Link {} driver stopped", self.generation);
    }
}
