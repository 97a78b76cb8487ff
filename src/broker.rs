//! Broker Connection Manager.
//!
//! Owns the single MQTT session. The session runs on its own task and moves
//! through an explicit state machine:
//!
//! ```text
//! Disconnected --start--> Connecting --SubAck--> Subscribed
//!                          ^    |                    |
//!            retry / ConnAck    +---- link lost -----+--> Degraded
//!                          |                               |
//!                          +-------------------------------+
//!                  any state --shutdown--> Closed
//! ```
//!
//! Entry actions live in [`Link`]: a ConnAck (re)issues the subscription,
//! entering `Subscribed` resets the backoff, entering `Degraded` waits for the
//! next backoff delay. Every inbound publish is pushed into the
//! [`DeliveryQueue`] without waiting, so a slow pipeline never stalls the
//! MQTT event loop.
//!
//! Delivery is at-least-once (QoS 1) from the broker; duplicates are absorbed
//! by the idempotent store. Messages published while the link is down are
//! not recovered.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, Publish, QoS};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::ConnectionError;
use crate::pipeline::PipelineStats;
use crate::queue::{Delivery, DeliveryQueue, PushOutcome};

/// Capacity of the rumqttc request channel.
const REQUEST_CAPACITY: usize = 32;

/// Upper bound on flushing the DISCONNECT packet during teardown.
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(2);

// ---

/// Connection lifecycle state, observable through [`BrokerHandle::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Subscribed,
    Degraded,
    Closed,
}

/// Inputs to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// Task started, first connection attempt.
    Start,
    /// Broker accepted the CONNECT.
    ConnAck,
    /// Broker confirmed the subscription.
    SubAck,
    /// Network or protocol failure.
    LinkLost,
    /// Backoff delay elapsed; the next poll reconnects.
    RetryDue,
    /// Orderly shutdown finished.
    Shutdown,
}

impl ConnectionState {
    // ---
    /// Pure transition function.
    pub fn on(self, event: LinkEvent) -> ConnectionState {
        // ---
        use ConnectionState::*;
        use LinkEvent::*;

        match (self, event) {
            (Closed, _) => Closed,
            (_, Shutdown) => Closed,
            (_, LinkLost) => Degraded,
            (Disconnected, Start) => Connecting,
            (Degraded, RetryDue) => Connecting,
            // A ConnAck always means a fresh session that still needs SUBSCRIBE.
            (_, ConnAck) => Connecting,
            (Connecting, SubAck) => Subscribed,
            (state, _) => state,
        }
    }

    pub fn is_connected(self) -> bool {
        self == ConnectionState::Subscribed
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Subscribed => "subscribed",
            ConnectionState::Degraded => "degraded",
            ConnectionState::Closed => "closed",
        };
        f.write_str(text)
    }
}

/// Exponential reconnect delay: base, 2*base, 4*base, ... capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    // ---
    base: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    // ---
    pub fn new(base: Duration, max: Duration) -> Self {
        // ---
        let max = max.max(base);
        Self {
            base,
            max,
            next: base,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        // ---
        let delay = self.next;
        self.next = self.next.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.next = self.base;
    }
}

/// Connection parameters, taken from [`Config`].
#[derive(Debug, Clone)]
pub struct BrokerSettings {
    // ---
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub topic_pattern: String,
    pub keep_alive: Duration,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
}

impl From<&Config> for BrokerSettings {
    fn from(cfg: &Config) -> Self {
        // ---
        Self {
            host: cfg.broker_host.clone(),
            port: cfg.broker_port,
            client_id: cfg.client_id.clone(),
            topic_pattern: cfg.topic_pattern.clone(),
            keep_alive: cfg.keep_alive,
            reconnect_base: cfg.reconnect_base,
            reconnect_max: cfg.reconnect_max,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Running,
    Draining,
    Disconnect,
}

/// Control surface of the running connection task.
#[derive(Debug)]
pub struct BrokerHandle {
    // ---
    control: watch::Sender<Phase>,
    status: watch::Receiver<ConnectionState>,
    task: JoinHandle<()>,
}

/// Spawn the connection task. Connecting happens in the background; watch
/// [`BrokerHandle::status`] for progress.
pub fn connect(
    settings: BrokerSettings,
    queue: Arc<DeliveryQueue>,
    stats: Arc<PipelineStats>,
) -> BrokerHandle {
    // ---
    let mut options = MqttOptions::new(&settings.client_id, &settings.host, settings.port);
    options.set_keep_alive(settings.keep_alive);
    options.set_clean_session(true);

    let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
    let (control_tx, control_rx) = watch::channel(Phase::Running);
    let (status_tx, status_rx) = watch::channel(ConnectionState::Disconnected);

    info!(
        host = %settings.host,
        port = settings.port,
        topic = %settings.topic_pattern,
        "Connecting to MQTT broker"
    );

    let link = Link {
        backoff: Backoff::new(settings.reconnect_base, settings.reconnect_max),
        settings,
        client,
        eventloop,
        queue,
        stats,
        state: ConnectionState::Disconnected,
        status: status_tx,
        intake_open: true,
        subscribe_pending: false,
    };
    let task = tokio::spawn(link.run(control_rx));

    BrokerHandle {
        control: control_tx,
        status: status_rx,
        task,
    }
}

impl BrokerHandle {
    // ---
    pub fn status(&self) -> watch::Receiver<ConnectionState> {
        self.status.clone()
    }

    pub fn state(&self) -> ConnectionState {
        *self.status.borrow()
    }

    /// Stop accepting new messages: unsubscribe and close the delivery queue.
    /// The session stays up so in-flight work can drain.
    pub fn stop_intake(&self) {
        self.control.send_replace(Phase::Draining);
    }

    /// Unsubscribe (if still subscribed), disconnect and wait for the task.
    pub async fn disconnect(self) {
        // ---
        self.control.send_replace(Phase::Disconnect);
        if let Err(e) = self.task.await {
            error!("Broker task failed: {}", e);
        }
    }
}

/// State owned by the connection task.
struct Link {
    // ---
    settings: BrokerSettings,
    client: AsyncClient,
    eventloop: EventLoop,
    queue: Arc<DeliveryQueue>,
    stats: Arc<PipelineStats>,
    backoff: Backoff,
    state: ConnectionState,
    status: watch::Sender<ConnectionState>,
    intake_open: bool,
    /// A ConnAck arrived but SUBSCRIBE is not queued yet.
    subscribe_pending: bool,
}

impl Link {
    // ---
    async fn run(mut self, control: watch::Receiver<Phase>) {
        // ---
        self.drive(control).await;
        // Runs on every exit path of `drive`.
        self.teardown().await;
    }

    async fn drive(&mut self, mut control: watch::Receiver<Phase>) {
        // ---
        self.transition(LinkEvent::Start);

        loop {
            tokio::select! {
                changed = control.changed() => {
                    let phase = if changed.is_ok() {
                        *control.borrow_and_update()
                    } else {
                        Phase::Disconnect
                    };
                    if self.apply(phase) {
                        return;
                    }
                }
                event = self.eventloop.poll() => match event {
                    Ok(event) => {
                        self.handle(event);
                        self.ensure_subscribed();
                    }
                    Err(e) => {
                        let err = ConnectionError::from(e);
                        self.transition(LinkEvent::LinkLost);
                        let delay = self.backoff.next_delay();
                        warn!(error = %err, retry_in = ?delay, "Broker link lost");

                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            changed = control.changed() => {
                                let phase = if changed.is_ok() {
                                    *control.borrow_and_update()
                                } else {
                                    Phase::Disconnect
                                };
                                if self.apply(phase) {
                                    return;
                                }
                            }
                        }
                        self.transition(LinkEvent::RetryDue);
                    }
                },
            }
        }
    }

    /// React to a control phase; `true` means leave the event loop.
    fn apply(&mut self, phase: Phase) -> bool {
        // ---
        match phase {
            Phase::Running => false,
            Phase::Draining => {
                self.stop_intake();
                false
            }
            Phase::Disconnect => true,
        }
    }

    fn handle(&mut self, event: Event) {
        // ---
        match event {
            Event::Incoming(Packet::ConnAck(ack)) => {
                debug!(code = ?ack.code, "Broker accepted connection");
                self.transition(LinkEvent::ConnAck);
                self.subscribe_pending = true;
            }
            Event::Incoming(Packet::SubAck(_)) => {
                self.transition(LinkEvent::SubAck);
                self.backoff.reset();
                info!(topic = %self.settings.topic_pattern, "Subscribed");
            }
            Event::Incoming(Packet::Publish(publish)) => self.forward(publish),
            _ => {}
        }
    }

    /// Entry action of a fresh session: queue the SUBSCRIBE. Retried after
    /// every event until the request channel accepts it.
    fn ensure_subscribed(&mut self) {
        // ---
        if !self.subscribe_pending || !self.intake_open {
            return;
        }
        match self
            .client
            .try_subscribe(self.settings.topic_pattern.as_str(), QoS::AtLeastOnce)
        {
            Ok(()) => self.subscribe_pending = false,
            Err(e) => warn!(error = %ConnectionError::from(e), "Failed to queue SUBSCRIBE; will retry"),
        }
    }

    fn forward(&mut self, publish: Publish) {
        // ---
        if !self.intake_open {
            debug!(topic = %publish.topic, "Intake stopped; ignoring publish");
            return;
        }
        self.stats.record_received();

        let delivery = Delivery {
            topic: publish.topic,
            payload: publish.payload,
            received_at: Utc::now(),
        };
        match self.queue.push(delivery) {
            PushOutcome::Accepted => {}
            PushOutcome::DroppedOldest(old) => {
                self.stats.record_dropped();
                warn!(
                    dropped_topic = %old.topic,
                    capacity = self.queue.capacity(),
                    "Delivery queue full; dropped oldest message"
                );
            }
            PushOutcome::Closed => {
                debug!("Delivery queue closed; ignoring publish");
            }
        }
    }

    fn stop_intake(&mut self) {
        // ---
        if !self.intake_open {
            return;
        }
        self.intake_open = false;
        self.subscribe_pending = false;
        if let Err(e) = self.client.try_unsubscribe(self.settings.topic_pattern.as_str()) {
            warn!(error = %e, "Failed to queue UNSUBSCRIBE");
        }
        self.queue.close();
        info!("Broker intake stopped");
    }

    async fn teardown(&mut self) {
        // ---
        self.stop_intake();

        if let Err(e) = self.client.try_disconnect() {
            warn!(error = %e, "Failed to queue DISCONNECT");
        } else {
            let flush = async {
                loop {
                    match self.eventloop.poll().await {
                        Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                        Ok(_) => {}
                    }
                }
            };
            if tokio::time::timeout(TEARDOWN_TIMEOUT, flush).await.is_err() {
                warn!("Timed out flushing DISCONNECT");
            }
        }

        self.transition(LinkEvent::Shutdown);
        info!("Disconnected from MQTT broker");
    }

    fn transition(&mut self, event: LinkEvent) {
        // ---
        let next = self.state.on(event);
        if next != self.state {
            debug!(from = %self.state, to = %next, ?event, "Broker state change");
            self.state = next;
            self.status.send_replace(next);
        }
    }
}
