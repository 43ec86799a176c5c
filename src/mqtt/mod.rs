//! MQTT broker link.
//!
//! A sync `rumqttc` client paired with one background thread that drives the
//! network event loop and forwards everything of interest into a channel.
//! The main loop drains that channel once per tick, so connection state and
//! inbound messages are only ever handled on the bridge thread.
//!
//! Reconnection is owned here, not by the client library: the event thread
//! exits on the first connection error, the link schedules a fresh connect
//! at `now + reconnect interval`, and the main loop fires it when due.

use std::time::{Duration, Instant};

use bytes::Bytes;
use rumqttc::{Client, ConnectReturnCode, Event, MqttOptions, Packet, QoS};

pub const MQTT_BROKER_DEFAULT: &str = "127.0.0.1";
pub const MQTT_PORT_DEFAULT: u16 = 1883;
pub const MQTT_CLIENT_ID: &str = "mbbridge";
pub const MQTT_RECONNECT_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub enum MqttEvent {
    Connected,
    Disconnected,
    Message(InboundMessage),
}

#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub retain: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

/// Outbound operation recorded instead of sent when the link is stubbed in
/// tests.
#[cfg(test)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestOp {
    Publish {
        topic: String,
        payload: String,
        retain: bool,
    },
    ClearRetained {
        topic: String,
    },
    Subscribe {
        topic: String,
    },
}

pub struct MqttLink {
    broker: String,
    port: u16,
    client_id: String,
    reconnect_interval: Duration,
    debug: bool,
    state: LinkState,
    client: Option<Client>,
    events: Option<flume::Receiver<MqttEvent>>,
    connect_started: Option<Instant>,
    next_connect: Option<Instant>,
    exiting: bool,
    #[cfg(test)]
    test_outbox: Option<flume::Sender<TestOp>>,
}

impl MqttLink {
    pub fn new(broker: String, port: u16, debug: bool) -> Self {
        Self {
            broker,
            port,
            client_id: MQTT_CLIENT_ID.to_string(),
            reconnect_interval: MQTT_RECONNECT_INTERVAL,
            debug,
            state: LinkState::Disconnected,
            client: None,
            events: None,
            connect_started: None,
            next_connect: None,
            exiting: false,
            #[cfg(test)]
            test_outbox: None,
        }
    }

    pub fn broker(&self) -> &str {
        &self.broker
    }

    pub fn is_connected(&self) -> bool {
        self.state == LinkState::Connected
    }

    /// True when a scheduled reconnect has come due.
    pub fn reconnect_due(&self, now: Instant) -> bool {
        matches!(self.next_connect, Some(at) if now >= at)
    }

    /// Start a connection attempt: fresh client, fresh event thread.
    pub fn connect(&mut self) {
        if self.debug {
            log::debug!("attempting to connect to mqtt broker {}", self.broker);
        }
        let mut options = MqttOptions::new(&self.client_id, &self.broker, self.port);
        options.set_keep_alive(Duration::from_secs(30));
        options.set_clean_session(true);
        let (client, mut connection) = Client::new(options, 10);
        let (event_tx, event_rx) = flume::unbounded();

        std::thread::spawn(move || {
            for notification in connection.iter() {
                match notification {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        if ack.code == ConnectReturnCode::Success {
                            if event_tx.send(MqttEvent::Connected).is_err() {
                                break;
                            }
                        } else {
                            log::warn!("mqtt connection rejected: {:?}", ack.code);
                            let _ = event_tx.send(MqttEvent::Disconnected);
                            break;
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let message = InboundMessage {
                            topic: publish.topic.clone(),
                            payload: publish.payload.clone(),
                            retain: publish.retain,
                        };
                        if event_tx.send(MqttEvent::Message(message)).is_err() {
                            break;
                        }
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        let _ = event_tx.send(MqttEvent::Disconnected);
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        log::debug!("mqtt connection error: {err}");
                        let _ = event_tx.send(MqttEvent::Disconnected);
                        break;
                    }
                }
            }
        });

        self.client = Some(client);
        self.events = Some(event_rx);
        self.state = LinkState::Connecting;
        self.connect_started = Some(Instant::now());
        self.next_connect = None;
    }

    /// Drain pending events, applying connection-state transitions, and hand
    /// them back for dispatch (subscription, inbound writes).
    pub fn poll_events(&mut self) -> Vec<MqttEvent> {
        let drained: Vec<MqttEvent> = match &self.events {
            Some(events) => events.try_iter().collect(),
            None => return Vec::new(),
        };
        for event in &drained {
            match event {
                MqttEvent::Connected => {
                    log::info!("connected to MQTT broker [{}]", self.broker);
                    self.state = LinkState::Connected;
                    self.next_connect = None;
                }
                MqttEvent::Disconnected => self.handle_disconnect(),
                MqttEvent::Message(_) => {}
            }
        }
        drained
    }

    fn handle_disconnect(&mut self) {
        match self.state {
            LinkState::Connecting => {
                // the timeout is whatever the network stack decided
                let elapsed = self
                    .connect_started
                    .map(|at| at.elapsed().as_secs())
                    .unwrap_or(0);
                log::info!("mqtt connection timeout after {elapsed}s");
            }
            LinkState::Connected => {
                log::warn!("disconnected from MQTT broker [{}]", self.broker);
            }
            LinkState::Disconnected => {}
        }
        self.state = LinkState::Disconnected;
        self.client = None;
        if !self.exiting {
            self.next_connect = Some(Instant::now() + self.reconnect_interval);
            log::info!(
                "mqtt reconnect scheduled in {} seconds",
                self.reconnect_interval.as_secs()
            );
        }
    }

    /// Publish a payload. Dropped silently while disconnected; the reconnect
    /// path restores the flow.
    pub fn publish(&self, topic: &str, payload: &str, retain: bool) {
        if self.state != LinkState::Connected {
            return;
        }
        #[cfg(test)]
        if let Some(outbox) = &self.test_outbox {
            let _ = outbox.send(TestOp::Publish {
                topic: topic.to_string(),
                payload: payload.to_string(),
                retain,
            });
            return;
        }
        let Some(client) = &self.client else { return };
        if self.debug {
            log::debug!("publish {topic} = {payload}");
        }
        if let Err(err) = client.publish(topic, QoS::AtMostOnce, retain, payload.as_bytes().to_vec())
        {
            log::warn!("mqtt publish to {topic} failed: {err}");
        }
    }

    /// Remove the broker's retained message for a topic (empty retained
    /// publish).
    pub fn clear_retained(&self, topic: &str) {
        if self.state != LinkState::Connected {
            return;
        }
        #[cfg(test)]
        if let Some(outbox) = &self.test_outbox {
            let _ = outbox.send(TestOp::ClearRetained {
                topic: topic.to_string(),
            });
            return;
        }
        let Some(client) = &self.client else { return };
        if let Err(err) = client.publish(topic, QoS::AtMostOnce, true, Vec::new()) {
            log::warn!("mqtt clear retained on {topic} failed: {err}");
        }
    }

    pub fn subscribe(&self, topic: &str) {
        #[cfg(test)]
        if let Some(outbox) = &self.test_outbox {
            let _ = outbox.send(TestOp::Subscribe {
                topic: topic.to_string(),
            });
            return;
        }
        let Some(client) = &self.client else { return };
        if let Err(err) = client.subscribe(topic, QoS::AtMostOnce) {
            log::warn!("mqtt subscribe to {topic} failed: {err}");
        }
    }

    /// Begin the shutdown disconnect; no reconnect is scheduled past this.
    pub fn disconnect(&mut self) {
        self.exiting = true;
        self.next_connect = None;
        #[cfg(test)]
        if self.test_outbox.is_some() {
            self.state = LinkState::Disconnected;
            return;
        }
        if let Some(client) = &self.client {
            if let Err(err) = client.disconnect() {
                log::debug!("mqtt disconnect request failed: {err}");
            }
        }
    }

    /// Stubbed link for tests: outbound operations land in the returned
    /// channel, nothing touches the network.
    #[cfg(test)]
    pub fn test_stub(connected: bool) -> (Self, flume::Receiver<TestOp>) {
        let (outbox_tx, outbox_rx) = flume::unbounded();
        let mut link = Self::new(MQTT_BROKER_DEFAULT.to_string(), MQTT_PORT_DEFAULT, false);
        link.state = if connected {
            LinkState::Connected
        } else {
            LinkState::Disconnected
        };
        link.test_outbox = Some(outbox_tx);
        (link, outbox_rx)
    }

    /// Stubbed link with an injectable event stream, for state-machine tests.
    #[cfg(test)]
    pub fn test_stub_with_events(
        connected: bool,
    ) -> (Self, flume::Receiver<TestOp>, flume::Sender<MqttEvent>) {
        let (mut link, outbox_rx) = Self::test_stub(connected);
        let (event_tx, event_rx) = flume::unbounded();
        link.events = Some(event_rx);
        if connected {
            link.connect_started = Some(Instant::now());
        }
        (link, outbox_rx, event_tx)
    }
}
