//! MQTT plumbing around the synchronous rumqttc client.
//!
//! Publishing never blocks the control loop on the broker: the client queues
//! into its request channel and the event-loop thread drains it. A retained
//! out-of-service last will covers ungraceful exits.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rumqttc::{Client, Connection, Event, LastWill, MqttOptions, Packet, QoS};
use tracing::{debug, error, info, warn};

use thermostat_common::{StatusPayload, OUT_OF_SERVICE};

use crate::config::MqttConfig;
use crate::settings::Settings;

const REQUEST_CAP: usize = 64;
const RECONNECT_BACKOFF: Duration = Duration::from_secs(2);

/// Seam between the control loop and the broker.
pub trait StatusSink {
    fn publish_status(&self, payload: &StatusPayload);
    fn publish_out_of_service(&self);
}

#[derive(Clone)]
pub struct Mqtt {
    client: Client,
    topic: String,
}

impl Mqtt {
    pub fn new(config: &MqttConfig, topic: String) -> (Self, Connection) {
        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_last_will(LastWill::new(&topic, OUT_OF_SERVICE, QoS::ExactlyOnce, true));
        if let Some(username) = &config.username {
            options.set_credentials(username, config.password.as_deref().unwrap_or_default());
        }
        let (client, connection) = Client::new(options, REQUEST_CAP);
        (Self { client, topic }, connection)
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn subscribe(&self, topic: &str) {
        if let Err(err) = self.client.subscribe(topic, QoS::ExactlyOnce) {
            warn!("failed to subscribe to {topic}: {err}");
        }
    }

    pub fn publish_value(&self, value: &serde_json::Value) {
        match serde_json::to_vec(value) {
            Ok(payload) => {
                if let Err(err) =
                    self.client
                        .publish(&self.topic, QoS::ExactlyOnce, false, payload)
                {
                    warn!("publish to {} failed: {err}", self.topic);
                }
            }
            Err(err) => error!("failed to serialize reply: {err}"),
        }
    }

    pub fn disconnect(&self) {
        if let Err(err) = self.client.disconnect() {
            debug!("disconnect request failed: {err}");
        }
    }
}

impl StatusSink for Mqtt {
    fn publish_status(&self, payload: &StatusPayload) {
        match serde_json::to_vec(payload) {
            Ok(encoded) => {
                debug!("publishing status {}", String::from_utf8_lossy(&encoded));
                if let Err(err) =
                    self.client
                        .publish(&self.topic, QoS::ExactlyOnce, false, encoded)
                {
                    warn!("status publish failed: {err}");
                }
            }
            Err(err) => error!("failed to serialize status: {err}"),
        }
    }

    fn publish_out_of_service(&self) {
        if let Err(err) = self
            .client
            .publish(&self.topic, QoS::ExactlyOnce, true, OUT_OF_SERVICE)
        {
            warn!("out-of-service publish failed: {err}");
        }
    }
}

/// Owns the thread that drives the broker connection and dispatches
/// incoming settings commands.
pub struct EventLoop {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl EventLoop {
    pub fn spawn(mut connection: Connection, settings: Arc<Settings>) -> io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let handle = thread::Builder::new().name("mqtt".to_string()).spawn({
            let stop = Arc::clone(&stop);
            move || {
                for notification in connection.iter() {
                    match notification {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            info!("broker connected");
                            settings.on_connect();
                        }
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            settings.handle_message(&publish.topic, &publish.payload);
                        }
                        Ok(_) => {}
                        Err(err) => {
                            if stop.load(Ordering::Relaxed) {
                                break;
                            }
                            warn!("broker connection lost: {err}");
                            thread::sleep(RECONNECT_BACKOFF);
                        }
                    }
                }
            }
        })?;
        Ok(Self { stop, handle })
    }

    /// Call after Mqtt::disconnect so the connection iterator terminates.
    pub fn stop(self) {
        self.stop.store(true, Ordering::Relaxed);
        if self.handle.join().is_err() {
            error!("mqtt event thread panicked");
        }
    }
}
