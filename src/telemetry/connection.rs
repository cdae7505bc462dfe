use async_trait::async_trait;
use log::{debug, info, warn};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};

use crate::config::MqttConfig;
use crate::error::DeliveryError;
use crate::telemetry::publisher::TelemetrySink;

/// Publishes that may wait in the client queue before the send is refused
const REQUEST_CAPACITY: usize = 10;
const RECONNECT_DELAY_SECS: u64 = 5;

/// MQTT telemetry sink
///
/// A send counts as delivered once the client has queued it; the background
/// event loop does the network I/O.
pub struct MqttSink {
    client: AsyncClient,
    qos: QoS,
}

impl MqttSink {
    fn new(client: AsyncClient) -> Self {
        Self {
            client,
            qos: QoS::AtLeastOnce,
        }
    }

    pub async fn disconnect(&self) {
        if let Err(e) = self.client.disconnect().await {
            debug!("Disconnect request not sent: {}", e);
        }
    }
}

#[async_trait]
impl TelemetrySink for MqttSink {
    async fn send(&self, topic: &str, payload: Vec<u8>) -> Result<(), DeliveryError> {
        // try_publish so a stalled broker fills the queue instead of blocking the pipeline
        self.client
            .try_publish(topic, self.qos, false, payload)
            .map_err(|e| DeliveryError::Rejected {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }
}

/// Create the broker client and spawn its event loop
///
/// The returned handle runs until the process exits; reconnection happens on
/// the next poll after an error.
pub fn connect(config: &MqttConfig) -> (MqttSink, JoinHandle<()>) {
    let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
    options.set_keep_alive(config.keep_alive);
    if let Some(username) = &config.username {
        options.set_credentials(username, config.password.clone().unwrap_or_default());
    }

    let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
    info!(
        "Connection attempt made to {}:{} as {}",
        config.host, config.port, config.client_id
    );

    let driver = tokio::spawn(drive(eventloop));
    (MqttSink::new(client), driver)
}

async fn drive(mut eventloop: EventLoop) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                info!("Connection returned result: {:?}", ack.code);
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("Broker closed the connection");
            }
            Ok(event) => debug!("MQTT event: {:?}", event),
            Err(e) => {
                warn!(
                    "Connection error: {}; reconnecting in {}s",
                    e, RECONNECT_DELAY_SECS
                );
                sleep(Duration::from_secs(RECONNECT_DELAY_SECS)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> (AsyncClient, EventLoop) {
        AsyncClient::new(MqttOptions::new("test", "localhost", 1883), REQUEST_CAPACITY)
    }

    #[tokio::test]
    async fn full_queue_is_a_delivery_error_not_a_wait() {
        let (client, _eventloop) = client();
        let sink = MqttSink::new(client);

        for _ in 0..REQUEST_CAPACITY {
            sink.send("gateway-data", b"{}".to_vec()).await.unwrap();
        }
        let err = sink.send("gateway-data", b"{}".to_vec()).await.unwrap_err();
        assert!(matches!(
            err,
            DeliveryError::Rejected { ref topic, .. } if topic == "gateway-data"
        ));
    }

    #[tokio::test]
    async fn closed_event_loop_rejects_sends() {
        let (client, eventloop) = client();
        drop(eventloop);
        let sink = MqttSink::new(client);
        assert!(sink.send("gateway-data", b"{}".to_vec()).await.is_err());
    }
}
