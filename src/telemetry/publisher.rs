/// Outbound message shaping and delivery to the telemetry sink
use async_trait::async_trait;
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::config::DeviceMetadata;
use crate::error::DeliveryError;
use crate::models::{PublishGroup, CHANNELS, CHANNEL_COUNT, PUBLISH_GROUPS};

/// Anything that accepts a payload for a topic
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn send(&self, topic: &str, payload: Vec<u8>) -> Result<(), DeliveryError>;
}

/// One serialized publish group, ready to send
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub group: &'static str,
    pub topic: String,
    pub payload: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    AllDelivered,
    PartialOrFullFailure { delivered: usize, failed: usize },
}

#[derive(Serialize)]
struct Meta<'a> {
    device_id: &'a str,
    sensor: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    location: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    location_specific: Option<&'a str>,
}

#[derive(Serialize)]
struct GroupPayload<'a> {
    #[serde(flatten)]
    readings: BTreeMap<&'static str, f64>,
    #[serde(rename = "_meta")]
    meta: Meta<'a>,
}

pub struct Publisher {
    topic: String,
    device: DeviceMetadata,
}

impl Publisher {
    pub fn new(topic: impl Into<String>, device: DeviceMetadata) -> Self {
        Self {
            topic: topic.into(),
            device,
        }
    }

    fn encode_group(
        &self,
        group: &PublishGroup,
        readings: &[f64; CHANNEL_COUNT],
    ) -> Result<String, serde_json::Error> {
        let payload = GroupPayload {
            readings: group
                .channels
                .iter()
                .map(|&i| (CHANNELS[i].field, readings[i]))
                .collect(),
            meta: Meta {
                device_id: &self.device.device_id,
                sensor: group.sensor,
                location: self.device.location.as_deref(),
                location_specific: self.device.location_detail.as_deref(),
            },
        };
        serde_json::to_string(&payload)
    }

    /// Serialize one message per [`PUBLISH_GROUPS`] entry, in table order
    pub fn messages(
        &self,
        readings: &[f64; CHANNEL_COUNT],
    ) -> Result<Vec<OutboundMessage>, serde_json::Error> {
        PUBLISH_GROUPS
            .iter()
            .map(|group| {
                Ok(OutboundMessage {
                    group: group.name,
                    topic: self.topic.clone(),
                    payload: self.encode_group(group, readings)?,
                })
            })
            .collect()
    }

    /// Attempt every message independently; failures are logged, never retried
    pub async fn publish<K>(&self, sink: &K, messages: &[OutboundMessage]) -> PublishOutcome
    where
        K: TelemetrySink + ?Sized,
    {
        let mut failed = 0;
        for message in messages {
            debug!("Payload for {}: {}", message.group, message.payload);
            match sink
                .send(&message.topic, message.payload.clone().into_bytes())
                .await
            {
                Ok(()) => info!("Sent {} message successfully", message.group),
                Err(e) => {
                    warn!("Failed to send {} message: {}", message.group, e);
                    failed += 1;
                }
            }
        }

        if failed == 0 {
            PublishOutcome::AllDelivered
        } else {
            PublishOutcome::PartialOrFullFailure {
                delivered: messages.len() - failed,
                failed,
            }
        }
    }

    /// Build and publish the messages for one set of readings
    pub async fn publish_readings<K>(
        &self,
        sink: &K,
        readings: &[f64; CHANNEL_COUNT],
    ) -> PublishOutcome
    where
        K: TelemetrySink + ?Sized,
    {
        match self.messages(readings) {
            Ok(messages) => self.publish(sink, &messages).await,
            Err(e) => {
                warn!(
                    "There was a problem encoding the messages: {}",
                    DeliveryError::from(e)
                );
                PublishOutcome::PartialOrFullFailure {
                    delivered: 0,
                    failed: PUBLISH_GROUPS.len(),
                }
            }
        }
    }
}
