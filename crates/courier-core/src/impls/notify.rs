//! NotificationRouter - channel 宛ての通知を送る DeliveryStrategy
//!
//! The payload names its channel (`"email"`, `"slack"`, ...). Channels are
//! registered up front; what happens to an unknown channel is a configured
//! policy, never a silent success by default.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::ports::{DeliveryError, DeliveryOutcome, DeliveryRequest, DeliveryStrategy};

/// Outbox event type routed to a `NotificationRouter` by default.
pub const NOTIFICATION_EVENT_TYPE: &str = "notification.send.v1";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownChannelPolicy {
    /// Permanent failure: the item is dead-lettered.
    #[default]
    DeadLetter,
    /// Count as delivered and log a warning.
    TreatAsDelivered,
}

/// Payload of a notification item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub channel: String,
    pub recipient: String,
    #[serde(default)]
    pub subject: Option<String>,
    pub body: String,
}

#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn name(&self) -> &str;

    /// `idempotency_token` must be forwarded when the channel supports it.
    async fn send(
        &self,
        notification: &Notification,
        idempotency_token: &str,
    ) -> Result<(), DeliveryError>;
}

/// Channel that only writes a log line. Useful in development.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogChannel;

#[async_trait]
impl NotificationChannel for LogChannel {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(
        &self,
        notification: &Notification,
        idempotency_token: &str,
    ) -> Result<(), DeliveryError> {
        info!(
            recipient = %notification.recipient,
            subject = notification.subject.as_deref().unwrap_or(""),
            token = idempotency_token,
            "notification"
        );
        Ok(())
    }
}

#[derive(Default)]
pub struct NotificationRouter {
    channels: HashMap<String, Arc<dyn NotificationChannel>>,
    unknown_channel: UnknownChannelPolicy,
}

impl NotificationRouter {
    pub fn new(unknown_channel: UnknownChannelPolicy) -> Self {
        Self {
            channels: HashMap::new(),
            unknown_channel,
        }
    }

    pub fn channel(mut self, channel: Arc<dyn NotificationChannel>) -> Self {
        self.channels.insert(channel.name().to_string(), channel);
        self
    }
}

#[async_trait]
impl DeliveryStrategy for NotificationRouter {
    async fn deliver(&self, request: &DeliveryRequest) -> DeliveryOutcome {
        let notification: Notification = match serde_json::from_slice(&request.payload) {
            Ok(n) => n,
            Err(e) => {
                return DeliveryError::InvalidRequest(format!("notification payload: {e}")).into();
            }
        };

        let Some(channel) = self.channels.get(&notification.channel) else {
            return match self.unknown_channel {
                UnknownChannelPolicy::DeadLetter => {
                    DeliveryError::UnknownChannel(notification.channel).into()
                }
                UnknownChannelPolicy::TreatAsDelivered => {
                    warn!(
                        event_id = %request.event_id,
                        channel = %notification.channel,
                        "unknown notification channel treated as delivered"
                    );
                    DeliveryOutcome::Delivered
                }
            };
        };

        match channel
            .send(&notification, request.idempotency_token.as_str())
            .await
        {
            Ok(()) => DeliveryOutcome::Delivered,
            Err(err) => err.into(),
        }
    }
}
