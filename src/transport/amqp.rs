//! RabbitMQ transport over `lapin`.
//!
//! Publishes persistent messages to a durable queue through the default
//! exchange. The work key travels as the AMQP `message_id`. The channel is
//! in confirm mode, so a publish only succeeds once the broker acks it.

use async_trait::async_trait;
use lapin::options::{BasicPublishOptions, ConfirmSelectOptions, QueueDeclareOptions};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{FieldTable, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::Mutex;

use super::{Transport, TransportError};

pub struct AmqpTransport {
    name: String,
    url: SecretString,
    queue: String,
    /// Connected lazily; cleared after any failure so the next publish
    /// reconnects.
    session: Mutex<Option<(Connection, Channel)>>,
}

impl AmqpTransport {
    pub fn new(url: SecretString, queue: impl Into<String>) -> Self {
        Self {
            name: "amqp".to_string(),
            url,
            queue: queue.into(),
            session: Mutex::new(None),
        }
    }

    async fn connect(&self) -> Result<(Connection, Channel), TransportError> {
        let connection =
            Connection::connect(self.url.expose_secret(), ConnectionProperties::default())
                .await
                .map_err(|e| TransportError::Connect(format!("amqp connect: {e}")))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| TransportError::Connect(format!("amqp channel: {e}")))?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| TransportError::Connect(format!("amqp confirm mode: {e}")))?;

        channel
            .queue_declare(
                &self.queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::Connect(format!("declare queue {}: {e}", self.queue)))?;

        tracing::info!(queue = %self.queue, "amqp transport connected");
        Ok((connection, channel))
    }

    async fn publish_on(
        &self,
        channel: &Channel,
        key: &[u8],
        value: &[u8],
    ) -> Result<(), TransportError> {
        let properties = BasicProperties::default()
            .with_delivery_mode(2)
            .with_message_id(ShortString::from(String::from_utf8_lossy(key).into_owned()));

        let confirm = channel
            .basic_publish(
                "",
                &self.queue,
                BasicPublishOptions::default(),
                value,
                properties,
            )
            .await
            .map_err(|e| TransportError::Publish(format!("publish to {}: {e}", self.queue)))?;
        let confirmation = confirm
            .await
            .map_err(|e| TransportError::Publish(format!("publish confirm: {e}")))?;
        check_confirmation(&self.queue, confirmation)
    }
}

fn check_confirmation(queue: &str, confirmation: Confirmation) -> Result<(), TransportError> {
    match confirmation {
        Confirmation::Ack(_) => Ok(()),
        Confirmation::Nack(_) => Err(TransportError::Publish(format!(
            "broker rejected message for {queue}"
        ))),
        Confirmation::NotRequested => Err(TransportError::Publish(format!(
            "channel for {queue} is not in confirm mode"
        ))),
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, key: &[u8], value: &[u8]) -> Result<(), TransportError> {
        let mut session = self.session.lock().await;
        if session.is_none() {
            *session = Some(self.connect().await?);
        }
        let Some((_, channel)) = session.as_ref() else {
            return Err(TransportError::Connect("amqp session missing".to_string()));
        };

        let result = self.publish_on(channel, key, value).await;
        if result.is_err() {
            *session = None;
        }
        result
    }
}
