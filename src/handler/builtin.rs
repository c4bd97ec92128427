//! Handlers shipped with the binary: email sending and broker publishing.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::{Handler, HandlerError, HandlerRegistry, TypedHandler};
use crate::error::Result;
use crate::transport::TransportRouter;

/// Payload of `send_email` work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Email {
    pub email: String,
    pub subject: String,
    pub body: String,
}

/// Delivers an email. The seam where an SMTP or API client plugs in.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: &Email) -> std::result::Result<(), HandlerError>;
}

/// Mailer that only logs. Used until a real provider is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, email: &Email) -> std::result::Result<(), HandlerError> {
        tracing::info!(to = %email.email, subject = %email.subject, "email sent");
        Ok(())
    }
}

/// `send_email` handler.
pub struct SendEmail<M> {
    mailer: M,
}

impl<M: Mailer> SendEmail<M> {
    pub fn new(mailer: M) -> Self {
        Self { mailer }
    }
}

#[async_trait]
impl<M: Mailer> TypedHandler for SendEmail<M> {
    type Payload = Email;

    async fn handle(&self, email: Email) -> std::result::Result<(), HandlerError> {
        if !email.email.contains('@') {
            return Err(HandlerError::permanent(format!(
                "invalid recipient address: {}",
                email.email
            )));
        }
        self.mailer.send(&email).await
    }
}

/// Forwards the raw payload through the transport router.
///
/// The message key is read from a top-level string (or number) field of the
/// JSON payload, so every event about the same entity carries the same key.
pub struct Publish {
    router: TransportRouter,
    key_field: String,
}

impl Publish {
    pub fn new(router: TransportRouter, key_field: impl Into<String>) -> Self {
        Self {
            router,
            key_field: key_field.into(),
        }
    }

    fn key(&self, payload: &[u8]) -> std::result::Result<String, HandlerError> {
        let value: serde_json::Value = serde_json::from_slice(payload)
            .map_err(|e| HandlerError::permanent(format!("undecodable payload: {e}")))?;
        match value.get(&self.key_field) {
            Some(serde_json::Value::String(s)) => Ok(s.clone()),
            Some(serde_json::Value::Number(n)) => Ok(n.to_string()),
            _ => Err(HandlerError::permanent(format!(
                "payload has no '{}' key",
                self.key_field
            ))),
        }
    }
}

#[async_trait]
impl Handler for Publish {
    async fn execute(&self, payload: &[u8]) -> std::result::Result<(), HandlerError> {
        let key = self.key(payload)?;
        match self.router.publish(key.as_bytes(), payload).await {
            Ok(route) => {
                tracing::debug!(key = %key, route = %route, "event published");
                Ok(())
            }
            Err(e) => Err(HandlerError::transient(e.to_string())),
        }
    }
}

/// Event types the binary publishes, with the payload field used as key.
pub const PUBLISHED_EVENTS: &[(&str, &str)] = &[
    ("order_created", "order_id"),
    ("payment_requested", "public_order_id"),
];

/// Register the shipped handlers: `send_email` always, the publish family
/// only when a router is configured.
pub fn register_builtins<M>(
    registry: &mut HandlerRegistry,
    mailer: M,
    router: Option<TransportRouter>,
) -> Result<()>
where
    M: Mailer + 'static,
{
    registry.register_json("send_email", SendEmail::new(mailer))?;

    let Some(router) = router else {
        tracing::info!("no transports configured, publish handlers disabled");
        return Ok(());
    };
    for (work_type, key_field) in PUBLISHED_EVENTS {
        let handler: Arc<dyn Handler> = Arc::new(Publish::new(router.clone(), *key_field));
        registry.register_arc(*work_type, handler)?;
    }
    Ok(())
}
