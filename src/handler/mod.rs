//! Handler trait and registry.
//!
//! A handler turns one work item's payload into a side effect (an email, a
//! broker message, a payment call). The registry maps a work item's type tag
//! to exactly one handler. Work whose type has no handler is dead-lettered by
//! the dispatcher.

pub mod builtin;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use crate::error::{Error, Result};

/// Why a handler could not finish an item.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    /// Worth retrying later: a downstream outage, a timeout.
    #[error("transient: {0}")]
    Transient(String),

    /// Retrying cannot help: malformed payload, rejected input.
    #[error("permanent: {0}")]
    Permanent(String),
}

impl HandlerError {
    pub fn transient(reason: impl Into<String>) -> Self {
        HandlerError::Transient(reason.into())
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        HandlerError::Permanent(reason.into())
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, HandlerError::Permanent(_))
    }
}

/// Executes work of one type.
///
/// Handlers must not hold on to the payload after returning; the item may be
/// retried on another dispatcher at any time afterwards.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn execute(&self, payload: &[u8]) -> std::result::Result<(), HandlerError>;
}

/// A handler over a typed payload. Wrap it in [`JsonHandler`] (or use
/// [`HandlerRegistry::register_json`]) to decode the stored JSON first.
#[async_trait]
pub trait TypedHandler: Send + Sync {
    type Payload: DeserializeOwned + Send;

    async fn handle(&self, payload: Self::Payload) -> std::result::Result<(), HandlerError>;
}

/// Decodes a JSON payload and passes it to a [`TypedHandler`]. A payload that
/// does not decode is a permanent failure.
pub struct JsonHandler<H> {
    inner: H,
}

impl<H> JsonHandler<H> {
    pub fn new(inner: H) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<H: TypedHandler> Handler for JsonHandler<H> {
    async fn execute(&self, payload: &[u8]) -> std::result::Result<(), HandlerError> {
        let decoded: H::Payload = serde_json::from_slice(payload)
            .map_err(|e| HandlerError::permanent(format!("undecodable payload: {e}")))?;
        self.inner.handle(decoded).await
    }
}

/// Adapts an async closure over the raw payload.
pub struct FnHandler<F> {
    f: F,
}

/// Build a handler from `Fn(Vec<u8>) -> impl Future<Output = Result<(), HandlerError>>`.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Vec<u8>) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<(), HandlerError>> + Send,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Vec<u8>) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<(), HandlerError>> + Send,
{
    async fn execute(&self, payload: &[u8]) -> std::result::Result<(), HandlerError> {
        (self.f)(payload.to_vec()).await
    }
}

/// Registry of handlers, indexed by work type.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `work_type`. Each type has at most one handler.
    pub fn register<H>(&mut self, work_type: impl Into<String>, handler: H) -> Result<()>
    where
        H: Handler + 'static,
    {
        self.register_arc(work_type, Arc::new(handler))
    }

    /// Register a handler that is shared with other owners.
    pub fn register_arc(
        &mut self,
        work_type: impl Into<String>,
        handler: Arc<dyn Handler>,
    ) -> Result<()> {
        let work_type = work_type.into();
        if self.handlers.contains_key(&work_type) {
            return Err(Error::AlreadyRegistered(work_type));
        }
        tracing::debug!(work_type = %work_type, "handler registered");
        self.handlers.insert(work_type, handler);
        Ok(())
    }

    /// Register a typed handler behind a JSON decoder.
    pub fn register_json<H>(&mut self, work_type: impl Into<String>, handler: H) -> Result<()>
    where
        H: TypedHandler + 'static,
    {
        self.register(work_type, JsonHandler::new(handler))
    }

    /// Look up the handler for a work type.
    pub fn get(&self, work_type: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(work_type).cloned()
    }

    pub fn contains(&self, work_type: &str) -> bool {
        self.handlers.contains_key(work_type)
    }

    /// Registered work types, sorted.
    pub fn work_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    struct Noop;

    #[async_trait]
    impl Handler for Noop {
        async fn execute(&self, _payload: &[u8]) -> std::result::Result<(), HandlerError> {
            Ok(())
        }
    }

    #[derive(Deserialize)]
    struct Greeting {
        name: String,
    }

    struct Greeter;

    #[async_trait]
    impl TypedHandler for Greeter {
        type Payload = Greeting;

        async fn handle(&self, payload: Greeting) -> std::result::Result<(), HandlerError> {
            if payload.name.is_empty() {
                return Err(HandlerError::permanent("empty name"));
            }
            Ok(())
        }
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = HandlerRegistry::new();
        registry.register("echo", Noop).unwrap();

        let err = registry.register("echo", Noop).unwrap_err();
        assert!(matches!(err, Error::AlreadyRegistered(t) if t == "echo"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn unknown_type_has_no_handler() {
        let mut registry = HandlerRegistry::new();
        registry.register("echo", Noop).unwrap();
        registry.register("audit", Noop).unwrap();

        assert!(registry.get("missing").is_none());
        assert!(registry.contains("echo"));
        assert_eq!(registry.work_types(), vec!["audit", "echo"]);
    }

    #[tokio::test]
    async fn json_handler_decodes_payload() {
        let handler = JsonHandler::new(Greeter);
        assert_eq!(handler.execute(br#"{"name":"ada"}"#).await, Ok(()));
        assert_eq!(
            handler.execute(br#"{"name":""}"#).await,
            Err(HandlerError::permanent("empty name"))
        );
    }

    #[tokio::test]
    async fn undecodable_json_is_permanent() {
        let handler = JsonHandler::new(Greeter);
        let err = handler.execute(b"not json").await.unwrap_err();
        assert!(err.is_permanent());
    }

    #[tokio::test]
    async fn closure_handler_sees_payload() {
        let handler = handler_fn(|payload: Vec<u8>| async move {
            if payload == b"ok" {
                Ok(())
            } else {
                Err(HandlerError::transient("try again"))
            }
        });
        assert!(handler.execute(b"ok").await.is_ok());
        assert!(!handler.execute(b"no").await.unwrap_err().is_permanent());
    }
}
