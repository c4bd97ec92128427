//! Downstream transports and the primary/secondary router.
//!
//! A [`TransportRouter`] owns two interchangeable transports. Each one is
//! either Available or Unavailable. A failed publish flips the transport to
//! Unavailable, and the caller that performed that flip spawns the single
//! recovery probe, which flips it back after the cooldown without testing
//! it. The next publish then tries the transport for real.

pub mod amqp;
pub mod redis_stream;

use async_trait::async_trait;
use opentelemetry::KeyValue;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::telemetry::metrics;

pub use amqp::AmqpTransport;
pub use redis_stream::RedisStreamTransport;

/// Failure to hand a message to a downstream system.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("publish failed: {0}")]
    Publish(String),
}

/// Something that accepts keyed messages: a broker queue, a stream.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short name for logs and metrics.
    fn name(&self) -> &str;

    async fn publish(&self, key: &[u8], value: &[u8]) -> std::result::Result<(), TransportError>;
}

/// Which of the router's transports accepted a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Primary,
    Secondary,
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Route::Primary => write!(f, "primary"),
            Route::Secondary => write!(f, "secondary"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Available,
    Unavailable,
}

struct Slot {
    transport: Arc<dyn Transport>,
    available: AtomicBool,
    /// Number of Available -> Unavailable flips, which equals probes spawned.
    outages: AtomicU64,
}

impl Slot {
    fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            available: AtomicBool::new(true),
            outages: AtomicU64::new(0),
        }
    }

    fn state(&self) -> TransportState {
        if self.available.load(Ordering::Acquire) {
            TransportState::Available
        } else {
            TransportState::Unavailable
        }
    }
}

/// Routes publishes to the primary transport, falling back to the secondary.
///
/// Cheap to clone; clones share transport state.
#[derive(Clone)]
pub struct TransportRouter {
    primary: Arc<Slot>,
    secondary: Arc<Slot>,
    cooldown: Duration,
}

impl TransportRouter {
    /// Both transports start Available.
    pub fn new(
        primary: Arc<dyn Transport>,
        secondary: Arc<dyn Transport>,
        cooldown: Duration,
    ) -> Self {
        Self {
            primary: Arc::new(Slot::new(primary)),
            secondary: Arc::new(Slot::new(secondary)),
            cooldown,
        }
    }

    fn slot(&self, route: Route) -> &Arc<Slot> {
        match route {
            Route::Primary => &self.primary,
            Route::Secondary => &self.secondary,
        }
    }

    pub fn state(&self, route: Route) -> TransportState {
        self.slot(route).state()
    }

    /// How many times `route` has been marked Unavailable.
    pub fn outages(&self, route: Route) -> u64 {
        self.slot(route).outages.load(Ordering::Relaxed)
    }

    /// Publish through the first Available transport that accepts the
    /// message. Returns the route that took it.
    ///
    /// Fails with [`Error::AllTransportsUnavailable`] when both transports
    /// are Unavailable or both fail on this call.
    pub async fn publish(&self, key: &[u8], value: &[u8]) -> Result<Route> {
        let mut last_error: Option<String> = None;

        for route in [Route::Primary, Route::Secondary] {
            let slot = self.slot(route);
            if slot.state() == TransportState::Unavailable {
                tracing::debug!(route = %route, transport = slot.transport.name(), "transport unavailable, skipping");
                continue;
            }

            let name = slot.transport.name().to_string();
            match slot.transport.publish(key, value).await {
                Ok(()) => {
                    metrics::transport_publishes().add(
                        1,
                        &[
                            KeyValue::new("transport", name),
                            KeyValue::new("result", "ok"),
                        ],
                    );
                    return Ok(route);
                }
                Err(e) => {
                    tracing::warn!(route = %route, transport = %name, error = %e, "publish failed");
                    metrics::transport_publishes().add(
                        1,
                        &[
                            KeyValue::new("transport", name),
                            KeyValue::new("result", "error"),
                        ],
                    );
                    last_error = Some(e.to_string());
                    self.mark_unavailable(route);
                }
            }
        }

        Err(Error::AllTransportsUnavailable {
            last_error: last_error.unwrap_or_else(|| "no transport available".to_string()),
        })
    }

    /// Flip `route` to Unavailable. Only the caller whose compare-and-swap
    /// wins spawns the recovery probe.
    fn mark_unavailable(&self, route: Route) {
        let slot = Arc::clone(self.slot(route));
        if slot
            .available
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        slot.outages.fetch_add(1, Ordering::Relaxed);
        record_state_change(slot.transport.name(), TransportState::Unavailable);
        tracing::warn!(
            route = %route,
            transport = slot.transport.name(),
            cooldown_ms = self.cooldown.as_millis() as u64,
            "transport marked unavailable"
        );

        let cooldown = self.cooldown;
        tokio::spawn(async move {
            tokio::time::sleep(cooldown).await;
            slot.available.store(true, Ordering::Release);
            record_state_change(slot.transport.name(), TransportState::Available);
            tracing::info!(route = %route, transport = slot.transport.name(), "transport marked available");
        });
    }
}

fn record_state_change(transport: &str, state: TransportState) {
    let state = match state {
        TransportState::Available => "available",
        TransportState::Unavailable => "unavailable",
    };
    metrics::transport_state_changes().add(
        1,
        &[
            KeyValue::new("transport", transport.to_string()),
            KeyValue::new("state", state),
        ],
    );
}
