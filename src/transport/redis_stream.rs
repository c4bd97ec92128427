//! Redis Streams transport: one `XADD` per message.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::Mutex;

use super::{Transport, TransportError};

pub struct RedisStreamTransport {
    name: String,
    url: SecretString,
    stream: String,
    conn: Mutex<Option<ConnectionManager>>,
}

impl RedisStreamTransport {
    pub fn new(url: SecretString, stream: impl Into<String>) -> Self {
        Self {
            name: "redis".to_string(),
            url,
            stream: stream.into(),
            conn: Mutex::new(None),
        }
    }

    async fn connect(&self) -> Result<ConnectionManager, TransportError> {
        let client = redis::Client::open(self.url.expose_secret())
            .map_err(|e| TransportError::Connect(format!("redis client: {e}")))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| TransportError::Connect(format!("redis connect: {e}")))?;
        tracing::info!(stream = %self.stream, "redis transport connected");
        Ok(conn)
    }
}

#[async_trait]
impl Transport for RedisStreamTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, key: &[u8], value: &[u8]) -> Result<(), TransportError> {
        let mut guard = self.conn.lock().await;
        let mut conn = match guard.as_ref() {
            Some(conn) => conn.clone(),
            None => {
                let conn = self.connect().await?;
                *guard = Some(conn.clone());
                conn
            }
        };

        let result: redis::RedisResult<String> = redis::cmd("XADD")
            .arg(&self.stream)
            .arg("*")
            .arg("key")
            .arg(key)
            .arg("value")
            .arg(value)
            .query_async(&mut conn)
            .await;

        match result {
            Ok(entry_id) => {
                tracing::debug!(stream = %self.stream, entry_id = %entry_id, "stream entry added");
                Ok(())
            }
            Err(e) => {
                *guard = None;
                Err(TransportError::Publish(format!("XADD {}: {e}", self.stream)))
            }
        }
    }
}
