//! Broker capability traits and transport-level errors.
//!
//! Adapters implement these traits over a concrete AMQP client; the
//! connection core never names one. Error classification drives the
//! retry policy: credential failures are fatal, network failures and
//! timeouts are transient.

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use thiserror::Error;

/// Result type for broker operations
pub type BrokerResult<T> = std::result::Result<T, BrokerError>;

/// Errors raised by the broker connection core
#[derive(Error, Debug, Clone)]
pub enum BrokerError {
    /// Connection-level failure
    #[error("connection failed: {0}")]
    Connection(String),

    /// Channel-level failure
    #[error("channel operation failed: {0}")]
    Channel(String),

    /// A bounded broker operation exceeded its budget
    #[error("broker operation timed out: {0}")]
    Timeout(String),

    /// Credential failure; never retried
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The manager is shut down; outstanding borrows fail with this
    #[error("connection manager is shut down")]
    Shutdown,
}

/// Whether an error is worth another attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Retry with backoff
    Transient,
    /// Surface immediately
    Fatal,
}

impl BrokerError {
    /// Classify for the retry policy
    #[must_use]
    pub const fn classify(&self) -> FailureClass {
        match self {
            Self::Connection(_) | Self::Channel(_) | Self::Timeout(_) => FailureClass::Transient,
            Self::Authentication(_) | Self::Shutdown => FailureClass::Fatal,
        }
    }

    /// Short stable name for metrics labels
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Connection(_) => "connection",
            Self::Channel(_) => "channel",
            Self::Timeout(_) => "timeout",
            Self::Authentication(_) => "authentication",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Parameters passed to a robust connect
#[derive(Debug, Clone)]
pub struct ConnectParams {
    /// Connection name advertised to the broker
    pub connection_name: String,
    /// Enable publisher confirms
    pub publisher_confirms: bool,
    /// TLS material, when enabled
    pub tls: Option<TlsParams>,
}

/// TLS parameters for a broker connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsParams {
    /// Verify the broker certificate
    pub verify: bool,
    /// Client certificate path
    pub cert_file: Option<String>,
    /// Client key path
    pub key_file: Option<String>,
}

/// One message delivered to a consumer
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Routing key the message arrived with
    pub routing_key: String,
    /// Message payload
    pub body: Bytes,
    /// Tag used to ack or nack
    pub delivery_tag: u64,
}

/// Handler invoked per delivered message
pub type DeliveryHandler =
    Box<dyn Fn(Delivery) -> BoxFuture<'static, BrokerResult<()>> + Send + Sync>;

/// Robust-connect capability over one broker
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    /// Establish a connection, reconnect-capable on the adapter side
    async fn connect(&self, url: &str, params: &ConnectParams)
    -> BrokerResult<Box<dyn BrokerConnection>>;
}

/// An established broker connection
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Open a new channel on this connection
    async fn open_channel(&self) -> BrokerResult<Box<dyn BrokerChannel>>;

    /// Whether the connection has been closed
    fn is_closed(&self) -> bool;

    /// Close the connection
    async fn close(&self) -> BrokerResult<()>;
}

/// A channel multiplexed over a connection
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Set consumer prefetch
    async fn set_qos(&self, prefetch: u16) -> BrokerResult<()>;

    /// Publish a message
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Bytes,
        persistent: bool,
    ) -> BrokerResult<()>;

    /// Declare an exchange
    async fn declare_exchange(&self, name: &str, kind: &str, durable: bool) -> BrokerResult<()>;

    /// Declare a queue
    async fn declare_queue(&self, name: &str, durable: bool) -> BrokerResult<()>;

    /// Bind a queue to an exchange
    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str)
    -> BrokerResult<()>;

    /// Start consuming a queue, invoking `handler` per delivery
    async fn consume(&self, queue: &str, handler: DeliveryHandler) -> BrokerResult<()>;

    /// Acknowledge a delivery
    async fn ack(&self, delivery_tag: u64) -> BrokerResult<()>;

    /// Reject a delivery, optionally requeueing it
    async fn nack(&self, delivery_tag: u64, requeue: bool) -> BrokerResult<()>;

    /// Whether the channel is open
    fn is_open(&self) -> bool;

    /// Close the channel
    async fn close(&self) -> BrokerResult<()>;
}
