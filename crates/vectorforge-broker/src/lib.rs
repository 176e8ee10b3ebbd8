//! # Vectorforge Broker
//!
//! Self-healing connection core for an AMQP 0-9-1 broker: a bounded
//! connection pool, per-connection channel sub-pools with QoS, a
//! background health loop, and transient-failure recovery. The broker
//! client itself is a capability: adapters implement
//! [`transport::BrokerTransport`] and friends.

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    clippy::all
)]
#![deny(unsafe_code)]

pub mod config;
pub mod manager;
pub mod transport;

pub use config::{BrokerConfig, BrokerTlsConfig};
pub use manager::{BrokerConnectionManager, ManagerStats, ScopedChannel, ScopedConnection};
pub use transport::{
    BrokerChannel, BrokerConnection, BrokerError, BrokerResult, BrokerTransport, ConnectParams,
    Delivery, DeliveryHandler, FailureClass, TlsParams,
};
