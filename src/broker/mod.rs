//! Control plane: message model, transport capability, backends and the connection.
//!
//! ## Contents
//! - [`ControlMessage`], [`Settle`] what travels over the bus and how it is settled
//! - [`Transport`], [`Session`], [`Subscription`] the one capability every backend implements
//! - [`MemoryTransport`] in-process hub (tests, `memory` backend)
//! - [`RedisTransport`] Redis pub/sub (feature `redis`)
//! - [`BrokerConnection`] reconnect, heartbeat, loopback suppression, sequential dispatch

mod connection;
mod memory;
mod message;
#[cfg(feature = "redis")]
mod redis;
mod transport;

pub use connection::{BrokerConnection, ConnectionState, Publisher};
pub use memory::MemoryTransport;
pub use message::{ControlMessage, Settle};
#[cfg(feature = "redis")]
pub use self::redis::RedisTransport;
pub use transport::{subject_matches, Session, Subscription, Transport};
