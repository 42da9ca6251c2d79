#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod adapter;
pub mod bridge;
pub mod buffer;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod janitor;
pub mod mapping;
pub mod message;
pub mod stats;
pub mod store;
pub mod transform;

/// Egress delivery contract and the ingress routing entry point.
pub use self::adapter::{AdapterRegistry, EgressAdapter, IngressEvent, IngressRouter, Outcome};
/// Process-lifetime wiring.
pub use self::bridge::{Bridge, BridgeHandle};
/// The public enqueue / claim / complete / fail surface.
pub use self::buffer::{Buffer, BufferOptions, EnqueueRequest};
/// YAML configuration loader.
pub use self::config::BridgeConfig;
/// Crate-wide error taxonomy.
pub use self::error::BridgeError;
/// Message vocabulary.
pub use self::message::{DataType, Destination, Message, Priority, Source, Status};
/// Durable SQLite-backed storage.
pub use self::store::Store;
