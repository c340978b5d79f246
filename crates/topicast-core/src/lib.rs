//! # topicast-core
//!
//! Broker and subscription primitives for the topicast pub/sub server.
//!
//! This crate provides the in-memory fan-out engine:
//!
//! - **Broker** - concurrency-safe topic registry and publish fan-out
//! - **Subscription** - one consumer's attachment to a topic, with its
//!   own delivery conduit and unique identity
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   publish    ┌───────────┐   conduit    ┌──────────────┐
//! │ Publisher │─────────────▶│  Broker   │─────────────▶│ Subscription │
//! └───────────┘              └───────────┘              └──────────────┘
//!                                  │
//!                                  ▼
//!                          topic → subscribers
//! ```
//!
//! The broker is payload-agnostic: `Broker<T>` delivers whatever value
//! type the transport layer hands it. Serialization stays outside this
//! crate.

pub mod broker;
pub mod subscription;

pub use broker::{Broker, BrokerConfig, BrokerError, BrokerStats};
pub use subscription::{Subscription, SubscriptionId, TryRecvError};
