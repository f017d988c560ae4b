//! Core domain model for the herald outbound webhook delivery engine.
//!
//! Provides the shared vocabulary of the delivery pipeline: strongly-typed
//! identifiers, the delivery state machine, HMAC request signing, a clock
//! abstraction for deterministic tests, and PostgreSQL repositories for
//! endpoints, deliveries, and the append-only attempt log.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod models;
pub mod signer;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use models::{
    Delivery, DeliveryAttempt, DeliveryId, DeliveryStatus, Endpoint, EndpointId, NewEndpoint,
};
pub use storage::Storage;
