//! Webhook delivery pipeline: signed dispatch, retry scheduling, fan-out.
//!
//! This crate turns ledger rows from `herald-core` into outbound HTTP
//! requests. It fans business events out to subscribed endpoints, signs
//! every request with the endpoint's current secret, and walks failed
//! deliveries through exponential backoff until they succeed or
//! dead-letter.
//!
//! # Architecture
//!
//! Producers hand events to the [`FanoutRouter`], which creates one
//! delivery per subscribed endpoint and dispatches each through the
//! [`Dispatcher`]. Deliveries whose attempt fails retryably wait in the
//! ledger; the [`SchedulerPool`] runs polling workers that claim due
//! retries with `FOR UPDATE SKIP LOCKED` and dispatch them again:
//!
//! 1. **Fan out** - resolve active subscribers, create ledger rows
//! 2. **Dispatch** - sign, POST, append to the attempt log
//! 3. **Settle** - mark success, schedule a retry, or dead-letter
//! 4. **Sweep** - scheduler workers claim and redispatch due retries
//!
//! # Key properties
//!
//! - **Exactly one claimant** - atomic claim-on-select means no delivery
//!   is ever dispatched twice concurrently
//! - **Isolated failures** - one broken endpoint never blocks fan-out to
//!   the others
//! - **Immutable audit trail** - every HTTP try lands in the append-only
//!   attempt log, sensitive headers redacted
//! - **Graceful shutdown** - workers finish in-flight deliveries inside a
//!   grace period
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use herald_core::time::RealClock;
//! use herald_delivery::{
//!     ClientConfig, DeliveryClient, Dispatcher, RetryPolicy, SchedulerConfig, SchedulerPool,
//! };
//!
//! # async fn example(
//! #     storage: Arc<dyn herald_delivery::DeliveryStorage>,
//! # ) -> herald_delivery::Result<()> {
//! let clock = Arc::new(RealClock::new());
//! let client = Arc::new(DeliveryClient::new(ClientConfig::default())?);
//! let dispatcher =
//!     Arc::new(Dispatcher::new(storage.clone(), client, RetryPolicy::default(), clock.clone()));
//!
//! let mut pool = SchedulerPool::new(storage, dispatcher, SchedulerConfig::default(), clock);
//! pool.spawn_workers().await;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod client;
pub mod dispatcher;
pub mod error;
pub mod retry;
pub mod router;
pub mod scheduler;
pub mod storage;
pub mod worker_pool;

pub use client::{ClientConfig, DeliveryClient, DeliveryRequest, DeliveryResponse};
pub use dispatcher::{DispatchOutcome, Dispatcher};
pub use error::{DeliveryError, ErrorCategory, Result};
pub use retry::{RetryContext, RetryDecision, RetryPolicy};
pub use router::{FanoutReport, FanoutRouter};
pub use scheduler::{RetryScheduler, SchedulerConfig, SchedulerStats};
pub use storage::{DeliveryStorage, PostgresDeliveryStorage};
pub use worker_pool::SchedulerPool;

/// Default number of concurrent scheduler workers.
pub const DEFAULT_WORKER_COUNT: usize = 3;

/// Default batch size for claiming due deliveries.
pub const DEFAULT_BATCH_SIZE: usize = 10;
