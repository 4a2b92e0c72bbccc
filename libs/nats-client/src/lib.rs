//! # nats-client
//!
//! Async NATS client built on top of a [`nats_core::Engine`].
//!
//! This library provides:
//! - **[`NatsClient`]** with a connection state machine
//!   (`idle → connecting → connected → closing → closed`, or `failed`),
//!   idempotent graceful shutdown and observable transitions.
//! - **[`Subscription`]** streams that turn native callback delivery into a
//!   `futures::Stream` of [`NatsMessage`] values, releasing every native
//!   resource exactly once however the stream ends.
//! - **Request/reply** on the blocking pool with an outer timeout guard.
//! - **[`Service`] / [`ServiceGroup`]** to run the client next to other
//!   services under one graceful-shutdown token.
//!
//! ## Threading
//!
//! Engines deliver messages on threads they own and their primitives may
//! block. The client never calls a blocking primitive on an async worker;
//! those go through `spawn_blocking`.
#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![allow(clippy::cognitive_complexity)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod client;
pub mod config;
pub mod context;
pub mod message;
pub mod metrics;
pub mod service;
pub mod state;
pub mod subscription;

pub use client::NatsClient;
pub use config::{AuthMode, ClientConfig};
pub use context::{ContextKey, ContextRegistry, ContextStats};
pub use message::NatsMessage;
pub use service::{Service, ServiceGroup};
pub use state::{ClientState, ConnectionState};
pub use subscription::Subscription;

pub use nats_core::{NatsError, NatsResult};
