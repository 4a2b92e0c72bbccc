//! # nats-core
//!
//! Low-level access to a NATS protocol engine.
//!
//! The protocol engine owns the wire protocol, TLS, reconnection and the
//! threads that deliver messages. This crate describes the primitives the
//! rest of the workspace needs from it and wraps the resources it hands out
//! in single-owner handles:
//!
//! - **[`Engine`]**: the raw primitives (options, connect, publish,
//!   subscribe, request, unsubscribe/drain, status) keyed by opaque ids.
//! - **Handles**: [`OptionsHandle`], [`ConnectionHandle`],
//!   [`SubscriptionHandle`] release their engine resource on drop;
//!   [`MessageHandle`] is a borrowed view that cannot outlive the delivery
//!   callback it was handed to.
//! - **[`Status`] / [`NatsError`]**: native status codes and the error
//!   taxonomy they translate into.
//! - **Engines**: [`MemoryEngine`], an in-process broker with
//!   instrumentation and fault injection, and [`RemoteEngine`], which talks to
//!   a real server through `async-nats`.
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

pub mod engine;
pub mod error;
pub mod handle;
pub mod memory;
pub mod remote;
pub mod status;
pub mod subject;

pub use bytes::Bytes;

pub use engine::{
    Closure, ConnStatus, Engine, MsgCallback, RawConnection, RawOptions, RawSubscription,
    ReconnectPolicy,
};
pub use error::{NatsError, NatsResult};
pub use handle::{
    ConnectionHandle, MessageHandle, NativeMessage, OptionsHandle, SubscriptionHandle,
};
pub use memory::{EngineStats, MemoryEngine};
pub use remote::RemoteEngine;
pub use status::Status;
