//! Runtime events: types and broadcast bus.
//!
//! This module groups the event **data model** and the **bus** used to
//! publish/subscribe to runtime events emitted by loaders, the filter
//! admission path, containers and subscriber workers.
//!
//! ## Contents
//! - [`EventKind`], [`Event`] event classification and payload metadata
//! - [`Bus`] thin wrapper over `tokio::sync::broadcast`
//!
//! ## Quick reference
//! - **Publishers**: `Loader`, `Container`, `SubscriberSet` workers (overflow/panic).
//! - **Consumers**: the listener spawned by `ContextBuilder::build` (fans out to
//!   `SubscriberSet`), and anyone holding `Context::bus().subscribe()`.

mod bus;
mod event;

pub use bus::Bus;
pub use event::{Event, EventKind};
