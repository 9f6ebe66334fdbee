//! Host collaborators consumed by the engine.
//!
//! ## Contents
//! - [`Surface`] fetch, inject and output-channel capture
//! - [`Store`], [`Codec`] durable storage and its value codec
//! - [`TelemetrySink`] outbound telemetry
//! - [`TokenResolver`] named page values
//!
//! Each trait ships a trivial implementation so a [`Context`](crate::Context)
//! can be built with only the collaborators a host actually has.

mod store;
mod surface;
mod telemetry;
mod tokens;

pub use store::{Codec, IdentityCodec, MemoryStore, Store};
pub use surface::{Completion, Location, NullSurface, OutputBuffer, Surface};
pub use telemetry::{NullTelemetry, TelemetrySink};
pub use tokens::{NoTokens, TokenResolver, TokenTable};
