//! # Rendering surface contract.
//!
//! The engine never fetches or injects anything itself: it asks a [`Surface`]
//! and waits for the completion callback. Completions may be invoked
//! synchronously from inside the call or later from any thread.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

/// One-shot completion callback handed to a collaborator.
pub type Completion<T> = Box<dyn FnOnce(T) + Send + 'static>;

/// Where content and scripts are attached.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum Location {
    /// Document head.
    #[default]
    Head,
    /// Document body.
    Body,
    /// A named element (e.g. an element id).
    Element(String),
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Head => f.write_str("head"),
            Location::Body => f.write_str("body"),
            Location::Element(id) => write!(f, "#{id}"),
        }
    }
}

/// Ordered private buffer that captures the shared output channel while a
/// loader holds the output-stream lock.
///
/// Cheap to clone; clones share the same buffer.
#[derive(Clone, Default)]
pub struct OutputBuffer {
    chunks: Arc<Mutex<Vec<String>>>,
}

impl OutputBuffer {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk of output.
    pub fn write(&self, chunk: impl Into<String>) {
        self.chunks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(chunk.into());
    }

    /// Returns `true` if nothing was written.
    pub fn is_empty(&self) -> bool {
        self.chunks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    /// Drains the buffer, concatenating chunks in write order.
    pub fn take(&self) -> String {
        let chunks =
            std::mem::take(&mut *self.chunks.lock().unwrap_or_else(PoisonError::into_inner));
        chunks.concat()
    }
}

impl fmt::Debug for OutputBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputBuffer")
            .field("empty", &self.is_empty())
            .finish()
    }
}

/// Fetch/inject collaborator.
pub trait Surface: Send + Sync + 'static {
    /// Fetches and attaches one external resource; reports success or failure.
    fn inject_script(&self, url: &str, location: &Location, is_async: bool, on_complete: Completion<bool>);

    /// Inserts markup at `location`, at its start or end.
    ///
    /// Implementations re-enter for nested script fetches and call
    /// `on_complete` once everything nested has finished.
    fn inject_content(&self, location: &Location, at_start: bool, html: &str, on_complete: Completion<()>);

    /// Starts capturing the shared synchronous output channel into `buffer`.
    fn redirect_output(&self, buffer: OutputBuffer);

    /// Restores the original output channel.
    fn restore_output(&self);

    /// Returns `true` once `location` exists and can receive content.
    fn is_ready(&self, _location: &Location) -> bool {
        true
    }
}

/// Surface that completes every request immediately and successfully.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSurface;

impl Surface for NullSurface {
    fn inject_script(&self, _url: &str, _location: &Location, _is_async: bool, on_complete: Completion<bool>) {
        on_complete(true);
    }

    fn inject_content(&self, _location: &Location, _at_start: bool, _html: &str, on_complete: Completion<()>) {
        on_complete(());
    }

    fn redirect_output(&self, _buffer: OutputBuffer) {}

    fn restore_output(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_keeps_write_order() {
        let buf = OutputBuffer::new();
        let other = buf.clone();
        buf.write("<p>");
        other.write("hi");
        buf.write("</p>");
        assert_eq!(buf.take(), "<p>hi</p>");
        assert!(other.is_empty());
    }

    #[test]
    fn test_location_display() {
        assert_eq!(Location::Element("slot".into()).to_string(), "#slot");
        assert_eq!(Location::default().to_string(), "head");
    }
}
