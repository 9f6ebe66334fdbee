//! # Page-scoped named value lookup.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// Resolves named page values used to materialize loader parameters.
pub trait TokenResolver: Send + Sync + 'static {
    /// Returns the current value of `token`, or `None` while it is undefined.
    fn resolve(&self, token: &str) -> Option<String>;
}

/// Resolver for which every token is undefined.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTokens;

impl TokenResolver for NoTokens {
    fn resolve(&self, _token: &str) -> Option<String> {
        None
    }
}

/// Mutable in-memory token table.
#[derive(Default)]
pub struct TokenTable {
    values: Mutex<HashMap<String, String>>,
}

impl TokenTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Defines or overwrites a token.
    pub fn define(&self, token: impl Into<String>, value: impl Into<String>) {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(token.into(), value.into());
    }
}

impl TokenResolver for TokenTable {
    fn resolve(&self, token: &str) -> Option<String> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(token)
            .cloned()
    }
}
