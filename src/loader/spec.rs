//! # Loader declaration.
//!
//! [`LoaderSpec`] collects every per-loader knob with a fluent API; a
//! [`Loader`](crate::Loader) is created from it inside a
//! [`Context`](crate::Context).
//!
//! ```rust
//! use tagvisor::{Location, LoaderSpec, Parameter, Timeout};
//!
//! let spec = LoaderSpec::new("analytics")
//!     .with_timeout(Timeout::millis(2_000))
//!     .with_url("https://cdn.test/analytics.js")
//!     .with_location(Location::Body)
//!     .with_parameter(Parameter::new("account", "page.account").with_default("anon"))
//!     .with_payload(|params| {
//!         let _account = params.get("account");
//!         Ok(())
//!     });
//!
//! assert_eq!(spec.name(), "analytics");
//! ```

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use crate::error::LoaderError;
use crate::filters::Filter;
use crate::host::Location;

use super::loader::Loader;
use super::timeout::Timeout;

/// Payload executed once dependencies, URLs and content are in place.
pub type Payload = Arc<dyn Fn(&Parameters) -> anyhow::Result<()> + Send + Sync>;

/// Pre-execution hook. Returning `false` vetoes the run.
pub type BeforeHook = Arc<dyn Fn(&Loader) -> bool + Send + Sync>;

/// Post-execution hook.
pub type AfterHook = Arc<dyn Fn(&Loader) + Send + Sync>;

/// Error hook, called with every failure the loader records.
pub type ErrorHook = Arc<dyn Fn(&Loader, &LoaderError) + Send + Sync>;

/// A named value the payload receives, resolved from a page token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parameter {
    name: String,
    token: String,
    default: Option<String>,
}

impl Parameter {
    /// Declares parameter `name`, resolved from `token`.
    pub fn new(name: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            token: token.into(),
            default: None,
        }
    }

    /// Value used when the token is still unresolved at the timeout.
    pub fn with_default(mut self, value: impl Into<String>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn default_value(&self) -> Option<&str> {
        self.default.as_deref()
    }
}

/// Resolved parameters handed to the payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Parameters {
    values: Vec<(String, String)>,
}

impl Parameters {
    pub(crate) fn push(&mut self, name: &str, value: String) {
        self.values.push((name.to_string(), value));
    }

    /// Returns the value of parameter `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Iterates over `(name, value)` pairs in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Boolean dependency polled until it holds.
#[derive(Clone)]
pub struct Predicate {
    label: Cow<'static, str>,
    check: Arc<dyn Fn() -> bool + Send + Sync>,
}

impl Predicate {
    pub fn new<F>(label: impl Into<Cow<'static, str>>, check: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        Self {
            label: label.into(),
            check: Arc::new(check),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn holds(&self) -> bool {
        (self.check)()
    }
}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Predicate").field(&self.label).finish()
    }
}

#[derive(Clone, Default)]
pub(crate) struct Hooks {
    pub before: Option<BeforeHook>,
    pub after: Option<AfterHook>,
    pub on_error: Option<ErrorHook>,
}

/// Declaration of one loader.
#[derive(Clone)]
pub struct LoaderSpec {
    pub(crate) name: Arc<str>,
    pub(crate) timeout: Option<Timeout>,
    pub(crate) is_async: bool,
    pub(crate) no_multiple_load: bool,
    pub(crate) urls: Vec<String>,
    pub(crate) content: Option<String>,
    pub(crate) location: Location,
    pub(crate) at_start: bool,
    pub(crate) uses_output_stream: bool,
    pub(crate) parameters: Vec<Parameter>,
    pub(crate) predicates: Vec<Predicate>,
    pub(crate) filters: Vec<Arc<Filter>>,
    pub(crate) filter_timeout: Timeout,
    pub(crate) hooks: Hooks,
    pub(crate) payload: Option<Payload>,
    pub(crate) dedupe: bool,
    pub(crate) disabled: bool,
    pub(crate) inactive: bool,
    pub(crate) needs_consent: bool,
    pub(crate) locked: bool,
}

impl LoaderSpec {
    /// Starts a declaration. The timeout defaults to the context's
    /// `default_timeout`; the filter-wait timeout to `Infinite`.
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            timeout: None,
            is_async: true,
            no_multiple_load: false,
            urls: Vec::new(),
            content: None,
            location: Location::default(),
            at_start: false,
            uses_output_stream: false,
            parameters: Vec::new(),
            predicates: Vec::new(),
            filters: Vec::new(),
            filter_timeout: Timeout::Infinite,
            hooks: Hooks::default(),
            payload: None,
            dedupe: false,
            disabled: false,
            inactive: false,
            needs_consent: false,
            locked: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn with_timeout(mut self, timeout: Timeout) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Loads URLs asynchronously (default `true`).
    pub fn with_async(mut self, is_async: bool) -> Self {
        self.is_async = is_async;
        self
    }

    /// Turns every `run()` into `run_once()`.
    pub fn no_multiple_load(mut self) -> Self {
        self.no_multiple_load = true;
        self
    }

    /// Appends a URL. URLs load in declaration order.
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.urls.push(url.into());
        self
    }

    /// Markup injected after the URLs have loaded.
    pub fn with_content(mut self, html: impl Into<String>) -> Self {
        self.content = Some(html.into());
        self
    }

    pub fn with_location(mut self, location: Location) -> Self {
        self.location = location;
        self
    }

    /// Injects content at the start of the location instead of the end.
    pub fn at_start(mut self) -> Self {
        self.at_start = true;
        self
    }

    /// Requires the context's output lock before executing.
    pub fn uses_output_stream(mut self) -> Self {
        self.uses_output_stream = true;
        self
    }

    pub fn with_parameter(mut self, parameter: Parameter) -> Self {
        self.parameters.push(parameter);
        self
    }

    /// Adds a boolean dependency, polled until it returns `true`.
    pub fn with_predicate<F>(mut self, label: impl Into<Cow<'static, str>>, check: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.predicates.push(Predicate::new(label, check));
        self
    }

    pub fn with_filter(mut self, filter: Arc<Filter>) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_filters(mut self, filters: impl IntoIterator<Item = Arc<Filter>>) -> Self {
        self.filters.extend(filters);
        self
    }

    /// Bounds how long filter retries may keep the loader waiting.
    pub fn with_filter_timeout(mut self, timeout: Timeout) -> Self {
        self.filter_timeout = timeout;
        self
    }

    pub fn before<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Loader) -> bool + Send + Sync + 'static,
    {
        self.hooks.before = Some(Arc::new(hook));
        self
    }

    pub fn after<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Loader) + Send + Sync + 'static,
    {
        self.hooks.after = Some(Arc::new(hook));
        self
    }

    pub fn on_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Loader, &LoaderError) + Send + Sync + 'static,
    {
        self.hooks.on_error = Some(Arc::new(hook));
        self
    }

    pub fn with_payload<F>(mut self, payload: F) -> Self
    where
        F: Fn(&Parameters) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.payload = Some(Arc::new(payload));
        self
    }

    /// Takes part in deduplicated accounting.
    pub fn dedupe(mut self) -> Self {
        self.dedupe = true;
        self
    }

    /// Skipped by containers unless a storage override lists it.
    pub fn disabled(mut self) -> Self {
        self.disabled = true;
        self
    }

    /// Never admitted by containers.
    pub fn inactive(mut self) -> Self {
        self.inactive = true;
        self
    }

    /// Admitted by containers only after consent.
    pub fn needs_consent(mut self) -> Self {
        self.needs_consent = true;
        self
    }

    /// Admitted by containers but not fired until `Loader::unlock`.
    pub fn locked(mut self) -> Self {
        self.locked = true;
        self
    }
}

impl fmt::Debug for LoaderSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoaderSpec")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .field("urls", &self.urls)
            .field("location", &self.location)
            .field("uses_output_stream", &self.uses_output_stream)
            .field("parameters", &self.parameters)
            .field("predicates", &self.predicates)
            .field("filters", &self.filters.len())
            .finish()
    }
}
