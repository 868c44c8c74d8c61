//! Transport to external capability providers.
//!
//! A provider is reached through an authority string (package id plus a
//! fixed suffix) and answers a small fixed verb set. Requests and replies
//! are flat JSON object maps ("extras"); keys starting with `_` are reserved
//! for the protocol itself (`_tool`, `_error`, `_target`, ...).

pub mod process;

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub use process::ProcessTransport;

/// Request/reply payload exchanged with a provider.
pub type Extras = Map<String, Value>;

/// Verbs every provider understands.
pub mod verbs {
    pub const GET_SCHEMA: &str = "get_schema";
    pub const GET_SCREEN: &str = "get_screen";
    pub const READ_SCREEN: &str = "read_screen";
    pub const CALL_TOOL: &str = "call_tool";
    pub const INVOKE_ACTION: &str = "invoke_action";
}

/// Reserved reply key carrying a provider-side error message.
pub const ERROR_KEY: &str = "_error";

/// Default bound on a single cross-process call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Failure to complete a provider call.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("provider call timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
    #[error("provider returned no result")]
    NoResult,
    #[error("{0}")]
    Remote(String),
    #[error("malformed provider reply: {0}")]
    Protocol(String),
}

/// Where a resolved provider lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderInfo {
    /// Package that owns the provider
    pub package: String,
}

/// Asynchronous access to providers.
#[async_trait]
pub trait ProviderTransport: Send + Sync {
    /// Look up the provider registered under `authority`. `Ok(None)` means
    /// nothing is there, which is not an error.
    async fn resolve(&self, authority: &str) -> Result<Option<ProviderInfo>, ProviderError>;

    /// Invoke `verb` on the provider at `authority`.
    async fn call(&self, authority: &str, verb: &str, extras: Extras)
        -> Result<Extras, ProviderError>;

    /// Drop anything cached about installed providers. Called before each
    /// discovery scan.
    async fn refresh(&self) {}
}

#[async_trait]
impl<T: ProviderTransport + ?Sized> ProviderTransport for Arc<T> {
    async fn resolve(&self, authority: &str) -> Result<Option<ProviderInfo>, ProviderError> {
        (**self).resolve(authority).await
    }

    async fn call(
        &self,
        authority: &str,
        verb: &str,
        extras: Extras,
    ) -> Result<Extras, ProviderError> {
        (**self).call(authority, verb, extras).await
    }

    async fn refresh(&self) {
        (**self).refresh().await
    }
}

/// Synchronous provider access, for backends whose calls block the thread.
pub trait BlockingTransport: Send + Sync + 'static {
    fn resolve(&self, authority: &str) -> Result<Option<ProviderInfo>, ProviderError>;

    fn call(&self, authority: &str, verb: &str, extras: Extras) -> Result<Extras, ProviderError>;
}

/// Applies a bounded wait to every call of an asynchronous transport.
pub struct Bounded<T> {
    inner: T,
    limit: Duration,
}

impl<T> Bounded<T> {
    pub fn new(inner: T, limit: Duration) -> Self {
        Self { inner, limit }
    }
}

#[async_trait]
impl<T: ProviderTransport> ProviderTransport for Bounded<T> {
    async fn resolve(&self, authority: &str) -> Result<Option<ProviderInfo>, ProviderError> {
        tokio::time::timeout(self.limit, self.inner.resolve(authority))
            .await
            .map_err(|_| ProviderError::Timeout(self.limit))?
    }

    async fn call(
        &self,
        authority: &str,
        verb: &str,
        extras: Extras,
    ) -> Result<Extras, ProviderError> {
        tokio::time::timeout(self.limit, self.inner.call(authority, verb, extras))
            .await
            .map_err(|_| ProviderError::Timeout(self.limit))?
    }

    async fn refresh(&self) {
        self.inner.refresh().await
    }
}

/// Runs a [`BlockingTransport`] on the blocking pool with a bounded wait.
///
/// A call that overruns the bound keeps its blocking thread until the
/// backend returns; only the caller is released.
pub struct Blocking<T> {
    inner: Arc<T>,
    limit: Duration,
}

impl<T: BlockingTransport> Blocking<T> {
    pub fn new(inner: T, limit: Duration) -> Self {
        Self {
            inner: Arc::new(inner),
            limit,
        }
    }

    async fn run<R, F>(&self, job: F) -> Result<R, ProviderError>
    where
        R: Send + 'static,
        F: FnOnce(&T) -> Result<R, ProviderError> + Send + 'static,
    {
        let inner = self.inner.clone();
        let task = tokio::task::spawn_blocking(move || job(&inner));
        match tokio::time::timeout(self.limit, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(ProviderError::Unavailable(format!("provider task failed: {e}"))),
            Err(_) => Err(ProviderError::Timeout(self.limit)),
        }
    }
}

#[async_trait]
impl<T: BlockingTransport> ProviderTransport for Blocking<T> {
    async fn resolve(&self, authority: &str) -> Result<Option<ProviderInfo>, ProviderError> {
        let authority = authority.to_string();
        self.run(move |inner| inner.resolve(&authority)).await
    }

    async fn call(
        &self,
        authority: &str,
        verb: &str,
        extras: Extras,
    ) -> Result<Extras, ProviderError> {
        let authority = authority.to_string();
        let verb = verb.to_string();
        self.run(move |inner| inner.call(&authority, &verb, extras))
            .await
    }
}

/// String value of `key` in a reply, if present and a string.
pub fn reply_str<'a>(reply: &'a Extras, key: &str) -> Option<&'a str> {
    reply.get(key).and_then(Value::as_str)
}

/// Render a reply value the way it is echoed back to clients.
pub fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}
