//! Finding streams on the network.
//!
//! Two shapes of discovery are offered:
//!
//! - **One-shot** ([`Resolver`] and the `resolve_*` functions): send query
//!   waves for a bounded window and return what answered.  The call returns
//!   early once `minimum` distinct streams are known.
//! - **Continuous** ([`ContinuousResolver`]): keep sending waves in the
//!   background and answer [`ContinuousResolver::results`] from the cache at
//!   any time without blocking.  Streams that stop answering age out.
//!
//! Every query is scoped to the configured session id, and the predicate is
//! parsed before any socket is touched.

use std::sync::Arc;
use std::time::Duration;

use labstream_core::query::{build_field_query, build_query};
use labstream_core::time::{Clock, LocalClock};
use labstream_core::{CancellationRegistry, Query, StreamInfo};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{record, Result};
use crate::infrastructure::config::ApiConfig;
use crate::infrastructure::network::resolve_attempt::{self, new_results, SharedResults};
use crate::infrastructure::runtime::{Interrupted, IoRuntime};

/// A timeout that never runs out.
pub const FOREVER: Duration = Duration::MAX;

/// The query for "every stream of this session matching `predicate`".  An
/// empty predicate matches every stream of the session.
///
/// # Errors
///
/// [`StreamError::QueryParse`](crate::StreamError::QueryParse) for a
/// malformed predicate.
pub fn session_query(config: &ApiConfig, predicate: Option<&str>) -> Result<Query> {
    build_query(&config.lab.session_id, predicate).map_err(record)
}

/// The query for "every stream of this session whose `field` is `value`".
///
/// # Errors
///
/// [`StreamError::QueryParse`](crate::StreamError::QueryParse) for an
/// unknown field or an unquotable value.
pub fn property_query(config: &ApiConfig, field: &str, value: &str) -> Result<Query> {
    build_field_query(&config.lab.session_id, field, value).map_err(record)
}

// ── One-shot ──────────────────────────────────────────────────────────────────

/// A reusable one-shot resolver.
///
/// [`cancel`](Self::cancel) may be called from another thread to end a
/// running resolve early; the call then returns what it found so far.
pub struct Resolver {
    config: Arc<ApiConfig>,
    clock: Arc<dyn Clock>,
    cancel: CancellationRegistry,
    runtime: IoRuntime,
}

impl Resolver {
    /// # Errors
    ///
    /// [`StreamError::Io`](crate::StreamError::Io) when the I/O runtime
    /// cannot start.
    pub fn new() -> Result<Self> {
        Self::with_config(ApiConfig::shared())
    }

    /// # Errors
    ///
    /// As [`new`](Self::new).
    pub fn with_config(config: Arc<ApiConfig>) -> Result<Self> {
        Ok(Self {
            config,
            clock: Arc::new(LocalClock),
            cancel: CancellationRegistry::new(),
            runtime: IoRuntime::new("resolver").map_err(record)?,
        })
    }

    pub fn config(&self) -> &Arc<ApiConfig> {
        &self.config
    }

    /// Every stream of the session that answers within `wait`.
    ///
    /// # Errors
    ///
    /// [`StreamError::Io`](crate::StreamError::Io) when no query socket
    /// could be bound.
    pub fn resolve_all(&self, wait: Duration) -> Result<Vec<StreamInfo>> {
        let query = session_query(&self.config, None)?;
        self.resolve(&query, 0, wait)
    }

    /// Streams matching a predicate such as `type='EEG' and channel_count>8`.
    ///
    /// # Errors
    ///
    /// [`StreamError::QueryParse`](crate::StreamError::QueryParse) before
    /// any I/O for a malformed predicate, otherwise as
    /// [`resolve_all`](Self::resolve_all).
    pub fn resolve_bypred(
        &self,
        predicate: &str,
        minimum: usize,
        timeout: Duration,
    ) -> Result<Vec<StreamInfo>> {
        let query = session_query(&self.config, Some(predicate))?;
        self.resolve(&query, minimum, timeout)
    }

    /// Streams whose `field` equals `value`.
    ///
    /// # Errors
    ///
    /// As [`resolve_bypred`](Self::resolve_bypred).
    pub fn resolve_byprop(
        &self,
        field: &str,
        value: &str,
        minimum: usize,
        timeout: Duration,
    ) -> Result<Vec<StreamInfo>> {
        let query = property_query(&self.config, field, value)?;
        self.resolve(&query, minimum, timeout)
    }

    /// Sends waves for `query` until `minimum` distinct streams answered
    /// (0: no minimum) or `timeout` passed, then returns them in order of
    /// first reply.
    ///
    /// # Errors
    ///
    /// [`StreamError::Io`](crate::StreamError::Io) when no query socket
    /// could be bound.
    pub fn resolve(&self, query: &Query, minimum: usize, timeout: Duration) -> Result<Vec<StreamInfo>> {
        let results = new_results(Arc::clone(&self.clock));
        let attempt = {
            let query = query.clone();
            let config = Arc::clone(&self.config);
            let results = Arc::clone(&results);
            async move {
                resolve_attempt::resolve(&query, &config, &results, minimum, Some(timeout), false)
                    .await
            }
        };

        match self.runtime.call(attempt, None, &self.cancel.handle()) {
            Ok(outcome) => outcome?,
            Err(Interrupted::Cancelled) => debug!("resolve of {:?} cancelled", query.text()),
            Err(Interrupted::TimedOut) => {}
        }
        Ok(snapshot_of(&results))
    }

    /// Ends every running [`resolve`](Self::resolve) on this resolver early.
    pub fn cancel(&self) {
        self.cancel.cancel_all();
    }
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver")
            .field("session_id", &self.config.lab.session_id)
            .finish_non_exhaustive()
    }
}

fn snapshot_of(results: &SharedResults) -> Vec<StreamInfo> {
    results.lock().unwrap_or_else(|p| p.into_inner()).results()
}

/// Every stream of the session visible within `wait`.
///
/// # Errors
///
/// As [`Resolver::resolve_all`].
pub fn resolve_streams(wait: Duration) -> Result<Vec<StreamInfo>> {
    Resolver::new()?.resolve_all(wait)
}

/// Streams whose `field` equals `value`; see [`Resolver::resolve_byprop`].
///
/// # Errors
///
/// As [`Resolver::resolve_byprop`].
pub fn resolve_stream(
    field: &str,
    value: &str,
    minimum: usize,
    timeout: Duration,
) -> Result<Vec<StreamInfo>> {
    let config = ApiConfig::shared();
    let query = property_query(&config, field, value)?;
    Resolver::with_config(config)?.resolve(&query, minimum, timeout)
}

/// Streams matching `predicate`; see [`Resolver::resolve_bypred`].
///
/// # Errors
///
/// As [`Resolver::resolve_bypred`].
pub fn resolve_bypred(predicate: &str, minimum: usize, timeout: Duration) -> Result<Vec<StreamInfo>> {
    let config = ApiConfig::shared();
    let query = session_query(&config, Some(predicate))?;
    Resolver::with_config(config)?.resolve(&query, minimum, timeout)
}

// ── Continuous ────────────────────────────────────────────────────────────────

/// Keeps a live list of the streams matching a query.
pub struct ContinuousResolver {
    query: Query,
    results: SharedResults,
    forget_after: Duration,
    task: JoinHandle<()>,
    runtime: IoRuntime,
}

impl ContinuousResolver {
    /// Starts resolving `query` in the background.  Streams unseen for more
    /// than `forget_after` drop out of [`results`](Self::results).
    ///
    /// # Errors
    ///
    /// [`StreamError::Io`](crate::StreamError::Io) when the I/O runtime
    /// cannot start.
    pub fn new(query: Query, forget_after: Duration, config: Arc<ApiConfig>) -> Result<Self> {
        let runtime = IoRuntime::new("continuous-resolver").map_err(record)?;
        let results = new_results(Arc::new(LocalClock));

        let task = {
            let query = query.clone();
            let results = Arc::clone(&results);
            runtime.spawn(async move {
                if let Err(e) = resolve_attempt::resolve(&query, &config, &results, 0, None, true).await {
                    warn!("continuous resolve of {:?} stopped: {e}", query.text());
                }
            })
        };
        debug!("continuous resolver started for {:?}", query.text());

        Ok(Self {
            query,
            results,
            forget_after,
            task,
            runtime,
        })
    }

    /// Watches every stream of the session.
    ///
    /// # Errors
    ///
    /// As [`new`](Self::new).
    pub fn all(forget_after: Duration) -> Result<Self> {
        let config = ApiConfig::shared();
        Self::new(session_query(&config, None)?, forget_after, config)
    }

    /// Watches the streams matching `predicate`.
    ///
    /// # Errors
    ///
    /// [`StreamError::QueryParse`](crate::StreamError::QueryParse) for a
    /// malformed predicate, otherwise as [`new`](Self::new).
    pub fn bypred(predicate: &str, forget_after: Duration) -> Result<Self> {
        let config = ApiConfig::shared();
        Self::new(session_query(&config, Some(predicate))?, forget_after, config)
    }

    /// Watches the streams whose `field` equals `value`.
    ///
    /// # Errors
    ///
    /// As [`bypred`](Self::bypred).
    pub fn byprop(field: &str, value: &str, forget_after: Duration) -> Result<Self> {
        let config = ApiConfig::shared();
        Self::new(property_query(&config, field, value)?, forget_after, config)
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    /// The streams seen within the last `forget_after`, in order of first
    /// reply.  Never blocks on the network.
    pub fn results(&self) -> Vec<StreamInfo> {
        self.results
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .snapshot(self.forget_after.as_secs_f64())
    }
}

impl Drop for ContinuousResolver {
    fn drop(&mut self) {
        self.task.abort();
        debug!("continuous resolver for {:?} stopped", self.query.text());
    }
}

impl std::fmt::Debug for ContinuousResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContinuousResolver")
            .field("query", &self.query.text())
            .field("forget_after", &self.forget_after)
            .field("runtime", &self.runtime)
            .finish_non_exhaustive()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
