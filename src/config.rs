//! Session configuration.
//!
//! A [`SessionConfig`] is built once, validated, and handed to
//! [`Session::create`](crate::Session::create).  The connection manager URI
//! and the target domain are required; everything else has a sensible
//! default.

use std::sync::Arc;
use std::time::Duration;

use crate::error::{BoshError, Result};
use crate::scheduler::TaskScheduler;

/// Default long-poll window requested at session creation, in seconds.
pub const DEFAULT_WAIT_SECONDS: u32 = 60;

/// Process-scope tunables governing timer behavior.
///
/// These exist mostly for tests and unusual deployments; the defaults match
/// the protocol's expectations.
#[derive(Debug, Clone)]
pub struct Tunables {
    /// Delay before an empty keep-alive request when the CM advertises no
    /// polling interval.
    pub empty_request_delay: Duration,
    /// Safety margin subtracted from `maxpause` when scheduling the request
    /// that wakes a paused session, leaving time to build and transmit it.
    pub pause_margin: Duration,
    /// Enable internal invariant assertions.
    pub assertions: bool,
    /// Suppress empty keep-alive requests entirely.  Test hook.
    pub empty_requests_disabled: bool,
}

impl Default for Tunables {
    fn default() -> Self {
        Tunables {
            empty_request_delay: Duration::from_millis(100),
            pause_margin: Duration::from_millis(500),
            assertions: cfg!(debug_assertions),
            empty_requests_disabled: false,
        }
    }
}

/// Configuration for one BOSH session.
#[derive(Clone)]
pub struct SessionConfig {
    uri: String,
    to: String,
    from: Option<String>,
    lang: String,
    route: Option<String>,
    wait_seconds: u32,
    proxy: Option<String>,
    scheduler: Option<Arc<dyn TaskScheduler>>,
    tunables: Tunables,
}

impl SessionConfig {
    /// Start building a configuration for the connection manager at `uri`
    /// serving the domain `to`.
    pub fn builder(uri: impl Into<String>, to: impl Into<String>) -> SessionConfigBuilder {
        SessionConfigBuilder {
            uri: uri.into(),
            to: to.into(),
            from: None,
            lang: None,
            route: None,
            wait_seconds: DEFAULT_WAIT_SECONDS,
            proxy: None,
            scheduler: None,
            tunables: Tunables::default(),
        }
    }

    /// Connection manager endpoint.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Target domain of the first stream.
    pub fn to(&self) -> &str {
        &self.to
    }

    pub fn from(&self) -> Option<&str> {
        self.from.as_deref()
    }

    /// Default language of the stream (`xml:lang`).
    pub fn lang(&self) -> &str {
        &self.lang
    }

    pub fn route(&self) -> Option<&str> {
        self.route.as_deref()
    }

    /// Long-poll window requested at session creation.
    pub fn wait(&self) -> Duration {
        Duration::from_secs(u64::from(self.wait_seconds))
    }

    pub fn wait_seconds(&self) -> u32 {
        self.wait_seconds
    }

    /// Proxy specification, passed through to the HTTP sender untouched.
    pub fn proxy(&self) -> Option<&str> {
        self.proxy.as_deref()
    }

    /// Externally-provided task scheduler, if any.
    pub fn scheduler(&self) -> Option<&Arc<dyn TaskScheduler>> {
        self.scheduler.as_ref()
    }

    pub fn tunables(&self) -> &Tunables {
        &self.tunables
    }
}

impl std::fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConfig")
            .field("uri", &self.uri)
            .field("to", &self.to)
            .field("from", &self.from)
            .field("lang", &self.lang)
            .field("route", &self.route)
            .field("wait_seconds", &self.wait_seconds)
            .field("proxy", &self.proxy)
            .field("external_scheduler", &self.scheduler.is_some())
            .field("tunables", &self.tunables)
            .finish()
    }
}

/// Builder for [`SessionConfig`].
pub struct SessionConfigBuilder {
    uri: String,
    to: String,
    from: Option<String>,
    lang: Option<String>,
    route: Option<String>,
    wait_seconds: u32,
    proxy: Option<String>,
    scheduler: Option<Arc<dyn TaskScheduler>>,
    tunables: Tunables,
}

impl SessionConfigBuilder {
    /// Set the originating entity advertised in the session-creation
    /// request.
    pub fn from(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    pub fn lang(mut self, lang: impl Into<String>) -> Self {
        self.lang = Some(lang.into());
        self
    }

    /// Request that the CM route the stream to a specific server.
    pub fn route(mut self, route: impl Into<String>) -> Self {
        self.route = Some(route.into());
        self
    }

    /// Long-poll window to request, in seconds.
    pub fn wait_seconds(mut self, seconds: u32) -> Self {
        self.wait_seconds = seconds;
        self
    }

    pub fn proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    /// Use an external scheduler for deferred tasks instead of spawning
    /// sleeper threads.
    pub fn scheduler(mut self, scheduler: Arc<dyn TaskScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn tunables(mut self, tunables: Tunables) -> Self {
        self.tunables = tunables;
        self
    }

    pub fn build(self) -> Result<SessionConfig> {
        if self.uri.is_empty() {
            return Err(BoshError::Usage(
                "connection manager URI may not be empty".into(),
            ));
        }
        if !self.uri.starts_with("http://") && !self.uri.starts_with("https://") {
            return Err(BoshError::Usage(format!(
                "connection manager URI must be http or https: {:?}",
                self.uri
            )));
        }
        if self.to.is_empty() {
            return Err(BoshError::Usage("target domain may not be empty".into()));
        }

        Ok(SessionConfig {
            uri: self.uri,
            to: self.to,
            from: self.from,
            lang: self.lang.unwrap_or_else(|| "en".to_string()),
            route: self.route,
            wait_seconds: self.wait_seconds,
            proxy: self.proxy,
            scheduler: self.scheduler,
            tunables: self.tunables,
        })
    }
}
