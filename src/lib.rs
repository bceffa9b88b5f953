#![forbid(unsafe_code)]

//! Client-side BOSH (XEP-0124 / XEP-0206) session engine.
//!
//! BOSH tunnels a long-lived bidirectional message stream over short HTTP
//! request/response pairs.  This crate implements the client half: it
//! multiplexes application bodies onto a managed pool of concurrent HTTP
//! requests to a remote connection manager and demultiplexes the responses
//! back, handling session creation, RID sequencing, acknowledgments,
//! long-poll keep-alive, pause/resume, binding conditions, timeouts, and
//! reconnection with request replay.
//!
//! ```no_run
//! use std::sync::Arc;
//! use bosh_client::{Body, Session, SessionConfig};
//! # fn sender() -> Arc<dyn bosh_client::HttpSender> { unimplemented!() }
//!
//! # fn main() -> bosh_client::Result<()> {
//! let config = SessionConfig::builder("http://cm.example.com/http-bind", "example.com")
//!     .from("user@example.com")
//!     .build()?;
//! let session = Session::create(config, sender())?;
//! session.send(Body::empty())?; // establishes the session
//! # Ok(())
//! # }
//! ```
//!
//! Network I/O is delegated to an [`HttpSender`] implementation; the engine
//! itself performs none.

pub mod acks;
pub mod body;
pub mod condition;
pub mod config;
pub mod error;
pub mod exchange;
pub mod http;
pub mod listener;
pub mod params;
mod rid;
pub mod scheduler;
pub mod session;
pub mod test_support;
pub mod wire;

pub use error::{BoshError, Result};

// Re-export the working set at crate root for convenience
pub use crate::body::{Body, BodyBuilder, attr};
pub use crate::condition::TerminalBindingCondition;
pub use crate::config::{SessionConfig, SessionConfigBuilder, Tunables};
pub use crate::http::{HttpResponse, HttpSender, ResponseHandle};
pub use crate::listener::{ConnectionEvent, ConnectionListener, RequestListener, ResponseListener};
pub use crate::params::CmSessionParams;
pub use crate::scheduler::{TaskHandle, TaskScheduler, ThreadScheduler};
pub use crate::session::Session;
