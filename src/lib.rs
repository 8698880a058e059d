//! Tool Gate Library
//!
//! Request-gating layer in front of callable tools with read or write effect.
//!
//! # Features
//!
//! - **Credential verification**: signed bearer tokens checked against a local
//!   JWKS file or a remote, cached and periodically refreshed JWKS
//! - **Role mapping**: external role/group claims reduced to `ReadOnly` or `ReadWrite`
//! - **Policy**: per-tool rules, site scoping, dry-run by default for mutating
//!   tools, commit gated on role, a global write switch and confirmation
//! - **Audit**: one redacted, hash-chained entry per call attempt
//!
//! The tools themselves are external; the [`gateway::Gateway`] hands allowed
//! calls to a [`gateway::ToolExecutor`] together with the dry-run flag.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod audit;
pub mod auth;
pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;
pub mod policy;

pub use error::{Error, GatewayError, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging. `RUST_LOG` overrides `level`.
///
/// # Errors
///
/// Returns [`Error::Internal`] if a global subscriber is already installed.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let installed = match format {
        Some("json") => subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
        _ => subscriber.with(fmt::layer().with_writer(std::io::stderr)).try_init(),
    };

    installed.map_err(|e| Error::Internal(format!("tracing init: {e}")))
}
