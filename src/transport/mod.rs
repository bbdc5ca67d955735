//! Transport layer for the tenant gateway.
//!
//! The core is transport-agnostic; this module exposes it over HTTP.

pub mod http;

pub use http::HttpTransport;

use crate::error::TenantResult;
use std::future::Future;

/// A front end serving the gateway.
pub trait Transport: Send + Sync {
    /// Start the transport and begin handling requests.
    ///
    /// This method should block until the transport is shut down.
    fn run(&self) -> impl Future<Output = TenantResult<()>> + Send;

    /// Get the name of this transport for logging.
    fn name(&self) -> &'static str;
}
