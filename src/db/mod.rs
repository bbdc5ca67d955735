//! Database layer.
//!
//! This module provides the per-tenant connection machinery:
//! - Connectors that open and close tenant pools
//! - The connection multiplexer and its reference-counted handles
//! - SQL rendering and parameter binding per backend
//! - Schema-bound accessors and the binder that caches them
//! - Database dispatch macros for reducing code duplication

pub mod accessor;
pub mod binder;
pub mod connector;
pub mod dialect;
pub mod handle;
#[macro_use]
pub mod macros;
pub mod multiplexer;
pub mod params;
pub mod pool;

pub use accessor::{Accessor, SqlAccessor};
pub use binder::ModelBinder;
pub use connector::{Connector, SqlxConnector};
pub use handle::{ConnectionHandle, HandleGuard, HandleState, HandleSummary};
pub use multiplexer::{
    CapacityPolicy, ConnectionMultiplexer, HandleEvent, MultiplexerConfig, MultiplexerStats,
};
pub use pool::DbPool;
