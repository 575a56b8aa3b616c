//! hubsync-core library.
//!
//! Leaf hubs fold watched policy objects into versioned bundles
//! ([`bundle`]), and a [`dispatch::Dispatcher`] sends every bundle whose
//! version moved. The consumer routes each message through a
//! [`registry::ConsumerRegistry`] into the SQLite [`db::Store`], where the
//! [`merge`] engine applies it under the scope's version checks.
//!
//! # Conventions
//!
//! - **Errors**: module errors are `thiserror` enums with a `code()` mapping to
//!   [`error::ErrorCode`]. Glue code uses `anyhow::Result`.
//! - **Logging**: `tracing` macros with structured fields (`leaf_hub`, `kind`,
//!   `version`). Only binaries install a subscriber.

pub mod bundle;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod incarnation;
pub mod merge;
pub mod object;
pub mod producer;
pub mod registry;
pub mod transport;
pub mod version;
pub mod wire;
