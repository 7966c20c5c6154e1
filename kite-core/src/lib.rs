//! Kite Core - Strongly-typed identifiers and limits for the Kite client.
//!
//! This crate holds the types shared by every layer of the client: protocol
//! identifiers, broker addressing, and the explicit resource limits that
//! bound every queue and buffer in the connection core.
//!
//! # Design Principles
//!
//! - **Strongly-typed IDs**: Prevent mixing up a `NodeId` with a
//!   `CorrelationId`
//! - **Explicit limits**: Every resource has a bounded maximum
//! - **No unsafe code**

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;
mod limits;
mod types;

pub use error::{Error, Result};
pub use limits::Limits;
pub use types::{BrokerIdentity, CorrelationId, NodeId};
