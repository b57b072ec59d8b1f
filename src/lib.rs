//! BoltStream.
//!
//! This crate provides direct access to the Bolt client/server protocol of a
//! graph database, allowing you to build custom database clients or tools
//! without the overhead of higher-level abstractions.
//!
//! # Overview
//!
//! The crate is organized around a few core concepts:
//!
//! - **Connection establishment** via [`ConnectionBuilder`] with support for
//!   authentication and TLS
//! - **Statement submission** using the fluent API on [`BoltStream`]
//! - **Result consumption** through the [`ResultStream`] capability set,
//!   with explicit record lifetimes ([`Record::retain`] / [`Record::release`])
//! - **Host verification** via the trust-on-first-use store in [`tofu`]
//!
//! # Example: Running a Statement
//!
//! ```no_run
//! use std::collections::HashMap;
//!
//! use bolt_stream::{ConnectionBuilder, ResultStream};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let stream = tokio::net::TcpStream::connect("localhost:7687").await?;
//!
//! let (conn, info) = ConnectionBuilder::new()
//!     .basic_auth("neo4j", "secret")
//!     .connect(stream)
//!     .await?;
//! println!("connected to {:?}", info.server);
//!
//! // Submit a statement and stream its records
//! let mut results = conn.run("MATCH (n) RETURN n LIMIT 10", HashMap::new());
//!
//! println!("fields: {}", results.nfields().await?);
//! while let Some(record) = results.fetch_next().await? {
//!     println!("{:?}", record.field(0));
//! }
//! results.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Example: Trust On First Use
//!
//! ```no_run
//! use bolt_stream::tofu::{self, HostVerification, TofuConfig, Verification};
//!
//! # fn main() -> Result<(), bolt_stream::KnownHostsError> {
//! let config = TofuConfig::new().on_unverified(|host, fingerprint, _reason| {
//!     println!("first contact with {host}: pinning {fingerprint}");
//!     HostVerification::Trust
//! });
//!
//! match tofu::check_known_hosts("db.example.com", 7687, "AA:BB:CC", &config)? {
//!     Verification::Verified => { /* proceed with the TLS session */ }
//!     Verification::Rejected => { /* tear the connection down */ }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Record Lifetimes
//!
//! A record returned by [`ResultStream::fetch_next`] stays readable until the
//! stream advances past it. To keep one longer, [`Record::retain`] it and
//! balance every retention with a [`Record::release`]; closing the stream
//! invalidates all of its records regardless. An invalidated record reads as
//! [`Value::Null`](value::Value::Null), so stale handles never dangle.
//!
//! # Failure Handling
//!
//! A failed stream is sticky: every subsequent operation reports the same
//! [`FailureKind`], and for server-originated failures the short code and
//! message remain readable via [`ResultStream::error_code`] and
//! [`ResultStream::error_message`] until the stream is closed. Records that
//! were already buffered when the failure arrived stay fetchable first.
//!
//! # TLS Support
//!
//! TLS can be negotiated using [`ConnectionBuilder::connect_with_tls`] with a
//! custom async upgrade function. The transport is encrypted from the first
//! byte; certificate verification is the upgrade function's concern, for
//! which [`tofu::check_known_hosts`] provides the trust-on-first-use policy.
//!
//! # Performance Considerations
//!
//! This crate is designed for low-level control and maximum performance:
//!
//! - Request messages are buffered and sent together to minimize syscalls
//! - Direct buffer manipulation with [`bytes::BytesMut`]
//! - Decoded records flow through a bounded buffer, so a slow consumer
//!   holds the decoder back instead of buffering without limit
//!
//! # Safety and Error Handling
//!
//! This is a low-level crate with minimal safety guarantees:
//!
//! - **No statement injection protection** - sanitize your inputs
//! - **No concurrent statement multiplexing** - one statement owns the
//!   connection until its stream ends or is closed
//! - **No connection pooling** - manage connections yourself

mod bolt_stream;
mod connect;
mod error;
pub mod known_hosts;
pub mod messages;
pub mod packstream;
mod record;
mod result_stream;
pub mod tofu;
pub mod value;

pub use bolt_stream::*;
pub use connect::*;
pub use error::*;
pub use known_hosts::KnownHostsError;
pub use record::Record;
pub use result_stream::{ErrorStream, ResultStream, RunStream};
