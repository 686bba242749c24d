//! Meshbus Wire
//!
//! This crate contains the socket layer the bus runtime is built on:
//! - Length-prefixed multipart framing (`codec`)
//! - Split-pump connection actors (`actor`)
//! - Dealer-style client sockets (`dealer`)
//! - Router-style listening sockets with identity routing (`router`)
//! - Publisher/Subscriber sockets with prefix subscriptions (`publisher`,
//!   `subscriber`, `subscription`)
//! - UDP broadcast beacon sockets (`beacon`)
//! - Error types (`error`)
//!
//! All TCP sockets run on a single-threaded `compio` runtime owned by the
//! calling thread; handles (`DealerSocket`, `RouterSocket`, `PubSocket`,
//! `SubSocket`) are cheap clones around `flume` senders and may be used from
//! any thread.

#![deny(unsafe_code)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::future_not_send)]

pub mod actor;
pub mod beacon;
pub mod codec;
pub mod dealer;
pub mod error;
pub mod publisher;
pub mod router;
pub mod subscriber;
pub mod subscription;

pub use error::{Result, WireError};

/// Number of consecutive TCP ports probed when binding a listener from a
/// configured base port.
pub const PORT_PROBE_SPAN: u16 = 200;
