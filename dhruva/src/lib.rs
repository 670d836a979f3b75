//! # dhruva
//!
//! A stateful SIP proxy.
//!
//! Messages come in through the [`transport`] layer, UDP datagrams or
//! `Content-Length` framed TCP and TLS streams, and are parsed into the
//! [`message`] model. The [`controller`] routes requests with a
//! [`service::RoutingService`], resolves the destination into hops with the
//! [`resolver`], admits calls against the [`session`] limits and forwards
//! them. Responses find their request again through the branch of the proxy
//! `Via`. An [`engine::Engine`] ties everything together.

pub mod config;
pub mod controller;
pub mod engine;
pub mod message;
pub mod metrics;
pub mod parser;
pub mod resolver;
pub mod service;
pub mod session;
pub mod transport;

pub mod error;
pub(crate) mod macros;

#[cfg(test)]
pub(crate) mod test_utils;

pub use engine::{Engine, EngineBuilder};
pub use error::{Error, Result};

#[cfg(test)]
#[macro_use]
extern crate assert_matches;
