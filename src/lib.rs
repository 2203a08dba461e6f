#![cfg_attr(not(feature = "std"), no_std)]
#![allow(stable_features)]
#![allow(unknown_lints)]

//! Async, `no_std`, no-alloc DHCPv4 client state machine (RFC 2131, plus the RFC 3927
//! link-local fallback). Generic over four narrow transport traits ([`transport::Sockets`],
//! [`transport::Arp`], [`transport::IpConfig`], [`transport::Interfaces`]) and a
//! [`transport::Clock`]; a host integration supplies real implementations, the [`sim`]
//! module (feature `std`) supplies in-memory fakes for this crate's own tests.
//!
//! [`client::Client`] is the entry point: `start`/`stop` enqueue work for the Dispatcher,
//! `check_status`/`get_option` read published state without touching the Dispatcher's lock,
//! and `run` drives the Dispatcher and Ticker tasks to completion.

pub mod client;
pub mod config;
pub mod error;
pub mod iface;
pub mod linklocal;
pub mod manager;
pub mod probe;
pub mod queue;
pub mod retransmit;
pub mod timer;
pub mod transport;
pub mod wire;

#[cfg(feature = "std")]
pub mod sim;

pub use client::Client;
pub use config::Config;
pub use error::{Error, TransportError};
pub use iface::LeaseStatus;
