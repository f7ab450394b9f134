//! # Moneta sandbox
//!
//! A bank impersonator for end-to-end testing: an EBICS host with real
//! key material and a minimal demo-bank ledger behind it. The binary
//! serves `POST /ebicsweb`; tests talk to the host in-process through
//! [`LoopbackTransport`].

#![forbid(unsafe_code)]

pub mod host;
pub mod ledger;

pub use host::{EbicsHost, LoopbackTransport};
pub use ledger::{BookedEntry, DemoAccount, DemoLedger};
