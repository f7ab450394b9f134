//! # Moneta EBICS engine
//!
//! Client side of EBICS 2.5 (H004): subscriber key lifecycle (INI, HIA,
//! HPB), signed and encrypted upload/download transactions, the HEV
//! version probe, and the crypto profiles the standard mandates (A006,
//! E002, X002). The envelope module is shared with the sandbox host, so
//! both ends of the wire canonicalize and verify identically.

#![forbid(unsafe_code)]

pub mod client;
pub mod codes;
pub mod envelope;
pub mod error;
pub mod keys;
pub mod pack;

pub use client::{EbicsClient, EbicsTransport, HttpTransport, Subscriber};
pub use codes::{retcodes, OrderType, ReturnCode};
pub use envelope::SubscriberIds;
pub use error::{Error, Result};
