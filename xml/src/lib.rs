//! # Moneta XML codec
//!
//! Tree-based XML handling shared by the EBICS engine and the ISO 20022
//! translator:
//! - parse documents into a light-weight element tree (quick-xml reader)
//! - destructure trees with namespace-insensitive combinators
//! - render trees canonically for digesting and signing

#![forbid(unsafe_code)]

pub mod c14n;
pub mod dom;
pub mod error;

pub use dom::{Element, Node};
pub use error::{Error, Result};
