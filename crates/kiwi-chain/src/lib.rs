// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! kiwi-chain
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Chain resolution with caching.
pub mod resolver;
/// Parent→child schema validation.
pub mod validate;
/// Link integrity verification.
pub mod verify;

pub use resolver::{ChainResolver, MAX_CHAIN_DEPTH, ResolveError};
pub use validate::{ChainValidator, SchemaCache, ValidateError, ValidationReport};
pub use verify::{IntegrityVerifier, VerifyError};
