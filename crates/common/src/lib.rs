//! Common utilities and types shared across Session Gate crates.

#![warn(clippy::pedantic)]

/// Module for secret types that prevent accidental logging
pub mod secret;

/// Module for JWT utilities (size limits, segment decoding, time windows)
pub mod jwt;
