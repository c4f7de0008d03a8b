//! Types shared between the call session coordinator and its test tooling.

#![warn(clippy::pedantic)]

/// Module for common data types
pub mod types;

/// Module for observability configuration
pub mod config;

/// Module for secret types that prevent accidental logging
pub mod secret;
