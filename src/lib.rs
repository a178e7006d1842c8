//! Kessel: a policy-driven asset and data cache.
//!
//! The [`cache`] module holds the subsystem; [`config`] and [`infra`] hold the
//! process plumbing used by the `kessel` binary.

pub mod cache;
pub mod config;
pub mod infra;
