//! Limits - connection and load admission control
//!
//! This crate decides, per incoming request, whether a front end should serve it
//! or answer with 503. The decision counts the requests currently in flight from
//! the same client address and to the same virtual host, and compares a cached
//! sample of the host's one-minute load average against a threshold.

pub mod config;
pub mod error;
pub mod grpc;
pub mod limits;
pub mod scoreboard;
