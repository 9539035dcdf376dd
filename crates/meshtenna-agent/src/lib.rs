//! Meshtenna field agent library.
//!
//! The probe engine (connection, correlation, scheduling, storage and
//! scoring) plus the status portal, exposed so the `meshtenna` binary and
//! the integration tests share one implementation.

pub mod config;
pub mod connection;
pub mod correlator;
pub mod persistence;
pub mod portal;
pub mod samples;
pub mod scheduler;
pub mod score;
pub mod storage;
pub mod transport;
