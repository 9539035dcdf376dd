//! Shared types for the Meshtenna antenna test harness.
//!
//! This crate contains:
//! - **Data models** - Sample, inbound radio events, probes, score rows
//! - **Protocol messages** - JSON envelopes for the mesh gateway bridge and
//!   the status snapshots published to the presentation layer

pub mod models;
pub mod protocol;
