//! Test utilities for pump and pool tests
//!
//! Raw IP packet builders and a scripted in-memory interface that stands in
//! for a TUN device.

pub mod interface;
pub mod packets;

pub use interface::{ReadStep, ScriptControl, ScriptedInterface};
