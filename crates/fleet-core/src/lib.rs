//! Fleet Core Library
//!
//! Error taxonomy, storage ports and the asciinema recording codec shared by
//! the control plane.

// Re-export pure types from fleet-types
pub use fleet_types::*;

pub mod error;
pub mod ports;
pub mod recording;

pub use error::{FleetError, Result};
