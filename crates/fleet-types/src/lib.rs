//! Fleet Types - Pure type definitions shared by the control plane and agents
//!
//! This crate contains only data types and wire formats with no async runtime
//! dependencies.

pub mod agent;
pub mod fleet;
pub mod recording;
pub mod stream;
pub mod terminal;

pub use agent::*;
pub use fleet::*;
pub use recording::*;
pub use stream::*;
pub use terminal::*;
