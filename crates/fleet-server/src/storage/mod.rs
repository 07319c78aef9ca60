//! Storage layer
//!
//! Uses SQLite (embedded) for the fleet inventory and recording metadata.
//! Recording bodies live on the filesystem, see `services::recorder`.

pub mod db;

pub use db::Database;
