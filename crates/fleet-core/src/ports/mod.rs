//! Port traits (interfaces) for dependency injection

pub mod directory;
pub mod recording;

pub use directory::InstanceDirectory;
pub use recording::RecordingStore;
