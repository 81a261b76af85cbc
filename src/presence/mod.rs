//! Party membership as seen through the shared presence channel.

pub mod directory;
pub mod merge;
pub mod sweep;

pub use directory::{PresenceDirectory, PresenceLink, SweepReport};
