pub mod coordinator;
pub mod state;
pub mod storage;

pub use coordinator::{PartyCoordinator, PartyDeps};
pub use state::PartyState;
pub use storage::{FileSessionStore, MemorySessionStore, SessionStorage};
