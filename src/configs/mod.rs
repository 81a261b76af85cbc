pub mod base;
pub mod credentials;
pub mod logging;
pub mod party;
pub mod presence;
pub mod server;
pub mod voice;

pub use base::*;
pub use credentials::*;
pub use logging::*;
pub use party::*;
pub use presence::*;
pub use server::*;
pub use voice::*;
