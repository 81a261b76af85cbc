pub mod backoff;
pub mod common;
pub mod configs;
pub mod credentials;
pub mod media;
pub mod party;
pub mod presence;
pub mod protocol;
pub mod realtime;
pub mod server;
pub mod transport;
pub mod voice;
