pub mod broadcaster;
pub mod debounce;
pub mod detector;
pub mod session;
pub mod state;

pub use broadcaster::VoiceBroadcaster;
pub use detector::{DetectorConfig, SpeakingDetector};
pub use session::{VoiceDeps, VoiceSession};
pub use state::VoiceSessionState;
