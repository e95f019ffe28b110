//! Per-bot channel recording engine: jitter-buffered PCM ingress, 20ms mix
//! ticks, Ogg/Opus segment files with loudness sidecars, a durable index and
//! the lifecycle state machine that ties them to channel events.

pub mod channel;
pub mod config;
pub mod events;
pub mod manager;
pub mod quota;
pub mod recovery;
pub mod segment;

pub use channel::{ChannelDirectory, ClientId, EmptyDirectory, Identity, StaticDirectory};
pub use config::{load_config, Config, RecordingConfig};
pub use events::{EventHub, Subscription, VoiceEvent};
pub use manager::{Recorder, RecorderStatus};
pub use recovery::{recover_orphans, RecoveryReport};
