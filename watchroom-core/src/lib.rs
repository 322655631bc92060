//! WatchRoom - Core Library
//!
//! This library keeps group video playback in sync: it tracks per-room
//! readiness and presence, measures timeline divergence against the room's
//! reference position, and corrects it with speed nudges or hard resyncs
//! of the local player.

pub mod correction;
pub mod desync;
pub mod events;
pub mod player;
pub mod presence;
pub mod ready;
pub mod relay;
pub mod room;
pub mod settings;

// Re-exports for convenience
pub use correction::{CorrectionAction, CorrectionActuator};
pub use desync::{classify, DesyncEvent, DesyncSeverity};
pub use events::{CoordinatorEvent, CoordinatorHandle, CoordinatorSnapshot};
pub use player::{PlayerClient, PlayerControl, PlayerError};
pub use ready::{ReadyState, ReadyStateTracker};
pub use relay::{RelayEvent, RelayHandle};
pub use room::{ConnectionState, RoomConnectionManager};
pub use settings::{PlaybackSettings, SettingsStore};

use std::sync::Once;

static TRACING_INIT: Once = Once::new();

/// Install a tracing subscriber once for the whole process. Safe to call
/// repeatedly; later calls are no-ops.
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_target(false)
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive("watchroom_core=debug".parse().expect("valid directive"))
                    .add_directive("hyper_util=off".parse().expect("valid directive"))
                    .add_directive("reqwest=off".parse().expect("valid directive"))
                    .add_directive("hyper=off".parse().expect("valid directive")),
            )
            .with_writer(std::io::stderr)
            .init();
    });
}
