pub mod auth;
pub mod error;
pub mod hub;
pub mod observability;
pub mod publish;
pub mod registry;
pub mod resolver;
pub mod session;

use std::time::Duration;

pub use error::CoreError;
pub use hub::{Hub, HubConfig, HubStats};
pub use resolver::{DbParticipantResolver, ParticipantResolver, ResolveError, StaticParticipants};
pub use session::{CloseReason, EnqueueError, Frame, Session};

pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024;
pub const DEFAULT_MAX_TYPING_EVENTS_PER_MINUTE: u32 = 120;

/// Shared application state handed to the gateway router.
#[derive(Clone)]
pub struct AppState {
    pub hub: Hub,
    pub config: AppConfig,
}

#[derive(Clone)]
pub struct AppConfig {
    pub jwt_secret: String,
    pub gateway: GatewayConfig,
}

/// Per-connection knobs applied by the gateway.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub outbound_queue_capacity: usize,
    /// Largest inbound WebSocket message accepted.
    pub max_frame_bytes: usize,
    /// None disables the idle timeout.
    pub idle_timeout: Option<Duration>,
    /// 0 disables typing rate limiting.
    pub max_typing_events_per_minute: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            outbound_queue_capacity: session::DEFAULT_OUTBOUND_CAPACITY,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            idle_timeout: None,
            max_typing_events_per_minute: DEFAULT_MAX_TYPING_EVENTS_PER_MINUTE,
        }
    }
}
