//! Live status plumbing for the Finexia backend: a reconnecting push channel,
//! the synchronizer that owns the client-side view, and a polling fallback.

pub mod api;
pub mod channel;
pub mod poller;
pub mod sync;
pub mod timer;

pub use api::{ApiClient, ApiClientConfig, ApiError, StatusApi};
pub use channel::{
    status_channel_url, ChannelConfig, ChannelError, ChannelSubscriber, ConnectionState, Frame,
    OutboundMessage, StatusChannel,
};
pub use poller::PollingCoordinator;
pub use sync::{LogUpdate, PipelineRunConfig, StatusSynchronizer, SyncError, SystemView};
pub use timer::TimerHandle;
