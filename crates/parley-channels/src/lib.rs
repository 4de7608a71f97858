pub mod live;
pub mod traits;

pub use live::{
    HttpSessionRefresher, LiveConnection, LivePublisher, SessionAuthenticator, StaticSession,
};
pub use traits::{ChannelLifecycle, ChannelStatus, FrameHandler};
