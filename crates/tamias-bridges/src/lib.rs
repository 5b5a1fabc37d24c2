pub mod bridge;
pub mod dispatcher;
pub mod queue;

pub use bridge::{Bridge, BridgeError, BridgeStatus, SessionContext};
pub use dispatcher::Dispatcher;
pub use queue::{ChannelQueue, Mark};
