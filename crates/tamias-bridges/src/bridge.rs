use async_trait::async_trait;

use tamias_core::types::DaemonEvent;

/// Common interface implemented by every bridge (terminal, Discord,
/// Telegram, WhatsApp, …).
///
/// Implementations must be `Send + Sync`: they are stored in the
/// [`Dispatcher`](crate::dispatcher::Dispatcher) and driven from multiple
/// Tokio tasks. Bridges hold session *ids* plus a store handle only —
/// never references back into sessions or the dispatcher.
#[async_trait]
pub trait Bridge: Send + Sync {
    /// The channel id this bridge owns (e.g. `"discord:main"`,
    /// `"telegram:bot1"`, `"terminal"`). Unique across the daemon.
    fn name(&self) -> &str;

    /// Establish the connection to the external service and start
    /// accepting inbound messages.
    async fn connect(&self) -> Result<(), BridgeError>;

    /// Gracefully close the connection. Transient UI state (typing
    /// indicators, reactions) must be cleared.
    async fn disconnect(&self);

    /// Current runtime status without blocking.
    fn status(&self) -> BridgeStatus;

    /// Deliver one session event to the transport. Called in emission
    /// order per session; a bridge must serialise its outgoing operations
    /// per `(channel_id, channel_user_id)` pair.
    async fn handle_daemon_event(&self, event: &DaemonEvent, ctx: &SessionContext);
}

/// Where an event came from, resolved by the dispatcher before delivery.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub session_id: String,
    pub channel_id: String,
    pub channel_user_id: String,
}

/// Runtime connection state of a bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeStatus {
    Connected,
    Connecting,
    Disconnected,
    Error(String),
}

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("missing token: env variable {0} is not set")]
    MissingToken(String),

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("send failed after retries: {0}")]
    Send(String),
}
