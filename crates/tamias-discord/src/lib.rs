pub mod bridge;
pub mod handler;
pub mod send;

pub use bridge::DiscordBridge;
