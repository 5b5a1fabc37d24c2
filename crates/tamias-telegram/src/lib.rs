pub mod bridge;
pub mod send;
pub mod typing;

pub use bridge::TelegramBridge;
