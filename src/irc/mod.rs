pub mod codec;
pub mod listener;
pub mod message;

pub use message::Message;
