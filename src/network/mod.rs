// Network layer: framing, the message model, and the TCP server.

pub mod frame;
pub mod message;
pub mod server;

pub use frame::FrameCodec;
pub use message::{Command, Content, Message, Response, ResponseCode};
pub use server::{Server, ServerHandle};
