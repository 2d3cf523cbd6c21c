//! The `transport` module is responsible for the network side of the
//! protocol: the frames exchanged over the WebSocket, the close-code
//! taxonomy, and the WebSocket server that hosts the reference broker.

pub mod close;
pub mod message;
pub mod websocket;

pub use close::CloseCode;
pub use message::{AckMode, ClientMessage, Delivery, DurableType, ServerMessage};
pub use websocket::{WebSocketServer, start_websocket_server};
