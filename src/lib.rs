mod amf0;
mod chunk;
mod client;
mod connection;
mod error;
mod flv;
mod handshake;
mod location;
mod message;

pub use amf0::*;
pub use client::*;
pub use connection::*;
pub use error::*;
pub use flv::*;
pub use location::*;
pub use message::*;
