//! `conduit-middleware` – The Wire Boundary
//!
//! Moves events and calls between the core and the server connection without
//! caring about their meaning.
//!
//! # Modules
//!
//! - [`transport`] – [`Transport`] trait for outbound calls and the
//!   [`Request`] methods a bound proxy understands.
//! - [`bus`] – ordered inbound [`EventQueue`] built on a Tokio mpsc channel,
//!   plus the JSON-lines event codec.
//! - [`loopback`] – [`LoopbackTransport`], an in-memory transport that
//!   records calls and can answer simple requests itself.

pub mod bus;
pub mod loopback;
pub mod transport;

pub use bus::{EventQueue, EventSender, channel, decode_line, encode_line};
pub use loopback::{Call, LoopbackTransport};
pub use transport::{Request, Transport};
