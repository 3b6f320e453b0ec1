//! Broadcast chat relay and the client session that talks to it.
//!
//! See `README.md` for usage and the wire format. Each module focuses on a
//! concrete responsibility:
//!
//! - [`cli`] parses the command-line interface for relay and client modes.
//! - [`relay`] serves WebSocket sessions with axum and re-emits every
//!   `message` event to all of them over a Tokio `broadcast` channel.
//! - [`message`] defines the chat [`Message`](message::Message) record and
//!   the `{event, data}` envelope that frames it on the wire.
//! - [`transport`] abstracts the client's channel to the relay, with a real
//!   WebSocket implementation and a local echoing mock.
//! - [`session`] keeps a client's append-only display list on top of any
//!   transport.
//! - [`client`] drives a session from the terminal.

pub mod cli;
pub mod client;
pub mod message;
pub mod relay;
pub mod session;
pub mod transport;
