//! Connection fabric: persistent duplex channels between gateway nodes and
//! named backend services.
//!
//! The fabric carries [`Envelope`](crate::envelope::Envelope) frames both
//! ways: request/response pairs correlated by id, and unsolicited pushes.
//! Frames on one connection are delivered in send order; nothing is
//! guaranteed across connections.

mod client;
mod protocol;
mod server;

pub use client::FabricConnection;
pub use protocol::{read_envelope, read_frame, write_envelope, write_frame};
pub use server::{EnvelopeSink, FabricDispatch, FabricServer, FabricServerHandle};
