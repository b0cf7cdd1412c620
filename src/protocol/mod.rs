//! Storage-Node Wire Protocol
//!
//! Length-prefixed JSON frames carrying the three operations a node
//! exposes: Set, Get, Del. Any order-preserving bidirectional
//! transport could carry these; here it is one framed request and one
//! framed response at a time over a persistent TCP connection.

pub mod codec;
pub mod types;

pub use codec::{decode, encode, encode_to_vec, FrameError, HEADER_BYTES, MAX_FRAME_BYTES};
pub use types::{Request, Response};
