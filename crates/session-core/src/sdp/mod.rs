//! Session Description Protocol model
//!
//! A small owned representation of an SDP offer or answer: the session level
//! origin and connection plus one [`MediaDescription`] per `m=` line. Stream
//! handlers read and append to this structure; the protocol engine owns the
//! wire encoding.

pub mod types;

pub use types::{
    addr_type_for, Connection, MediaDescription, MediaDirection, Origin, SdpAttribute,
    SessionDescription,
};
