//! # Message-Core
//!
//! Out-of-call messaging for RVoIP: text messages and transfer requests that
//! travel outside of any INVITE dialog.
//!
//! This crate provides:
//! - [`Message`] and [`Refer`] values with case-insensitive variables
//! - Message and refer technologies, picked by the scheme of a destination
//! - Message handlers, including delivery to the dialplan
//! - A delivery queue and the `MessageSend` operation over a channel's message
//! - `MESSAGE()` and `MESSAGE_DATA()` channel functions
//! - SIP MESSAGE and REFER, in and out of dialog
//!
//! ## Architecture
//!
//! Received messages are queued on the [`MessageRouter`], which hands each
//! one to every handler that wants it on its own serializer. Outgoing
//! messages pick a [`MessageTech`] by destination scheme; [`SipMessaging`]
//! is the SIP one and sends through the same
//! [`SipSender`](rvoip_session_core::sip::SipSender) seam sessions use.

pub mod config;
pub mod errors;
pub mod functions;
pub mod handler;
pub mod message;
pub mod refer;
pub mod router;
pub mod sip;
pub mod tech;
pub mod vars;

pub use self::config::MessageConfig;
pub use errors::{MessageError, Result};
pub use functions::{message_data_read, message_data_write, message_read, message_write};
pub use handler::{DialplanHandler, DialplanRunner, MessageChannel, MessageHandler};
pub use message::Message;
pub use refer::Refer;
pub use router::{MessageRouter, SendStatus, MESSAGE_SEND_STATUS};
pub use sip::{MessagingSupplement, SipMessaging};
pub use tech::{MessageTech, ReferTech};
