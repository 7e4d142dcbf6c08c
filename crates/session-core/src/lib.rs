//! # Session-Core
//!
//! SIP session layer for RVoIP: one [`Session`] per INVITE dialog, extended
//! by plug-in supplements and per stream type SDP handlers.
//!
//! This crate provides:
//! - Supplement registration and priority ordered dispatch
//! - SDP handler chains with defer, negotiate, create and apply phases
//! - Active and pending media states with atomic swap on negotiation
//! - Per-session serializers, suspension, deferred re-INVITEs and delayed requests
//! - Termination with optional deferral
//! - T.38 fax negotiation, caller identity and header function supplements
//!
//! ## Architecture
//!
//! The protocol engine hands received messages to the [`SessionCoordinator`],
//! which routes them to the owning session's serializer. Outgoing messages
//! leave through the [`SipSender`](sip::SipSender) seam; the PBX side is the
//! [`Channel`](channel::Channel) trait and the [`Dialplan`](pbx::Dialplan)
//! routing trait.

pub mod channel;
pub mod config;
pub mod coordinator;
pub mod dialog;
pub mod errors;
pub mod media;
pub mod pbx;
pub mod sdp;
pub mod session;
pub mod sip;
pub mod supplement;
pub mod supplements;
pub mod t38;

pub use self::config::{EndpointConfig, FeaturesConfig, SessionConfig, T38Config};
pub use coordinator::SessionCoordinator;
pub use errors::{Result, SessionError};
pub use media::{MediaState, SdpDeferral, SdpHandler, SessionMedia, StreamOutcome};
pub use session::{
    DelayedMethod, PartyId, RefreshOptions, ReinviteState, Session, SessionEvent, SessionId,
    SessionStats, T38State,
};
pub use supplement::{priority, RequestDisposition, ResponsePriority, SessionSupplement};
