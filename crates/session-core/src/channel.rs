//! Channel seam
//!
//! The channel is the PBX side of a call. The session layer only needs to
//! queue frames toward it, hang datastores and variables off it and let
//! extensions intercept control frames written by the application.

use std::fmt;
use std::sync::Arc;

use rvoip_infra_common::DatastoreContainer;
use serde::{Deserialize, Serialize};

use crate::errors::Result;
use crate::session::Session;

/// T.38 negotiation request or reply carried in a control frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum T38Request {
    RequestNegotiate,
    RequestTerminate,
    Negotiated,
    Terminated,
    Refused,
    RequestParms,
}

/// How training is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum T38RateManagement {
    #[default]
    TransferredTcf,
    LocalTcf,
}

impl T38RateManagement {
    pub fn as_sdp(&self) -> &'static str {
        match self {
            T38RateManagement::TransferredTcf => "transferredTCF",
            T38RateManagement::LocalTcf => "localTCF",
        }
    }
}

/// T.38 session parameters exchanged with the channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct T38Parameters {
    pub version: u32,
    /// Maximum IFP frame size
    pub max_ifp: u32,
    /// Maximum bit rate in bits per second
    pub rate: u32,
    pub rate_management: T38RateManagement,
    pub fill_bit_removal: bool,
    pub transcoding_mmr: bool,
    pub transcoding_jbig: bool,
    pub request_response: T38Request,
}

impl Default for T38Parameters {
    fn default() -> Self {
        Self {
            version: 0,
            max_ifp: 400,
            rate: 14400,
            rate_management: T38RateManagement::TransferredTcf,
            fill_bit_removal: false,
            transcoding_mmr: false,
            transcoding_jbig: false,
            request_response: T38Request::RequestNegotiate,
        }
    }
}

impl T38Parameters {
    pub fn with_request(mut self, request: T38Request) -> Self {
        self.request_response = request;
        self
    }
}

/// Control frames relevant to the session layer
#[derive(Debug, Clone, PartialEq)]
pub enum ControlFrame {
    Hold,
    Unhold,
    Ringing,
    Progress,
    Answer,
    /// Caller/connected line changed
    ConnectedLine,
    T38Parameters(T38Parameters),
}

/// A frame queued toward the channel
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Wakes the channel so it re-reads negotiated formats
    Null,
    Control(ControlFrame),
    Text { content_type: String, body: String },
}

/// The PBX channel a session is bound to
pub trait Channel: Send + Sync {
    fn name(&self) -> &str;

    /// Queue a frame for the channel to read
    fn queue_frame(&self, frame: Frame) -> Result<()>;

    fn queue_control(&self, control: ControlFrame) -> Result<()> {
        self.queue_frame(Frame::Control(control))
    }

    /// Datastores attached to the channel
    fn datastores(&self) -> &DatastoreContainer;

    fn set_variable(&self, name: &str, value: &str);

    fn variable(&self, name: &str) -> Option<String>;
}

impl fmt::Debug for dyn Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel").field("name", &self.name()).finish()
    }
}

/// Intercepts control frames the application writes to a session's channel
pub trait FrameHook: Send + Sync {
    fn name(&self) -> &str;

    /// Returns true when the frame was consumed
    fn on_write(&self, session: &Arc<Session>, control: &ControlFrame) -> bool;
}
