//! Session events published by the engine

use serde::{Deserialize, Serialize};

use crate::dialog::InviteState;
use crate::session::{SessionId, T38State};

/// Something observable happened to a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionEvent {
    Created {
        session_id: SessionId,
    },
    StateChanged {
        session_id: SessionId,
        state: InviteState,
    },
    /// An incoming re-INVITE is waiting for an outside decision
    ReinviteDeferred {
        session_id: SessionId,
    },
    /// A deferred re-INVITE is being processed again
    ReinviteResumed {
        session_id: SessionId,
    },
    /// A negotiation completed and the pending media became active
    MediaUpdated {
        session_id: SessionId,
        stream_types: Vec<String>,
    },
    T38StateChanged {
        session_id: SessionId,
        from: T38State,
        to: T38State,
    },
    Ended {
        session_id: SessionId,
    },
}

impl SessionEvent {
    pub fn session_id(&self) -> &SessionId {
        match self {
            SessionEvent::Created { session_id }
            | SessionEvent::StateChanged { session_id, .. }
            | SessionEvent::ReinviteDeferred { session_id }
            | SessionEvent::ReinviteResumed { session_id }
            | SessionEvent::MediaUpdated { session_id, .. }
            | SessionEvent::T38StateChanged { session_id, .. }
            | SessionEvent::Ended { session_id } => session_id,
        }
    }
}
