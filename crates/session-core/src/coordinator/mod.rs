//! Session engine
//!
//! The [`SessionCoordinator`] owns the global supplement and SDP handler
//! registries, the live session registry and the configuration snapshot.
//! The protocol engine feeds it received requests and responses; it finds or
//! creates the session and runs the work on that session's serializer.

pub mod registry;

use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::dialog::{dialog_key, InviteSession, InviteState};
use crate::errors::Result;
use crate::media::rtp::{RtpHandler, RTP_STREAM_TYPES};
use crate::media::{SdpHandler, SdpHandlerRegistry};
use crate::pbx::Dialplan;
use crate::session::{Session, SessionContext, SessionEvent, SessionId};
use crate::sip::{Method, NameAddr, SipRequest, SipResponse, SipSender};
use crate::supplement::{SessionSupplement, SupplementRegistry};

pub use registry::{RegistryStats, SessionRegistry};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Entry point of the session layer
pub struct SessionCoordinator {
    config: ArcSwap<SessionConfig>,
    supplements: SupplementRegistry,
    context: Arc<SessionContext>,
    dialplan: Arc<dyn Dialplan>,
}

impl SessionCoordinator {
    /// Build the engine with the core RTP handler registered for audio and video
    pub fn new(
        config: SessionConfig,
        sender: Arc<dyn SipSender>,
        dialplan: Arc<dyn Dialplan>,
    ) -> Result<Arc<Self>> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let context = Arc::new(SessionContext {
            sender,
            sdp_handlers: Arc::new(SdpHandlerRegistry::new()),
            registry: Arc::new(SessionRegistry::new()),
            events,
        });
        let rtp: Arc<dyn SdpHandler> = Arc::new(RtpHandler::new());
        for stream_type in RTP_STREAM_TYPES {
            context.sdp_handlers.register(rtp.clone(), stream_type)?;
        }
        info!(
            "Session coordinator started with {} endpoints",
            config.endpoints.len()
        );
        Ok(Arc::new(Self {
            config: ArcSwap::from_pointee(config),
            supplements: SupplementRegistry::new(),
            context,
            dialplan,
        }))
    }

    /// Current configuration snapshot
    pub fn config(&self) -> Arc<SessionConfig> {
        self.config.load_full()
    }

    /// Swap in a new configuration. Existing sessions keep their endpoint.
    pub fn reload_config(&self, config: SessionConfig) {
        info!("Reloading session configuration ({} endpoints)", config.endpoints.len());
        self.config.store(Arc::new(config));
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.context.events.subscribe()
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.context.registry
    }

    pub fn sdp_handlers(&self) -> &Arc<SdpHandlerRegistry> {
        &self.context.sdp_handlers
    }

    pub fn supplements(&self) -> &SupplementRegistry {
        &self.supplements
    }

    pub fn session(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.context.registry.get(id)
    }

    // Registration

    pub fn register_supplement(&self, supplement: Arc<dyn SessionSupplement>) {
        self.supplements.register(supplement);
    }

    pub fn unregister_supplement(&self, supplement: &Arc<dyn SessionSupplement>) -> bool {
        self.supplements.unregister(supplement)
    }

    pub fn register_sdp_handler(&self, handler: Arc<dyn SdpHandler>, stream_type: &str) -> Result<()> {
        self.context.sdp_handlers.register(handler, stream_type)
    }

    pub fn unregister_sdp_handler(&self, handler_id: &str, stream_type: &str) -> bool {
        self.context.sdp_handlers.unregister(handler_id, stream_type)
    }

    // Sessions

    fn session_alloc(&self, endpoint_id: &str, inv: InviteSession) -> Result<Arc<Session>> {
        let endpoint = Arc::new(self.config().endpoint(endpoint_id)?.clone());
        let key = inv.dialog_key();
        let session = Session::alloc(
            self.context.clone(),
            endpoint,
            self.supplements.snapshot(),
            inv,
        );
        self.context.registry.register(session.clone(), key);
        Ok(session)
    }

    /// Create a session for a call we will place. Send it with [`Session::send_invite`].
    pub fn create_outgoing(
        &self,
        endpoint_id: &str,
        local: NameAddr,
        remote: NameAddr,
    ) -> Result<Arc<Session>> {
        let session = self.session_alloc(endpoint_id, InviteSession::outgoing(local, remote))?;
        info!("Created outgoing session {} on endpoint {}", session.id(), endpoint_id);
        Ok(session)
    }

    /// Session whose peer sends with this Call-ID and From tag
    fn find_by_peer(&self, request: &SipRequest) -> Option<Arc<Session>> {
        self.context.registry.find(|s| {
            !s.is_ended() && s.is_peer_dialog(&request.call_id, request.from_tag.as_deref())
        })
    }

    fn reply_stateless(&self, request: &SipRequest, status: u16) {
        let response = SipResponse::for_request(request, status);
        if let Err(e) = self.context.sender.send_response(&response) {
            warn!("Failed to send {} to {}: {}", status, request.method, e);
        }
    }

    /// Route a received request. Returns false when it is not session business.
    pub async fn on_rx_request(&self, endpoint_id: &str, request: SipRequest) -> Result<bool> {
        if request.method == Method::Invite && !request.is_in_dialog() {
            if let Some(existing) = self.find_by_peer(&request) {
                if matches!(existing.invite_state(), InviteState::Incoming | InviteState::Early) {
                    debug!("Retransmitted INVITE for session {}", existing.id());
                    return Ok(true);
                }
            }
            let session = self.session_alloc(endpoint_id, InviteSession::incoming(&request))?;
            info!(
                "New incoming session {} for {} on endpoint {}",
                session.id(),
                request.uri,
                endpoint_id
            );
            let dialplan = self.dialplan.clone();
            let features = self.config().features.clone();
            session
                .push_task_synchronous(move |s| {
                    s.handle_new_invite(&request, dialplan.as_ref(), &features)
                })
                .await?;
            return Ok(true);
        }

        if request.method == Method::Cancel {
            let Some(session) = self.find_by_peer(&request) else {
                self.reply_stateless(&request, 481);
                return Ok(true);
            };
            session
                .push_task_synchronous(move |s| s.handle_in_dialog_request(&request))
                .await?;
            return Ok(true);
        }

        let Some(to_tag) = request.to_tag.as_deref() else {
            return Ok(false);
        };
        match self
            .context
            .registry
            .find_by_dialog(&dialog_key(&request.call_id, to_tag))
        {
            Some(session) => {
                session
                    .push_task_synchronous(move |s| s.handle_in_dialog_request(&request))
                    .await?;
                Ok(true)
            }
            None if request.method == Method::Ack => Ok(false),
            None => {
                debug!("No session for {} on dialog {}", request.method, request.call_id);
                self.reply_stateless(&request, 481);
                Ok(true)
            }
        }
    }

    /// Route a received response to the session that sent the request
    pub async fn on_rx_response(&self, response: SipResponse) -> Result<bool> {
        let Some(tag) = response.from_tag.as_deref() else {
            return Ok(false);
        };
        let Some(session) = self
            .context
            .registry
            .find_by_dialog(&dialog_key(&response.call_id, tag))
        else {
            debug!("No session for {} response on {}", response.status, response.call_id);
            return Ok(false);
        };
        session
            .push_task_synchronous(move |s| s.handle_response(&response))
            .await?;
        Ok(true)
    }
}

impl std::fmt::Debug for SessionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCoordinator")
            .field("supplements", &self.supplements)
            .field("sdp_handlers", &self.context.sdp_handlers)
            .field("sessions", &self.context.registry.len())
            .finish()
    }
}
