//! T.38 fax over UDPTL
//!
//! Three cooperating pieces:
//!
//! - [`T38Handler`], the SDP handler for `image` streams. A peer re-INVITE
//!   offering T.38 while the session is not faxing is deferred until the
//!   application accepts or refuses it, or until the auto-reject timer fires.
//! - [`T38FrameHook`], which intercepts `T38Parameters` control frames the
//!   application writes and interprets them on the session serializer.
//! - [`T38Supplement`], which attaches the frame hook once per channel.
//!
//! Per-session negotiation state lives in the `t38` session datastore.

use std::sync::Arc;

use parking_lot::Mutex;
use rvoip_infra_common::{schedule, Datastore, DatastoreType, ScheduledTask};
use tracing::{debug, info, warn};

use crate::channel::{ControlFrame, FrameHook, T38Parameters, T38RateManagement, T38Request};
use crate::config::T38ErrorCorrection;
use crate::coordinator::SessionCoordinator;
use crate::errors::Result;
use crate::media::rtp::{remote_address, rewrite_connection};
use crate::media::{MediaState, MediaTransport, SdpDeferral, SdpHandler, SessionMedia, StreamOutcome, TransportKind};
use crate::sdp::{Connection, MediaDescription, SdpAttribute, SessionDescription};
use crate::session::{RefreshOptions, Session, T38State};
use crate::sip::{SipRequest, SipResponse};
use crate::supplement::{priority, RequestDisposition, SessionSupplement};

pub const T38_HANDLER_ID: &str = "t38";
pub const T38_STREAM_TYPE: &str = "image";

const STATE_DATASTORE: &str = "t38";
const FRAMEHOOK_DATASTORE: &str = "T38 framehook";

struct T38DatastoreType(&'static str);

impl DatastoreType for T38DatastoreType {
    fn name(&self) -> &str {
        self.0
    }
}

/// Negotiation state kept per session
#[derive(Debug, Default)]
pub struct T38SessionState {
    /// Parameters we answer or offer with
    pub our_parms: T38Parameters,
    /// Parameters the peer sent in its SDP
    pub their_parms: T38Parameters,
    pub their_error_correction: T38ErrorCorrection,
    timer: Option<ScheduledTask>,
    /// Bumped on every state change; a timer from an older generation is stale
    generation: u64,
    /// Auto-reject timers stopped before they fired
    pub auto_reject_cancels: u32,
    /// Streams to go back to when leaving T.38
    saved_media_state: Option<MediaState>,
}

type SharedState = Arc<Mutex<T38SessionState>>;

fn existing_state(session: &Session) -> Option<SharedState> {
    session
        .get_datastore(STATE_DATASTORE)?
        .data::<Mutex<T38SessionState>>()
}

fn state_for(session: &Session) -> Option<SharedState> {
    if let Some(state) = existing_state(session) {
        return Some(state);
    }
    let state: SharedState = Arc::new(Mutex::new(T38SessionState::default()));
    let datastore = Datastore::alloc(
        Arc::new(T38DatastoreType("t38 session state")),
        Some(STATE_DATASTORE),
        Some(state.clone()),
    );
    match session.add_datastore(datastore) {
        Ok(()) => Some(state),
        Err(_) => existing_state(session),
    }
}

/// Number of auto-reject timers cancelled by a state change before firing
pub fn auto_reject_cancels(session: &Session) -> u32 {
    existing_state(session).map_or(0, |s| s.lock().auto_reject_cancels)
}

/// Parameters the peer last sent, if T.38 was ever negotiated on the session
pub fn their_parameters(session: &Session) -> Option<T38Parameters> {
    existing_state(session).map(|s| s.lock().their_parms)
}

pub fn our_parameters(session: &Session) -> Option<T38Parameters> {
    existing_state(session).map(|s| s.lock().our_parms)
}

/// The session's image stream, pending first
fn image_media(session: &Session) -> Option<Arc<SessionMedia>> {
    let pending = session.update_pending_media(|p| p.default_for(T38_STREAM_TYPE).cloned());
    pending.or_else(|| session.active_media().default_for(T38_STREAM_TYPE).cloned())
}

fn udptl_transport(media: &SessionMedia) -> Option<Arc<MediaTransport>> {
    media.transport().filter(|t| t.kind() == TransportKind::Udptl)
}

/// Bind a UDPTL transport for the stream unless it has one
fn initialize_udptl(session: &Session, media: &SessionMedia) -> Result<Arc<MediaTransport>> {
    if let Some(transport) = udptl_transport(media) {
        return Ok(transport);
    }
    let config = &session.endpoint().media;
    let transport = Arc::new(MediaTransport::bind(TransportKind::Udptl, &config.address)?);
    if config.t38.max_datagram > 0 {
        transport.set_local_max_datagram(config.t38.max_datagram);
    }
    media.set_transport(Some(transport.clone()));
    debug!("Session {}: UDPTL bound on {}", session.id(), transport.local_addr());
    Ok(transport)
}

/// Peer parameters with the max IFP the far end accepts
fn peer_parameters(state: &T38SessionState, media: Option<&Arc<SessionMedia>>) -> T38Parameters {
    let mut parameters = state.their_parms;
    let far = media.and_then(|m| udptl_transport(m)).map_or(0, |t| t.far_max_datagram());
    if far > 0 {
        parameters.max_ifp = far;
    }
    parameters
}

fn change_state(
    session: &Arc<Session>,
    media: Option<&Arc<SessionMedia>>,
    state: &SharedState,
    new_state: T38State,
) {
    let old_state = session.t38_state();
    if old_state == new_state {
        return;
    }
    session.set_t38_state(new_state);

    let generation = {
        let mut st = state.lock();
        if let Some(timer) = st.timer.take() {
            if timer.cancel() {
                st.auto_reject_cancels += 1;
            }
        }
        st.generation += 1;
        st.generation
    };

    let Some(channel) = session.channel() else {
        return;
    };

    let parameters = match new_state {
        T38State::PeerReinvite => {
            let timeout = session.endpoint().media.t38.auto_reject_timeout();
            let weak = Arc::downgrade(session);
            let timer = schedule(timeout, async move {
                if let Some(session) = weak.upgrade() {
                    if let Err(e) = session.push_task(move |s| auto_reject(s, generation)) {
                        debug!("Session {}: {}", session.id(), e);
                    }
                }
            });
            let mut st = state.lock();
            st.timer = Some(timer);
            Some(peer_parameters(&st, media).with_request(T38Request::RequestNegotiate))
        }
        T38State::Enabled => {
            let st = state.lock();
            Some(peer_parameters(&st, media).with_request(T38Request::Negotiated))
        }
        T38State::Rejected | T38State::Disabled => match old_state {
            T38State::Enabled => Some(T38Parameters::default().with_request(T38Request::Terminated)),
            T38State::LocalReinvite => Some(T38Parameters::default().with_request(T38Request::Refused)),
            _ => None,
        },
        T38State::LocalReinvite => None,
    };
    if let Some(parameters) = parameters {
        if let Err(e) = channel.queue_control(ControlFrame::T38Parameters(parameters)) {
            warn!("Session {}: could not queue T.38 parameters: {}", session.id(), e);
        }
    }
}

/// Auto-reject timer expiry, run on the session serializer
fn auto_reject(session: &Arc<Session>, generation: u64) {
    let Some(state) = existing_state(session) else {
        return;
    };
    if state.lock().generation != generation || session.t38_state() != T38State::PeerReinvite {
        debug!("Session {}: stale T.38 auto-reject ignored", session.id());
        return;
    }
    info!("Session {}: automatically rejecting T.38 re-INVITE", session.id());
    let media = image_media(session);
    change_state(session, media.as_ref(), &state, T38State::Rejected);
    session.resume_reinvite();
}

/// Read the peer's T.38 attributes from an image stream
fn interpret_sdp(session: &Session, media: &SessionMedia, state: &SharedState, stream: &MediaDescription) {
    let config = &session.endpoint().media.t38;
    let mut st = state.lock();
    for attribute in &stream.attributes {
        let value = attribute.value.as_deref().unwrap_or("").trim();
        let flag = value != "0";
        match attribute.name.to_ascii_lowercase().as_str() {
            "t38maxbitrate" => {
                if let Ok(rate) = value.parse() {
                    st.their_parms.rate = rate;
                }
            }
            "t38faxversion" => {
                if let Ok(version) = value.parse() {
                    st.their_parms.version = version;
                }
            }
            "t38faxmaxdatagram" | "t38maxdatagram" => {
                let size = if config.max_datagram > 0 {
                    config.max_datagram
                } else {
                    value.parse().unwrap_or(0)
                };
                if let Some(transport) = udptl_transport(media) {
                    transport.set_far_max_datagram(size);
                }
            }
            "t38faxfillbitremoval" => st.their_parms.fill_bit_removal = flag,
            "t38faxtranscodingmmr" => st.their_parms.transcoding_mmr = flag,
            "t38faxtranscodingjbig" => st.their_parms.transcoding_jbig = flag,
            "t38faxratemanagement" => {
                if value.eq_ignore_ascii_case("localTCF") {
                    st.their_parms.rate_management = T38RateManagement::LocalTcf;
                } else if value.eq_ignore_ascii_case("transferredTCF") {
                    st.their_parms.rate_management = T38RateManagement::TransferredTcf;
                }
            }
            "t38faxudpec" => {
                st.their_error_correction = if value.eq_ignore_ascii_case("t38UDPRedundancy") {
                    T38ErrorCorrection::Redundancy
                } else if value.eq_ignore_ascii_case("t38UDPFEC") {
                    T38ErrorCorrection::Fec
                } else {
                    T38ErrorCorrection::None
                };
            }
            _ => {}
        }
    }
}

/// Act on a `T38Parameters` frame written by the application
pub fn interpret_parameters(session: &Arc<Session>, parameters: T38Parameters) {
    let Some(state) = state_for(session) else {
        return;
    };
    let media = image_media(session);
    let current = session.t38_state();
    debug!(
        "Session {}: T.38 {:?} in state {:?}",
        session.id(),
        parameters.request_response,
        current
    );

    match parameters.request_response {
        T38Request::Negotiated | T38Request::RequestNegotiate => {
            if current == T38State::PeerReinvite {
                let our = {
                    let mut st = state.lock();
                    let their = st.their_parms;
                    let mut our = parameters;
                    our.fill_bit_removal &= their.fill_bit_removal;
                    our.transcoding_mmr &= their.transcoding_mmr;
                    our.transcoding_jbig &= their.transcoding_jbig;
                    our.version = our.version.min(their.version);
                    our.rate_management = their.rate_management;
                    st.our_parms = our;
                    our
                };
                if let Some(transport) = media.as_ref().and_then(|m| udptl_transport(m)) {
                    transport.set_local_max_datagram(our.max_ifp);
                }
                change_state(session, media.as_ref(), &state, T38State::Enabled);
                session.resume_reinvite();
            } else if current != T38State::Enabled
                || parameters.request_response == T38Request::RequestNegotiate
            {
                start_local_reinvite(session, &state, parameters);
            }
        }
        T38Request::Terminated | T38Request::Refused | T38Request::RequestTerminate => match current {
            T38State::PeerReinvite => {
                change_state(session, media.as_ref(), &state, T38State::Rejected);
                session.resume_reinvite();
            }
            T38State::Enabled => {
                change_state(session, media.as_ref(), &state, T38State::Disabled);
                let mut options = RefreshOptions::invite();
                if let Some(saved) = state.lock().saved_media_state.take() {
                    options = options.with_media_state(saved);
                }
                if let Err(e) = session.refresh(options) {
                    warn!("Session {}: re-INVITE back to audio failed: {}", session.id(), e);
                }
            }
            _ => {}
        },
        T38Request::RequestParms => {
            if current == T38State::PeerReinvite {
                let reply = peer_parameters(&state.lock(), media.as_ref())
                    .with_request(T38Request::RequestNegotiate);
                if let Some(channel) = session.channel() {
                    if let Err(e) = channel.queue_control(ControlFrame::T38Parameters(reply)) {
                        warn!("Session {}: could not queue T.38 parameters: {}", session.id(), e);
                    }
                }
            }
        }
    }
}

/// Re-INVITE the peer onto a single image stream
fn start_local_reinvite(session: &Arc<Session>, state: &SharedState, parameters: T38Parameters) {
    let mut media_state = MediaState::new();
    let image = match media_state.add(None, T38_STREAM_TYPE, 0) {
        Ok(image) => image,
        Err(e) => {
            warn!("Session {}: {}", session.id(), e);
            return;
        }
    };
    state.lock().our_parms = parameters;
    change_state(session, Some(&image), state, T38State::LocalReinvite);

    let sdp_state = state.clone();
    let response_state = state.clone();
    let options = RefreshOptions::invite()
        .with_media_state(media_state)
        .on_sdp_creation(Box::new(move |session, _sdp| {
            sdp_state.lock().saved_media_state = Some((*session.active_media()).clone());
            Ok(())
        }))
        .on_response(Box::new(move |session, response| {
            local_reinvite_response(session, &response_state, response);
        }));
    if let Err(e) = session.refresh(options) {
        warn!("Session {}: T.38 re-INVITE failed: {}", session.id(), e);
        change_state(session, Some(&image), state, T38State::Rejected);
    }
}

fn local_reinvite_response(session: &Arc<Session>, state: &SharedState, response: &SipResponse) {
    if session.channel().is_none() {
        return;
    }
    if session.t38_state() != T38State::LocalReinvite {
        debug!("Session {}: T.38 re-INVITE already had a final response", session.id());
        return;
    }
    if response.is_success() {
        let media = session.active_media().default_for(T38_STREAM_TYPE).cloned();
        change_state(session, media.as_ref(), state, T38State::Enabled);
        let saved = state.lock().saved_media_state.clone();
        for stream in saved.iter().flat_map(|s| s.sessions.iter()) {
            if let Some(handler) = stream.handler() {
                handler.stream_stop(stream);
            }
        }
    } else {
        let media = image_media(session);
        change_state(session, media.as_ref(), state, T38State::Rejected);
        state.lock().saved_media_state = None;
        session.reset_pending_media();
    }
}

/// SDP handler for `image` streams
#[derive(Debug, Default)]
pub struct T38Handler;

impl T38Handler {
    pub fn new() -> Self {
        Self
    }
}

impl SdpHandler for T38Handler {
    fn id(&self) -> &str {
        T38_HANDLER_ID
    }

    fn defer_incoming_sdp_stream(
        &self,
        session: &Arc<Session>,
        media: &Arc<SessionMedia>,
        sdp: &SessionDescription,
        index: usize,
    ) -> SdpDeferral {
        if !session.endpoint().media.t38.enabled {
            return SdpDeferral::NotHandled;
        }
        if let Err(e) = initialize_udptl(session, media) {
            warn!("Session {}: {}", session.id(), e);
            return SdpDeferral::Error;
        }
        let (Some(state), Some(stream)) = (state_for(session), sdp.media.get(index)) else {
            return SdpDeferral::Error;
        };
        interpret_sdp(session, media, &state, stream);
        if session.t38_state() == T38State::Disabled {
            change_state(session, Some(media), &state, T38State::PeerReinvite);
            return SdpDeferral::Needed;
        }
        SdpDeferral::NotNeeded
    }

    fn negotiate_incoming_sdp_stream(
        &self,
        session: &Arc<Session>,
        media: &Arc<SessionMedia>,
        sdp: &SessionDescription,
        index: usize,
    ) -> StreamOutcome {
        let config = &session.endpoint().media.t38;
        if !config.enabled {
            return StreamOutcome::NotHandled;
        }
        let Some(state) = state_for(session) else {
            return StreamOutcome::Failed;
        };
        if matches!(session.t38_state(), T38State::Rejected | T38State::Disabled) {
            debug!("Session {}: declining image stream, T.38 not negotiated", session.id());
            change_state(session, Some(media), &state, T38State::Disabled);
            return StreamOutcome::NotHandled;
        }
        let Some(ip) = sdp
            .connection_for(index)
            .and_then(|c| c.address.parse::<std::net::IpAddr>().ok())
        else {
            debug!("Session {}: declining image stream, invalid host", session.id());
            return StreamOutcome::NotHandled;
        };
        if ip.is_ipv6() != config.ipv6 {
            debug!("Session {}: declining image stream, address family mismatch", session.id());
            return StreamOutcome::NotHandled;
        }
        match initialize_udptl(session, media) {
            Ok(_) => StreamOutcome::Claimed,
            Err(e) => {
                warn!("Session {}: {}", session.id(), e);
                StreamOutcome::Failed
            }
        }
    }

    fn create_outgoing_sdp_stream(
        &self,
        session: &Arc<Session>,
        media: &Arc<SessionMedia>,
        local: &mut SessionDescription,
        _remote: Option<&SessionDescription>,
        _index: usize,
    ) -> StreamOutcome {
        let config = &session.endpoint().media;
        if !config.t38.enabled
            || !matches!(
                session.t38_state(),
                T38State::LocalReinvite | T38State::PeerReinvite | T38State::Enabled
            )
        {
            return StreamOutcome::Claimed;
        }
        let Some(state) = state_for(session) else {
            return StreamOutcome::Failed;
        };
        let transport = match initialize_udptl(session, media) {
            Ok(transport) => transport,
            Err(e) => {
                warn!("Session {}: {}", session.id(), e);
                return StreamOutcome::Failed;
            }
        };
        let our = state.lock().our_parms;
        let max_datagram = if config.t38.max_datagram > 0 {
            config.t38.max_datagram
        } else {
            our.max_ifp
        };
        transport.set_local_max_datagram(max_datagram);

        let mut stream = MediaDescription::new(T38_STREAM_TYPE, transport.local_addr().port(), "udptl")
            .with_format("t38")
            .with_connection(Connection::new(&config.address))
            .with_attribute(SdpAttribute::value("T38FaxVersion", our.version.to_string()))
            .with_attribute(SdpAttribute::value("T38MaxBitRate", our.rate.to_string()));
        if our.fill_bit_removal {
            stream = stream.with_attribute(SdpAttribute::flag("T38FaxFillBitRemoval"));
        }
        if our.transcoding_mmr {
            stream = stream.with_attribute(SdpAttribute::flag("T38FaxTranscodingMMR"));
        }
        if our.transcoding_jbig {
            stream = stream.with_attribute(SdpAttribute::flag("T38FaxTranscodingJBIG"));
        }
        stream = stream
            .with_attribute(SdpAttribute::value(
                "T38FaxRateManagement",
                our.rate_management.as_sdp(),
            ))
            .with_attribute(SdpAttribute::value(
                "T38FaxMaxDatagram",
                transport.local_max_datagram().to_string(),
            ));
        match config.t38.error_correction {
            T38ErrorCorrection::None => {}
            T38ErrorCorrection::Fec => {
                stream = stream.with_attribute(SdpAttribute::value("T38FaxUdpEC", "t38UDPFEC"));
            }
            T38ErrorCorrection::Redundancy => {
                stream = stream.with_attribute(SdpAttribute::value("T38FaxUdpEC", "t38UDPRedundancy"));
            }
        }
        local.media.push(stream);
        StreamOutcome::Claimed
    }

    fn apply_negotiated_sdp_stream(
        &self,
        session: &Arc<Session>,
        media: &Arc<SessionMedia>,
        _local: &SessionDescription,
        remote: &SessionDescription,
        index: usize,
    ) -> StreamOutcome {
        let Some(transport) = udptl_transport(media) else {
            return StreamOutcome::NotHandled;
        };
        let (Some(state), Some(stream)) = (state_for(session), remote.media.get(index)) else {
            return StreamOutcome::Failed;
        };
        let Some(peer) = remote_address(remote, index) else {
            warn!("Session {}: invalid UDPTL peer address", session.id());
            return StreamOutcome::Failed;
        };
        transport.set_remote_addr(peer);
        interpret_sdp(session, media, &state, stream);
        StreamOutcome::Claimed
    }

    fn change_outgoing_sdp_stream_media_address(
        &self,
        session: &Arc<Session>,
        _media: &Arc<SessionMedia>,
        sdp: &mut SessionDescription,
        index: usize,
    ) {
        let config = &session.endpoint().media;
        if let Some(external) = &config.external_media_address {
            rewrite_connection(sdp, index, &config.address, external);
        }
    }

    fn stream_stop(&self, media: &SessionMedia) {
        if let Some(transport) = udptl_transport(media) {
            transport.stop();
        }
    }

    fn stream_destroy(&self, media: &SessionMedia) {
        if udptl_transport(media).is_some() {
            media.set_transport(None);
        }
    }
}

/// Intercepts `T38Parameters` frames written toward the channel
#[derive(Debug, Default)]
pub struct T38FrameHook;

impl FrameHook for T38FrameHook {
    fn name(&self) -> &str {
        "t38"
    }

    fn on_write(&self, session: &Arc<Session>, control: &ControlFrame) -> bool {
        let ControlFrame::T38Parameters(parameters) = control else {
            return false;
        };
        if session.endpoint().media.t38.enabled {
            let parameters = *parameters;
            if let Err(e) = session.push_task(move |s| interpret_parameters(s, parameters)) {
                warn!("Session {}: could not queue T.38 parameters: {}", session.id(), e);
            }
        } else if let Some(channel) = session.channel() {
            let reply = match parameters.request_response {
                T38Request::RequestNegotiate => Some(T38Request::Refused),
                T38Request::RequestTerminate => Some(T38Request::Terminated),
                _ => None,
            };
            if let Some(reply) = reply {
                let frame = ControlFrame::T38Parameters(T38Parameters::default().with_request(reply));
                if let Err(e) = channel.queue_control(frame) {
                    warn!("Session {}: could not queue T.38 reply: {}", session.id(), e);
                }
            }
        }
        true
    }
}

fn attach_framehook(session: &Arc<Session>) {
    let Some(channel) = session.channel() else {
        return;
    };
    if !session.endpoint().media.t38.enabled {
        return;
    }
    if channel.datastores().find(FRAMEHOOK_DATASTORE).is_some() {
        return;
    }
    let marker = Datastore::alloc(
        Arc::new(T38DatastoreType("t38 framehook")),
        Some(FRAMEHOOK_DATASTORE),
        None,
    );
    if channel.datastores().add(marker).is_err() {
        return;
    }
    session.attach_frame_hook(Arc::new(T38FrameHook));
}

/// Attaches the frame hook to INVITE sessions that have a channel
#[derive(Debug, Default)]
pub struct T38Supplement;

impl SessionSupplement for T38Supplement {
    fn name(&self) -> &str {
        "t38"
    }

    fn method(&self) -> Option<&str> {
        Some("INVITE")
    }

    fn priority(&self) -> i32 {
        priority::CHANNEL + 1
    }

    fn incoming_request(&self, session: &Arc<Session>, _request: &SipRequest) -> RequestDisposition {
        attach_framehook(session);
        RequestDisposition::Continue
    }

    fn outgoing_request(&self, session: &Arc<Session>, _request: &mut SipRequest) {
        attach_framehook(session);
    }
}

/// Register the T.38 supplement and `image` handler with the engine
pub fn load(coordinator: &SessionCoordinator) -> Result<Arc<dyn SessionSupplement>> {
    coordinator.register_sdp_handler(Arc::new(T38Handler::new()), T38_STREAM_TYPE)?;
    let supplement: Arc<dyn SessionSupplement> = Arc::new(T38Supplement);
    coordinator.register_supplement(supplement.clone());
    info!("T.38 support loaded");
    Ok(supplement)
}

pub fn unload(coordinator: &SessionCoordinator, supplement: &Arc<dyn SessionSupplement>) {
    coordinator.unregister_supplement(supplement);
    coordinator.unregister_sdp_handler(T38_HANDLER_ID, T38_STREAM_TYPE);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_defaults_to_standard_parameters() {
        let state = T38SessionState::default();
        assert_eq!(state.our_parms.max_ifp, 400);
        assert_eq!(state.their_parms.rate, 14400);
        assert_eq!(state.auto_reject_cancels, 0);
        assert!(state.saved_media_state.is_none());
    }
}
