//! SDP offer/answer against the registered handler chains

use std::sync::Arc;

use rand::Rng;
use tracing::{debug, warn};

use crate::channel::Frame;
use crate::errors::{Result, SessionError};
use crate::media::{MediaState, SdpDeferral, SdpHandler, SessionMedia, StreamOutcome};
use crate::sdp::{Connection, MediaDescription, Origin, SessionDescription};
use crate::session::{SdpCreationCallback, Session, SessionEvent};
use crate::dialog::NegotiatorState;

fn same_handler(a: &Arc<dyn SdpHandler>, b: &Arc<dyn SdpHandler>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

impl Session {
    /// Chain for a stream type, minus the handler already bound to `media`
    fn handler_chain(&self, media: &SessionMedia) -> (Option<Arc<dyn SdpHandler>>, Vec<Arc<dyn SdpHandler>>) {
        let bound = media.handler();
        let chain = self
            .ctx
            .sdp_handlers
            .handlers(media.stream_type())
            .into_iter()
            .filter(|h| bound.as_ref().is_none_or(|b| !same_handler(b, h)))
            .collect();
        (bound, chain)
    }

    /// True when answering `sdp` has to wait for an outside decision
    pub(crate) fn sdp_requires_deferral(self: &Arc<Self>, sdp: &SessionDescription) -> bool {
        let active = self.active_media();
        let mut pending = self.take_pending_media();
        let mut medias = Vec::with_capacity(sdp.media.len());
        for (index, stream) in sdp.media.iter().enumerate() {
            match pending.add(Some(&active), &stream.media, index) {
                Ok(media) => medias.push(media),
                Err(e) => {
                    warn!("Session {}: {}", self.id, e);
                    self.put_pending_media(pending);
                    return false;
                }
            }
        }
        self.put_pending_media(pending);

        for (index, media) in medias.iter().enumerate() {
            let (bound, chain) = self.handler_chain(media);
            if let Some(bound) = bound {
                match bound.defer_incoming_sdp_stream(self, media, sdp, index) {
                    SdpDeferral::Error => return false,
                    SdpDeferral::Needed => return true,
                    SdpDeferral::NotHandled | SdpDeferral::NotNeeded => continue,
                }
            }
            for handler in chain {
                match handler.defer_incoming_sdp_stream(self, media, sdp, index) {
                    SdpDeferral::NotHandled => continue,
                    SdpDeferral::Error => {
                        media.set_handler(handler);
                        return false;
                    }
                    SdpDeferral::NotNeeded => {
                        media.set_handler(handler);
                        break;
                    }
                    SdpDeferral::Needed => {
                        media.set_handler(handler);
                        return true;
                    }
                }
            }
        }
        false
    }

    /// Negotiate every stream of an incoming offer or answer into the pending state
    pub(crate) fn handle_incoming_sdp(self: &Arc<Self>, sdp: &SessionDescription) -> Result<()> {
        if self.is_disconnected() {
            return Err(SessionError::Disconnected(self.id.to_string()));
        }
        let active = self.active_media();
        let mut pending = self.take_pending_media();
        let result = self.negotiate_streams(&active, &mut pending, sdp);
        match result {
            Ok(()) => self.put_pending_media(pending),
            Err(_) => {
                pending.reset();
                self.put_pending_media(pending);
            }
        }
        result
    }

    fn negotiate_streams(
        self: &Arc<Self>,
        active: &MediaState,
        pending: &mut MediaState,
        sdp: &SessionDescription,
    ) -> Result<()> {
        let mut handled_any = false;
        for (index, stream) in sdp.media.iter().enumerate() {
            let media = pending.add(Some(active), &stream.media, index)?;
            if stream.is_declined() {
                debug!("Session {}: stream {} declined by peer", self.id, index);
                continue;
            }
            let (bound, chain) = self.handler_chain(&media);
            let mut handled = false;
            if let Some(bound) = bound {
                match bound.negotiate_incoming_sdp_stream(self, &media, sdp, index) {
                    StreamOutcome::Failed => {
                        return Err(SessionError::NegotiationFailed(format!(
                            "handler '{}' failed stream {}",
                            bound.id(),
                            index
                        )));
                    }
                    StreamOutcome::Claimed => handled = true,
                    StreamOutcome::NotHandled => {}
                }
            }
            if !handled {
                for handler in chain {
                    match handler.negotiate_incoming_sdp_stream(self, &media, sdp, index) {
                        StreamOutcome::NotHandled => continue,
                        StreamOutcome::Failed => {
                            return Err(SessionError::NegotiationFailed(format!(
                                "handler '{}' failed stream {}",
                                handler.id(),
                                index
                            )));
                        }
                        StreamOutcome::Claimed => {
                            debug!(
                                "Session {}: handler '{}' claimed {} stream {}",
                                self.id,
                                handler.id(),
                                stream.media,
                                index
                            );
                            media.set_handler(handler);
                            handled = true;
                            break;
                        }
                    }
                }
            }
            handled_any |= handled;
        }
        pending.truncate(sdp.media.len());
        if !handled_any {
            return Err(SessionError::NegotiationFailed(
                "no stream in the SDP could be handled".into(),
            ));
        }
        Ok(())
    }

    /// Build local SDP from the pending media state.
    ///
    /// With `remote` the result answers that offer stream for stream. With
    /// `previous` the origin continues that description's id and version.
    pub(crate) fn create_local_sdp(
        self: &Arc<Self>,
        remote: Option<&SessionDescription>,
        previous: Option<&SessionDescription>,
    ) -> Result<SessionDescription> {
        if self.is_disconnected() {
            return Err(SessionError::Disconnected(self.id.to_string()));
        }
        let media_config = &self.endpoint.media;
        let address = self.endpoint.advertised_media_address().to_string();
        let origin = match remote.or(previous) {
            None => {
                let id: u32 = rand::thread_rng().r#gen();
                Origin::new(media_config.sdp_owner.clone(), id as u64, id as u64, &address)
            }
            Some(base) => Origin::new(
                media_config.sdp_owner.clone(),
                base.origin.session_id,
                base.origin.session_version + 1,
                &address,
            ),
        };
        let mut local = SessionDescription::new(origin, media_config.sdp_session.clone());

        let active = self.active_media();
        let mut pending = self.take_pending_media();
        if let Some(remote) = remote {
            for (index, stream) in remote.media.iter().enumerate() {
                if let Err(e) = pending.add(Some(&active), &stream.media, index) {
                    self.put_pending_media(pending);
                    return Err(e);
                }
            }
            pending.truncate(remote.media.len());
        } else if pending.is_empty() {
            if active.is_empty() {
                if let Err(e) = pending.add(None, "audio", 0) {
                    self.put_pending_media(pending);
                    return Err(e);
                }
            } else {
                pending = (*active).clone();
            }
        }
        let medias = pending.sessions.clone();
        self.put_pending_media(pending);

        for (index, media) in medias.iter().enumerate() {
            let before = local.media.len();
            let (bound, chain) = self.handler_chain(media);
            let mut claimed = false;
            for (handler, is_bound) in bound.into_iter().map(|h| (h, true)).chain(chain.into_iter().map(|h| (h, false))) {
                match handler.create_outgoing_sdp_stream(self, media, &mut local, remote, index) {
                    StreamOutcome::NotHandled => continue,
                    StreamOutcome::Failed => {
                        return Err(SessionError::SdpCreationFailed(format!(
                            "handler '{}' failed stream {}",
                            handler.id(),
                            index
                        )));
                    }
                    StreamOutcome::Claimed => {
                        if !is_bound {
                            media.set_handler(handler);
                        }
                        claimed = true;
                        break;
                    }
                }
            }
            if local.media.len() == before {
                let (protocol, formats) = remote
                    .and_then(|r| r.media.get(index))
                    .map(|m| (m.protocol.clone(), m.formats.clone()))
                    .unwrap_or_else(|| ("RTP/AVP".to_string(), Vec::new()));
                debug!(
                    "Session {}: declining {} stream {} (claimed: {})",
                    self.id,
                    media.stream_type(),
                    index,
                    claimed
                );
                local
                    .media
                    .push(MediaDescription::declined(media.stream_type(), protocol, formats));
            }
        }

        consolidate_connections(&mut local, &address);
        Ok(local)
    }

    /// Rebuild the answer to the outstanding remote offer
    pub fn regenerate_answer(self: &Arc<Self>, on_sdp_creation: Option<SdpCreationCallback>) -> Result<()> {
        let offer = {
            let inv = self.inv.lock();
            if inv.negotiator != NegotiatorState::RemoteOffer {
                return Err(SessionError::invalid_state(format!(
                    "cannot regenerate an answer with negotiator state {:?}",
                    inv.negotiator
                )));
            }
            inv.remote_offer.clone()
        };
        let offer = offer.ok_or_else(|| SessionError::invalid_state("no remote offer"))?;
        let mut answer = self.create_local_sdp(Some(&offer), None)?;
        if let Some(cb) = on_sdp_creation {
            cb(self, &mut answer)?;
        }
        self.inv.lock().pending_local_sdp = Some(answer);
        Ok(())
    }

    /// Commit a completed negotiation: apply each stream and make pending active
    pub(crate) fn handle_negotiated_sdp(
        self: &Arc<Self>,
        local: &SessionDescription,
        remote: &SessionDescription,
    ) -> Result<()> {
        let active = self.active_media();
        let mut pending = self.take_pending_media();
        if pending.is_empty() {
            pending = (*active).clone();
        }
        let mut medias = Vec::with_capacity(local.media.len());
        for (index, stream) in local.media.iter().enumerate() {
            match pending.add(Some(&active), &stream.media, index) {
                Ok(media) => medias.push(media),
                Err(e) => {
                    self.put_pending_media(pending);
                    return Err(e);
                }
            }
        }
        pending.truncate(local.media.len());
        self.put_pending_media(pending);

        for (index, media) in medias.iter().enumerate() {
            let declined = local.media[index].is_declined()
                || remote.media.get(index).is_none_or(|m| m.is_declined());
            let (bound, chain) = self.handler_chain(media);
            let mut applied = false;
            if !declined {
                for (handler, is_bound) in bound
                    .clone()
                    .into_iter()
                    .map(|h| (h, true))
                    .chain(chain.into_iter().map(|h| (h, false)))
                {
                    match handler.apply_negotiated_sdp_stream(self, media, local, remote, index) {
                        StreamOutcome::NotHandled => continue,
                        StreamOutcome::Failed => {
                            return Err(SessionError::NegotiationFailed(format!(
                                "handler '{}' could not apply stream {}",
                                handler.id(),
                                index
                            )));
                        }
                        StreamOutcome::Claimed => {
                            if !is_bound {
                                media.set_handler(handler);
                            }
                            applied = true;
                            break;
                        }
                    }
                }
            }
            if !applied {
                if let Some(handler) = media.handler() {
                    debug!("Session {}: stopping unused stream {}", self.id, index);
                    handler.stream_stop(media);
                }
            }
        }

        let committed = self.take_pending_media();
        let stream_types = committed
            .stream_types()
            .into_iter()
            .map(str::to_string)
            .collect();
        self.active_media.store(Arc::new(committed));
        if let Some(channel) = self.channel() {
            if let Err(e) = channel.queue_frame(Frame::Null) {
                warn!("Session {}: could not wake channel: {}", self.id, e);
            }
        }
        self.emit(SessionEvent::MediaUpdated {
            session_id: self.id.clone(),
            stream_types,
        });
        Ok(())
    }

    /// Let stream handlers rewrite addresses right before transmission
    pub(crate) fn change_outgoing_media_addresses(self: &Arc<Self>, sdp: &mut SessionDescription) {
        let pending = self.pending_media.lock().sessions.clone();
        let active = self.active_media();
        for index in 0..sdp.media.len() {
            let media = pending
                .get(index)
                .or_else(|| active.get(index))
                .filter(|m| m.stream_type() == sdp.media[index].media)
                .cloned();
            if let Some(media) = media {
                if let Some(handler) = media.handler() {
                    handler.change_outgoing_sdp_stream_media_address(self, &media, sdp, index);
                }
            }
        }
    }
}

/// Hoist the first stream connection to session level and drop duplicates
fn consolidate_connections(sdp: &mut SessionDescription, fallback: &str) {
    let session_conn = sdp
        .media
        .iter()
        .find_map(|m| m.connection.clone())
        .unwrap_or_else(|| Connection::new(fallback));
    for media in sdp.media.iter_mut() {
        if media.connection.as_ref() == Some(&session_conn) {
            media.connection = None;
        }
    }
    sdp.origin.addr_type = session_conn.addr_type.clone();
    sdp.origin.address = session_conn.address.clone();
    sdp.connection = Some(session_conn);
}
