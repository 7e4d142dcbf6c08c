//! Core RTP stream handler for audio and video
//!
//! Negotiates the joint payload formats against the endpoint's codec list,
//! owns one UDP transport per stream and turns the peer's stream direction
//! into hold and unhold indications toward the channel.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::channel::ControlFrame;
use crate::media::{MediaTransport, SdpHandler, SessionMedia, StreamOutcome, TransportKind};
use crate::sdp::{Connection, MediaDescription, MediaDirection, SdpAttribute, SessionDescription};
use crate::session::Session;

pub const RTP_HANDLER_ID: &str = "rtp";

/// Stream types the core RTP handler registers for
pub const RTP_STREAM_TYPES: [&str; 2] = ["audio", "video"];

/// `a=rtpmap` value for the static and well-known payload types
fn rtpmap(format: &str) -> Option<&'static str> {
    match format {
        "0" => Some("PCMU/8000"),
        "8" => Some("PCMA/8000"),
        "9" => Some("G722/8000"),
        "18" => Some("G729/8000"),
        "101" => Some("telephone-event/8000"),
        _ => None,
    }
}

/// Point stream `index` of an outgoing SDP at `external` if it carries `local`
pub(crate) fn rewrite_connection(sdp: &mut SessionDescription, index: usize, local: &str, external: &str) {
    let Some(stream) = sdp.media.get_mut(index) else {
        return;
    };
    match stream.connection.as_mut() {
        Some(conn) if conn.address == local => *conn = Connection::new(external),
        Some(_) => {}
        None => {
            if let Some(conn) = sdp.connection.as_mut().filter(|c| c.address == local) {
                *conn = Connection::new(external);
                if sdp.origin.address == local {
                    sdp.origin.address = conn.address.clone();
                    sdp.origin.addr_type = conn.addr_type.clone();
                }
            }
        }
    }
}

/// Peer address for stream `index`, `None` when it cannot be parsed
pub(crate) fn remote_address(sdp: &SessionDescription, index: usize) -> Option<SocketAddr> {
    let stream = sdp.media.get(index)?;
    let ip: IpAddr = sdp.connection_for(index)?.address.parse().ok()?;
    Some(SocketAddr::new(ip, stream.port))
}

/// The built-in RTP handler
#[derive(Debug, Default)]
pub struct RtpHandler;

impl RtpHandler {
    pub fn new() -> Self {
        Self
    }

    fn allowed_formats(session: &Session, stream_type: &str) -> Vec<String> {
        let media = &session.endpoint().media;
        match stream_type {
            "audio" => media.codecs.clone(),
            "video" => media.video_codecs.clone(),
            _ => Vec::new(),
        }
    }

    /// Transport for the stream, binding one on first use
    fn ensure_transport(session: &Session, media: &SessionMedia) -> Option<Arc<MediaTransport>> {
        if let Some(transport) = media.transport().filter(|t| t.kind() == TransportKind::Rtp) {
            return Some(transport);
        }
        match MediaTransport::bind(TransportKind::Rtp, &session.endpoint().media.address) {
            Ok(transport) => {
                let transport = Arc::new(transport);
                media.set_transport(Some(transport.clone()));
                Some(transport)
            }
            Err(e) => {
                warn!("Session {}: RTP transport: {}", session.id(), e);
                None
            }
        }
    }
}

impl SdpHandler for RtpHandler {
    fn id(&self) -> &str {
        RTP_HANDLER_ID
    }

    fn negotiate_incoming_sdp_stream(
        &self,
        session: &Arc<Session>,
        media: &Arc<SessionMedia>,
        sdp: &SessionDescription,
        index: usize,
    ) -> StreamOutcome {
        let Some(stream) = sdp.media.get(index) else {
            return StreamOutcome::NotHandled;
        };
        if !stream.protocol.starts_with("RTP/") {
            return StreamOutcome::NotHandled;
        }
        let allowed = Self::allowed_formats(session, media.stream_type());
        let joint: Vec<String> = stream
            .formats
            .iter()
            .filter(|f| allowed.contains(f))
            .cloned()
            .collect();
        if joint.is_empty() {
            debug!(
                "Session {}: no joint {} formats in {:?}",
                session.id(),
                media.stream_type(),
                stream.formats
            );
            return StreamOutcome::NotHandled;
        }
        if Self::ensure_transport(session, media).is_none() {
            return StreamOutcome::Failed;
        }
        let mut params = media.params();
        params.formats = joint;
        params.direction = stream.direction().unwrap_or(MediaDirection::SendRecv);
        params.encryption = stream.attribute_value("crypto").map(str::to_string);
        StreamOutcome::Claimed
    }

    fn create_outgoing_sdp_stream(
        &self,
        session: &Arc<Session>,
        media: &Arc<SessionMedia>,
        local: &mut SessionDescription,
        remote: Option<&SessionDescription>,
        index: usize,
    ) -> StreamOutcome {
        let remote_stream = remote.and_then(|r| r.media.get(index));
        if remote_stream.is_some_and(|s| !s.protocol.starts_with("RTP/")) {
            return StreamOutcome::NotHandled;
        }
        let (formats, remote_direction, locally_held) = {
            let params = media.params();
            let formats = match remote_stream {
                Some(_) => params.formats.clone(),
                None => Self::allowed_formats(session, media.stream_type()),
            };
            (formats, remote_stream.map(|_| params.direction), params.locally_held)
        };
        if formats.is_empty() {
            return StreamOutcome::NotHandled;
        }
        let Some(transport) = Self::ensure_transport(session, media) else {
            return StreamOutcome::Failed;
        };

        let mut stream = MediaDescription::new(
            media.stream_type(),
            transport.local_addr().port(),
            "RTP/AVP",
        )
        .with_connection(Connection::new(&session.endpoint().media.address));
        for format in &formats {
            stream = stream.with_format(format.clone());
        }
        for format in &formats {
            if let Some(map) = rtpmap(format) {
                stream = stream.with_attribute(SdpAttribute::value("rtpmap", format!("{} {}", format, map)));
            }
        }
        let direction = if locally_held {
            MediaDirection::SendOnly
        } else {
            remote_direction
                .map(|d| d.reversed())
                .unwrap_or(MediaDirection::SendRecv)
        };
        stream.set_direction(direction);
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
        let Some(stream) = remote.media.get(index) else {
            return StreamOutcome::NotHandled;
        };
        let Some(transport) = media.transport().filter(|t| t.kind() == TransportKind::Rtp) else {
            return StreamOutcome::NotHandled;
        };
        let Some(peer) = remote_address(remote, index) else {
            warn!("Session {}: no usable connection for stream {}", session.id(), index);
            return StreamOutcome::Failed;
        };
        transport.set_remote_addr(peer);

        let direction = stream.direction().unwrap_or(MediaDirection::SendRecv);
        let held = matches!(direction, MediaDirection::SendOnly | MediaDirection::Inactive)
            || peer.ip().is_unspecified();
        let changed = {
            let mut params = media.params();
            params.direction = direction;
            std::mem::replace(&mut params.remotely_held, held) != held
        };
        if changed && media.stream_type() == "audio" {
            if let Some(channel) = session.channel() {
                let control = if held { ControlFrame::Hold } else { ControlFrame::Unhold };
                if let Err(e) = channel.queue_control(control) {
                    warn!("Session {}: could not queue hold change: {}", session.id(), e);
                }
            }
        }

        session.update_pending_media(|pending| {
            let registered = pending
                .read_callbacks
                .iter()
                .any(|cb| Arc::ptr_eq(&cb.media, media));
            if !registered && pending.sessions.iter().any(|m| Arc::ptr_eq(m, media)) {
                let _ = pending.add_read_callback(RTP_HANDLER_ID, media);
            }
        });
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
        if let Some(transport) = media.transport() {
            transport.stop();
        }
    }

    fn stream_destroy(&self, media: &SessionMedia) {
        media.set_transport(None);
    }
}
