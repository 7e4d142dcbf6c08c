//! UDP media transports for RTP and UDPTL streams

use std::fmt;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::debug;

use crate::errors::{Result, SessionError};

/// What a transport carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Rtp,
    Udptl,
}

/// A bound UDP socket plus the negotiated peer address
pub struct MediaTransport {
    kind: TransportKind,
    socket: UdpSocket,
    local: SocketAddr,
    remote: Mutex<Option<SocketAddr>>,
    stopped: AtomicBool,
    /// UDPTL only: largest datagram the far end accepts
    far_max_datagram: Mutex<u32>,
    /// UDPTL only: largest datagram we accept
    local_max_datagram: Mutex<u32>,
}

impl MediaTransport {
    /// Bind an ephemeral port on `address`
    pub fn bind(kind: TransportKind, address: &str) -> Result<Self> {
        let ip: IpAddr = address
            .parse()
            .map_err(|_| SessionError::Transport(format!("invalid media address '{}'", address)))?;
        let socket = UdpSocket::bind(SocketAddr::new(ip, 0))
            .map_err(|e| SessionError::Transport(format!("bind {} failed: {}", address, e)))?;
        let local = socket
            .local_addr()
            .map_err(|e| SessionError::Transport(e.to_string()))?;
        debug!("Bound {:?} transport on {}", kind, local);
        Ok(Self {
            kind,
            socket,
            local,
            remote: Mutex::new(None),
            stopped: AtomicBool::new(false),
            far_max_datagram: Mutex::new(0),
            local_max_datagram: Mutex::new(0),
        })
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        *self.remote.lock()
    }

    pub fn set_remote_addr(&self, remote: SocketAddr) {
        *self.remote.lock() = Some(remote);
        self.stopped.store(false, Ordering::SeqCst);
    }

    /// Stop sending until a new peer address is set
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn far_max_datagram(&self) -> u32 {
        *self.far_max_datagram.lock()
    }

    pub fn set_far_max_datagram(&self, size: u32) {
        *self.far_max_datagram.lock() = size;
    }

    pub fn local_max_datagram(&self) -> u32 {
        *self.local_max_datagram.lock()
    }

    pub fn set_local_max_datagram(&self, size: u32) {
        *self.local_max_datagram.lock() = size;
    }

    /// Send one datagram to the peer
    pub fn send(&self, payload: &[u8]) -> Result<usize> {
        if self.is_stopped() {
            return Err(SessionError::Transport("transport stopped".into()));
        }
        let remote = self
            .remote_addr()
            .ok_or_else(|| SessionError::Transport("no remote address".into()))?;
        self.socket
            .send_to(payload, remote)
            .map_err(|e| SessionError::Transport(e.to_string()))
    }
}

impl fmt::Debug for MediaTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTransport")
            .field("kind", &self.kind)
            .field("local", &self.local)
            .field("remote", &self.remote_addr())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
