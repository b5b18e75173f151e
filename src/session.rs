//! Per-connection DIRCON session state (§3). Exactly one session is active
//! at a time; the server holds it inline rather than in a connection table.

use std::net::SocketAddr;
use std::time::Instant;

use tokio::net::TcpStream;

/// The live state of the single accepted DIRCON client connection.
pub struct DirconSession {
    pub socket: Option<TcpStream>,
    pub local_addr: Option<SocketAddr>,
    pub remote_addr: Option<SocketAddr>,
    pub last_tx_seq: u8,
    pub tx_count: u64,
    pub rx_count: u64,
    pub ibd_notifications_enabled: bool,
    pub fmcp_notifications_enabled: bool,
    pub next_notification_deadline: Option<Instant>,
    pub response_pending: bool,
}

impl DirconSession {
    /// `last_tx_seq = 0xFF` so the first notification's pre-increment lands
    /// on sequence 0.
    pub fn new() -> Self {
        DirconSession {
            socket: None,
            local_addr: None,
            remote_addr: None,
            last_tx_seq: 0xFF,
            tx_count: 0,
            rx_count: 0,
            ibd_notifications_enabled: false,
            fmcp_notifications_enabled: false,
            next_notification_deadline: None,
            response_pending: false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.socket.is_some()
    }

    pub fn attach(&mut self, socket: TcpStream, local_addr: SocketAddr, remote_addr: SocketAddr) {
        self.socket = Some(socket);
        self.local_addr = Some(local_addr);
        self.remote_addr = Some(remote_addr);
    }

    /// Advance and return the sequence number to stamp on a server-initiated
    /// frame (notifications). Wraps mod 256 per §3's invariant.
    pub fn next_tx_seq(&mut self) -> u8 {
        self.last_tx_seq = self.last_tx_seq.wrapping_add(1);
        self.tx_count += 1;
        self.last_tx_seq
    }

    pub fn record_rx(&mut self) {
        self.rx_count += 1;
    }

    /// Connection-drop cleanup (§4.9): clear deadlines, clear both enable
    /// flags, reset counters, drop the socket and cached addresses.
    pub fn reset(&mut self) {
        *self = DirconSession::new();
    }
}

impl Default for DirconSession {
    fn default() -> Self {
        DirconSession::new()
    }
}
