//! The top-level state aggregate and event loop (§3, §4.9). Bundles the
//! GATT table, the one active session, telemetry, and mDNS bookkeeping,
//! and drives everything from a single `tokio::select!` per iteration —
//! the async re-expression of the donor's single-threaded cooperative
//! poll loop.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpSocket, TcpStream, UdpSocket};

use crate::config::{Config, PowerRange};
use crate::error::{FatalError, ProtocolError};
use crate::gatt::GattTable;
use crate::handlers;
use crate::mdns;
use crate::protocol::{Frame, MesgId, RespCode, HEADER_LEN};
use crate::session::DirconSession;
use crate::telemetry::{ActivityFileSource, ConstantTelemetry, TelemetrySource};

const NOTIFICATION_PERIOD: Duration = Duration::from_secs(1);
const MDNS_READVERTISE_PERIOD: Duration = Duration::from_secs(60);
const PROBE_SPACING: Duration = Duration::from_millis(250);
const TICK_PERIOD: Duration = Duration::from_millis(10);
const RX_BUFFER_SIZE: usize = 4096;

/// An FMCP write staged for its mandatory follow-up notification (§4.5.4).
pub struct PendingCpResponse {
    pub chr_uuid16: u16,
    pub req_opcode: u8,
    pub result: u8,
}

pub struct Server {
    pub listen_addr: SocketAddr,
    pub mac_addr: [u8; 6],
    pub gatt_table: GattTable,
    pub session: DirconSession,
    pub config: Config,
    pub config_telemetry: ConstantTelemetry,
    pub telemetry_stream: Option<Box<dyn TelemetrySource + Send>>,
    pub supported_power_range: PowerRange,
    pub control_granted: bool,
    pub activity_in_progress: bool,
    pub pending_cp_response: Option<PendingCpResponse>,
    pub rx_mdns_count: u64,
    pub tx_mdns_count: u64,
    pub base_time: Instant,
    pub next_mdns_deadline: Option<Instant>,
    pub exit_requested: bool,
}

/// The host OS's interface-MAC lookup is an external collaborator (§1); in
/// the emulator role it only needs to be stable and distinct per bind
/// address, so it's synthesized rather than read from a NIC.
fn derive_mac_addr(bind_addr: Ipv4Addr) -> [u8; 6] {
    let o = bind_addr.octets();
    [0x02, 0x00, 0x00, o[1], o[2], o[3]]
}

impl Server {
    pub fn new(config: Config) -> Self {
        let mac_addr = derive_mac_addr(config.bind_addr);
        let telemetry_stream: Option<Box<dyn TelemetrySource + Send>> = config
            .activity_path
            .as_ref()
            .and_then(|path| match ActivityFileSource::load(path) {
                Ok(source) => Some(Box::new(source) as Box<dyn TelemetrySource + Send>),
                Err(e) => {
                    log::warn!("failed to load activity file {}: {}", path.display(), e);
                    None
                }
            });

        Server {
            listen_addr: SocketAddr::new(config.bind_addr.into(), config.tcp_port),
            mac_addr,
            gatt_table: GattTable::build(),
            session: DirconSession::new(),
            config_telemetry: config.telemetry,
            supported_power_range: config.supported_power_range,
            config,
            telemetry_stream,
            control_granted: false,
            activity_in_progress: false,
            pending_cp_response: None,
            rx_mdns_count: 0,
            tx_mdns_count: 0,
            base_time: Instant::now(),
            next_mdns_deadline: None,
            exit_requested: false,
        }
    }

    pub fn monotonic_seconds(&self) -> u64 {
        self.base_time.elapsed().as_secs()
    }

    fn serial_number(&self) -> String {
        format!(
            "{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}",
            self.mac_addr[0], self.mac_addr[1], self.mac_addr[2], self.mac_addr[3], self.mac_addr[4], self.mac_addr[5]
        )
    }

    /// Dispatches one validated request frame, returning the response and
    /// an optional follow-up notification, per §4.5.7 step 5.
    fn dispatch(&mut self, seq: u8, mesg_id: MesgId, payload: &[u8]) -> (Frame, Option<Frame>) {
        match mesg_id {
            MesgId::DiscoverServices => (handlers::handle_discover_services(self, seq), None),
            MesgId::DiscoverCharacteristics => (handlers::handle_discover_characteristics(self, seq, payload), None),
            MesgId::ReadCharacteristic => (handlers::handle_read_characteristic(self, seq, payload), None),
            MesgId::WriteCharacteristic => {
                let resp = handlers::handle_write_characteristic(self, seq, payload);
                let note = self.pending_cp_response.take().map(|pending| {
                    let notify_seq = self.session.next_tx_seq();
                    handlers::build_fmcp_notification(notify_seq, &pending)
                });
                (resp, note)
            }
            MesgId::EnableCharacteristicNotifications => {
                (handlers::handle_enable_notifications(self, seq, payload), None)
            }
            MesgId::UnsolicitedCharacteristicNotification | MesgId::Error => {
                log::warn!("dropping response-classified or reserved message id from client");
                (Frame::new(MesgId::Error, seq, RespCode::UnknownMessage, vec![]), None)
            }
        }
    }

    async fn send_frame(socket: &mut TcpStream, frame: &Frame) -> io::Result<()> {
        socket.write_all(&frame.encode()).await
    }

    /// Runs the full server: binds sockets, sends the initial mDNS
    /// probes, then loops until ctrl-c or an `exit` CLI command.
    pub async fn run(mut self) -> Result<(), FatalError> {
        let tcp_socket = TcpSocket::new_v4().map_err(|e| FatalError::TcpBind { addr: self.listen_addr, source: e })?;
        tcp_socket.set_reuseaddr(true).map_err(|e| FatalError::TcpBind { addr: self.listen_addr, source: e })?;
        tcp_socket.bind(self.listen_addr).map_err(|e| FatalError::TcpBind { addr: self.listen_addr, source: e })?;
        let listener = tcp_socket.listen(1024).map_err(|e| FatalError::TcpBind { addr: self.listen_addr, source: e })?;
        log::info!("DIRCON listening on {}", self.listen_addr);

        let mdns_sock = if self.config.mdns_enabled {
            let sock = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, mdns::MDNS_PORT))
                .await
                .map_err(FatalError::MdnsBind)?;
            sock.join_multicast_v4(mdns::MDNS_MULTICAST_ADDR, Ipv4Addr::UNSPECIFIED)
                .map_err(FatalError::MdnsBind)?;
            log::info!("mDNS responder bound on {}:{}", Ipv4Addr::UNSPECIFIED, mdns::MDNS_PORT);
            self.send_initial_advertisement(&sock).await;
            self.next_mdns_deadline = Some(Instant::now() + MDNS_READVERTISE_PERIOD);
            Some(sock)
        } else {
            None
        };

        let mut history: Vec<String> = Vec::new();
        let mut stdin_lines = BufReader::new(tokio::io::stdin()).lines();
        let mut tick = tokio::time::interval(TICK_PERIOD);
        let mut mdns_buf = [0u8; 4096];

        while !self.exit_requested {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    log::info!("received shutdown signal");
                    break;
                }
                accepted = listener.accept() => {
                    self.handle_accept(accepted);
                }
                frame_result = read_frame_or_pending(&mut self.session) => {
                    self.handle_frame_result(frame_result).await;
                }
                recv = recv_mdns_or_pending(mdns_sock.as_ref(), &mut mdns_buf) => {
                    if let Some(sock) = mdns_sock.as_ref() {
                        match recv {
                            Ok((len, from)) => {
                                let datagram = mdns_buf[..len].to_vec();
                                self.handle_mdns_datagram(sock, &datagram, from).await;
                            }
                            Err(e) => log::error!("mDNS recv failed: {e}"),
                        }
                    }
                }
                line = stdin_lines.next_line() => {
                    self.handle_cli_line(line, &mut history);
                }
                _ = tick.tick() => {
                    self.on_tick(mdns_sock.as_ref()).await;
                }
            }
        }

        log::info!("shutting down");
        Ok(())
    }

    fn handle_accept(&mut self, accepted: io::Result<(TcpStream, SocketAddr)>) {
        match accepted {
            Ok((socket, remote_addr)) => {
                if self.session.is_active() {
                    log::warn!("rejecting connection from {remote_addr}: a session is already active");
                    drop(socket);
                    return;
                }
                let local_addr = socket.local_addr().unwrap_or(self.listen_addr);
                let _ = socket.set_nodelay(true);
                log::info!("accepted DIRCON session from {remote_addr}");
                self.session.attach(socket, local_addr, remote_addr);
            }
            Err(e) => log::error!("accept failed: {e}"),
        }
    }

    async fn handle_frame_result(&mut self, result: Result<Frame, ProtocolError>) {
        let frame = match result {
            Ok(frame) => frame,
            Err(ProtocolError::ConnectionDropped) => {
                log::info!("session dropped");
                self.session.reset();
                return;
            }
            Err(e) => {
                log::error!("frame error: {e}");
                self.session.reset();
                return;
            }
        };

        self.session.record_rx();
        let seq = frame.seq_num;
        let (response, notification) = match frame.validate() {
            Ok(mesg_id) => self.dispatch(seq, mesg_id, &frame.payload),
            Err(e) => {
                log::warn!("rejecting frame: {e}");
                return;
            }
        };

        if let Some(socket) = self.session.socket.as_mut() {
            if let Err(e) = Server::send_frame(socket, &response).await {
                log::error!("send failed: {e}");
                self.session.reset();
                return;
            }
            if let Some(notification) = notification {
                if let Err(e) = Server::send_frame(socket, &notification).await {
                    log::error!("send failed: {e}");
                    self.session.reset();
                }
            }
        }
    }

    fn handle_cli_line(&mut self, line: io::Result<Option<String>>, history: &mut Vec<String>) {
        let Ok(Some(line)) = line else {
            return;
        };
        let line = line.trim().to_string();
        if line.is_empty() {
            return;
        }
        history.push(line.clone());
        match line.as_str() {
            "help" => println!("commands: help, history, exit, show"),
            "history" => {
                for (i, cmd) in history.iter().enumerate() {
                    println!("{i}: {cmd}");
                }
            }
            "exit" => self.exit_requested = true,
            "show" => println!("session active: {}", self.session.is_active()),
            other => println!("unknown command: {other}"),
        }
    }

    async fn send_initial_advertisement(&mut self, sock: &UdpSocket) {
        let dest = (mdns::MDNS_MULTICAST_ADDR, mdns::MDNS_PORT);
        for i in 0..3u16 {
            let probe = mdns::build_advertisement_probe(&self.mac_addr, self.config.bind_addr, self.config.tcp_port, i);
            if let Err(e) = sock.send_to(&probe, dest).await {
                log::error!("mDNS probe send failed: {e}");
            }
            self.tx_mdns_count += 1;
            if i < 2 {
                tokio::time::sleep(PROBE_SPACING).await;
            }
        }
        let response = mdns::build_advertisement_response(&self.mac_addr, self.config.bind_addr, self.config.tcp_port, 0);
        if let Err(e) = sock.send_to(&response, dest).await {
            log::error!("mDNS advertisement response send failed: {e}");
        }
        self.tx_mdns_count += 1;
    }

    async fn handle_mdns_datagram(&mut self, sock: &UdpSocket, buf: &[u8], from: SocketAddr) {
        self.rx_mdns_count += 1;
        let source_ip = match from.ip() {
            std::net::IpAddr::V4(v4) => v4,
            std::net::IpAddr::V6(_) => return,
        };

        let serial = self.serial_number();
        match mdns::handle_query(buf, source_ip, self.config.bind_addr, &self.mac_addr, self.config.tcp_port, &serial) {
            Ok(Some(response)) => {
                if let Err(e) = sock.send_to(&response, from).await {
                    log::error!("mDNS response send failed: {e}");
                } else {
                    self.tx_mdns_count += 1;
                }
            }
            Ok(None) => {}
            Err(e) => log::warn!("malformed mDNS message from {from}: {e}"),
        }
    }

    async fn on_tick(&mut self, mdns_sock: Option<&UdpSocket>) {
        let now = Instant::now();

        if self.session.ibd_notifications_enabled {
            if let Some(deadline) = self.session.next_notification_deadline {
                if deadline <= now {
                    self.session.next_notification_deadline = Some(deadline + NOTIFICATION_PERIOD);
                    let seq = self.session.next_tx_seq();
                    let notification = handlers::build_ibd_notification(self, seq);
                    if let Some(socket) = self.session.socket.as_mut() {
                        if let Err(e) = Server::send_frame(socket, &notification).await {
                            log::error!("IBD notification send failed: {e}");
                            self.session.reset();
                        }
                    }
                }
            }
        }

        if let Some(sock) = mdns_sock {
            if let Some(deadline) = self.next_mdns_deadline {
                if deadline <= now {
                    self.next_mdns_deadline = Some(deadline + MDNS_READVERTISE_PERIOD);
                    self.send_initial_advertisement(sock).await;
                }
            }
        }
    }
}

async fn read_frame_or_pending(session: &mut DirconSession) -> Result<Frame, ProtocolError> {
    match session.socket.as_mut() {
        Some(socket) => read_one_frame(socket).await,
        None => std::future::pending().await,
    }
}

async fn read_one_frame(socket: &mut TcpStream) -> Result<Frame, ProtocolError> {
    let mut header = [0u8; HEADER_LEN];
    socket.read_exact(&mut header).await.map_err(|_| ProtocolError::ConnectionDropped)?;

    let (frame, mesg_len) = Frame::parse_header(&header)?;
    if HEADER_LEN + mesg_len as usize > RX_BUFFER_SIZE {
        return Err(ProtocolError::LengthExceedsBuffer { mesg_len: mesg_len as usize, limit: RX_BUFFER_SIZE });
    }

    let mut payload = vec![0u8; mesg_len as usize];
    if !payload.is_empty() {
        socket.read_exact(&mut payload).await.map_err(|_| ProtocolError::ConnectionDropped)?;
    }
    Ok(frame.with_payload(payload))
}

async fn recv_mdns_or_pending<'a>(sock: Option<&UdpSocket>, buf: &'a mut [u8]) -> io::Result<(usize, SocketAddr)> {
    match sock {
        Some(sock) => sock.recv_from(buf).await,
        None => std::future::pending().await,
    }
}
