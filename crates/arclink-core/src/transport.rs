//! TCP link transport.
//!
//! Two independent directional connections form the link: the receive role
//! listens for the upstream peer, the transmit role connects out to the
//! downstream peer. A single background thread runs both role state machines
//! over non-blocking sockets and shuttles bytes between the sockets and a
//! pair of SPSC rings; the emulation thread only ever touches the rings, so
//! `send`/`receive` never block.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel as cb;
use log::{debug, info, trace, warn};
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;

use crate::ring::{RingReader, RingWriter, byte_ring};

/// Ring capacity per direction; large enough that the simulated transfer
/// rate cannot overrun it.
pub const RING_CAPACITY: usize = 0x80000;

const IO_CHUNK: usize = 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const LISTEN_RETRY_INTERVAL: Duration = Duration::from_secs(1);
const POLL_INTERVAL: Duration = Duration::from_micros(100);
const EVENT_QUEUE_DEPTH: usize = 64;

/// Endpoints and relay flag for one link node, applied at reset time.
///
/// Ports are kept as strings so they can come straight from host options and
/// resolve through the system resolver together with the host names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkConfig {
    pub local_host: String,
    pub local_port: String,
    pub remote_host: String,
    pub remote_port: String,
    pub forward: bool,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            local_host: "127.0.0.1".into(),
            local_port: "15112".into(),
            remote_host: "127.0.0.1".into(),
            remote_port: "15113".into(),
            forward: false,
        }
    }
}

/// Identification byte carried in every outgoing frame, folded from the
/// configured remote endpoint so each node in a chain tags its traffic
/// differently.
pub fn link_id(config: &LinkConfig) -> u8 {
    let endpoint = format!("{}:{}", config.remote_host, config.remote_port);
    endpoint.bytes().fold(0, |id, byte| id ^ byte)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleState {
    Idle,
    Pending,
    Connected,
}

impl RoleState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => RoleState::Pending,
            2 => RoleState::Connected,
            _ => RoleState::Idle,
        }
    }
}

/// Per-role state shared between the emulation thread and the network
/// thread; the network thread is the only writer.
#[derive(Default)]
struct RoleStates {
    rx: AtomicU8,
    tx: AtomicU8,
}

impl RoleStates {
    fn rx(&self) -> RoleState {
        RoleState::from_u8(self.rx.load(Ordering::Acquire))
    }

    fn tx(&self) -> RoleState {
        RoleState::from_u8(self.tx.load(Ordering::Acquire))
    }

    fn set_rx(&self, state: RoleState) {
        self.rx.store(state as u8, Ordering::Release);
    }

    fn set_tx(&self, state: RoleState) {
        self.tx.store(state as u8, Ordering::Release);
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SendError {
    #[error("transmit role is not connected")]
    NotConnected,
    #[error("outbound buffer full")]
    Overflow,
}

/// Link status notifications for hosts that display connection state.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    Listening(SocketAddr),
    RxConnected(SocketAddr),
    RxLost,
    TxConnected(SocketAddr),
    TxLost,
}

enum Command {
    Reset(LinkConfig),
    Shutdown,
}

/// Foreground handle to the link: non-blocking send/receive over the rings,
/// plus lifecycle control of the background thread.
pub struct LinkTransport {
    states: Arc<RoleStates>,
    cmd_tx: mpsc::Sender<Command>,
    events: cb::Receiver<LinkEvent>,
    inbound: RingReader,
    outbound: RingWriter,
    thread: Option<thread::JoinHandle<()>>,
}

impl LinkTransport {
    /// Spawn the network thread. The transport starts detached; call
    /// [`reset`](Self::reset) with a config to bring the roles up.
    pub fn start() -> Self {
        let (inbound_writer, inbound_reader) = byte_ring(RING_CAPACITY);
        let (outbound_writer, outbound_reader) = byte_ring(RING_CAPACITY);
        let states = Arc::new(RoleStates::default());
        let (cmd_tx, cmd_rx) = mpsc::channel();
        let (event_tx, event_rx) = cb::bounded(EVENT_QUEUE_DEPTH);

        let thread_states = Arc::clone(&states);
        let thread = thread::spawn(move || {
            net_thread_main(
                cmd_rx,
                event_tx,
                thread_states,
                inbound_writer,
                outbound_reader,
            );
        });

        Self {
            states,
            cmd_tx,
            events: event_rx,
            inbound: inbound_reader,
            outbound: outbound_writer,
            thread: Some(thread),
        }
    }

    /// Tear down any open sockets, re-resolve both endpoints and restart
    /// both role state machines. Processed asynchronously on the network
    /// thread.
    pub fn reset(&self, config: &LinkConfig) {
        let _ = self.cmd_tx.send(Command::Reset(config.clone()));
    }

    /// Shut the network thread down and block until it has exited. After
    /// this returns no background activity remains.
    pub fn stop(&mut self) {
        if let Some(handle) = self.thread.take() {
            let _ = self.cmd_tx.send(Command::Shutdown);
            let _ = handle.join();
        }
    }

    /// True only when both roles have a live connection.
    pub fn connected(&self) -> bool {
        self.states.rx() == RoleState::Connected && self.states.tx() == RoleState::Connected
    }

    pub fn rx_state(&self) -> RoleState {
        self.states.rx()
    }

    pub fn tx_state(&self) -> RoleState {
        self.states.tx()
    }

    pub fn events(&self) -> cb::Receiver<LinkEvent> {
        self.events.clone()
    }

    /// Pull exactly `out.len()` bytes from the inbound buffer.
    ///
    /// `None` when the receive role is not connected; `Some(0)` when fewer
    /// bytes are buffered than requested (poll again later).
    pub fn receive(&mut self, out: &mut [u8]) -> Option<usize> {
        if self.states.rx() != RoleState::Connected {
            return None;
        }
        if !self.inbound.read(out) {
            return Some(0);
        }
        Some(out.len())
    }

    /// Queue `data` for transmission. Nothing is queued on error; the
    /// background drain picks accepted bytes up on its next pass.
    pub fn send(&mut self, data: &[u8]) -> Result<usize, SendError> {
        if self.states.tx() != RoleState::Connected {
            return Err(SendError::NotConnected);
        }
        if !self.outbound.write(data) {
            warn!("link: outbound buffer overflow, {} bytes dropped", data.len());
            return Err(SendError::Overflow);
        }
        Ok(data.len())
    }
}

impl Drop for LinkTransport {
    fn drop(&mut self) {
        self.stop();
    }
}

impl crate::device::FrameLink for LinkTransport {
    fn reset(&mut self, config: &LinkConfig) {
        LinkTransport::reset(self, config);
    }

    fn stop(&mut self) {
        LinkTransport::stop(self);
    }

    fn connected(&self) -> bool {
        LinkTransport::connected(self)
    }

    fn send(&mut self, frame: &[u8]) -> Result<usize, SendError> {
        LinkTransport::send(self, frame)
    }

    fn receive(&mut self, out: &mut [u8]) -> Option<usize> {
        LinkTransport::receive(self, out)
    }
}

fn resolve(host: &str, port: &str, what: &str) -> Option<SocketAddr> {
    let endpoint = format!("{host}:{port}");
    if let Ok(addr) = endpoint.parse::<SocketAddr>() {
        return Some(addr);
    }

    match endpoint.to_socket_addrs() {
        Ok(mut addrs) => {
            let addr = addrs.next();
            if addr.is_none() {
                warn!("link: no address resolved for {what} {endpoint}");
            }
            addr
        }
        Err(e) => {
            warn!("link: {what} {endpoint} resolve error: {e}");
            None
        }
    }
}

fn connect_in_progress(err: &io::Error) -> bool {
    if err.kind() == io::ErrorKind::WouldBlock {
        return true;
    }
    matches!(
        err.raw_os_error(),
        Some(code) if code == libc::EINPROGRESS || code == libc::EALREADY
    )
}

fn already_connected(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(code) if code == libc::EISCONN)
}

fn domain_for(addr: SocketAddr) -> Domain {
    if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 }
}

fn listen_on(addr: SocketAddr) -> io::Result<Socket> {
    let listener = Socket::new(domain_for(addr), Type::STREAM, Some(Protocol::TCP))?;
    listener.set_reuse_address(true)?;
    listener.set_nonblocking(true)?;
    listener.bind(&addr.into())?;
    listener.listen(1)?;
    Ok(listener)
}

fn open_client(addr: SocketAddr) -> io::Result<Socket> {
    let sock = Socket::new(domain_for(addr), Type::STREAM, Some(Protocol::TCP))?;
    sock.set_nonblocking(true)?;
    sock.set_keepalive(true)?;
    Ok(sock)
}

struct NetContext {
    states: Arc<RoleStates>,
    event_tx: cb::Sender<LinkEvent>,
    inbound: RingWriter,
    outbound: RingReader,
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,
    forward: bool,
    listener: Option<Socket>,
    listen_retry_at: Instant,
    rx_stream: Option<TcpStream>,
    tx_pending: Option<Socket>,
    tx_stream: Option<TcpStream>,
    tx_deadline: Option<Instant>,
    forward_queue: VecDeque<u8>,
    chunk: [u8; IO_CHUNK],
}

fn net_thread_main(
    cmd_rx: mpsc::Receiver<Command>,
    event_tx: cb::Sender<LinkEvent>,
    states: Arc<RoleStates>,
    inbound: RingWriter,
    outbound: RingReader,
) {
    debug!("link: network thread started");
    let mut net = NetContext {
        states,
        event_tx,
        inbound,
        outbound,
        local_addr: None,
        remote_addr: None,
        forward: false,
        listener: None,
        listen_retry_at: Instant::now(),
        rx_stream: None,
        tx_pending: None,
        tx_stream: None,
        tx_deadline: None,
        forward_queue: VecDeque::new(),
        chunk: [0; IO_CHUNK],
    };

    loop {
        match cmd_rx.try_recv() {
            Ok(Command::Reset(config)) => net.apply_reset(&config),
            Ok(Command::Shutdown) | Err(mpsc::TryRecvError::Disconnected) => {
                net.teardown();
                debug!("link: network thread stopped");
                return;
            }
            Err(mpsc::TryRecvError::Empty) => {}
        }

        net.step_rx();
        net.step_tx();
        thread::sleep(POLL_INTERVAL);
    }
}

impl NetContext {
    fn emit(&self, event: LinkEvent) {
        let _ = self.event_tx.try_send(event);
    }

    fn teardown(&mut self) {
        self.listener = None;
        self.rx_stream = None;
        self.tx_pending = None;
        self.tx_stream = None;
        self.tx_deadline = None;
        self.forward_queue.clear();
        self.inbound.clear();
        self.outbound.clear();
        self.states.set_rx(RoleState::Idle);
        self.states.set_tx(RoleState::Idle);
    }

    fn apply_reset(&mut self, config: &LinkConfig) {
        self.teardown();
        self.forward = config.forward;
        self.local_addr = resolve(&config.local_host, &config.local_port, "local endpoint");
        self.remote_addr = resolve(&config.remote_host, &config.remote_port, "remote endpoint");
        if let Some(addr) = self.local_addr {
            debug!("link: local endpoint {addr}");
        }
        if let Some(addr) = self.remote_addr {
            debug!("link: remote endpoint {addr}");
        }
        self.listen_retry_at = Instant::now();
    }

    fn step_rx(&mut self) {
        match self.states.rx() {
            RoleState::Idle => self.start_listen(),
            RoleState::Pending => self.poll_accept(),
            RoleState::Connected => self.poll_read(),
        }
    }

    fn start_listen(&mut self) {
        let Some(addr) = self.local_addr else { return };
        if Instant::now() < self.listen_retry_at {
            return;
        }

        match listen_on(addr) {
            Ok(listener) => {
                info!("link: rx listening on {addr}");
                self.listener = Some(listener);
                self.states.set_rx(RoleState::Pending);
                self.emit(LinkEvent::Listening(addr));
            }
            Err(e) => {
                warn!("link: rx listen on {addr} failed: {e}");
                self.listen_retry_at = Instant::now() + LISTEN_RETRY_INTERVAL;
            }
        }
    }

    fn poll_accept(&mut self) {
        let Some(listener) = self.listener.as_ref() else {
            self.states.set_rx(RoleState::Idle);
            return;
        };

        match listener.accept() {
            Ok((sock, peer)) => {
                // one peer per role: the listener is done once we accept
                self.listener = None;
                let _ = sock.set_keepalive(true);
                let stream = TcpStream::from(sock);
                let _ = stream.set_nonblocking(true);
                if let Some(addr) = peer.as_socket() {
                    info!("link: rx connection from {addr}");
                    self.emit(LinkEvent::RxConnected(addr));
                } else {
                    info!("link: rx connection accepted");
                }
                self.rx_stream = Some(stream);
                self.states.set_rx(RoleState::Connected);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                warn!("link: rx accept error: {e}");
                self.listener = None;
                self.states.set_rx(RoleState::Idle);
            }
        }
    }

    fn poll_read(&mut self) {
        loop {
            let Some(stream) = self.rx_stream.as_mut() else {
                return;
            };
            match stream.read(&mut self.chunk) {
                Ok(0) => {
                    info!("link: rx connection lost");
                    self.drop_rx();
                    return;
                }
                Ok(n) => {
                    if !self.inbound.write(&self.chunk[..n]) {
                        warn!("link: inbound buffer overflow, dropping connection");
                        self.drop_rx();
                        return;
                    }
                    trace!("link: rx {n} bytes buffered");
                    if self.forward {
                        self.queue_forward(n);
                    }
                    if n < self.chunk.len() {
                        return;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!("link: rx read error: {e}");
                    self.drop_rx();
                    return;
                }
            }
        }
    }

    fn queue_forward(&mut self, len: usize) {
        if self.forward_queue.len() + len > RING_CAPACITY {
            warn!("link: forward queue full, {len} bytes dropped");
            return;
        }
        self.forward_queue.extend(&self.chunk[..len]);
    }

    fn drop_rx(&mut self) {
        self.rx_stream = None;
        self.inbound.clear();
        self.states.set_rx(RoleState::Idle);
        self.emit(LinkEvent::RxLost);
    }

    fn step_tx(&mut self) {
        match self.states.tx() {
            RoleState::Idle => self.start_connect(),
            RoleState::Pending => self.poll_connect(),
            RoleState::Connected => self.poll_write(),
        }
    }

    fn start_connect(&mut self) {
        let Some(addr) = self.remote_addr else { return };
        let sock = match open_client(addr) {
            Ok(sock) => sock,
            Err(e) => {
                warn!("link: tx socket setup failed: {e}");
                return;
            }
        };

        match sock.connect(&addr.into()) {
            Ok(()) => self.promote_tx(sock, addr),
            Err(e) if connect_in_progress(&e) => {
                debug!("link: tx connecting to {addr}");
                self.tx_pending = Some(sock);
                self.tx_deadline = Some(Instant::now() + CONNECT_TIMEOUT);
                self.states.set_tx(RoleState::Pending);
            }
            Err(e) => {
                trace!("link: tx connect to {addr} failed: {e}");
            }
        }
    }

    fn poll_connect(&mut self) {
        if let Some(deadline) = self.tx_deadline
            && Instant::now() >= deadline
        {
            info!("link: tx connect timed out");
            self.abort_connect();
            return;
        }

        let (Some(sock), Some(addr)) = (self.tx_pending.as_ref(), self.remote_addr) else {
            self.abort_connect();
            return;
        };

        // re-issuing the connect reports how the in-progress attempt ended
        match sock.connect(&addr.into()) {
            Ok(()) => {
                if let Some(sock) = self.tx_pending.take() {
                    self.promote_tx(sock, addr);
                }
            }
            Err(e) if already_connected(&e) => {
                if let Some(sock) = self.tx_pending.take() {
                    self.promote_tx(sock, addr);
                }
            }
            Err(e) if connect_in_progress(&e) => {}
            Err(e) => {
                trace!("link: tx connect to {addr} failed: {e}");
                self.abort_connect();
            }
        }
    }

    fn promote_tx(&mut self, sock: Socket, addr: SocketAddr) {
        let stream = TcpStream::from(sock);
        let _ = stream.set_nodelay(true);
        let _ = stream.set_nonblocking(true);
        info!("link: tx connected to {addr}");
        self.tx_stream = Some(stream);
        self.tx_deadline = None;
        self.states.set_tx(RoleState::Connected);
        self.emit(LinkEvent::TxConnected(addr));
    }

    /// Back to `Idle`; the next pass issues a fresh connect immediately.
    fn abort_connect(&mut self) {
        self.tx_pending = None;
        self.tx_deadline = None;
        self.states.set_tx(RoleState::Idle);
    }

    fn poll_write(&mut self) {
        if self.flush_forward() {
            self.flush_outbound();
        }
    }

    /// Relay traffic drains ahead of the foreground's outbound ring. Returns
    /// false when the connection died mid-flush.
    fn flush_forward(&mut self) -> bool {
        while !self.forward_queue.is_empty() {
            let len = self.forward_queue.len().min(IO_CHUNK);
            for (dst, src) in self
                .chunk
                .iter_mut()
                .zip(self.forward_queue.iter().take(len))
            {
                *dst = *src;
            }

            let Some(stream) = self.tx_stream.as_mut() else {
                return false;
            };
            match stream.write(&self.chunk[..len]) {
                Ok(0) => {
                    warn!("link: tx socket closed while writing");
                    self.drop_tx();
                    return false;
                }
                Ok(written) => {
                    self.forward_queue.drain(..written);
                    if written < len {
                        return true;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return true,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!("link: tx write error: {e}");
                    self.drop_tx();
                    return false;
                }
            }
        }
        true
    }

    fn flush_outbound(&mut self) {
        while self.outbound.used() > 0 {
            let len = self.outbound.used().min(IO_CHUNK);
            if !self.outbound.peek(&mut self.chunk[..len]) {
                return;
            }

            let Some(stream) = self.tx_stream.as_mut() else {
                return;
            };
            match stream.write(&self.chunk[..len]) {
                Ok(0) => {
                    warn!("link: tx socket closed while writing");
                    self.drop_tx();
                    return;
                }
                Ok(written) => {
                    self.outbound.consume(written);
                    trace!("link: tx {written} bytes sent");
                    if written < len {
                        return;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!("link: tx write error: {e}");
                    self.drop_tx();
                    return;
                }
            }
        }
    }

    fn drop_tx(&mut self) {
        self.tx_stream = None;
        self.tx_pending = None;
        self.tx_deadline = None;
        self.forward_queue.clear();
        self.outbound.clear();
        self.states.set_tx(RoleState::Idle);
        self.emit(LinkEvent::TxLost);
    }
}
