//! The connecting facet: one ephemeral UDP socket carrying any number of
//! sessions to remote servers, each with a retried hello and an explicit
//! goodbye. Connections are keyed by the opaque binary address form.

use crate::addr::RawAddr;
use crate::arena::Arena;
use crate::arena_index;
use crate::driver::{Pollable, Worker};
use crate::error::{Error, Result};
use crate::frame::{self, Command, Frame, HEADER_SIZE};
use crate::payload::{self, EndpointId, Origin, Payload, PayloadRef};
use crate::Reason;
use hashbrown::HashMap;
use keel::logging::{self, Logger};
use keel::time::{duration_micros, Clock};
use mio::net::UdpSocket;
use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Configuration for a client endpoint.
#[derive(Debug, Clone)]
pub struct ClientParams {
    /// Must match the remote server's application id.
    pub app_id: u16,
    /// Version stamped on outgoing frames.
    pub app_version: u16,
    /// Largest payload accepted or sent; 0 selects the default 1200.
    pub max_payload_size: u16,
    /// Established connections quiet for longer than this go away.
    pub idle_timeout: Duration,
    /// Gap between hello retransmissions while unanswered.
    pub retry_interval: Duration,
    /// Hello attempts before the connection is given up.
    pub retry_attempts: u32,
}

impl Default for ClientParams {
    fn default() -> ClientParams {
        ClientParams {
            app_id: 0,
            app_version: 0,
            max_payload_size: 0,
            idle_timeout: Duration::from_secs(5),
            retry_interval: Duration::from_secs(1),
            retry_attempts: 5,
        }
    }
}

/// Application hooks for a client endpoint. Every callback runs on the
/// thread driving [`Client::poll`].
pub trait ClientHandler {
    /// Something went wrong outside a returnable code path.
    fn on_error(&mut self, _code: Error, _text: &str) {}

    /// Called once per polling step, after all other work.
    fn on_idle(&mut self, _client: &mut Client) {}

    /// A payload arrived on a connection. The handle is borrowed for the
    /// duration of the call; clone it to keep it past return.
    fn on_payload(&mut self, client: &mut Client, conn: ConnId, payload: &PayloadRef);

    /// The connection is gone; `conn` is its final state.
    fn on_disconnect(&mut self, _conn: &Connection, _reason: Reason) {}
}

arena_index!(ConnId);

/// Lifecycle of one connection.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ConnState {
    /// Hello sent, nothing heard back yet.
    Preconnect,
    /// First reply received, still in the setup grace.
    Initial,
    /// Steady state.
    Connected,
    /// Local disconnect issued, awaiting drain.
    Final,
    /// Terminal; about to leave the table.
    Dead,
}

/// Client-side state for one remote server.
#[derive(Debug)]
pub struct Connection {
    id: ConnId,
    addr: RawAddr,
    target: SocketAddr,
    state: ConnState,
    conn_payload: Option<PayloadRef>,
    outgoing: VecDeque<PayloadRef>,
    last_transmit: u64,
    last_receive: u64,
    ntransmit: u32,
}

impl Connection {
    #[inline]
    pub fn id(&self) -> ConnId {
        self.id
    }

    #[inline]
    pub fn addr(&self) -> RawAddr {
        self.addr
    }

    #[inline]
    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Hello transmissions performed so far.
    #[inline]
    pub fn attempts(&self) -> u32 {
        self.ntransmit
    }
}

enum Deferred {
    Error(Error, String),
    Disconnected(Connection, Reason),
}

/// A client endpoint. All methods, including the polling entry point, must
/// be called from a single thread; handing the endpoint to [`Client::run`]
/// moves that duty onto a library worker.
pub struct Client {
    app_id: u16,
    app_version: u16,
    max_payload_size: usize,
    idle_timeout: u64,
    retry_interval: u64,
    retry_attempts: u32,
    endpoint: EndpointId,
    socket: UdpSocket,
    local_addr: SocketAddr,
    poll: mio::Poll,
    events: mio::Events,
    clock: Clock,
    handler: Option<Box<dyn ClientHandler + Send>>,
    conns: Arena<Connection>,
    conn_index: HashMap<RawAddr, ConnId>,
    deferred: Vec<Deferred>,
    recv_buf: Box<[u8]>,
    send_buf: Box<[u8]>,
    log: Logger,
}

impl Client {
    const RECV_TOKEN: mio::Token = mio::Token(0);
    const ZERO_TIME: Duration = Duration::from_secs(0);

    /// Binds an ephemeral-port socket and readies the endpoint. Failures
    /// are reported through the handler's `on_error` and returned.
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        params: ClientParams,
        mut handler: Box<dyn ClientHandler + Send>,
        log: L,
    ) -> Result<Client> {
        let log = match log.into() {
            Some(log) => log.new(logging::o!("facet" => "client")),
            None => Logger::root(logging::Discard, logging::o!()),
        };

        let max_payload_size = match payload::effective_payload_size(params.max_payload_size) {
            Ok(size) => size,
            Err(err) => {
                handler.on_error(err, "Client::new(): max_payload_size out of range");
                return Err(err);
            }
        };

        let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), 0);
        let socket = match UdpSocket::bind(&bind_addr) {
            Ok(socket) => socket,
            Err(err) => {
                let code = Error::Socket(err.kind());
                handler.on_error(code, "Client::new(): bind() failed");
                return Err(code);
            }
        };

        let local_addr = match socket.local_addr() {
            Ok(addr) => addr,
            Err(err) => {
                let code = Error::Socket(err.kind());
                handler.on_error(code, "Client::new(): local_addr() failed");
                return Err(code);
            }
        };

        let poll = match mio::Poll::new() {
            Ok(poll) => poll,
            Err(err) => {
                let code = Error::Io(err.kind());
                handler.on_error(code, "Client::new(): poll creation failed");
                return Err(code);
            }
        };

        if let Err(err) = poll.register(
            &socket,
            Self::RECV_TOKEN,
            mio::Ready::readable(),
            mio::PollOpt::edge(),
        ) {
            let code = Error::Io(err.kind());
            handler.on_error(code, "Client::new(): socket registration failed");
            return Err(code);
        }

        logging::debug!(log, "client ready"; "context" => "new", "addr" => %local_addr);

        Ok(Client {
            app_id: params.app_id,
            app_version: params.app_version,
            max_payload_size,
            idle_timeout: duration_micros(params.idle_timeout),
            retry_interval: duration_micros(params.retry_interval),
            retry_attempts: params.retry_attempts,
            endpoint: EndpointId::next(),
            socket,
            local_addr,
            poll,
            events: mio::Events::with_capacity(8),
            clock: Clock::new(),
            handler: Some(handler),
            conns: Arena::new(),
            conn_index: HashMap::new(),
            deferred: Vec::new(),
            recv_buf: vec![0u8; max_payload_size + HEADER_SIZE + 1].into_boxed_slice(),
            send_buf: vec![0u8; max_payload_size + HEADER_SIZE].into_boxed_slice(),
            log,
        })
    }

    /// The ephemeral address the socket bound to.
    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Microseconds since the endpoint was created.
    #[inline]
    pub fn timestamp(&self) -> u64 {
        self.clock.micros()
    }

    #[inline]
    pub fn app_id(&self) -> u16 {
        self.app_id
    }

    #[inline]
    pub fn app_version(&self) -> u16 {
        self.app_version
    }

    #[inline]
    pub fn max_payload_size(&self) -> usize {
        self.max_payload_size
    }

    /// Mints an empty payload bound to this endpoint.
    #[inline]
    pub fn payload(&self) -> Payload {
        Payload::new(
            Origin::Client(self.endpoint),
            self.app_id,
            self.app_version,
            self.max_payload_size,
        )
    }

    /// Looks up a live connection.
    #[inline]
    pub fn connection(&self, conn: ConnId) -> Option<&Connection> {
        self.conns.get(conn.0)
    }

    /// Starts a session. The optional payload is retained and resent until
    /// the server answers; without one an empty hello frame goes out
    /// instead. The payload is consumed even on failure.
    pub fn connect(&mut self, addr: RawAddr, conn_payload: Option<PayloadRef>) -> Result<ConnId> {
        if self.conn_index.contains_key(&addr) {
            self.emit_error(
                Error::InvalidArgument,
                "Client::connect(): already connecting to address",
            );
            return Err(Error::InvalidArgument);
        }

        let target = match addr.socket_addr() {
            Ok(target) => target,
            Err(err) => {
                self.emit_error(err, "Client::connect(): unusable address");
                return Err(err);
            }
        };

        if let Some(ref payload) = conn_payload {
            if payload.origin().endpoint() != self.endpoint
                || payload.is_empty()
                || payload.len() > self.max_payload_size
            {
                self.emit_error(
                    Error::InvalidArgument,
                    "Client::connect(): unusable connect payload",
                );
                return Err(Error::InvalidArgument);
            }
        }

        let now = self.clock.micros();
        let conn = ConnId(self.conns.insert_with(|index| Connection {
            id: ConnId(index),
            addr,
            target,
            state: ConnState::Preconnect,
            conn_payload,
            outgoing: VecDeque::new(),
            last_transmit: 0,
            last_receive: now,
            ntransmit: 0,
        }));
        self.conn_index.insert(addr, conn);

        logging::debug!(self.log, "connecting";
                        "context" => "connect",
                        "conn" => %conn,
                        "target" => %target);

        Ok(conn)
    }

    /// Ends a session: one best-effort goodbye frame, queued payloads are
    /// released, and `on_disconnect(ClientDisconnected)` fires.
    pub fn disconnect(&mut self, conn: ConnId) -> Result<()> {
        let target = match self.conns.get_mut(conn.0) {
            Some(state) => {
                state.state = ConnState::Final;
                state.target
            }
            None => return Err(Error::InvalidArgument),
        };

        let goodbye = frame::encode_control(Command::Disconnect, self.app_id, self.app_version);
        if let Err(err) = self.socket.send_to(&goodbye, &target) {
            if err.kind() != io::ErrorKind::WouldBlock {
                self.emit_error(
                    Error::Socket(err.kind()),
                    "Client::disconnect(): send_to() failed",
                );
            }
        }

        self.remove_conn(conn, Reason::ClientDisconnected);
        self.flush_deferred();
        Ok(())
    }

    /// Queues a payload on a connection, FIFO. The handle is consumed even
    /// on failure.
    pub fn send(&mut self, conn: ConnId, payload: PayloadRef) -> Result<()> {
        if payload.origin().endpoint() != self.endpoint {
            self.emit_error(
                Error::InvalidArgument,
                "Client::send(): payload minted by another endpoint",
            );
            return Err(Error::InvalidArgument);
        }
        if payload.is_empty() {
            self.emit_error(Error::InvalidArgument, "Client::send(): empty payload");
            return Err(Error::InvalidArgument);
        }
        if payload.len() > self.max_payload_size {
            self.emit_error(
                Error::InvalidArgument,
                "Client::send(): payload exceeds max_payload_size",
            );
            return Err(Error::InvalidArgument);
        }

        match self.conns.get_mut(conn.0) {
            Some(state) => match state.state {
                ConnState::Final | ConnState::Dead => Err(Error::InvalidArgument),
                _ => {
                    state.outgoing.push_back(payload);
                    Ok(())
                }
            },
            None => Err(Error::InvalidArgument),
        }
    }

    /// Hands the endpoint to a library worker that polls it continuously.
    pub fn run(self) -> Result<Worker<Client>> {
        Worker::spawn(self)
    }

    /// Tears the endpoint down, releasing every connection with
    /// `ClientDisconnected`. No goodbye frames are sent.
    pub fn terminate(mut self) {
        logging::debug!(self.log, "terminating";
                        "context" => "terminate",
                        "connections" => self.conns.len());

        let conns: Vec<ConnId> = self.conns.iter().map(|(_, state)| state.id).collect();
        for conn in conns {
            self.remove_conn(conn, Reason::ClientDisconnected);
        }
        self.flush_deferred();
    }
}

impl Client {
    /// One step of the event loop: drain receives, retransmit unanswered
    /// hellos, drain sends, expire idle connections, then let the
    /// application idle. Returns the number of frames processed.
    pub fn poll(&mut self) -> usize {
        let mut processed = 0;

        processed += self.drain_receives();
        processed += self.retransmit_hellos();
        processed += self.drain_sends();
        self.expire_idle();
        self.dispatch_idle();
        self.flush_deferred();

        processed
    }

    fn drain_receives(&mut self) -> usize {
        self.poll
            .poll(&mut self.events, Some(Self::ZERO_TIME))
            .expect("Receive poll failed");

        let mut readable = false;
        for event in &self.events {
            if event.token() == Self::RECV_TOKEN && event.readiness().is_readable() {
                readable = true;
            }
        }
        if !readable {
            return 0;
        }

        let mut processed = 0;
        loop {
            let (size, from) = match self.socket.recv_from(&mut self.recv_buf) {
                Ok(pair) => pair,
                Err(err) => {
                    if err.kind() != io::ErrorKind::WouldBlock {
                        self.emit_error(
                            Error::Socket(err.kind()),
                            "Client::poll(): recv_from() failed",
                        );
                    }
                    break;
                }
            };

            processed += 1;
            self.receive_datagram(from, size);
        }

        processed
    }

    fn receive_datagram(&mut self, from: SocketAddr, size: usize) {
        if size == self.recv_buf.len() {
            logging::trace!(self.log, "dropping oversize datagram"; "context" => "recv", "from" => %from);
            return;
        }

        let conn = match self.conn_index.get(&RawAddr::from_socket_addr(&from)) {
            Some(conn) => *conn,
            None => {
                logging::trace!(self.log, "datagram from stranger"; "context" => "recv", "from" => %from);
                return;
            }
        };

        let (command, payload) = {
            let frame = match Frame::decode(&self.recv_buf[..size], self.max_payload_size) {
                Ok(frame) => frame,
                Err(err) => {
                    logging::trace!(self.log, "dropping datagram";
                                    "context" => "recv",
                                    "from" => %from,
                                    "err" => ?err);
                    return;
                }
            };

            if frame.app_id() != self.app_id {
                logging::trace!(self.log, "dropping foreign app id";
                                "context" => "recv",
                                "from" => %from,
                                "app_id" => frame.app_id());
                return;
            }

            // The server caps its version to ours, so anything on a known
            // connection passes the version filter.
            match frame {
                Frame::Control {
                    command,
                    app_id,
                    app_version,
                } => (
                    Some(command),
                    Payload::received(
                        Origin::Client(self.endpoint),
                        app_id,
                        app_version,
                        self.max_payload_size,
                        &[],
                    ),
                ),
                Frame::Data {
                    app_id,
                    app_version,
                    payload,
                } => (
                    None,
                    Payload::received(
                        Origin::Client(self.endpoint),
                        app_id,
                        app_version,
                        self.max_payload_size,
                        payload,
                    ),
                ),
            }
        };

        let payload = PayloadRef::from(payload);
        let now = self.clock.micros();

        {
            let state = self
                .conns
                .get_mut(conn.0)
                .expect("Connection index out of sync");
            state.last_receive = now;

            // Any valid reply advances the handshake; the first one also
            // retires the retained hello payload.
            match state.state {
                ConnState::Preconnect => {
                    state.state = ConnState::Initial;
                    state.conn_payload = None;
                    logging::debug!(self.log, "connection answered"; "context" => "recv", "conn" => %conn);
                }
                ConnState::Initial => state.state = ConnState::Connected,
                _ => (),
            }
        }

        match command {
            None => self.dispatch_payload(conn, &payload),
            Some(Command::Connect) => (),
            Some(Command::Disconnect) => self.remove_conn(conn, Reason::ClientDisconnected),
        }
    }

    fn dispatch_payload(&mut self, conn: ConnId, payload: &PayloadRef) {
        let mut handler = self
            .handler
            .take()
            .expect("Client handler must be installed during receive");
        handler.on_payload(self, conn, payload);
        self.handler = Some(handler);
        self.flush_deferred();
    }

    fn retransmit_hellos(&mut self) -> usize {
        let now = self.clock.micros();
        let interval = self.retry_interval;

        let due: Vec<ConnId> = self
            .conns
            .iter()
            .filter(|(_, state)| state.state == ConnState::Preconnect)
            .filter(|(_, state)| {
                state.ntransmit == 0 || now.saturating_sub(state.last_transmit) >= interval
            })
            .map(|(_, state)| state.id)
            .collect();

        let mut processed = 0;
        for conn in due {
            let exhausted = match self.conns.get(conn.0) {
                Some(state) => state.ntransmit >= self.retry_attempts,
                None => continue,
            };
            if exhausted {
                logging::debug!(self.log, "hello went unanswered";
                                "context" => "retransmit",
                                "conn" => %conn,
                                "attempts" => self.retry_attempts);
                self.remove_conn(conn, Reason::TimedOut);
                continue;
            }

            let (len, target) = {
                let state = self.conns.get(conn.0).expect("Connection vanished");
                match state.conn_payload {
                    Some(ref payload) => {
                        let len = frame::encode_data(
                            &mut self.send_buf,
                            self.app_id,
                            self.app_version,
                            payload.data(),
                        );
                        (len, state.target)
                    }
                    None => {
                        let hello =
                            frame::encode_control(Command::Connect, self.app_id, self.app_version);
                        self.send_buf[..HEADER_SIZE].copy_from_slice(&hello);
                        (HEADER_SIZE, state.target)
                    }
                }
            };

            match self.socket.send_to(&self.send_buf[..len], &target) {
                Ok(_) => {
                    processed += 1;
                }
                Err(err) => {
                    if err.kind() == io::ErrorKind::WouldBlock {
                        break;
                    }
                    self.emit_error(
                        Error::Socket(err.kind()),
                        "Client::poll(): hello send_to() failed",
                    );
                }
            }

            // Failed attempts count against the bound too, so a dead route
            // cannot retry forever.
            if let Some(state) = self.conns.get_mut(conn.0) {
                state.ntransmit += 1;
                state.last_transmit = now;
            }
        }

        processed
    }

    fn drain_sends(&mut self) -> usize {
        let pending: Vec<ConnId> = self
            .conns
            .iter()
            .filter(|(_, state)| match state.state {
                ConnState::Initial | ConnState::Connected => !state.outgoing.is_empty(),
                _ => false,
            })
            .map(|(_, state)| state.id)
            .collect();

        let now = self.clock.micros();
        let mut processed = 0;

        'conns: for conn in pending {
            loop {
                let (len, target) = {
                    let state = match self.conns.get(conn.0) {
                        Some(state) => state,
                        None => break,
                    };
                    let payload = match state.outgoing.front() {
                        Some(payload) => payload,
                        None => break,
                    };
                    let len = frame::encode_data(
                        &mut self.send_buf,
                        self.app_id,
                        self.app_version,
                        payload.data(),
                    );
                    (len, state.target)
                };

                match self.socket.send_to(&self.send_buf[..len], &target) {
                    Ok(_) => {
                        processed += 1;
                        if let Some(state) = self.conns.get_mut(conn.0) {
                            state.outgoing.pop_front();
                            state.last_transmit = now;
                        }
                    }
                    Err(err) => {
                        if err.kind() == io::ErrorKind::WouldBlock {
                            break 'conns;
                        }
                        if let Some(state) = self.conns.get_mut(conn.0) {
                            state.outgoing.pop_front();
                        }
                        self.emit_error(
                            Error::Socket(err.kind()),
                            "Client::poll(): send_to() failed",
                        );
                    }
                }
            }
        }

        processed
    }

    fn expire_idle(&mut self) {
        let now = self.clock.micros();
        let timeout = self.idle_timeout;

        let stale: Vec<ConnId> = self
            .conns
            .iter()
            .filter(|(_, state)| match state.state {
                ConnState::Initial | ConnState::Connected => {
                    now.saturating_sub(state.last_receive) > timeout
                }
                _ => false,
            })
            .map(|(_, state)| state.id)
            .collect();

        for conn in stale {
            logging::debug!(self.log, "connection timed out"; "context" => "expire", "conn" => %conn);
            self.remove_conn(conn, Reason::TimedOut);
        }
    }

    fn dispatch_idle(&mut self) {
        if let Some(mut handler) = self.handler.take() {
            handler.on_idle(self);
            self.handler = Some(handler);
        }
    }

    // Final teardown of a connection: releases retained payloads and
    // notifies the application.
    fn remove_conn(&mut self, conn: ConnId, reason: Reason) {
        let mut state = match self.conns.remove(conn.0) {
            Some(state) => state,
            None => return,
        };
        self.conn_index.remove(&state.addr);
        state.conn_payload = None;
        state.outgoing.clear();
        state.state = ConnState::Dead;

        logging::debug!(self.log, "connection closed";
                        "context" => "remove_conn",
                        "conn" => %conn,
                        "reason" => ?reason);

        match self.handler.as_mut() {
            Some(handler) => handler.on_disconnect(&state, reason),
            None => self.deferred.push(Deferred::Disconnected(state, reason)),
        }
    }

    fn emit_error(&mut self, code: Error, text: &str) {
        logging::debug!(self.log, "reporting error";
                        "context" => "emit_error",
                        "code" => code.code(),
                        "text" => text);

        match self.handler.as_mut() {
            Some(handler) => handler.on_error(code, text),
            None => self.deferred.push(Deferred::Error(code, text.to_string())),
        }
    }

    fn flush_deferred(&mut self) {
        while !self.deferred.is_empty() {
            match self.handler.as_mut() {
                Some(handler) => match self.deferred.remove(0) {
                    Deferred::Error(code, text) => handler.on_error(code, &text),
                    Deferred::Disconnected(conn, reason) => handler.on_disconnect(&conn, reason),
                },
                None => return,
            }
        }
    }
}

impl Pollable for Client {
    #[inline]
    fn poll_once(&mut self) -> usize {
        self.poll()
    }
}
