//! The listening facet: one UDP socket, a table of peers keyed by their
//! remote address, and an application-defined graph of peer groups that
//! controls both message fan-out and peer lifetime.

use crate::addr::{resolve_interface, TextAddr};
use crate::arena::Arena;
use crate::arena_index;
use crate::driver::{Pollable, Worker};
use crate::error::{Error, Result};
use crate::frame::{self, Command, Frame, HEADER_SIZE};
use crate::payload::{self, EndpointId, Origin, Payload, PayloadRef};
use crate::Reason;
use hashbrown::HashMap;
use indexmap::IndexSet;
use keel::logging::{self, Logger};
use keel::time::{duration_micros, Clock};
use mio::net::UdpSocket;
use std::cmp;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

/// Configuration for a listening instance.
#[derive(Debug, Clone)]
pub struct ServerParams {
    /// UDP port to listen on; 0 selects the default 4812.
    pub port: u16,
    /// Largest payload accepted or sent; 0 selects the default 1200.
    pub max_payload_size: u16,
    /// Tells this application apart from others sharing the port space.
    pub app_id: u16,
    /// Version stamped on outgoing frames and required of incoming ones.
    pub app_version: u16,
    /// Local interface to listen on; `None` listens on all of them.
    pub interface: Option<String>,
    /// Peers quiet for longer than this are expired.
    pub idle_timeout: Duration,
}

impl Default for ServerParams {
    fn default() -> ServerParams {
        ServerParams {
            port: 0,
            max_payload_size: 0,
            app_id: 0,
            app_version: 0,
            interface: None,
            idle_timeout: Duration::from_secs(5),
        }
    }
}

/// Application hooks for a listening instance. Every callback runs on the
/// thread driving [`Server::poll`].
pub trait ServerHandler {
    /// Something went wrong outside a returnable code path.
    fn on_error(&mut self, _code: Error, _text: &str) {}

    /// Called once per polling step, after all other work.
    fn on_idle(&mut self, _server: &mut Server) {}

    /// A datagram arrived from an address with no live peer. Add the peer
    /// to at least one group to keep it; otherwise it is discarded when
    /// this returns. Clone the payload handle to keep it past the call.
    fn on_peer_new(&mut self, server: &mut Server, peer: PeerId, payload: &PayloadRef);

    /// The peer left its last group and is gone; `peer` is its final state.
    fn on_peer_expired(&mut self, _peer: &Peer, _reason: Reason) {}
}

/// Application hooks attached to one group.
pub trait GroupHandler {
    /// A payload arrived from a peer belonging to this group. The handle
    /// is borrowed for the duration of the call.
    fn on_peer_message(&mut self, server: &mut Server, peer: PeerId, payload: &PayloadRef);

    /// The peer left this group.
    fn on_peer_removed(&mut self, _server: &mut Server, _peer: PeerId, _reason: Reason) {}
}

arena_index!(PeerId);
arena_index!(GroupId);

/// Server-side state for one remote address. Lives for as long as the peer
/// belongs to at least one group.
#[derive(Debug)]
pub struct Peer {
    id: PeerId,
    addr: SocketAddr,
    last_receive: u64,
    last_send: u64,
    remote_app_version: u16,
    out_queue: VecDeque<PayloadRef>,
    groups: Vec<GroupId>,
}

impl Peer {
    #[inline]
    pub fn id(&self) -> PeerId {
        self.id
    }

    #[inline]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The version last seen from this peer; outgoing frames are capped to
    /// it so a newer server keeps speaking the older dialect.
    #[inline]
    pub fn remote_app_version(&self) -> u16 {
        self.remote_app_version
    }

    /// Timestamp of the last accepted datagram, in instance microseconds.
    #[inline]
    pub fn last_receive(&self) -> u64 {
        self.last_receive
    }

    /// Timestamp of the last completed send, in instance microseconds.
    #[inline]
    pub fn last_send(&self) -> u64 {
        self.last_send
    }
}

struct Group {
    handler: Option<Box<dyn GroupHandler + Send>>,
    peers: Vec<PeerId>,
}

enum Deferred {
    Error(Error, String),
    Expired(Peer, Reason),
}

/// A listening endpoint. All methods, including the polling entry point,
/// must be called from a single thread; handing the instance to
/// [`Server::run`] moves that duty onto a library worker.
pub struct Server {
    app_id: u16,
    app_version: u16,
    max_payload_size: usize,
    idle_timeout: u64,
    endpoint: EndpointId,
    socket: UdpSocket,
    local_addr: SocketAddr,
    poll: mio::Poll,
    events: mio::Events,
    clock: Clock,
    handler: Option<Box<dyn ServerHandler + Send>>,
    peers: Arena<Peer>,
    peer_index: HashMap<SocketAddr, PeerId>,
    groups: Arena<Group>,
    group_order: IndexSet<GroupId>,
    deferred: Vec<Deferred>,
    recv_buf: Box<[u8]>,
    send_buf: Box<[u8]>,
    log: Logger,
}

impl Server {
    const RECV_TOKEN: mio::Token = mio::Token(0);
    const ZERO_TIME: Duration = Duration::from_secs(0);

    /// Binds the listening socket and readies the instance. Failures are
    /// reported through the handler's `on_error` and returned; partial
    /// resources are released before returning.
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        params: ServerParams,
        mut handler: Box<dyn ServerHandler + Send>,
        log: L,
    ) -> Result<Server> {
        let log = match log.into() {
            Some(log) => log.new(logging::o!("facet" => "server")),
            None => Logger::root(logging::Discard, logging::o!()),
        };

        let max_payload_size = match payload::effective_payload_size(params.max_payload_size) {
            Ok(size) => size,
            Err(err) => {
                handler.on_error(err, "Server::new(): max_payload_size out of range");
                return Err(err);
            }
        };

        let port = match params.port {
            0 => crate::addr::DEFAULT_PORT,
            port => port,
        };

        let interface = params.interface.as_ref().map(|host| host.as_str());
        let bind_addr = match resolve_interface(interface, port) {
            Ok(addr) => addr,
            Err(err) => {
                handler.on_error(err, "Server::new(): interface resolution failed");
                return Err(err);
            }
        };

        let socket = match UdpSocket::bind(&bind_addr) {
            Ok(socket) => socket,
            Err(err) => {
                let code = Error::Socket(err.kind());
                handler.on_error(code, "Server::new(): bind() failed");
                return Err(code);
            }
        };

        let local_addr = match socket.local_addr() {
            Ok(addr) => addr,
            Err(err) => {
                let code = Error::Socket(err.kind());
                handler.on_error(code, "Server::new(): local_addr() failed");
                return Err(code);
            }
        };

        let poll = match mio::Poll::new() {
            Ok(poll) => poll,
            Err(err) => {
                let code = Error::Io(err.kind());
                handler.on_error(code, "Server::new(): poll creation failed");
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
            handler.on_error(code, "Server::new(): socket registration failed");
            return Err(code);
        }

        logging::debug!(log, "server listening";
                        "context" => "new",
                        "addr" => %local_addr,
                        "max_payload_size" => max_payload_size);

        Ok(Server {
            app_id: params.app_id,
            app_version: params.app_version,
            max_payload_size,
            idle_timeout: duration_micros(params.idle_timeout),
            endpoint: EndpointId::next(),
            socket,
            local_addr,
            poll,
            events: mio::Events::with_capacity(8),
            clock: Clock::new(),
            handler: Some(handler),
            peers: Arena::new(),
            peer_index: HashMap::new(),
            groups: Arena::new(),
            group_order: IndexSet::new(),
            deferred: Vec::new(),
            // One spare byte so an oversize datagram is distinguishable
            // from an exact fit after kernel truncation.
            recv_buf: vec![0u8; max_payload_size + HEADER_SIZE + 1].into_boxed_slice(),
            send_buf: vec![0u8; max_payload_size + HEADER_SIZE].into_boxed_slice(),
            log,
        })
    }

    /// The address the socket actually bound to.
    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Microseconds since the instance was created.
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

    /// Mints an empty payload bound to this instance.
    #[inline]
    pub fn payload(&self) -> Payload {
        Payload::new(
            Origin::Server(self.endpoint),
            self.app_id,
            self.app_version,
            self.max_payload_size,
        )
    }

    /// Hands the instance to a library worker that polls it continuously.
    pub fn run(self) -> Result<Worker<Server>> {
        Worker::spawn(self)
    }

    /// Tears the instance down: every group is destroyed, surviving peers
    /// expire with `LastGroupDestroyed`, and the socket closes on drop.
    pub fn terminate(mut self) {
        logging::debug!(self.log, "terminating";
                        "context" => "terminate",
                        "peers" => self.peers.len(),
                        "groups" => self.groups.len());

        let groups: Vec<GroupId> = self.group_order.iter().cloned().collect();
        for group in groups {
            self.group_destroy(group);
        }
        self.flush_deferred();
    }
}

impl Server {
    /// Creates a group. Peers added to it stay alive for as long as they
    /// belong to it or to any other group.
    pub fn group_create(&mut self, handler: Box<dyn GroupHandler + Send>) -> GroupId {
        let mut handler = Some(handler);
        let id = GroupId(self.groups.insert_with(|_| Group {
            handler: handler.take(),
            peers: Vec::new(),
        }));
        self.group_order.insert(id);

        logging::debug!(self.log, "group created"; "context" => "group_create", "group" => %id);

        id
    }

    /// Destroys a group, detaching every member in reverse order. Peers
    /// left without any group expire with `LastGroupDestroyed`. Internal
    /// inconsistencies are reported once, coarsely, so teardown always
    /// completes.
    pub fn group_destroy(&mut self, group: GroupId) {
        if !self.groups.contains(group.0) {
            self.emit_error(Error::InvalidArgument, "Server::group_destroy(): no such group");
            return;
        }

        logging::debug!(self.log, "destroying group"; "context" => "group_destroy", "group" => %group);

        let mut errors = 0;
        loop {
            let remaining = match self.groups.get(group.0) {
                Some(entry) => entry.peers.len(),
                None => break,
            };
            if remaining == 0 {
                break;
            }
            if self
                .remove_ix(
                    group,
                    remaining - 1,
                    Reason::RemovedFromGroup,
                    Reason::LastGroupDestroyed,
                )
                .is_err()
            {
                errors += 1;
            }
        }

        if self.groups.remove(group.0).is_none() {
            errors += 1;
        }
        self.group_order.shift_remove(&group);

        if errors > 0 {
            self.emit_error(
                Error::InvalidArgument,
                "Server::group_destroy(): errors during group destruction",
            );
        }
        self.flush_deferred();
    }

    /// Adds a peer to a group, recording the membership symmetrically on
    /// both sides. Adding a peer twice is an error.
    pub fn group_peer_add(&mut self, peer: PeerId, group: GroupId) -> Result<()> {
        if !self.groups.contains(group.0) {
            return Err(Error::InvalidArgument);
        }

        {
            let state = match self.peers.get_mut(peer.0) {
                Some(state) => state,
                None => return Err(Error::InvalidArgument),
            };
            if state.groups.contains(&group) {
                return Err(Error::InvalidArgument);
            }
            state.groups.push(group);
        }

        self.groups
            .get_mut(group.0)
            .expect("Group vanished during add")
            .peers
            .push(peer);

        Ok(())
    }

    /// Removes a peer from a group it belongs to. Removing the last
    /// membership destroys the peer.
    pub fn group_peer_remove(&mut self, peer: PeerId, group: GroupId) -> Result<()> {
        let ix = match self.groups.get(group.0) {
            Some(entry) => match entry.peers.iter().position(|&member| member == peer) {
                Some(ix) => ix,
                None => return Err(Error::InvalidArgument),
            },
            None => return Err(Error::InvalidArgument),
        };

        let result = self.remove_ix(group, ix, Reason::RemovedFromGroup, Reason::LastGroupDestroyed);
        if result.is_err() {
            self.emit_error(
                Error::InvalidArgument,
                "Server::group_peer_remove(): membership out of sync",
            );
        }
        self.flush_deferred();
        result
    }

    /// The peers currently in a group.
    pub fn group_peers(&self, group: GroupId) -> &[PeerId] {
        match self.groups.get(group.0) {
            Some(entry) => &entry.peers,
            None => &[],
        }
    }

    /// The groups a peer currently belongs to.
    pub fn peer_groups(&self, peer: PeerId) -> &[GroupId] {
        match self.peers.get(peer.0) {
            Some(state) => &state.groups,
            None => &[],
        }
    }

    /// Looks up a live peer.
    #[inline]
    pub fn peer(&self, peer: PeerId) -> Option<&Peer> {
        self.peers.get(peer.0)
    }

    /// Formats the remote address of a live peer.
    pub fn peer_addr_format(&self, peer: PeerId) -> Option<TextAddr> {
        self.peers
            .get(peer.0)
            .map(|state| TextAddr::from_socket_addr(&state.addr))
    }

    /// Queues a payload for one peer. The handle is consumed either way.
    pub fn peer_enqueue(&mut self, peer: PeerId, payload: PayloadRef) -> Result<()> {
        self.check_outbound(&payload)?;

        match self.peers.get_mut(peer.0) {
            Some(state) => {
                state.out_queue.push_back(payload);
                Ok(())
            }
            None => Err(Error::InvalidArgument),
        }
    }

    /// Queues a payload for every peer in a group. The handle is consumed
    /// either way.
    pub fn group_enqueue(&mut self, group: GroupId, payload: PayloadRef) -> Result<()> {
        self.check_outbound(&payload)?;

        let members: Vec<PeerId> = match self.groups.get(group.0) {
            Some(entry) => entry.peers.clone(),
            None => return Err(Error::InvalidArgument),
        };

        for peer in members {
            if let Some(state) = self.peers.get_mut(peer.0) {
                state.out_queue.push_back(payload.clone());
            }
        }

        Ok(())
    }

    // A payload may only travel through the endpoint that minted it, and
    // must fill one data frame: at least one byte, at most one datagram.
    fn check_outbound(&mut self, payload: &PayloadRef) -> Result<()> {
        if payload.origin().endpoint() != self.endpoint {
            self.emit_error(
                Error::InvalidArgument,
                "Server::enqueue(): payload minted by another endpoint",
            );
            return Err(Error::InvalidArgument);
        }
        if payload.is_empty() {
            self.emit_error(Error::InvalidArgument, "Server::enqueue(): empty payload");
            return Err(Error::InvalidArgument);
        }
        if payload.len() > self.max_payload_size {
            self.emit_error(
                Error::InvalidArgument,
                "Server::enqueue(): payload exceeds max_payload_size",
            );
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }

    // Removes the peer at `ix` of the group's list, notifies the group,
    // then detaches the group on the peer's side, destroying the peer when
    // its membership drops to zero. An error means the two sides of the
    // membership disagreed.
    fn remove_ix(
        &mut self,
        group: GroupId,
        ix: usize,
        removed: Reason,
        expired: Reason,
    ) -> Result<()> {
        let peer = {
            let entry = match self.groups.get_mut(group.0) {
                Some(entry) => entry,
                None => return Err(Error::InvalidArgument),
            };
            if ix >= entry.peers.len() {
                return Err(Error::InvalidArgument);
            }
            entry.peers.remove(ix)
        };

        self.dispatch_peer_removed(group, peer, removed);

        // The callback may have mutated membership; recheck everything.
        let now_empty = match self.peers.get_mut(peer.0) {
            Some(state) => match state.groups.iter().position(|&member| member == group) {
                Some(pos) => {
                    state.groups.remove(pos);
                    state.groups.is_empty()
                }
                None => return Err(Error::InvalidArgument),
            },
            None => return Ok(()),
        };

        if now_empty {
            self.destroy_peer(peer, expired);
        }

        Ok(())
    }

    // Detaches the peer from every group and destroys it, threading the
    // triggering reason through both notifications.
    fn drop_peer(&mut self, peer: PeerId, reason: Reason) {
        loop {
            let group = match self.peers.get(peer.0) {
                Some(state) => match state.groups.last() {
                    Some(&group) => group,
                    None => break,
                },
                None => return,
            };

            let ix = self
                .groups
                .get(group.0)
                .and_then(|entry| entry.peers.iter().position(|&member| member == peer));

            match ix {
                Some(ix) => {
                    if self.remove_ix(group, ix, reason, reason).is_err() {
                        self.detach_unilaterally(peer, group);
                        self.emit_error(
                            Error::InvalidArgument,
                            "Server::poll(): membership out of sync during peer drop",
                        );
                    }
                }
                None => {
                    self.detach_unilaterally(peer, group);
                    self.emit_error(
                        Error::InvalidArgument,
                        "Server::poll(): peer missing from group list",
                    );
                }
            }
        }

        if self.peers.contains(peer.0) {
            self.destroy_peer(peer, reason);
        }
    }

    // One-sided detach for when the two membership lists disagree; only
    // drops the entry if it is still the one the drop loop selected.
    fn detach_unilaterally(&mut self, peer: PeerId, group: GroupId) {
        if let Some(state) = self.peers.get_mut(peer.0) {
            if state.groups.last() == Some(&group) {
                state.groups.pop();
            }
        }
    }

    // Final teardown of a peer: releases queued payloads and notifies the
    // instance.
    fn destroy_peer(&mut self, peer: PeerId, reason: Reason) {
        let mut state = match self.peers.remove(peer.0) {
            Some(state) => state,
            None => return,
        };
        self.peer_index.remove(&state.addr);
        state.out_queue.clear();

        logging::debug!(self.log, "peer expired";
                        "context" => "destroy_peer",
                        "peer" => %peer,
                        "addr" => %state.addr,
                        "reason" => ?reason);

        match self.handler.as_mut() {
            Some(handler) => handler.on_peer_expired(&state, reason),
            None => self.deferred.push(Deferred::Expired(state, reason)),
        }
    }

    fn dispatch_peer_removed(&mut self, group: GroupId, peer: PeerId, reason: Reason) {
        let mut handler = match self.groups.get_mut(group.0) {
            Some(entry) => match entry.handler.take() {
                Some(handler) => handler,
                None => return,
            },
            None => return,
        };

        handler.on_peer_removed(self, peer, reason);

        if let Some(entry) = self.groups.get_mut(group.0) {
            entry.handler = Some(handler);
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

    // Events raised while the instance handler was out on a dispatch are
    // delivered here, once it is back in place.
    fn flush_deferred(&mut self) {
        while !self.deferred.is_empty() {
            match self.handler.as_mut() {
                Some(handler) => match self.deferred.remove(0) {
                    Deferred::Error(code, text) => handler.on_error(code, &text),
                    Deferred::Expired(peer, reason) => handler.on_peer_expired(&peer, reason),
                },
                None => return,
            }
        }
    }
}

impl Server {
    /// One step of the event loop: drain receives, drain sends, expire
    /// idle peers, then let the application idle. Returns the number of
    /// frames processed.
    pub fn poll(&mut self) -> usize {
        let mut processed = 0;

        processed += self.drain_receives();
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
                            "Server::poll(): recv_from() failed",
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
            // Filled the spare byte: bigger than max_payload_size plus
            // framing, and the kernel truncated the tail.
            logging::trace!(self.log, "dropping oversize datagram"; "context" => "recv", "from" => %from);
            return;
        }

        let known = self.peer_index.get(&from).cloned();

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

            // A lower version is only acceptable from a peer we already
            // track; it then caps what we send back.
            if frame.app_version() < self.app_version && known.is_none() {
                logging::trace!(self.log, "dropping low version from stranger";
                                "context" => "recv",
                                "from" => %from,
                                "app_version" => frame.app_version());
                return;
            }

            match frame {
                Frame::Control {
                    command,
                    app_id,
                    app_version,
                } => (
                    Some(command),
                    Payload::received(
                        Origin::Server(self.endpoint),
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
                        Origin::Server(self.endpoint),
                        app_id,
                        app_version,
                        self.max_payload_size,
                        payload,
                    ),
                ),
            }
        };

        let remote_version = payload.app_version();
        let payload = PayloadRef::from(payload);
        let now = self.clock.micros();

        match known {
            Some(peer) => {
                {
                    let state = self.peers.get_mut(peer.0).expect("Peer index out of sync");
                    state.last_receive = now;
                    state.remote_app_version = remote_version;
                }

                match command {
                    None => self.fan_out(peer, &payload),
                    // A repeated hello from a live peer is a keepalive.
                    Some(Command::Connect) => (),
                    Some(Command::Disconnect) => self.drop_peer(peer, Reason::ClientDisconnected),
                }
            }
            None => {
                if command == Some(Command::Disconnect) {
                    logging::trace!(self.log, "disconnect from stranger"; "context" => "recv", "from" => %from);
                    return;
                }
                self.accept_new_peer(from, now, remote_version, &payload);
            }
        }
    }

    fn accept_new_peer(
        &mut self,
        from: SocketAddr,
        now: u64,
        remote_version: u16,
        payload: &PayloadRef,
    ) {
        let peer = PeerId(self.peers.insert_with(|index| Peer {
            id: PeerId(index),
            addr: from,
            last_receive: now,
            last_send: now,
            remote_app_version: remote_version,
            out_queue: VecDeque::new(),
            groups: Vec::new(),
        }));
        self.peer_index.insert(from, peer);

        logging::debug!(self.log, "peer arrived";
                        "context" => "recv",
                        "peer" => %peer,
                        "addr" => %from);

        let mut handler = self
            .handler
            .take()
            .expect("Instance handler must be installed during receive");
        handler.on_peer_new(self, peer, payload);
        self.handler = Some(handler);
        self.flush_deferred();

        // Groups are how the application claims a peer; loners go away
        // without an expiry notice.
        let unclaimed = match self.peers.get(peer.0) {
            Some(state) => state.groups.is_empty(),
            None => false,
        };
        if unclaimed {
            if let Some(state) = self.peers.remove(peer.0) {
                self.peer_index.remove(&state.addr);
                logging::debug!(self.log, "peer not claimed"; "context" => "recv", "peer" => %peer);
            }
        }
    }

    // Delivers a payload once to every group the peer belongs to. The
    // membership snapshot is taken up front; callbacks may mutate it, so
    // each delivery rechecks that peer and group are still attached.
    fn fan_out(&mut self, peer: PeerId, payload: &PayloadRef) {
        let snapshot: Vec<GroupId> = match self.peers.get(peer.0) {
            Some(state) => state.groups.clone(),
            None => return,
        };

        for group in snapshot {
            if self.peers.get(peer.0).is_none() {
                break;
            }
            let still_member = match self.groups.get(group.0) {
                Some(entry) => entry.peers.contains(&peer),
                None => false,
            };
            if !still_member {
                continue;
            }
            self.dispatch_peer_message(group, peer, payload);
        }
    }

    fn dispatch_peer_message(&mut self, group: GroupId, peer: PeerId, payload: &PayloadRef) {
        let mut handler = match self.groups.get_mut(group.0) {
            Some(entry) => match entry.handler.take() {
                Some(handler) => handler,
                None => return,
            },
            None => return,
        };

        handler.on_peer_message(self, peer, payload);

        if let Some(entry) = self.groups.get_mut(group.0) {
            entry.handler = Some(handler);
        }
    }

    fn drain_sends(&mut self) -> usize {
        let pending: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(_, state)| !state.out_queue.is_empty())
            .map(|(_, state)| state.id)
            .collect();

        let now = self.clock.micros();
        let mut processed = 0;

        'peers: for peer in pending {
            loop {
                let (len, target) = {
                    let state = match self.peers.get(peer.0) {
                        Some(state) => state,
                        None => break,
                    };
                    let payload = match state.out_queue.front() {
                        Some(payload) => payload,
                        None => break,
                    };
                    let version = cmp::min(self.app_version, state.remote_app_version);
                    let len = frame::encode_data(
                        &mut self.send_buf,
                        self.app_id,
                        version,
                        payload.data(),
                    );
                    (len, state.addr)
                };

                match self.socket.send_to(&self.send_buf[..len], &target) {
                    Ok(_) => {
                        processed += 1;
                        if let Some(state) = self.peers.get_mut(peer.0) {
                            state.out_queue.pop_front();
                            state.last_send = now;
                        }
                    }
                    Err(err) => {
                        if err.kind() == io::ErrorKind::WouldBlock {
                            break 'peers;
                        }
                        // Best-effort transport: drop the datagram rather
                        // than wedging the queue.
                        if let Some(state) = self.peers.get_mut(peer.0) {
                            state.out_queue.pop_front();
                        }
                        self.emit_error(
                            Error::Socket(err.kind()),
                            "Server::poll(): send_to() failed",
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

        let stale: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(_, state)| now.saturating_sub(state.last_receive) > timeout)
            .map(|(_, state)| state.id)
            .collect();

        for peer in stale {
            logging::debug!(self.log, "peer timed out"; "context" => "expire", "peer" => %peer);
            self.drop_peer(peer, Reason::TimedOut);
        }
    }

    fn dispatch_idle(&mut self) {
        if let Some(mut handler) = self.handler.take() {
            handler.on_idle(self);
            self.handler = Some(handler);
        }
    }
}

impl Pollable for Server {
    #[inline]
    fn poll_once(&mut self) -> usize {
        self.poll()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{Client, ClientHandler, ClientParams, ConnId, Connection};
    use crate::RawAddr;
    use std::net::UdpSocket as RawSocket;
    use std::sync::{Arc, Mutex};
    use std::thread;

    const APP_ID: u16 = 34;
    const APP_VERSION: u16 = 3;

    #[derive(Default)]
    struct Shared {
        orphan: bool,
        errors: Vec<(u32, String)>,
        new_peers: Vec<PeerId>,
        expired: Vec<(PeerId, Reason)>,
        removed: Vec<(&'static str, PeerId, Reason)>,
        messages: Vec<(&'static str, PeerId, usize)>,
        g1: Option<GroupId>,
        g2: Option<GroupId>,
        g3: Option<GroupId>,
    }

    type SharedState = Arc<Mutex<Shared>>;

    struct Room {
        label: &'static str,
        shared: SharedState,
    }

    impl GroupHandler for Room {
        fn on_peer_message(&mut self, _server: &mut Server, peer: PeerId, payload: &PayloadRef) {
            self.shared
                .lock()
                .unwrap()
                .messages
                .push((self.label, peer, payload.len()));
        }

        fn on_peer_removed(&mut self, _server: &mut Server, peer: PeerId, reason: Reason) {
            self.shared
                .lock()
                .unwrap()
                .removed
                .push((self.label, peer, reason));
        }
    }

    struct Fixture {
        shared: SharedState,
    }

    impl Fixture {
        fn room(&self, label: &'static str) -> Box<Room> {
            Box::new(Room {
                label,
                shared: self.shared.clone(),
            })
        }
    }

    impl ServerHandler for Fixture {
        fn on_error(&mut self, code: Error, text: &str) {
            self.shared
                .lock()
                .unwrap()
                .errors
                .push((code.code(), text.to_string()));
        }

        // The first peer lands in rooms one and two, everybody after that
        // in rooms one and three. Each newcomer gets a greeting back so the
        // remote handshake completes.
        fn on_peer_new(&mut self, server: &mut Server, peer: PeerId, _payload: &PayloadRef) {
            let mut shared = self.shared.lock().unwrap();
            shared.new_peers.push(peer);

            if shared.orphan {
                return;
            }

            let g1 = match shared.g1 {
                Some(g1) => g1,
                None => {
                    let g1 = server.group_create(self.room("g1"));
                    shared.g1 = Some(g1);
                    g1
                }
            };
            server.group_peer_add(peer, g1).unwrap();

            if shared.g2.is_none() {
                let g2 = server.group_create(self.room("g2"));
                shared.g2 = Some(g2);
                server.group_peer_add(peer, g2).unwrap();
            } else {
                let g3 = match shared.g3 {
                    Some(g3) => g3,
                    None => {
                        let g3 = server.group_create(self.room("g3"));
                        shared.g3 = Some(g3);
                        g3
                    }
                };
                server.group_peer_add(peer, g3).unwrap();
            }

            let mut greeting = server.payload();
            greeting.write(b"welcome").unwrap();
            server.peer_enqueue(peer, greeting.into()).unwrap();
        }

        fn on_peer_expired(&mut self, peer: &Peer, reason: Reason) {
            self.shared
                .lock()
                .unwrap()
                .expired
                .push((peer.id(), reason));
        }
    }

    #[derive(Default)]
    struct ClientEvents {
        errors: Vec<u32>,
        payloads: Vec<usize>,
        disconnects: Vec<Reason>,
    }

    struct ClientFixture {
        shared: Arc<Mutex<ClientEvents>>,
    }

    impl ClientHandler for ClientFixture {
        fn on_error(&mut self, code: Error, _text: &str) {
            self.shared.lock().unwrap().errors.push(code.code());
        }

        fn on_payload(&mut self, _client: &mut Client, _conn: ConnId, payload: &PayloadRef) {
            self.shared.lock().unwrap().payloads.push(payload.len());
        }

        fn on_disconnect(&mut self, _conn: &Connection, reason: Reason) {
            self.shared.lock().unwrap().disconnects.push(reason);
        }
    }

    fn server_fixture_idle(port: u16, idle_timeout: Duration) -> (Server, SharedState) {
        let shared = SharedState::default();
        let params = ServerParams {
            port,
            app_id: APP_ID,
            app_version: APP_VERSION,
            interface: Some("127.0.0.1".to_string()),
            idle_timeout,
            ..ServerParams::default()
        };
        let server = Server::new(
            params,
            Box::new(Fixture {
                shared: shared.clone(),
            }),
            None,
        )
        .unwrap();
        (server, shared)
    }

    fn server_fixture(port: u16) -> (Server, SharedState) {
        server_fixture_idle(port, Duration::from_secs(5))
    }

    fn client_fixture() -> (Client, Arc<Mutex<ClientEvents>>) {
        let shared = Arc::new(Mutex::new(ClientEvents::default()));
        let params = ClientParams {
            app_id: APP_ID,
            app_version: APP_VERSION,
            ..ClientParams::default()
        };
        let client = Client::new(
            params,
            Box::new(ClientFixture {
                shared: shared.clone(),
            }),
            None,
        )
        .unwrap();
        (client, shared)
    }

    fn loopback(port: u16) -> RawAddr {
        RawAddr::resolve(&TextAddr::new("127.0.0.1", &port.to_string())).unwrap()
    }

    fn pump_until<F: Fn() -> bool>(server: &mut Server, clients: &mut [&mut Client], cond: F) {
        for _ in 0..500 {
            server.poll();
            for client in clients.iter_mut() {
                client.poll();
            }
            if cond() {
                return;
            }
            thread::sleep(Duration::from_millis(1));
        }
        panic!("Timed out waiting on test condition");
    }

    fn spin(server: &mut Server, steps: usize) {
        for _ in 0..steps {
            server.poll();
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn assert_symmetry(server: &Server, peers: &[PeerId], groups: &[GroupId]) {
        for &peer in peers {
            for &group in server.peer_groups(peer) {
                assert!(server.group_peers(group).contains(&peer));
            }
        }
        for &group in groups {
            for &peer in server.group_peers(group) {
                assert!(server.peer_groups(peer).contains(&group));
            }
        }
    }

    struct Topology {
        server: Server,
        shared: SharedState,
        client1: Client,
        events1: Arc<Mutex<ClientEvents>>,
        conn1: ConnId,
        client2: Client,
        events2: Arc<Mutex<ClientEvents>>,
        conn2: ConnId,
    }

    // Two clients connected to one server: the first peer sits in g1 and
    // g2, the second in g1 and g3, and both handshakes are complete.
    fn build_topology(port: u16) -> Topology {
        let (mut server, shared) = server_fixture(port);
        let (mut client1, events1) = client_fixture();
        let (mut client2, events2) = client_fixture();

        let conn1 = client1.connect(loopback(port), None).unwrap();
        {
            let shared = shared.clone();
            let events1 = events1.clone();
            pump_until(&mut server, &mut [&mut client1], move || {
                shared.lock().unwrap().new_peers.len() == 1
                    && !events1.lock().unwrap().payloads.is_empty()
            });
        }

        let conn2 = client2.connect(loopback(port), None).unwrap();
        {
            let shared = shared.clone();
            let events2 = events2.clone();
            pump_until(&mut server, &mut [&mut client2], move || {
                shared.lock().unwrap().new_peers.len() == 2
                    && !events2.lock().unwrap().payloads.is_empty()
            });
        }

        Topology {
            server,
            shared,
            client1,
            events1,
            conn1,
            client2,
            events2,
            conn2,
        }
    }

    #[test]
    fn test_server_lifecycle() {
        let shared = SharedState::default();
        let params = ServerParams {
            port: 4992,
            app_id: 123,
            app_version: 1,
            interface: Some("127.0.0.1".to_string()),
            ..ServerParams::default()
        };
        let mut server = Server::new(
            params,
            Box::new(Fixture {
                shared: shared.clone(),
            }),
            None,
        )
        .unwrap();

        spin(&mut server, 3);
        server.terminate();

        assert!(shared.lock().unwrap().errors.is_empty());
    }

    #[test]
    fn test_rejects_tiny_max_payload() {
        let shared = SharedState::default();
        let params = ServerParams {
            port: 19420,
            max_payload_size: 16,
            interface: Some("127.0.0.1".to_string()),
            ..ServerParams::default()
        };

        let result = Server::new(
            params,
            Box::new(Fixture {
                shared: shared.clone(),
            }),
            None,
        );

        assert_eq!(result.err(), Some(Error::InvalidArgument));
        assert_eq!(shared.lock().unwrap().errors[0].0, 5);
    }

    #[test]
    fn test_group_assignment() {
        let mut topo = build_topology(12345);

        let (g1, g2, g3, p1, p2) = {
            let shared = topo.shared.lock().unwrap();
            (
                shared.g1.unwrap(),
                shared.g2.unwrap(),
                shared.g3.unwrap(),
                shared.new_peers[0],
                shared.new_peers[1],
            )
        };

        assert_eq!(topo.server.group_peers(g1), &[p1, p2]);
        assert_eq!(topo.server.group_peers(g2), &[p1]);
        assert_eq!(topo.server.group_peers(g3), &[p2]);
        assert_symmetry(&topo.server, &[p1, p2], &[g1, g2, g3]);

        // Adding a peer twice to one group is refused.
        assert_eq!(
            topo.server.group_peer_add(p1, g1),
            Err(Error::InvalidArgument)
        );
        assert_symmetry(&topo.server, &[p1, p2], &[g1, g2, g3]);

        assert!(topo.events1.lock().unwrap().errors.is_empty());
        assert!(topo.events2.lock().unwrap().errors.is_empty());
    }

    #[test]
    fn test_fan_out() {
        let mut topo = build_topology(19422);
        let (p1, p2) = {
            let shared = topo.shared.lock().unwrap();
            (shared.new_peers[0], shared.new_peers[1])
        };

        let mut ping = topo.client1.payload();
        ping.write(b"ping").unwrap();
        topo.client1.send(topo.conn1, ping.into()).unwrap();
        {
            let shared = topo.shared.clone();
            pump_until(&mut topo.server, &mut [&mut topo.client1], move || {
                shared.lock().unwrap().messages.len() >= 2
            });
        }

        {
            let shared = topo.shared.lock().unwrap();
            let for_p1: Vec<_> = shared
                .messages
                .iter()
                .filter(|(_, peer, _)| *peer == p1)
                .collect();
            assert_eq!(for_p1.len(), 2);
            assert!(for_p1
                .iter()
                .any(|(label, _, len)| *label == "g1" && *len == 4));
            assert!(for_p1
                .iter()
                .any(|(label, _, len)| *label == "g2" && *len == 4));
        }

        let mut pong = topo.client2.payload();
        pong.write(b"pong!").unwrap();
        topo.client2.send(topo.conn2, pong.into()).unwrap();
        {
            let shared = topo.shared.clone();
            pump_until(&mut topo.server, &mut [&mut topo.client2], move || {
                shared.lock().unwrap().messages.len() >= 4
            });
        }

        {
            let shared = topo.shared.lock().unwrap();
            let for_p2: Vec<_> = shared
                .messages
                .iter()
                .filter(|(_, peer, _)| *peer == p2)
                .collect();
            assert_eq!(for_p2.len(), 2);
            assert!(for_p2
                .iter()
                .any(|(label, _, len)| *label == "g1" && *len == 5));
            assert!(for_p2
                .iter()
                .any(|(label, _, len)| *label == "g3" && *len == 5));
        }

        // A broadcast to the big room reaches both clients.
        let g1 = topo.shared.lock().unwrap().g1.unwrap();
        let mut blast = topo.server.payload();
        blast.write(b"all").unwrap();
        topo.server.group_enqueue(g1, blast.into()).unwrap();
        {
            let events1 = topo.events1.clone();
            let events2 = topo.events2.clone();
            pump_until(
                &mut topo.server,
                &mut [&mut topo.client1, &mut topo.client2],
                move || {
                    events1.lock().unwrap().payloads.len() >= 2
                        && events2.lock().unwrap().payloads.len() >= 2
                },
            );
        }
        assert!(topo.events1.lock().unwrap().payloads.contains(&3));
        assert!(topo.events2.lock().unwrap().payloads.contains(&3));
    }

    #[test]
    fn test_last_group_destroy() {
        let mut topo = build_topology(19423);
        let (g1, g2, g3, p1, p2) = {
            let shared = topo.shared.lock().unwrap();
            (
                shared.g1.unwrap(),
                shared.g2.unwrap(),
                shared.g3.unwrap(),
                shared.new_peers[0],
                shared.new_peers[1],
            )
        };

        topo.server.group_destroy(g1);

        {
            let shared = topo.shared.lock().unwrap();
            assert!(shared.expired.is_empty());

            let removed: Vec<_> = shared
                .removed
                .iter()
                .filter(|(label, _, _)| *label == "g1")
                .collect();
            assert_eq!(removed.len(), 2);
            assert!(removed
                .iter()
                .all(|(_, _, reason)| *reason == Reason::RemovedFromGroup));
        }

        // Both peers still hold one other membership.
        assert!(topo.server.peer(p1).is_some());
        assert!(topo.server.peer(p2).is_some());
        assert_eq!(topo.server.peer_groups(p1), &[g2]);
        assert_eq!(topo.server.peer_groups(p2), &[g3]);

        // Dropping the last membership expires the peer, exactly once.
        topo.server.group_destroy(g3);

        {
            let shared = topo.shared.lock().unwrap();
            assert_eq!(shared.expired, vec![(p2, Reason::LastGroupDestroyed)]);
        }
        assert!(topo.server.peer(p1).is_some());
        assert!(topo.server.peer(p2).is_none());
        assert!(topo.shared.lock().unwrap().errors.is_empty());
    }

    #[test]
    fn test_client_disconnect() {
        let mut topo = build_topology(19424);
        let p1 = topo.shared.lock().unwrap().new_peers[0];

        topo.client1.disconnect(topo.conn1).unwrap();
        assert_eq!(
            topo.events1.lock().unwrap().disconnects,
            vec![Reason::ClientDisconnected]
        );

        {
            let shared = topo.shared.clone();
            pump_until(&mut topo.server, &mut [&mut topo.client2], move || {
                !shared.lock().unwrap().expired.is_empty()
            });
        }

        let shared = topo.shared.lock().unwrap();
        assert_eq!(shared.expired, vec![(p1, Reason::ClientDisconnected)]);

        let removed: Vec<_> = shared
            .removed
            .iter()
            .filter(|(_, peer, _)| *peer == p1)
            .collect();
        assert_eq!(removed.len(), 2);
        assert!(removed
            .iter()
            .all(|(_, _, reason)| *reason == Reason::ClientDisconnected));
    }

    #[test]
    fn test_wire_filter() {
        let (mut server, shared) = server_fixture(19425);
        let target = server.local_addr();
        let probe = RawSocket::bind("127.0.0.1:0").unwrap();
        let mut buf = [0u8; 64];

        // A stranger speaking an older version is ignored.
        let len = frame::encode_data(&mut buf, APP_ID, APP_VERSION - 1, b"early");
        probe.send_to(&buf[..len], target).unwrap();
        spin(&mut server, 10);
        assert!(shared.lock().unwrap().new_peers.is_empty());

        // So is a foreign app id.
        let len = frame::encode_data(&mut buf, APP_ID + 1, APP_VERSION, b"alien");
        probe.send_to(&buf[..len], target).unwrap();
        spin(&mut server, 10);
        assert!(shared.lock().unwrap().new_peers.is_empty());

        // And a corrupted checksum.
        let len = frame::encode_data(&mut buf, APP_ID, APP_VERSION, b"garbled");
        buf[6] ^= 0xff;
        probe.send_to(&buf[..len], target).unwrap();
        spin(&mut server, 10);
        assert!(shared.lock().unwrap().new_peers.is_empty());

        // The right id and version get through.
        let len = frame::encode_data(&mut buf, APP_ID, APP_VERSION, b"hello");
        probe.send_to(&buf[..len], target).unwrap();
        {
            let shared = shared.clone();
            pump_until(&mut server, &mut [], move || {
                shared.lock().unwrap().new_peers.len() == 1
            });
        }
        let peer = shared.lock().unwrap().new_peers[0];

        // A known peer may speak an older dialect, and its version is
        // remembered for outgoing traffic.
        let len = frame::encode_data(&mut buf, APP_ID, APP_VERSION - 1, b"again");
        probe.send_to(&buf[..len], target).unwrap();
        {
            let shared = shared.clone();
            pump_until(&mut server, &mut [], move || {
                shared.lock().unwrap().messages.len() >= 2
            });
        }

        {
            let shared = shared.lock().unwrap();
            assert_eq!(
                shared
                    .messages
                    .iter()
                    .filter(|(_, from, _)| *from == peer)
                    .count(),
                2
            );
        }
        assert_eq!(server.peer(peer).unwrap().remote_app_version(), APP_VERSION - 1);
    }

    #[test]
    fn test_unclaimed_peer_is_discarded() {
        let (mut server, shared) = server_fixture(19426);
        let target = server.local_addr();
        let probe = RawSocket::bind("127.0.0.1:0").unwrap();
        let mut buf = [0u8; 64];

        shared.lock().unwrap().orphan = true;

        let len = frame::encode_data(&mut buf, APP_ID, APP_VERSION, b"knock");
        probe.send_to(&buf[..len], target).unwrap();
        {
            let shared = shared.clone();
            pump_until(&mut server, &mut [], move || {
                shared.lock().unwrap().new_peers.len() == 1
            });
        }

        let first = shared.lock().unwrap().new_peers[0];
        assert!(server.peer(first).is_none());
        assert!(shared.lock().unwrap().expired.is_empty());

        // The same address starts over with its next datagram.
        probe.send_to(&buf[..len], target).unwrap();
        {
            let shared = shared.clone();
            pump_until(&mut server, &mut [], move || {
                shared.lock().unwrap().new_peers.len() == 2
            });
        }

        shared.lock().unwrap().orphan = false;
        probe.send_to(&buf[..len], target).unwrap();
        {
            let shared = shared.clone();
            pump_until(&mut server, &mut [], move || {
                shared.lock().unwrap().new_peers.len() == 3
            });
        }
        let kept = shared.lock().unwrap().new_peers[2];
        assert!(server.peer(kept).is_some());
    }

    #[test]
    fn test_peer_idle_timeout() {
        let (mut server, shared) = server_fixture_idle(19427, Duration::from_millis(60));
        let target = server.local_addr();
        let probe = RawSocket::bind("127.0.0.1:0").unwrap();
        let mut buf = [0u8; 64];

        let len = frame::encode_data(&mut buf, APP_ID, APP_VERSION, b"hello");
        probe.send_to(&buf[..len], target).unwrap();
        {
            let shared = shared.clone();
            pump_until(&mut server, &mut [], move || {
                shared.lock().unwrap().new_peers.len() == 1
            });
        }
        let peer = shared.lock().unwrap().new_peers[0];

        {
            let shared = shared.clone();
            pump_until(&mut server, &mut [], move || {
                !shared.lock().unwrap().expired.is_empty()
            });
        }

        let shared = shared.lock().unwrap();
        assert_eq!(shared.expired, vec![(peer, Reason::TimedOut)]);
        assert!(shared
            .removed
            .iter()
            .filter(|(_, from, _)| *from == peer)
            .all(|(_, _, reason)| *reason == Reason::TimedOut));
    }

    #[test]
    fn test_owned_mode() {
        let (server, shared) = server_fixture(19428);
        let worker = server.run().unwrap();

        let (mut client, events) = client_fixture();
        let conn = client.connect(loopback(19428), None).unwrap();

        for _ in 0..500 {
            client.poll();
            if !events.lock().unwrap().payloads.is_empty() {
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
        assert!(!events.lock().unwrap().payloads.is_empty());

        client.disconnect(conn).unwrap();

        let server = worker.stop();
        server.terminate();
        assert!(shared.lock().unwrap().errors.is_empty());
    }
}
