//! A lightweight structured transport on top of UDP: checksummed framed
//! datagrams between an application-tagged listening server that sorts its
//! peers into groups, and a multi-connection client with a retried
//! handshake. Payloads are refcounted buffers tied to the endpoint that
//! minted them; every endpoint is driven by a single non-blocking polling
//! loop, either from an application thread or from a library worker.

#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod addr;
pub mod arena;
pub mod client;
pub mod driver;
pub mod error;
pub mod frame;
pub mod payload;
pub mod server;

pub use crate::addr::{RawAddr, TextAddr, DEFAULT_PORT};
pub use crate::client::{Client, ClientHandler, ClientParams, ConnId, ConnState, Connection};
pub use crate::driver::{Pollable, Worker};
pub use crate::error::{Error, Result};
pub use crate::payload::{Origin, Payload, PayloadRef};
pub use crate::server::{
    GroupHandler, GroupId, Peer, PeerId, Server, ServerHandler, ServerParams,
};

/// Why a peer or a connection went away.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Reason {
    TimedOut = 1,
    LastGroupDestroyed = 2,
    ClientDisconnected = 3,
    RemovedFromGroup = 4,
}

impl Reason {
    /// Stable numeric identity of the reason.
    #[inline]
    pub fn code(self) -> u32 {
        self as u32
    }
}
