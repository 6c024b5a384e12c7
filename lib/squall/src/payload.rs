//! The payload object: a bounded byte buffer with application tagging,
//! shared by reference counting and tied to the endpoint that minted it.

use crate::error::{Error, Result};
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Payload size selected when the application asks for zero.
pub const DEFAULT_MAX_PAYLOAD_SIZE: u16 = 1200;
/// Smallest payload size an endpoint accepts.
pub const MIN_PAYLOAD_SIZE: u16 = 32;
/// Largest payload that still fits a single datagram with framing.
pub const MAX_PAYLOAD_SIZE: u16 = 65496;

/// Applies the default and rejects out-of-range payload sizes.
pub(crate) fn effective_payload_size(requested: u16) -> Result<usize> {
    match requested {
        0 => Ok(DEFAULT_MAX_PAYLOAD_SIZE as usize),
        n if n < MIN_PAYLOAD_SIZE => Err(Error::InvalidArgument),
        n if n > MAX_PAYLOAD_SIZE => Err(Error::InvalidArgument),
        n => Ok(n as usize),
    }
}

static NEXT_ENDPOINT_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one endpoint (server instance or client), drawn from a
/// process-wide counter so the two facets never collide.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct EndpointId(u64);

impl EndpointId {
    #[inline]
    pub(crate) fn next() -> EndpointId {
        EndpointId(NEXT_ENDPOINT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Which side of the library minted a payload.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Origin {
    Server(EndpointId),
    Client(EndpointId),
}

impl Origin {
    #[inline]
    pub(crate) fn endpoint(self) -> EndpointId {
        match self {
            Origin::Server(id) => id,
            Origin::Client(id) => id,
        }
    }
}

/// One application message: the buffer, the sender's application id and
/// version, and the minting endpoint. Payloads are mutated while unique,
/// then shared through [`PayloadRef`] and immutable from there on.
#[derive(Debug)]
pub struct Payload {
    data: Vec<u8>,
    limit: usize,
    app_id: u16,
    app_version: u16,
    origin: Origin,
}

impl Payload {
    #[inline]
    pub(crate) fn new(origin: Origin, app_id: u16, app_version: u16, limit: usize) -> Payload {
        Payload {
            data: Vec::new(),
            limit,
            app_id,
            app_version,
            origin,
        }
    }

    /// Wraps bytes that arrived off the wire.
    #[inline]
    pub(crate) fn received(
        origin: Origin,
        app_id: u16,
        app_version: u16,
        limit: usize,
        bytes: &[u8],
    ) -> Payload {
        Payload {
            data: bytes.to_vec(),
            limit,
            app_id,
            app_version,
            origin,
        }
    }

    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Direct access to the buffer for staging outgoing data. The size cap
    /// is enforced when the payload is enqueued.
    #[inline]
    pub fn data_mut(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }

    /// Appends bytes, refusing to grow past the minting endpoint's maximum
    /// payload size.
    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        match self.data.len() + bytes.len() <= self.limit {
            true => {
                self.data.extend_from_slice(bytes);
                Ok(())
            }
            false => Err(Error::InvalidArgument),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The most this payload may hold.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.limit
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
    pub fn origin(&self) -> Origin {
        self.origin
    }

    /// Pins the payload. The buffer is leaked and lives for the rest of the
    /// process; holding and releasing a pinned payload are no-ops.
    pub fn pin(self) -> PayloadRef {
        PayloadRef::Pinned(Box::leak(Box::new(self)))
    }
}

/// Shared handle to a payload. Cloning holds one more reference, dropping
/// releases one; the buffer goes away with the last `Shared` handle. A
/// `Pinned` payload is indestructible.
#[derive(Debug, Clone)]
pub enum PayloadRef {
    Shared(Arc<Payload>),
    Pinned(&'static Payload),
}

impl Deref for PayloadRef {
    type Target = Payload;

    #[inline]
    fn deref(&self) -> &Payload {
        match self {
            PayloadRef::Shared(payload) => payload,
            PayloadRef::Pinned(payload) => payload,
        }
    }
}

impl From<Payload> for PayloadRef {
    #[inline]
    fn from(payload: Payload) -> PayloadRef {
        PayloadRef::Shared(Arc::new(payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Weak;

    fn mint(limit: usize) -> Payload {
        Payload::new(Origin::Server(EndpointId::next()), 7, 2, limit)
    }

    fn weak_of(handle: &PayloadRef) -> Weak<Payload> {
        match handle {
            PayloadRef::Shared(arc) => Arc::downgrade(arc),
            PayloadRef::Pinned(_) => panic!("expected a shared payload"),
        }
    }

    #[test]
    fn test_write_respects_limit() {
        let mut payload = mint(8);

        payload.write(b"12345").unwrap();
        payload.write(b"678").unwrap();
        assert_eq!(payload.write(b"9"), Err(Error::InvalidArgument));
        assert_eq!(payload.data(), b"12345678");
    }

    #[test]
    fn test_hold_release_pairs_keep_payload_live() {
        let payload = mint(64);
        let handle = PayloadRef::from(payload);
        let weak = weak_of(&handle);

        for _ in 0..10 {
            let held = handle.clone();
            drop(held);
            assert!(weak.upgrade().is_some());
        }

        drop(handle);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_last_release_frees() {
        let handle = PayloadRef::from(mint(64));
        let weak = weak_of(&handle);

        let second = handle.clone();
        drop(handle);
        assert!(weak.upgrade().is_some());
        drop(second);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_pinned_is_indestructible() {
        let mut payload = mint(64);
        payload.write(b"forever").unwrap();

        let pinned = payload.pin();
        let copy = pinned.clone();
        drop(pinned);
        drop(copy.clone());

        assert_eq!(copy.data(), b"forever");
    }

    #[test]
    fn test_effective_payload_size() {
        assert_eq!(
            effective_payload_size(0),
            Ok(DEFAULT_MAX_PAYLOAD_SIZE as usize)
        );
        assert_eq!(effective_payload_size(MIN_PAYLOAD_SIZE), Ok(32));
        assert_eq!(
            effective_payload_size(MIN_PAYLOAD_SIZE - 1),
            Err(Error::InvalidArgument)
        );
        assert_eq!(
            effective_payload_size(MAX_PAYLOAD_SIZE),
            Ok(MAX_PAYLOAD_SIZE as usize)
        );
        assert_eq!(
            effective_payload_size(MAX_PAYLOAD_SIZE + 1),
            Err(Error::InvalidArgument)
        );
    }

    #[test]
    fn test_endpoint_ids_are_unique() {
        let a = EndpointId::next();
        let b = EndpointId::next();
        assert_ne!(a, b);
    }
}
