//! Session table: an explicit, session-handle-indexed replacement for the
//! original's raw-fd-indexed `cbuff*` array that gets `realloc`'d on every
//! `accept()`.

use std::collections::BTreeMap;
use std::fs::File;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};

use crate::ring::Rb;

/// Opaque handle into the session table. Stable across the table's
/// lifetime, unlike a raw fd, which the kernel can reuse the instant a
/// session is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(u64);

/// The OS resource a session wraps. Holding the owning type (rather than a
/// bare `RawFd`) means the descriptor stays open for exactly as long as the
/// session is in the table, and is closed automatically when it is removed.
#[derive(Debug)]
pub enum SessionResource {
    Tty(File),
    Listener(TcpListener),
    Client(TcpStream),
}

impl SessionResource {
    pub fn as_raw_fd(&self) -> RawFd {
        match self {
            SessionResource::Tty(f) => f.as_raw_fd(),
            SessionResource::Listener(l) => l.as_raw_fd(),
            SessionResource::Client(c) => c.as_raw_fd(),
        }
    }

    pub fn is_client(&self) -> bool {
        matches!(self, SessionResource::Client(_))
    }
}

#[derive(Debug)]
pub struct Session {
    pub resource: SessionResource,
    /// Tty and client sessions own a ring; the listener never reads/writes
    /// bytes and so never needs one.
    pub ring: Option<Rb>,
    /// Clients only: set on peer EOF. The ring is drained of any remaining
    /// complete records before the session is reaped.
    pub closed: bool,
    pub peer: Option<SocketAddr>,
}

impl Session {
    pub fn tty(file: File, ring: Rb) -> Self {
        Self {
            resource: SessionResource::Tty(file),
            ring: Some(ring),
            closed: false,
            peer: None,
        }
    }

    pub fn listener(listener: TcpListener) -> Self {
        Self {
            resource: SessionResource::Listener(listener),
            ring: None,
            closed: false,
            peer: None,
        }
    }

    pub fn client(stream: TcpStream, ring: Rb, peer: SocketAddr) -> Self {
        Self {
            resource: SessionResource::Client(stream),
            ring: Some(ring),
            closed: false,
            peer: Some(peer),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.resource.as_raw_fd()
    }

    /// A client enters CLOSED_DRAINING on peer EOF: `closed` is set but the
    /// ring is not freed until its remaining complete records have been
    /// written to the tty.
    pub fn mark_closed(&mut self) {
        self.closed = true;
    }

    pub fn is_reapable(&self, has_complete_record: bool) -> bool {
        self.closed && !has_complete_record
    }
}

/// The owning collection of sessions, keyed by opaque handle rather than by
/// raw fd. Grows on `accept()`, shrinks on reap.
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: BTreeMap<u64, Session>,
    next_id: u64,
}

impl SessionTable {
    pub fn new() -> Self {
        Self {
            sessions: BTreeMap::new(),
            next_id: 0,
        }
    }

    pub fn insert(&mut self, session: Session) -> SessionId {
        let id = SessionId(self.next_id);
        self.next_id += 1;
        self.sessions.insert(id.0, session);
        id
    }

    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id.0)
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(&id.0)
    }

    pub fn remove(&mut self, id: SessionId) -> Option<Session> {
        self.sessions.remove(&id.0)
    }

    pub fn ids(&self) -> impl Iterator<Item = SessionId> + '_ {
        self.sessions.keys().copied().map(SessionId)
    }

    pub fn clients(&self) -> impl Iterator<Item = SessionId> + '_ {
        self.sessions
            .iter()
            .filter(|(_, s)| s.resource.is_client())
            .map(|(id, _)| SessionId(*id))
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
