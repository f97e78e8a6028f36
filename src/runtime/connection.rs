//! Per-peer connection state and the live-connection registry.
//!
//! A `Connection` owns its socket and line framer. The `ConnectionRegistry`
//! keeps two views over the same live connections:
//! - an ordered list of tokens (broadcast order = accept order)
//! - a map from token to connection (dispatch of readiness events)
//!
//! Every live connection is in both views, every evicted connection in
//! neither. Tokens come from a monotonic counter and are never reused, so a
//! stale readiness event can never reach a newer connection.

use crate::protocol::{format_frame, FrameError, LineFramer};
use bytes::Bytes;
use mio::Token;
use std::collections::HashMap;
use std::fmt;
use std::io::{self, Write};

/// Why a connection left the registry.
#[derive(Debug)]
pub enum CloseReason {
    /// Read returned zero bytes.
    PeerClosed,
    /// Read failed.
    ReadFailed(io::Error),
    /// Send failed during a broadcast. The socket is non-blocking, so a
    /// full kernel send buffer counts as a failure too.
    SendFailed(io::Error),
    /// The readiness wait reported an error condition on the socket.
    SocketError,
    /// An unterminated line exceeded the configured limit.
    LineTooLong(FrameError),
    /// Re-arming readiness notifications failed.
    ReregisterFailed(io::Error),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::PeerClosed => write!(f, "peer closed"),
            CloseReason::ReadFailed(e) => write!(f, "read failed: {}", e),
            CloseReason::SendFailed(e) => write!(f, "send failed: {}", e),
            CloseReason::SocketError => write!(f, "socket error"),
            CloseReason::LineTooLong(e) => write!(f, "{}", e),
            CloseReason::ReregisterFailed(e) => write!(f, "reregister failed: {}", e),
        }
    }
}

/// A single peer.
#[derive(Debug)]
pub struct Connection<S> {
    stream: S,
    /// Remote address, fixed at accept.
    peer: String,
    framer: LineFramer,
}

impl<S> Connection<S> {
    /// Wrap an accepted stream.
    pub fn new(stream: S, peer: String, max_line_length: Option<usize>) -> Self {
        Self {
            stream,
            peer,
            framer: LineFramer::with_limit(max_line_length),
        }
    }

    /// Remote address string used as the sender name in outbound frames.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Socket access for reads and readiness registration.
    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Push received bytes through the framer.
    ///
    /// Returns one outbound frame per completed line, in order. On a
    /// framing error the frames completed before it are dropped along with
    /// the connection.
    pub fn feed(&mut self, input: &[u8]) -> Result<Vec<(String, Bytes)>, FrameError> {
        let mut lines = Vec::new();
        self.framer.feed(input, &mut lines)?;
        Ok(lines
            .into_iter()
            .map(|line| {
                let frame = format_frame(&self.peer, &line);
                (line, frame)
            })
            .collect())
    }
}

impl<S: Write> Connection<S> {
    /// Write `bytes` to the peer unmodified.
    ///
    /// Any error, including a short write on a non-blocking socket, is
    /// terminal for the connection.
    pub fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes)
    }
}

/// A connection removed by a broadcast pass.
#[derive(Debug)]
pub struct Evicted<S> {
    pub token: Token,
    pub connection: Connection<S>,
    pub reason: CloseReason,
}

/// Outcome of a broadcast pass.
#[derive(Debug)]
pub struct BroadcastReport<S> {
    /// Connections that received the frame.
    pub delivered: usize,
    /// Connections whose send failed, already removed from the registry.
    pub evicted: Vec<Evicted<S>>,
}

/// Registry of live connections.
pub struct ConnectionRegistry<S> {
    order: Vec<Token>,
    by_token: HashMap<Token, Connection<S>>,
    next_token: usize,
    max_connections: Option<usize>,
}

impl<S> ConnectionRegistry<S> {
    /// Create a registry. `None` means no connection limit.
    pub fn new(max_connections: Option<usize>) -> Self {
        Self {
            order: Vec::with_capacity(64),
            by_token: HashMap::with_capacity(64),
            next_token: 0,
            max_connections,
        }
    }

    /// Register a connection in both views.
    ///
    /// Returns `None` if the registry is at its connection limit.
    pub fn insert(&mut self, conn: Connection<S>) -> Option<Token> {
        if self.is_full() {
            return None;
        }
        let token = Token(self.next_token);
        self.next_token += 1;
        self.order.push(token);
        self.by_token.insert(token, conn);
        Some(token)
    }

    /// Whether another connection would exceed the limit.
    pub fn is_full(&self) -> bool {
        self.max_connections
            .map_or(false, |max| self.by_token.len() >= max)
    }

    #[cfg(test)]
    pub fn get(&self, token: Token) -> Option<&Connection<S>> {
        self.by_token.get(&token)
    }

    pub fn get_mut(&mut self, token: Token) -> Option<&mut Connection<S>> {
        self.by_token.get_mut(&token)
    }

    #[cfg(test)]
    pub fn contains(&self, token: Token) -> bool {
        self.by_token.contains_key(&token)
    }

    /// Remove a connection from both views.
    ///
    /// Returns `None` if it was already evicted.
    pub fn evict(&mut self, token: Token) -> Option<Connection<S>> {
        let conn = self.by_token.remove(&token)?;
        if let Some(pos) = self.order.iter().position(|&t| t == token) {
            self.order.remove(pos);
        }
        Some(conn)
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.by_token.len()
    }

    /// Iterate live connections in accept order.
    #[cfg(test)]
    pub fn iter(&self) -> impl Iterator<Item = (Token, &Connection<S>)> {
        self.order
            .iter()
            .filter_map(move |&token| self.by_token.get(&token).map(|conn| (token, conn)))
    }
}

impl<S: Write> ConnectionRegistry<S> {
    /// Send `frame` to every live connection in accept order.
    ///
    /// Failed sends are only marked while iterating. The marked connections
    /// are evicted once every connection has been tried.
    pub fn broadcast(&mut self, frame: &[u8]) -> BroadcastReport<S> {
        let mut delivered = 0;
        let mut failed = Vec::new();

        for &token in &self.order {
            let Some(conn) = self.by_token.get_mut(&token) else {
                continue;
            };
            match conn.send(frame) {
                Ok(()) => delivered += 1,
                Err(e) => failed.push((token, e)),
            }
        }

        let evicted = failed
            .into_iter()
            .filter_map(|(token, e)| {
                self.evict(token).map(|connection| Evicted {
                    token,
                    connection,
                    reason: CloseReason::SendFailed(e),
                })
            })
            .collect();

        BroadcastReport { delivered, evicted }
    }
}
