//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us which sockets are ready, then we
//! perform non-blocking accept/read/write syscalls. Uses epoll on Linux,
//! kqueue on macOS.
//!
//! ## Pass Structure
//!
//! Each wakeup takes one snapshot of the ready set and handles it in two
//! sweeps:
//! 1. readable sockets: one accept on the listener, one bounded read per
//!    connection, broadcast of every line that read completed
//! 2. errored sockets: eviction, skipped for connections already gone
//!
//! Everything runs on the calling thread, so handling of one ready socket
//! finishes before the next one is looked at.
//!
//! ## Re-arming
//!
//! mio registrations are edge-triggered. Every accept and every read that
//! returned data re-registers the socket, so connections, bytes or an EOF
//! still queued in the kernel are reported again in a later pass.

use crate::config::Config;
use crate::runtime::{CloseReason, Connection, ConnectionRegistry};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use std::io::{self, Read};
use std::net::{IpAddr, SocketAddr};
use tracing::{debug, info, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Events drained per wakeup.
const EVENTS_CAPACITY: usize = 1024;

/// Readiness of one socket, copied out of the mio event batch.
#[derive(Debug, Clone, Copy)]
struct Readiness {
    token: Token,
    readable: bool,
    error: bool,
}

/// Owns the listener, the poll instance and every live connection.
pub struct Multiplexer {
    poll: Poll,
    events: Events,
    ready: Vec<Readiness>,
    listener: TcpListener,
    local_addr: SocketAddr,
    connections: ConnectionRegistry<TcpStream>,
    /// Receive buffer shared by all connections. Reads never overlap.
    scratch: Box<[u8]>,
    max_line_length: Option<usize>,
}

impl Multiplexer {
    /// Bind the listening socket and register it for readiness.
    ///
    /// Bind and listen failures are returned to the caller.
    pub fn bind(config: &Config) -> io::Result<Self> {
        let ip: IpAddr = config
            .listen
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let addr = SocketAddr::new(ip, config.port);

        let listener = create_listener(addr, config.backlog)?;
        let mut listener = TcpListener::from_std(listener);
        let local_addr = listener.local_addr()?;

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        Ok(Self {
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            ready: Vec::with_capacity(EVENTS_CAPACITY),
            listener,
            local_addr,
            connections: ConnectionRegistry::new(config.max_connections),
            scratch: vec![0u8; config.read_buffer_size].into_boxed_slice(),
            max_line_length: config.max_line_length,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve forever. Only listener or poll failures return.
    pub fn run(&mut self) -> io::Result<()> {
        loop {
            self.run_once()?;
        }
    }

    /// Wait for readiness without a timeout and handle one ready-set snapshot.
    fn run_once(&mut self) -> io::Result<()> {
        match self.poll.poll(&mut self.events, None) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }

        self.ready.clear();
        self.ready.extend(self.events.iter().map(|event| Readiness {
            token: event.token(),
            readable: event.is_readable() || event.is_read_closed(),
            error: event.is_error(),
        }));

        for i in 0..self.ready.len() {
            let readiness = self.ready[i];
            if !readiness.readable {
                continue;
            }
            if readiness.token == LISTENER_TOKEN {
                self.accept()?;
            } else {
                self.read(readiness.token);
            }
        }

        for i in 0..self.ready.len() {
            let readiness = self.ready[i];
            if !readiness.error {
                continue;
            }
            if readiness.token == LISTENER_TOKEN {
                if let Some(e) = self.listener.take_error()? {
                    return Err(e);
                }
            } else {
                self.close(readiness.token, CloseReason::SocketError);
            }
        }

        Ok(())
    }

    /// Accept one pending connection and re-arm the listener.
    fn accept(&mut self) -> io::Result<()> {
        match self.listener.accept() {
            Ok((stream, peer_addr)) => self.register(stream, peer_addr),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) if is_transient_accept_error(&e) => {
                warn!(error = %e, "Accept failed");
            }
            Err(e) => return Err(e),
        }

        self.poll
            .registry()
            .reregister(&mut self.listener, LISTENER_TOKEN, Interest::READABLE)
    }

    fn register(&mut self, stream: TcpStream, peer_addr: SocketAddr) {
        let peer = peer_addr.to_string();
        let conn = Connection::new(stream, peer.clone(), self.max_line_length);

        let Some(token) = self.connections.insert(conn) else {
            warn!(peer = %peer, "Connection limit reached");
            return;
        };

        let registered = match self.connections.get_mut(token) {
            Some(conn) => {
                self.poll
                    .registry()
                    .register(conn.stream_mut(), token, Interest::READABLE)
            }
            None => return,
        };

        match registered {
            Ok(()) => {
                info!(
                    peer = %peer,
                    token = token.0,
                    connections = self.connections.len(),
                    "Peer connected"
                );
            }
            Err(e) => {
                warn!(peer = %peer, error = %e, "Failed to register connection");
                self.connections.evict(token);
            }
        }
    }

    /// One bounded read from a ready connection, then broadcast of every
    /// line it completed.
    fn read(&mut self, token: Token) {
        let Some(conn) = self.connections.get_mut(token) else {
            return;
        };

        let n = match conn.stream_mut().read(&mut self.scratch) {
            Ok(0) => return self.close(token, CloseReason::PeerClosed),
            Ok(n) => n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return self.rearm(token),
            Err(e) => return self.close(token, CloseReason::ReadFailed(e)),
        };

        let Some(conn) = self.connections.get_mut(token) else {
            return;
        };
        let peer = conn.peer().to_string();
        let frames = match conn.feed(&self.scratch[..n]) {
            Ok(frames) => frames,
            Err(e) => return self.close(token, CloseReason::LineTooLong(e)),
        };

        // Data and FIN can share one edge; re-arm so the EOF is seen.
        self.rearm(token);

        for (line, frame) in frames {
            self.broadcast(&peer, &line, &frame);
        }
    }

    /// Send a frame to every live connection, then evict the ones that failed.
    fn broadcast(&mut self, origin: &str, line: &str, frame: &[u8]) {
        let report = self.connections.broadcast(frame);

        info!(
            peer = origin,
            line = %line.escape_debug(),
            recipients = report.delivered,
            "Broadcast"
        );

        for evicted in report.evicted {
            debug!(
                peer = evicted.connection.peer(),
                token = evicted.token.0,
                "Send failed during broadcast"
            );
            self.release(evicted.connection, evicted.reason);
        }
    }

    fn rearm(&mut self, token: Token) {
        let Some(conn) = self.connections.get_mut(token) else {
            return;
        };
        if let Err(e) =
            self.poll
                .registry()
                .reregister(conn.stream_mut(), token, Interest::READABLE)
        {
            self.close(token, CloseReason::ReregisterFailed(e));
        }
    }

    /// Evict a connection if it is still registered.
    fn close(&mut self, token: Token, reason: CloseReason) {
        if let Some(conn) = self.connections.evict(token) {
            self.release(conn, reason);
        }
    }

    /// Deregister and drop an evicted connection, closing its socket.
    fn release(&mut self, mut conn: Connection<TcpStream>, reason: CloseReason) {
        let _ = self.poll.registry().deregister(conn.stream_mut());
        info!(
            peer = conn.peer(),
            reason = %reason,
            connections = self.connections.len(),
            "Peer disconnected"
        );
    }
}

/// Accept failures caused by the peer rather than the listener.
fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
    )
}

/// Create a non-blocking TCP listener with the given backlog.
fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::Shutdown;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    fn test_config() -> Config {
        Config {
            listen: "127.0.0.1".to_string(),
            port: 0,
            backlog: 16,
            max_connections: None,
            read_buffer_size: 16 * 1024,
            max_line_length: None,
            log_level: "info".to_string(),
        }
    }

    fn spawn_relay(config: Config) -> SocketAddr {
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let mut multiplexer = Multiplexer::bind(&config).unwrap();
            tx.send(multiplexer.local_addr()).unwrap();
            let _ = multiplexer.run();
        });
        rx.recv().unwrap()
    }

    fn connect(addr: SocketAddr) -> std::net::TcpStream {
        let stream = std::net::TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }

    fn name(stream: &std::net::TcpStream) -> String {
        stream.local_addr().unwrap().to_string()
    }

    fn expect(stream: &mut std::net::TcpStream, expected: &str) {
        let mut buf = vec![0u8; expected.len()];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(String::from_utf8_lossy(&buf), expected);
    }

    /// Assert the relay closed its end of the connection.
    fn expect_closed(stream: &mut std::net::TcpStream) {
        let mut buf = [0u8; 64];
        match stream.read(&mut buf) {
            Ok(0) => {}
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {}
            other => panic!("expected the relay to close the connection, got {:?}", other),
        }
    }

    /// Send a line and wait for its echo, which proves the sender is registered.
    fn join(stream: &mut std::net::TcpStream) {
        let me = name(stream);
        stream.write_all(b"joined\n").unwrap();
        expect(stream, &format!("{me}: joined\n"));
    }

    #[test]
    fn test_line_relayed_to_every_peer() {
        let addr = spawn_relay(test_config());

        let mut a = connect(addr);
        join(&mut a);

        let mut b = connect(addr);
        join(&mut b);
        expect(&mut a, &format!("{}: joined\n", name(&b)));

        a.write_all(b"hi\n").unwrap();
        let frame = format!("{}: hi\n", name(&a));
        expect(&mut a, &frame);
        expect(&mut b, &frame);
    }

    #[test]
    fn test_carriage_return_relayed_verbatim() {
        let addr = spawn_relay(test_config());

        let mut a = connect(addr);
        a.write_all(b"hel").unwrap();
        a.write_all(b"lo\r\n").unwrap();
        let me = name(&a);
        expect(&mut a, &format!("{me}: hello\r\n"));
    }

    #[test]
    fn test_departed_peer_does_not_disrupt_others() {
        let addr = spawn_relay(test_config());

        let mut a = connect(addr);
        join(&mut a);

        let mut c = connect(addr);
        join(&mut c);
        expect(&mut a, &format!("{}: joined\n", name(&c)));
        drop(c);

        a.write_all(b"still here\n").unwrap();
        let me = name(&a);
        expect(&mut a, &format!("{me}: still here\n"));

        let mut b = connect(addr);
        join(&mut b);
        expect(&mut a, &format!("{}: joined\n", name(&b)));
    }

    #[test]
    fn test_line_then_eof_evicts_peer() {
        let addr = spawn_relay(test_config());

        let mut a = connect(addr);
        let me = name(&a);
        a.write_all(b"hi\n").unwrap();
        a.shutdown(Shutdown::Write).unwrap();

        expect(&mut a, &format!("{me}: hi\n"));
        expect_closed(&mut a);
    }

    #[test]
    fn test_partial_line_then_eof_evicts_peer() {
        let addr = spawn_relay(test_config());

        let mut a = connect(addr);
        join(&mut a);

        let mut c = connect(addr);
        join(&mut c);
        expect(&mut a, &format!("{}: joined\n", name(&c)));

        c.write_all(b"abc").unwrap();
        c.shutdown(Shutdown::Write).unwrap();
        expect_closed(&mut c);

        // The unterminated line is never relayed.
        a.write_all(b"after\n").unwrap();
        let me = name(&a);
        expect(&mut a, &format!("{me}: after\n"));
    }

    #[test]
    fn test_bare_eof_evicts_peer() {
        let addr = spawn_relay(test_config());

        let mut a = connect(addr);
        join(&mut a);

        let mut c = connect(addr);
        join(&mut c);
        expect(&mut a, &format!("{}: joined\n", name(&c)));

        c.shutdown(Shutdown::Write).unwrap();
        expect_closed(&mut c);

        // The half-closed peer gets nothing relayed after its eviction.
        a.write_all(b"later\n").unwrap();
        let me = name(&a);
        expect(&mut a, &format!("{me}: later\n"));
        expect_closed(&mut c);
    }

    #[test]
    fn test_line_limit_disconnects_peer() {
        let mut config = test_config();
        config.max_line_length = Some(8);
        let addr = spawn_relay(config);

        let mut a = connect(addr);
        a.write_all(b"this line never ends").unwrap();

        expect_closed(&mut a);
    }

    #[test]
    fn test_connection_limit_rejects_extra_peer() {
        let mut config = test_config();
        config.max_connections = Some(1);
        let addr = spawn_relay(config);

        let mut a = connect(addr);
        join(&mut a);

        let mut b = connect(addr);
        expect_closed(&mut b);

        a.write_all(b"alone\n").unwrap();
        let me = name(&a);
        expect(&mut a, &format!("{me}: alone\n"));
    }

    #[test]
    fn test_bind_rejects_bad_host() {
        let mut config = test_config();
        config.listen = "not-an-ip".to_string();
        let err = Multiplexer::bind(&config).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
