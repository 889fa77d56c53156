//! # Transport Runtime
//!
//! Binds a [`StreamSession`] to a UDP socket with two named threads:
//!
//! ```text
//!            ┌──────────────┐   handle_packet    ┌───────────────┐
//!  socket ──▶│ vrlink-recv  │ ─────────────────▶ │               │
//!     ▲      └──────────────┘  (replies sent     │ StreamSession │
//!     │                         directly)        │               │
//!     │      ┌──────────────┐   poll + drain     │               │
//!     └──────│ vrlink-pump  │ ◀───────────────── │               │
//!            └──────────────┘   every 1 ms       └───────────────┘
//! ```
//!
//! The socket is non-blocking. The receive thread naps for the pump interval
//! whenever the socket is empty, and the pump never stalls on a full send
//! buffer. Dropping the runtime stops and joins both threads.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::session::StreamSession;

const PUMP_INTERVAL: Duration = Duration::from_millis(1);
const RECV_BUFFER: usize = 2048;

type SharedPeer = Arc<Mutex<Option<SocketAddr>>>;

fn current_peer(peer: &SharedPeer) -> Option<SocketAddr> {
    *peer.lock().unwrap_or_else(|e| e.into_inner())
}

/// Socket threads driving one session.
pub struct TransportRuntime {
    session: Arc<StreamSession>,
    shutdown: Arc<AtomicBool>,
    peer: SharedPeer,
    local_addr: SocketAddr,
    handles: Vec<thread::JoinHandle<()>>,
}

impl TransportRuntime {
    /// Start both threads on `socket`.
    ///
    /// With `peer == None` the first datagram's source becomes the peer and
    /// datagrams from any other address are dropped afterwards.
    pub fn start(
        session: Arc<StreamSession>,
        socket: UdpSocket,
        peer: Option<SocketAddr>,
    ) -> io::Result<Self> {
        socket.set_nonblocking(true)?;
        let local_addr = socket.local_addr()?;
        let send_socket = socket.try_clone()?;

        let mut rt = TransportRuntime {
            session,
            shutdown: Arc::new(AtomicBool::new(false)),
            peer: Arc::new(Mutex::new(peer)),
            local_addr,
            handles: Vec::with_capacity(2),
        };

        let (session, shutdown, peer) = (rt.session.clone(), rt.shutdown.clone(), rt.peer.clone());
        rt.handles.push(
            thread::Builder::new()
                .name("vrlink-recv".into())
                .spawn(move || recv_loop(socket, session, peer, shutdown))?,
        );

        let (session, shutdown, peer) = (rt.session.clone(), rt.shutdown.clone(), rt.peer.clone());
        rt.handles.push(
            thread::Builder::new()
                .name("vrlink-pump".into())
                .spawn(move || pump_loop(send_socket, session, peer, shutdown))?,
        );

        tracing::info!(local = %local_addr, peer = ?rt.peer(), "transport runtime started");
        Ok(rt)
    }

    pub fn session(&self) -> &Arc<StreamSession> {
        &self.session
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        current_peer(&self.peer)
    }

    /// Stop both threads and wait for them. Idempotent.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for TransportRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn recv_loop(
    socket: UdpSocket,
    session: Arc<StreamSession>,
    peer: SharedPeer,
    shutdown: Arc<AtomicBool>,
) {
    let mut buf = [0u8; RECV_BUFFER];
    while !shutdown.load(Ordering::Relaxed) {
        let (n, from) = match socket.recv_from(&mut buf) {
            Ok(r) => r,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(PUMP_INTERVAL);
                continue;
            }
            Err(e) => {
                tracing::debug!(error = %e, "recv failed");
                continue;
            }
        };

        {
            let mut p = peer.lock().unwrap_or_else(|e| e.into_inner());
            match *p {
                Some(addr) if addr != from => {
                    tracing::trace!(%from, "datagram from unknown address dropped");
                    continue;
                }
                Some(_) => {}
                None => {
                    tracing::info!(peer = %from, "client connected");
                    *p = Some(from);
                }
            }
        }

        if let Some(reply) = session.handle_packet(&buf[..n], session.now_us()) {
            if let Err(e) = socket.send_to(&reply, from) {
                tracing::debug!(error = %e, "reply send failed");
            }
        }
    }
}

fn pump_loop(
    socket: UdpSocket,
    session: Arc<StreamSession>,
    peer: SharedPeer,
    shutdown: Arc<AtomicBool>,
) {
    while !shutdown.load(Ordering::Relaxed) {
        let now = session.now_us();
        session.poll(now);
        if let Some(addr) = current_peer(&peer) {
            session.drain(now, |bytes| socket.send_to(bytes, addr).map(|_| ()));
        }
        thread::sleep(PUMP_INTERVAL);
    }
}
