//! The capture server: a listening TCP socket the GUI connects to.
//!
//! The receive side is pumped from `next_frame` on the main thread — it
//! accepts at most one client, drains whatever bytes arrived, and hands
//! decoded requests back to the core. The send side is callable from any
//! thread under its own mutex (the dump pass and the GPU flip both send).

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::time::Duration;

use framescope_wire::{
    next_message, write_response, InputStream, Request, ResponseType, WireError, APPLICATION_ID,
    DEFAULT_PORT, PORT_RANGE,
};
use parking_lot::Mutex;

/// In-process consumer of the capture stream, fed the same framed messages
/// the TCP client receives. Useful for saving captures to disk and for
/// exercising the dump pass in tests.
pub trait CaptureSink: Send {
    fn message(&mut self, ty: ResponseType, payload: &[u8]);
}

/// Read timeout standing in for the original's zero-timeout select: short
/// enough that a frame tick never stalls on a silent client.
const RECV_TIMEOUT: Duration = Duration::from_millis(1);

struct RecvState {
    stream: Option<TcpStream>,
    input: InputStream,
}

pub(crate) struct Server {
    listener: Option<TcpListener>,
    port: Option<u16>,
    recv: Mutex<RecvState>,
    send: Mutex<Option<TcpStream>>,
}

impl Server {
    /// Bind the first free port in `[DEFAULT_PORT, DEFAULT_PORT + PORT_RANGE)`.
    /// On failure the profiler stays silent: annotations keep working, but
    /// no client can connect.
    pub fn start() -> Self {
        let mut listener = None;
        let mut port = None;
        for candidate in DEFAULT_PORT..DEFAULT_PORT + PORT_RANGE {
            match TcpListener::bind(("0.0.0.0", candidate)) {
                Ok(socket) => {
                    if let Err(err) = socket.set_nonblocking(true) {
                        log::warn!("failed to make the listener non-blocking: {err}");
                        break;
                    }
                    log::debug!("profiler server listening on port {candidate}");
                    listener = Some(socket);
                    port = Some(candidate);
                    break;
                }
                Err(_) => continue,
            }
        }
        if listener.is_none() {
            log::warn!(
                "failed to bind a profiler port in [{DEFAULT_PORT}, {}]; remote capture disabled",
                DEFAULT_PORT + PORT_RANGE - 1
            );
        }

        Server {
            listener,
            port,
            recv: Mutex::new(RecvState {
                stream: None,
                input: InputStream::new(),
            }),
            send: Mutex::new(None),
        }
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Accept/drain/decode one round. Returns the requests that arrived.
    pub fn update(&self) -> Vec<Request> {
        let mut recv = self.recv.lock();

        if recv.stream.is_none() {
            self.try_accept(&mut recv);
        }

        if recv.stream.is_some() && !self.drain(&mut recv) {
            self.disconnect(&mut recv);
        }

        let mut requests = Vec::new();
        while let Some(raw) = next_message(&mut recv.input) {
            if raw.application_id != APPLICATION_ID {
                log::warn!(
                    "frame with foreign application id {:#x}; discarding",
                    raw.application_id
                );
                continue;
            }
            match Request::parse(&raw) {
                Ok(request) => requests.push(request),
                Err(WireError::UnknownMessageType(code)) => {
                    log::warn!("unknown client message type {code:#x}; discarding");
                }
                Err(err) => {
                    log::warn!("client stream is corrupt ({err}); disconnecting");
                    self.disconnect(&mut recv);
                    break;
                }
            }
        }
        requests
    }

    fn try_accept(&self, recv: &mut RecvState) {
        let Some(listener) = &self.listener else {
            return;
        };
        match listener.accept() {
            Ok((stream, peer)) => {
                log::debug!("profiler client connected from {peer}");
                if stream.set_read_timeout(Some(RECV_TIMEOUT)).is_err() {
                    return;
                }
                let _ = stream.set_nodelay(true);
                *self.send.lock() = stream.try_clone().ok();
                recv.input = InputStream::new();
                recv.stream = Some(stream);
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(err) => log::debug!("accept failed: {err}"),
        }
    }

    /// Pull everything currently buffered on the socket. Returns false when
    /// the peer went away.
    fn drain(&self, recv: &mut RecvState) -> bool {
        let mut buffer = [0u8; 1024];
        loop {
            let Some(stream) = recv.stream.as_mut() else {
                return true;
            };
            match stream.read(&mut buffer) {
                Ok(0) => return false,
                Ok(count) => recv.input.append(&buffer[..count]),
                Err(err)
                    if err.kind() == std::io::ErrorKind::WouldBlock
                        || err.kind() == std::io::ErrorKind::TimedOut =>
                {
                    return true;
                }
                Err(err) => {
                    log::debug!("receive failed: {err}");
                    return false;
                }
            }
        }
    }

    fn disconnect(&self, recv: &mut RecvState) {
        log::debug!("profiler client disconnected");
        recv.stream = None;
        recv.input = InputStream::new();
        *self.send.lock() = None;
    }

    /// Frame and send one message. A socket error costs at most this
    /// message; the server goes back to listening.
    pub fn send(&self, ty: ResponseType, payload: &[u8]) {
        let mut send = self.send.lock();
        let Some(stream) = send.as_mut() else {
            return;
        };
        let bytes = write_response(ty, payload);
        if let Err(err) = stream.write_all(&bytes) {
            log::warn!("send failed ({err}); dropping the connection");
            *send = None;
        }
    }

    pub fn is_connected(&self) -> bool {
        self.send.lock().is_some()
    }
}
