//! RPC responder.
//!
//! Keeps a connection to the control daemon open, answers every
//! `video_stream_request` the way the vendor camera process does and drives
//! the capture pipeline from `startLanCapture` / `stopLanCapture`.

use log::{debug, info, trace, warn};
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::config::RpcConfig;
use crate::display::CapturePipeline;
use crate::error::{Error, Result};
use crate::protocol::{self, methods, FrameReader, Inbound, StreamRequest};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const READ_CHUNK: usize = 4096;

/// What the responder needs from the capture side.
pub trait StreamControl: Send + Sync {
    fn start_stream(&self, fps: u32) -> Result<()>;
    fn stop_stream(&self);
    fn is_streaming(&self) -> bool;
}

impl StreamControl for CapturePipeline {
    fn start_stream(&self, fps: u32) -> Result<()> {
        self.start(fps)
    }

    fn stop_stream(&self) {
        self.stop()
    }

    fn is_streaming(&self) -> bool {
        self.is_running()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Stopped,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct RpcStatus {
    pub state: ConnectionState,
    pub connect_attempts: u64,
    pub sessions: u64,
    pub requests_handled: u64,
    pub last_error: Option<String>,
    /// A capture pipeline is attached.
    pub stream_available: bool,
    pub streaming: bool,
}

struct Shared {
    config: RpcConfig,
    stream: Option<Arc<dyn StreamControl>>,
    running: AtomicBool,
    state: Mutex<ConnectionState>,
    // Clone of the live session socket so `stop()` can unblock the reader.
    socket: Mutex<Option<TcpStream>>,
    connect_attempts: AtomicU64,
    sessions: AtomicU64,
    requests: AtomicU64,
    last_error: Mutex<Option<String>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Shared {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn set_state(&self, state: ConnectionState) {
        *lock(&self.state) = state;
    }

    fn record_error(&self, message: String) {
        *lock(&self.last_error) = Some(message);
    }
}

pub struct RpcEngine {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl RpcEngine {
    pub fn new(config: RpcConfig, stream: Option<Arc<dyn StreamControl>>) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                stream,
                running: AtomicBool::new(false),
                state: Mutex::new(ConnectionState::Disconnected),
                socket: Mutex::new(None),
                connect_attempts: AtomicU64::new(0),
                sessions: AtomicU64::new(0),
                requests: AtomicU64::new(0),
                last_error: Mutex::new(None),
            }),
            thread: Mutex::new(None),
        }
    }

    /// Spawn the connection thread. Does not wait for the daemon.
    pub fn start(&self) -> Result<()> {
        let mut thread = lock(&self.thread);
        if thread.is_some() {
            return Err(Error::AlreadyRunning("rpc engine"));
        }

        self.shared.running.store(true, Ordering::Release);
        self.shared.set_state(ConnectionState::Disconnected);

        let shared = self.shared.clone();
        let handle = std::thread::Builder::new()
            .name("rpc".to_string())
            .spawn(move || connection_loop(shared));

        match handle {
            Ok(handle) => {
                *thread = Some(handle);
                info!("rpc engine started ({})", self.shared.config.addr);
                Ok(())
            }
            Err(e) => {
                self.shared.running.store(false, Ordering::Release);
                Err(Error::Io(e))
            }
        }
    }

    /// Stop the connection thread and wait for it.
    pub fn stop(&self) {
        let mut thread = lock(&self.thread);
        self.shared.running.store(false, Ordering::Release);

        if let Some(socket) = lock(&self.shared.socket).as_ref() {
            let _ = socket.shutdown(Shutdown::Both);
        }

        if let Some(handle) = thread.take() {
            if handle.join().is_err() {
                warn!("rpc thread panicked");
            }
            info!("rpc engine stopped");
        }
        self.shared.set_state(ConnectionState::Stopped);
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.shared.state)
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    pub fn status(&self) -> RpcStatus {
        let shared = &self.shared;
        RpcStatus {
            state: self.state(),
            connect_attempts: shared.connect_attempts.load(Ordering::Relaxed),
            sessions: shared.sessions.load(Ordering::Relaxed),
            requests_handled: shared.requests.load(Ordering::Relaxed),
            last_error: lock(&shared.last_error).clone(),
            stream_available: shared.stream.is_some(),
            streaming: shared.stream.as_ref().map_or(false, |s| s.is_streaming()),
        }
    }
}

impl Drop for RpcEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

fn connection_loop(shared: Arc<Shared>) {
    while shared.is_running() {
        shared.set_state(ConnectionState::Connecting);
        shared.connect_attempts.fetch_add(1, Ordering::Relaxed);

        match connect(&shared.config) {
            Ok(stream) => {
                shared.sessions.fetch_add(1, Ordering::Relaxed);
                shared.set_state(ConnectionState::Connected);
                info!("connected to {}", shared.config.addr);

                if let Ok(clone) = stream.try_clone() {
                    *lock(&shared.socket) = Some(clone);
                }
                let result = serve(&shared, stream);
                *lock(&shared.socket) = None;

                match result {
                    Ok(()) => debug!("session closed"),
                    Err(e) => {
                        warn!("session ended: {}", e);
                        shared.record_error(e.to_string());
                    }
                }
            }
            Err(e) => {
                debug!("connect to {} failed: {}", shared.config.addr, e);
                shared.record_error(e.to_string());
            }
        }

        shared.set_state(ConnectionState::Disconnected);
        if !shared.is_running() {
            break;
        }
        backoff(&shared);
    }

    shared.set_state(ConnectionState::Stopped);
}

fn connect(config: &RpcConfig) -> Result<TcpStream> {
    let stream = TcpStream::connect_timeout(&config.addr, CONNECT_TIMEOUT)
        .map_err(|e| Error::Connection(format!("connect {}: {}", config.addr, e)))?;
    stream.set_read_timeout(Some(config.poll_interval))?;
    stream.set_write_timeout(Some(config.idle_timeout))?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Sleep out the reconnect backoff while watching the running flag.
fn backoff(shared: &Shared) {
    let deadline = Instant::now() + shared.config.reconnect_backoff;
    let slice = shared.config.poll_interval.max(Duration::from_millis(10));
    while shared.is_running() {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        std::thread::sleep(slice.min(deadline - now));
    }
}

/// Run one session until the peer goes away, the link idles out or the
/// engine is stopped (`Ok`).
fn serve(shared: &Shared, mut stream: TcpStream) -> Result<()> {
    let mut reader = FrameReader::new();
    let mut chunk = [0u8; READ_CHUNK];
    let mut last_rx = Instant::now();

    while shared.is_running() {
        match stream.read(&mut chunk) {
            Ok(0) => {
                if !shared.is_running() {
                    break;
                }
                return Err(Error::Connection("closed by peer".to_string()));
            }
            Ok(n) => {
                last_rx = Instant::now();
                for payload in reader.push(&chunk[..n])? {
                    handle_payload(shared, &mut stream, &payload)?;
                }
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                if last_rx.elapsed() >= shared.config.idle_timeout {
                    return Err(Error::Connection(format!(
                        "no data for {:?}",
                        shared.config.idle_timeout
                    )));
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => {
                if !shared.is_running() {
                    break;
                }
                return Err(Error::Connection(format!("read: {}", e)));
            }
        }
    }
    Ok(())
}

fn handle_payload(shared: &Shared, stream: &mut TcpStream, payload: &[u8]) -> Result<()> {
    let request = match protocol::parse_message(payload)? {
        Inbound::StreamRequest(request) => request,
        Inbound::Ignored => {
            trace!("ignoring {} byte message", payload.len());
            return Ok(());
        }
    };

    debug!("video_stream_request {} (id {})", request.method, request.id);

    if !is_known_method(&request.method) {
        debug!("ignoring unhandled method {}", request.method);
        return Ok(());
    }

    let reply = protocol::video_reply(&request)?;
    stream
        .write_all(&reply)
        .and_then(|_| stream.flush())
        .map_err(|e| Error::Connection(format!("send reply: {}", e)))?;
    shared.requests.fetch_add(1, Ordering::Relaxed);

    dispatch(shared, &request);
    Ok(())
}

fn is_known_method(method: &str) -> bool {
    matches!(
        method,
        methods::START_LAN_CAPTURE
            | methods::STOP_LAN_CAPTURE
            | methods::OPEN_DELAY_CAMERA
            | methods::SET_LED
    )
}

/// Act on a request that has already been acknowledged.
fn dispatch(shared: &Shared, request: &StreamRequest) {
    match request.method.as_str() {
        methods::START_LAN_CAPTURE => {
            let Some(stream) = shared.stream.as_ref() else {
                warn!("startLanCapture: no display pipeline, stream unavailable");
                shared.record_error("stream unavailable: no display pipeline".to_string());
                return;
            };
            if let Err(e) = stream.start_stream(shared.config.stream_fps) {
                warn!("failed to start display stream: {}", e);
                shared.record_error(format!("stream start failed: {}", e));
            }
        }
        methods::STOP_LAN_CAPTURE => {
            if let Some(stream) = shared.stream.as_ref() {
                stream.stop_stream();
            }
        }
        _ => debug!("{} acknowledged", request.method),
    }
}
