//! Teleoperation loop.
//!
//! A single thread alternates between servicing HTTP connections and, once
//! per stream interval, pushing one labelled frame to the attached client.
//! Connections are read without blocking; a request whose head arrives in
//! pieces is parked and picked up again on later passes.

use crate::config::Config;
use crate::error::StartupError;
use crate::frame::FrameSource;
use crate::http::{poll_request, write_plain, write_response, Request};
use crate::motor::MotorDriver;
use crate::router::{parse_speed_arg, CommandRouter};
use crate::state::ActuationState;
use crate::stream::{write_stream_head, FrameLabeler, StreamPhase, TickOutcome};
use std::io::{self, ErrorKind};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

pub const CONTROL_PAGE: &str = include_str!("page.html");

/// How long a connection may take to deliver its request head.
pub const REQUEST_DEADLINE: Duration = Duration::from_secs(1);
/// Connections parked mid-request at once. The oldest is dropped beyond this.
const MAX_PENDING: usize = 8;
const IDLE_SLEEP: Duration = Duration::from_millis(1);

struct PendingRequest {
    stream: TcpStream,
    peer: SocketAddr,
    head: Vec<u8>,
    since: Instant,
}

pub struct TeleopServer<S, M> {
    listener: TcpListener,
    pending: Vec<PendingRequest>,
    state: ActuationState,
    router: CommandRouter<M>,
    labeler: FrameLabeler<TcpStream>,
    source: S,
    interval: Duration,
    write_timeout: Duration,
    last_tick: Option<Instant>,
}

impl<S: FrameSource, M: MotorDriver> TeleopServer<S, M> {
    pub fn bind(cfg: &Config, source: S, motor: M) -> Result<Self, StartupError> {
        let bind_err = |source| StartupError::Bind {
            addr: cfg.bind.clone(),
            source,
        };
        let listener = TcpListener::bind(&cfg.bind).map_err(bind_err)?;
        listener.set_nonblocking(true).map_err(bind_err)?;
        let state = ActuationState::new(cfg.default_speed);
        let router = CommandRouter::new(motor, &state);
        info!(addr = %cfg.bind, "teleop server listening");
        Ok(Self {
            listener,
            pending: Vec::with_capacity(MAX_PENDING),
            state,
            router,
            labeler: FrameLabeler::new(cfg.jpeg_quality),
            source,
            interval: Duration::from_millis(cfg.stream_interval_ms),
            write_timeout: Duration::from_millis(cfg.client_write_timeout_ms),
            last_tick: None,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn state(&self) -> &ActuationState {
        &self.state
    }

    pub fn motor(&self) -> &M {
        self.router.motor()
    }

    pub fn stream_phase(&self) -> StreamPhase {
        self.labeler.phase()
    }

    /// Accepts every waiting connection, then services all parked ones.
    /// Returns how many requests were answered.
    pub fn poll(&mut self) -> io::Result<usize> {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    trace!(%peer, "connection accepted");
                    if let Err(e) = stream.set_nonblocking(true) {
                        warn!(%peer, "connection dropped: {e}");
                        continue;
                    }
                    if self.pending.len() >= MAX_PENDING {
                        let oldest = self.pending.remove(0);
                        warn!(peer = %oldest.peer, "too many pending requests, dropping oldest");
                    }
                    self.pending.push(PendingRequest {
                        stream,
                        peer,
                        head: Vec::new(),
                        since: Instant::now(),
                    });
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(self.service_pending())
    }

    fn service_pending(&mut self) -> usize {
        let now = Instant::now();
        let mut handled = 0;
        let mut waiting = Vec::with_capacity(MAX_PENDING);
        for mut conn in std::mem::take(&mut self.pending) {
            match poll_request(&mut conn.stream, &mut conn.head) {
                Ok(Some(request)) => {
                    if let Err(e) = self.handle(conn.stream, &request) {
                        warn!(peer = %conn.peer, "request dropped: {e}");
                    }
                    handled += 1;
                }
                Ok(None) if now.duration_since(conn.since) < REQUEST_DEADLINE => waiting.push(conn),
                Ok(None) => debug!(peer = %conn.peer, "request head timed out"),
                Err(e) => debug!(peer = %conn.peer, "request dropped: {e}"),
            }
        }
        self.pending = waiting;
        handled
    }

    fn handle(&mut self, mut stream: TcpStream, request: &Request) -> io::Result<()> {
        stream.set_nonblocking(false)?;
        stream.set_write_timeout(Some(self.write_timeout))?;
        debug!(method = %request.method, path = %request.path, "request");
        if request.method != "GET" {
            return write_plain(&mut stream, 405, "method not allowed");
        }
        match request.path.as_str() {
            "/" => write_response(&mut stream, 200, "text/html", CONTROL_PAGE.as_bytes()),
            "/cmd" => {
                let token = request.arg("dir").unwrap_or_default();
                self.router.apply_direction(&mut self.state, &token);
                write_plain(&mut stream, 200, "OK")
            }
            "/speed" => {
                let value = request.arg("val").as_deref().map(parse_speed_arg).unwrap_or(0);
                self.router.apply_speed(&mut self.state, value);
                write_plain(&mut stream, 200, "OK")
            }
            "/stream" => self.attach(stream),
            _ => write_plain(&mut stream, 404, "not found"),
        }
    }

    fn attach(&mut self, mut stream: TcpStream) -> io::Result<()> {
        write_stream_head(&mut stream)?;
        self.labeler.attach(stream, &self.state);
        info!("stream client attached");
        // First frame goes out on the next poll.
        self.last_tick = None;
        Ok(())
    }

    /// Runs one stream period if it is due.
    pub fn tick(&mut self) -> Option<TickOutcome> {
        let now = Instant::now();
        if let Some(last) = self.last_tick {
            if now.duration_since(last) < self.interval {
                return None;
            }
        }
        self.last_tick = Some(now);
        Some(self.labeler.tick(&mut self.source, &self.state))
    }

    /// One pass of the loop: commands first, then the stream.
    pub fn run_once(&mut self) -> io::Result<Option<TickOutcome>> {
        self.poll()?;
        Ok(self.tick())
    }

    pub fn run(&mut self, shutdown: &AtomicBool) -> io::Result<()> {
        while !shutdown.load(Ordering::Relaxed) {
            if let Err(e) = self.run_once() {
                error!("listener failed: {e}");
                return Err(e);
            }
            std::thread::sleep(IDLE_SLEEP);
        }
        info!("teleop loop stopped");
        Ok(())
    }
}
