//! The engine handle owned by the host.
//!
//! A [`Session`] registers with the controller, runs the dispatch thread
//! and exposes call control. Failures of an API call are returned to the
//! caller; failures that happen later, on the dispatch thread, reach the
//! host through [`Handlers::status`].
//!
//! Lock order is connection table, then controller link, then a call's
//! recorder. Host event callbacks never run with the table locked.

use capi_phone_common::MetricsContext;
use chrono::Local;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::config::SessionConfig;
use crate::connection::{CallId, CallInfo, ConnectionTable, Direction, State};
use crate::controller::{Controller, ReceiveError, Request};
use crate::error::CapiError;
use crate::handlers::{Handlers, Outbox};
use crate::link::Link;
use crate::params::{self, BProtocol, ACCEPT, SELECTOR_DTMF, SELECTOR_SUPPLEMENTARY};
use crate::transfer::{Media, Service};

/// Granularity of the interruptible sleeps.
const POLL_STEP: Duration = Duration::from_millis(10);

/// State shared between the host-facing handle and the dispatch thread.
pub(crate) struct Shared<C, H: Handlers> {
    // ---
    pub link: Arc<Link<C>>,
    pub handlers: Arc<H>,
    pub table: Mutex<ConnectionTable<H::Audio>>,
    pub config: SessionConfig,
    pub metrics: MetricsContext,

    /// Ends the dispatch loop.
    pub stop: AtomicBool,

    /// Set when shutdown begins; API calls fail from then on.
    pub closed: AtomicBool,
}

impl<C: Controller, H: Handlers> Shared<C, H> {
    // ---
    pub fn new(controller: C, handlers: H, config: SessionConfig, metrics: MetricsContext) -> Self {
        // ---
        Self {
            link: Arc::new(Link::new(controller, metrics.clone())),
            handlers: Arc::new(handlers),
            table: Mutex::new(ConnectionTable::new(config.max_connections)),
            config,
            metrics,
            stop: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    fn dispatch_loop(&self) {
        // ---
        info!("Dispatch thread started");
        let mut failures = 0;

        while !self.stop.load(Ordering::Acquire) {
            if !self.link.wait(self.config.wait_timeout()) {
                continue;
            }

            match self.link.fetch() {
                Ok(message) => {
                    failures = 0;
                    self.handle_message(message);
                }
                Err(ReceiveError::QueueEmpty) => {
                    if !self.reconnect(&mut failures) {
                        break;
                    }
                }
                Err(e) => {
                    error!("CAPI {}, stopping dispatch", e);
                    break;
                }
            }
        }

        info!("Dispatch thread stopped");
    }

    /// Re-registers with exponential backoff; `false` once retries are
    /// exhausted or the session is stopping.
    fn reconnect(&self, failures: &mut u32) -> bool {
        // ---
        let policy = &self.config.reconnect;

        loop {
            if *failures >= policy.max_retries {
                error!("Giving up after {} re-registration attempts", failures);
                return false;
            }

            let delay = policy.backoff(*failures);
            *failures += 1;
            warn!(
                "CAPI receive queue empty, re-registering in {:?} (attempt {}/{})",
                delay, failures, policy.max_retries
            );

            if !self.sleep_unless_stopped(delay) {
                return false;
            }

            match self.link.reattach(self.config.controller) {
                Ok(appl_id) => {
                    self.metrics.reconnects_total.inc();
                    info!("Re-registered as application {}", appl_id);
                    return true;
                }
                Err(e) => warn!("Re-registration failed: {}", e),
            }
        }
    }

    fn sleep_unless_stopped(&self, duration: Duration) -> bool {
        // ---
        let deadline = Instant::now() + duration;
        loop {
            if self.stop.load(Ordering::Acquire) {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep(POLL_STEP.min(deadline - now));
        }
    }
}

/// A registered CAPI application with its dispatch thread.
pub struct Session<C: Controller, H: Handlers> {
    // ---
    shared: Arc<Shared<C, H>>,
    dispatch: Option<JoinHandle<()>>,
}

impl<C: Controller, H: Handlers> Session<C, H> {
    // ---
    /// Registers with the controller and starts the dispatch thread.
    ///
    /// `host` names a remote CAPI server for network-attached controllers.
    pub fn init(
        controller: C,
        handlers: H,
        host: Option<&str>,
        config: SessionConfig,
    ) -> Result<Self, CapiError> {
        // ---
        config.validate().map_err(CapiError::Config)?;
        media::init_tables();

        if let Some(host) = host {
            debug!("Using remote CAPI host {}", host);
            controller.set_remote_host(host);
        }

        let metrics = MetricsContext::new("capi-engine").map_err(CapiError::Metrics)?;
        let shared = Arc::new(Shared::new(controller, handlers, config, metrics));
        shared.link.attach(shared.config.controller)?;

        let worker = Arc::clone(&shared);
        let spawned = thread::Builder::new()
            .name("capi".into())
            .spawn(move || worker.dispatch_loop());

        match spawned {
            Ok(handle) => {
                info!(
                    "CAPI session started ({} connection slots)",
                    shared.config.max_connections
                );
                Ok(Self {
                    shared,
                    dispatch: Some(handle),
                })
            }
            Err(e) => {
                shared.link.detach();
                Err(CapiError::Thread("capi", e))
            }
        }
    }

    /// Hangs up every call, stops the dispatch thread and releases the
    /// registration. Calling it again does nothing.
    pub fn shutdown(&mut self) {
        // ---
        let Some(dispatch) = self.dispatch.take() else {
            return;
        };
        info!("Shutting down CAPI session");
        self.shared.closed.store(true, Ordering::Release);

        let mut out = Outbox::new();
        {
            let mut table = self.shared.table.lock();
            for id in table.ids() {
                self.shared.hangup_locked(&mut table, &mut out, id);
            }
        }
        out.deliver(&*self.shared.handlers);

        // Let the dispatch thread process the remote disconnects
        let deadline = Instant::now() + self.shared.config.shutdown_grace();
        while !self.shared.table.lock().is_empty()
            && !dispatch.is_finished()
            && Instant::now() < deadline
        {
            thread::sleep(POLL_STEP);
        }

        self.shared.stop.store(true, Ordering::Release);
        if dispatch.join().is_err() {
            warn!("Dispatch thread panicked");
        }

        let mut out = Outbox::new();
        {
            let mut table = self.shared.table.lock();
            for id in table.ids() {
                debug!("Discarding call {} still open at shutdown", id);
                self.shared.discard(&mut table, &mut out, id);
            }
            self.shared.metrics.active_connections.set(0);
        }
        out.deliver(&*self.shared.handlers);

        self.shared.link.detach();
        info!("CAPI session closed");
    }

    /// Whether the dispatch thread is still running.
    pub fn is_running(&self) -> bool {
        self.dispatch.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    pub fn metrics(&self) -> &MetricsContext {
        &self.shared.metrics
    }

    /// Starts an outbound call from `source` to `target`.
    pub fn dial(
        &self,
        controller: u32,
        source: &str,
        target: &str,
        anonymous: bool,
        service: Service,
    ) -> Result<CallId, CapiError> {
        // ---
        if source.is_empty() {
            return Err(CapiError::InvalidNumber(source.to_string()));
        }
        if target.is_empty() {
            return Err(CapiError::InvalidNumber(target.to_string()));
        }

        let cip = service.cip();
        let connect = params::connect_params(source, target, anonymous, cip);

        self.locked(|t, _| {
            let id = t.allocate(Direction::Outbound)?;
            let conn = t.get_mut(id).ok_or(CapiError::UnknownCall(id))?;
            conn.source = source.to_string();
            conn.target = target.to_string();
            conn.media = Media::from_service(service);
            conn.state = State::ConnectReq;

            let request = Request::Connect {
                controller,
                cip,
                params: connect,
            };
            if let Err(e) = self.shared.link.request(request) {
                t.release(id);
                return Err(e);
            }

            self.shared.metrics.calls_dialed_total.inc();
            info!("Dialing {} -> {} (call {}, CIP {})", source, target, id, cip);
            Ok(id)
        })
    }

    /// Accepts a ringing inbound call.
    pub fn pickup(&self, id: CallId, service: Service) -> Result<(), CapiError> {
        // ---
        self.locked(|t, _| {
            let conn = t.get_mut(id).ok_or(CapiError::UnknownCall(id))?;
            if conn.state != State::Ringing {
                return Err(CapiError::InvalidState {
                    operation: "pick up",
                    state: conn.state,
                });
            }

            self.shared.link.request(Request::ConnectResponse {
                plci: conn.plci,
                reject: ACCEPT,
                protocol: BProtocol::TRANSPARENT,
            })?;

            conn.media = Media::from_service(service);
            conn.state = State::IncomingWait;
            self.shared.metrics.calls_accepted_total.inc();
            info!("Picked up call {} from {}", id, conn.source);
            Ok(())
        })
    }

    /// Hangs up `id` in whatever state it is in.
    pub fn hangup(&self, id: CallId) -> Result<(), CapiError> {
        // ---
        self.locked(|t, out| {
            if t.get(id).is_none() {
                return Err(CapiError::UnknownCall(id));
            }
            self.shared.hangup_locked(t, out, id);
            Ok(())
        })
    }

    /// Mutes or unmutes the local party of a voice call.
    pub fn mute(&self, id: CallId, mute: bool) -> Result<(), CapiError> {
        // ---
        self.locked(|t, _| {
            let conn = t.get(id).ok_or(CapiError::UnknownCall(id))?;
            let line = conn.media.line().ok_or(CapiError::InvalidState {
                operation: "mute",
                state: conn.state,
            })?;
            line.set_muted(mute);
            debug!("Call {} {}", id, if mute { "muted" } else { "unmuted" });
            Ok(())
        })
    }

    /// Puts a connected call on hold, or retrieves a held one.
    pub fn hold(&self, id: CallId, hold: bool) -> Result<(), CapiError> {
        // ---
        self.locked(|t, _| {
            let conn = t.get(id).ok_or(CapiError::UnknownCall(id))?;

            let address = match (hold, conn.state) {
                (true, State::Connected) => conn.ncci,
                (false, _) if conn.on_hold => conn.plci,
                (operation, state) => {
                    return Err(CapiError::InvalidState {
                        operation: if operation { "hold" } else { "retrieve" },
                        state,
                    })
                }
            };

            self.shared.link.request(Request::Facility {
                address,
                selector: SELECTOR_SUPPLEMENTARY,
                params: params::hold_params(hold),
            })
        })
    }

    /// Sends one DTMF digit on the bearer leg.
    pub fn send_dtmf(&self, id: CallId, digit: char) -> Result<(), CapiError> {
        // ---
        let code = u8::try_from(digit)
            .ok()
            .filter(|b| params::dtmf_digit(*b).is_some())
            .ok_or(CapiError::InvalidDigit(digit))?;

        self.locked(|t, _| {
            let conn = t.get(id).ok_or(CapiError::UnknownCall(id))?;
            if conn.ncci == 0 {
                return Err(CapiError::InvalidState {
                    operation: "send DTMF",
                    state: conn.state,
                });
            }

            self.shared.link.request(Request::Facility {
                address: conn.ncci,
                selector: SELECTOR_DTMF,
                params: params::dtmf_send_params(code),
            })
        })
    }

    /// Starts or stops recording a voice call into `dir`.
    ///
    /// Returns the path of the recording when one was started.
    pub fn record(
        &self,
        id: CallId,
        enable: bool,
        dir: impl AsRef<Path>,
    ) -> Result<Option<PathBuf>, CapiError> {
        // ---
        self.locked(|t, _| {
            let conn = t.get(id).ok_or(CapiError::UnknownCall(id))?;
            let line = conn.media.line().ok_or(CapiError::InvalidState {
                operation: "record",
                state: conn.state,
            })?;

            if !enable {
                if let Some(frames) = line.stop_recording()? {
                    debug!("Call {}: recording stopped after {} frames", id, frames);
                }
                return Ok(None);
            }

            let started = conn.connect_time.unwrap_or_else(Local::now);
            let name = format!(
                "{}-{}-{}.wav",
                started.format("%d.%m.%Y-%H-%M"),
                conn.source,
                conn.target
            );
            let path = dir.as_ref().join(name);

            line.start_recording(&path)?;
            Ok(Some(path))
        })
    }

    /// Writes buffered recording data that both parties have caught up on.
    pub fn flush(&self, id: CallId) -> Result<usize, CapiError> {
        // ---
        self.locked(|t, _| {
            let conn = t.get(id).ok_or(CapiError::UnknownCall(id))?;
            let frames = match conn.media.line() {
                Some(line) => line.flush_recording(false)?,
                None => 0,
            };
            self.shared
                .metrics
                .recorder_frames_flushed_total
                .inc_by(frames as u64);
            Ok(frames)
        })
    }

    /// Smoothed `(incoming, outgoing)` levels, 0.0..=1.0.
    pub fn line_levels(&self, id: CallId) -> Result<(f64, f64), CapiError> {
        // ---
        self.locked(|t, _| {
            let conn = t.get(id).ok_or(CapiError::UnknownCall(id))?;
            Ok(conn
                .media
                .line()
                .map_or((0.0, 0.0), |line| (line.level_in(), line.level_out())))
        })
    }

    pub fn call_info(&self, id: CallId) -> Option<CallInfo> {
        self.shared.table.lock().get(id).map(|c| c.info())
    }

    /// Snapshots of every live call, oldest first.
    pub fn calls(&self) -> Vec<CallInfo> {
        // ---
        let mut calls: Vec<CallInfo> = self.shared.table.lock().iter().map(|c| c.info()).collect();
        calls.sort_by_key(|c| c.id.serial());
        calls
    }

    /// Runs `f` with the table locked, then delivers the collected callbacks.
    fn locked<T>(
        &self,
        f: impl FnOnce(
            &mut ConnectionTable<H::Audio>,
            &mut Outbox<H::Audio>,
        ) -> Result<T, CapiError>,
    ) -> Result<T, CapiError> {
        // ---
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(CapiError::SessionClosed);
        }

        let mut out = Outbox::new();
        let result = {
            let mut table = self.shared.table.lock();
            let result = f(&mut table, &mut out);
            self.shared.metrics.active_connections.set(table.len() as i64);
            result
        };

        out.deliver(&*self.shared.handlers);
        result
    }
}

impl<C: Controller, H: Handlers> Drop for Session<C, H> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
