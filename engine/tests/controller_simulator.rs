//! Scripted CAPI controller and recording host for integration testing.
//!
//! The test pushes the messages the controller would deliver and inspects
//! the requests the engine sent. Failures can be injected per request name,
//! on registration and on the receive path.

#![allow(dead_code)]

use engine::{
    CallId, CallInfo, CapiError, Confirmation, Controller, Handlers, Indication, Message,
    ReceiveError, RegisterParams, Request, Session, SessionConfig,
};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// How long scenario steps wait for the dispatch thread.
pub const STEP_TIMEOUT: Duration = Duration::from_secs(2);

/// Controller behaviour at registration time.
#[derive(Debug, Clone)]
pub struct SimControllerConfig {
    // ---
    pub installed: bool,
    pub controllers: u32,

    /// Info code returned by registration; 0 registers successfully.
    pub register_info: u16,
}

impl Default for SimControllerConfig {
    fn default() -> Self {
        // ---
        Self {
            installed: true,
            controllers: 1,
            register_info: 0,
        }
    }
}

#[derive(Default)]
struct SimState {
    // ---
    queue: Mutex<VecDeque<Message>>,
    ready: Condvar,
    sent: Mutex<Vec<Request>>,
    failing: Mutex<HashMap<&'static str, u16>>,
    register_info: Mutex<u16>,
    receive_failure: Mutex<Option<ReceiveError>>,
    spurious_empty: AtomicU32,
    registrations: AtomicU32,
    releases: AtomicU32,
    remote_host: Mutex<Option<String>>,
}

/// In-memory controller; clones share state.
#[derive(Clone)]
pub struct SimController {
    // ---
    config: SimControllerConfig,
    state: Arc<SimState>,
}

impl SimController {
    // ---
    pub fn new(config: SimControllerConfig) -> Self {
        // ---
        let state = SimState::default();
        *state.register_info.lock() = config.register_info;
        Self {
            config,
            state: Arc::new(state),
        }
    }

    /// Queues a message for the dispatch thread.
    pub fn push(&self, message: Message) {
        // ---
        self.state.queue.lock().push_back(message);
        self.state.ready.notify_all();
    }

    pub fn indicate(&self, indication: Indication) {
        self.push(Message::Indication(indication));
    }

    pub fn confirm(&self, confirmation: Confirmation) {
        self.push(Message::Confirmation(confirmation));
    }

    /// Makes every request named `request` return `info`.
    pub fn fail(&self, request: &'static str, info: u16) {
        self.state.failing.lock().insert(request, info);
    }

    pub fn set_register_info(&self, info: u16) {
        *self.state.register_info.lock() = info;
    }

    /// The next `count` fetches report an empty queue.
    pub fn inject_queue_empty(&self, count: u32) {
        // ---
        self.state.spurious_empty.store(count, Ordering::SeqCst);
        self.state.ready.notify_all();
    }

    /// The next fetch fails with `error`.
    pub fn inject_receive_failure(&self, error: ReceiveError) {
        // ---
        *self.state.receive_failure.lock() = Some(error);
        self.state.ready.notify_all();
    }

    pub fn sent(&self) -> Vec<Request> {
        self.state.sent.lock().clone()
    }

    pub fn count_sent(&self, pred: impl Fn(&Request) -> bool) -> usize {
        self.state.sent.lock().iter().filter(|r| pred(r)).count()
    }

    /// Waits until a request matching `pred` was sent.
    pub fn wait_for_request(&self, pred: impl Fn(&Request) -> bool) -> Option<Request> {
        // ---
        let mut found = None;
        eventually(|| {
            found = self.state.sent.lock().iter().find(|r| pred(r)).cloned();
            found.is_some()
        });
        found
    }

    pub fn registrations(&self) -> u32 {
        self.state.registrations.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> u32 {
        self.state.releases.load(Ordering::SeqCst)
    }

    pub fn remote_host(&self) -> Option<String> {
        self.state.remote_host.lock().clone()
    }

    fn has_pending(&self) -> bool {
        // ---
        self.state.spurious_empty.load(Ordering::SeqCst) > 0
            || self.state.receive_failure.lock().is_some()
            || !self.state.queue.lock().is_empty()
    }
}

impl Controller for SimController {
    // ---
    fn is_installed(&self) -> bool {
        self.config.installed
    }

    fn controller_count(&self) -> u32 {
        self.config.controllers
    }

    fn set_remote_host(&self, host: &str) {
        *self.state.remote_host.lock() = Some(host.to_string());
    }

    fn register(&self, _params: &RegisterParams) -> Result<u32, u16> {
        // ---
        let attempt = self.state.registrations.fetch_add(1, Ordering::SeqCst) + 1;
        match *self.state.register_info.lock() {
            0 => Ok(attempt),
            info => Err(info),
        }
    }

    fn release(&self, _appl_id: u32) -> u16 {
        self.state.releases.fetch_add(1, Ordering::SeqCst);
        0
    }

    fn wait_for_message(&self, _appl_id: u32, timeout: Duration) -> bool {
        // ---
        let deadline = Instant::now() + timeout;
        let mut queue = self.state.queue.lock();

        loop {
            let signalled = !queue.is_empty()
                || self.state.spurious_empty.load(Ordering::SeqCst) > 0
                || self.state.receive_failure.lock().is_some();
            if signalled {
                return true;
            }
            if self.state.ready.wait_until(&mut queue, deadline).timed_out() {
                return false;
            }
        }
    }

    fn get_message(&self, _appl_id: u32) -> Result<Message, ReceiveError> {
        // ---
        if let Some(error) = self.state.receive_failure.lock().take() {
            return Err(error);
        }

        let spurious = self.state.spurious_empty.load(Ordering::SeqCst);
        if spurious > 0 {
            self.state.spurious_empty.store(spurious - 1, Ordering::SeqCst);
            return Err(ReceiveError::QueueEmpty);
        }

        self.state
            .queue
            .lock()
            .pop_front()
            .ok_or(ReceiveError::QueueEmpty)
    }

    fn send(&self, _appl_id: u32, _number: u16, request: &Request) -> u16 {
        // ---
        self.state.sent.lock().push(request.clone());
        self.state
            .failing
            .lock()
            .get(request.name())
            .copied()
            .unwrap_or(0)
    }
}

/// Host-side audio device: scripted microphone, captured speaker.
#[derive(Default)]
pub struct SimDevice {
    input: Mutex<VecDeque<u8>>,
    output: Mutex<Vec<u8>>,
}

impl SimDevice {
    // ---
    pub fn speak(&self, pcm: &[u8]) {
        self.input.lock().extend(pcm.iter().copied());
    }

    pub fn played(&self) -> Vec<u8> {
        self.output.lock().clone()
    }
}

/// Callback observed by the host.
#[derive(Debug, Clone, PartialEq)]
pub enum HostEvent {
    Connected(CallInfo),
    Disconnected(CallInfo),
    Ring(CallInfo),
    Code(CallId, char),
    Status(Option<CallId>, String),
}

#[derive(Default)]
struct HostState {
    // ---
    events: Mutex<Vec<HostEvent>>,
    device: Arc<SimDevice>,
    no_audio: bool,
    opened: AtomicU32,
    closed: AtomicU32,
}

/// Handler set recording every callback.
#[derive(Clone, Default)]
pub struct SimHost {
    state: Arc<HostState>,
}

impl SimHost {
    // ---
    pub fn new() -> Self {
        Self::default()
    }

    /// Host whose audio device cannot be opened.
    pub fn without_audio() -> Self {
        // ---
        Self {
            state: Arc::new(HostState {
                no_audio: true,
                ..HostState::default()
            }),
        }
    }

    pub fn device(&self) -> &Arc<SimDevice> {
        &self.state.device
    }

    pub fn events(&self) -> Vec<HostEvent> {
        self.state.events.lock().clone()
    }

    pub fn count(&self, pred: impl Fn(&HostEvent) -> bool) -> usize {
        self.state.events.lock().iter().filter(|e| pred(e)).count()
    }

    pub fn connected(&self) -> usize {
        self.count(|e| matches!(e, HostEvent::Connected(_)))
    }

    pub fn disconnected(&self) -> usize {
        self.count(|e| matches!(e, HostEvent::Disconnected(_)))
    }

    pub fn statuses(&self) -> Vec<String> {
        // ---
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                HostEvent::Status(_, message) => Some(message),
                _ => None,
            })
            .collect()
    }

    /// Waits for an event matching `pred`.
    pub fn wait_for(&self, pred: impl Fn(&HostEvent) -> bool) -> Option<HostEvent> {
        // ---
        let mut found = None;
        eventually(|| {
            found = self.state.events.lock().iter().find(|e| pred(e)).cloned();
            found.is_some()
        });
        found
    }

    pub fn audio_opened(&self) -> u32 {
        self.state.opened.load(Ordering::SeqCst)
    }

    pub fn audio_closed(&self) -> u32 {
        self.state.closed.load(Ordering::SeqCst)
    }

    fn record(&self, event: HostEvent) {
        self.state.events.lock().push(event);
    }
}

impl Handlers for SimHost {
    // ---
    type Audio = Arc<SimDevice>;

    fn audio_open(&self) -> Option<Self::Audio> {
        // ---
        if self.state.no_audio {
            return None;
        }
        self.state.opened.fetch_add(1, Ordering::SeqCst);
        Some(Arc::clone(&self.state.device))
    }

    fn audio_input(&self, audio: &Self::Audio, buf: &mut [u8]) -> usize {
        // ---
        let mut input = audio.input.lock();
        let len = buf.len().min(input.len());
        for (slot, byte) in buf.iter_mut().zip(input.drain(..len)) {
            *slot = byte;
        }
        len
    }

    fn audio_output(&self, audio: &Self::Audio, buf: &[u8]) -> usize {
        audio.output.lock().extend_from_slice(buf);
        buf.len()
    }

    fn audio_close(&self, _audio: &Self::Audio) -> bool {
        self.state.closed.fetch_add(1, Ordering::SeqCst);
        true
    }

    fn connected(&self, call: &CallInfo) {
        self.record(HostEvent::Connected(call.clone()));
    }

    fn disconnected(&self, call: &CallInfo) {
        self.record(HostEvent::Disconnected(call.clone()));
    }

    fn ring(&self, call: &CallInfo) {
        self.record(HostEvent::Ring(call.clone()));
    }

    fn code(&self, call: &CallInfo, code: char) {
        self.record(HostEvent::Code(call.id, code));
    }

    fn status(&self, call: Option<&CallInfo>, error: &CapiError) {
        self.record(HostEvent::Status(call.map(|c| c.id), error.to_string()));
    }
}

/// Short timeouts so scenarios and shutdown run fast.
pub fn test_config() -> SessionConfig {
    // ---
    let mut config = SessionConfig {
        wait_timeout_ms: 10,
        audio_stop_timeout_ms: 200,
        record_flush_interval_ms: 50,
        shutdown_grace_ms: 100,
        ..SessionConfig::default()
    };
    config.reconnect.initial_backoff_ms = 1;
    config.reconnect.max_backoff_ms = 5;
    config
}

pub type SimSession = Session<SimController, SimHost>;

/// Starts a session on a default simulator.
pub fn start() -> (SimController, SimHost, SimSession) {
    start_with(SimControllerConfig::default(), SimHost::new(), test_config())
}

pub fn start_with(
    controller: SimControllerConfig,
    host: SimHost,
    config: SessionConfig,
) -> (SimController, SimHost, SimSession) {
    // ---
    let sim = SimController::new(controller);
    let session = Session::init(sim.clone(), host.clone(), None, config).expect("session init");
    (sim, host, session)
}

/// Polls `cond` until it holds or [`STEP_TIMEOUT`] passes.
pub fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    // ---
    let deadline = Instant::now() + STEP_TIMEOUT;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(2));
    }
}

/// Calling party number element as the network delivers it.
pub fn calling_number(digits: &str) -> Vec<u8> {
    // ---
    let mut ie = vec![digits.len() as u8 + 2, 0x01, 0x80];
    ie.extend_from_slice(digits.as_bytes());
    ie
}

/// Called party number element.
pub fn called_number(digits: &str) -> Vec<u8> {
    // ---
    let mut ie = vec![digits.len() as u8 + 1, 0x81];
    ie.extend_from_slice(digits.as_bytes());
    ie
}
