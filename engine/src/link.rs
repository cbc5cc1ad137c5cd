//! Serialized access to the controller.
//!
//! The CAPI library is not reentrant, so every request and every message
//! fetch goes through one lock. Waiting for a message does not take it.

use capi_phone_common::MetricsContext;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use crate::controller::{Controller, Message, ReceiveError, Request, REGISTER_PARAMS};
use crate::error::CapiError;

/// Listen for every info element we log.
const LISTEN_INFO_MASK: u32 = 0x3FF;

/// Listen for every CIP value up to fax G3, plus the extended services.
const LISTEN_CIP_MASK: u32 = 0x1FFF_03FF;

pub(crate) struct Link<C> {
    // ---
    controller: C,
    lock: Mutex<()>,

    /// 0 while not registered.
    appl_id: AtomicU32,
    message_number: AtomicU16,
    metrics: MetricsContext,
}

impl<C: Controller> Link<C> {
    // ---
    pub fn new(controller: C, metrics: MetricsContext) -> Self {
        // ---
        Self {
            controller,
            lock: Mutex::new(()),
            appl_id: AtomicU32::new(0),
            message_number: AtomicU16::new(0),
            metrics,
        }
    }

    #[cfg(test)]
    pub fn controller(&self) -> &C {
        &self.controller
    }

    pub fn appl_id(&self) -> u32 {
        self.appl_id.load(Ordering::Acquire)
    }

    /// Next outbound message number (wraps).
    pub fn next_number(&self) -> u16 {
        self.message_number.fetch_add(1, Ordering::Relaxed)
    }

    /// Registers and listens on `listen` (0 = every controller).
    pub fn attach(&self, listen: u32) -> Result<u32, CapiError> {
        // ---
        let _guard = self.lock.lock();
        self.attach_locked(listen)
    }

    /// Drops the current registration and registers again.
    pub fn reattach(&self, listen: u32) -> Result<u32, CapiError> {
        // ---
        let _guard = self.lock.lock();
        self.release_locked();
        self.attach_locked(listen)
    }

    /// Releases the registration, if any.
    pub fn detach(&self) {
        // ---
        let _guard = self.lock.lock();
        self.release_locked();
    }

    fn attach_locked(&self, listen: u32) -> Result<u32, CapiError> {
        // ---
        if !self.controller.is_installed() {
            warn!("CAPI 2.0: not installed");
            return Err(CapiError::ControllerUnavailable);
        }

        let count = self.controller.controller_count();
        if count == 0 {
            warn!("CAPI 2.0: no ISDN controllers installed");
            return Err(CapiError::NoControllers);
        }
        debug!("CAPI 2.0: {} controller(s) found", count);

        let appl_id = match self.controller.register(&REGISTER_PARAMS) {
            Ok(0) => return Err(CapiError::RegistrationFailed(0)),
            Ok(appl_id) => appl_id,
            Err(info) => return Err(CapiError::RegistrationFailed(info)),
        };

        let controllers = if listen == 0 { 1..=count } else { listen..=listen };
        for controller in controllers {
            let request = Request::Listen {
                controller,
                info_mask: LISTEN_INFO_MASK,
                cip_mask: LISTEN_CIP_MASK,
            };
            let info = self.controller.send(appl_id, 0, &request);
            self.metrics.requests_sent_total.inc();

            if info != 0 {
                warn!("LISTEN_REQ on controller {} failed, info 0x{:04x}", controller, info);
                self.metrics.requests_failed_total.inc();
                self.controller.release(appl_id);
                return Err(CapiError::RegistrationFailed(info));
            }
            debug!("Listening on controller {}", controller);
        }

        self.appl_id.store(appl_id, Ordering::Release);
        info!("CAPI connection established (application {})", appl_id);
        Ok(appl_id)
    }

    fn release_locked(&self) {
        // ---
        let appl_id = self.appl_id.swap(0, Ordering::AcqRel);
        if appl_id == 0 {
            return;
        }

        let info = self.controller.release(appl_id);
        if info != 0 {
            warn!("CAPI release of application {} returned 0x{:04x}", appl_id, info);
        } else {
            debug!("Released CAPI application {}", appl_id);
        }
    }

    /// Blocks up to `timeout` for a message. Does not take the lock.
    pub fn wait(&self, timeout: Duration) -> bool {
        // ---
        match self.appl_id() {
            0 => false,
            appl_id => self.controller.wait_for_message(appl_id, timeout),
        }
    }

    /// Fetches and decodes the next message under the lock.
    pub fn fetch(&self) -> Result<Message, ReceiveError> {
        // ---
        let _guard = self.lock.lock();
        let message = self.controller.get_message(self.appl_id())?;
        self.metrics.messages_received_total.inc();
        Ok(message)
    }

    /// Sends `request`; a non-zero info code becomes [`CapiError::RequestFailed`].
    pub fn request(&self, request: Request) -> Result<(), CapiError> {
        // ---
        let info = {
            let _guard = self.lock.lock();
            let number = self.next_number();
            self.controller.send(self.appl_id(), number, &request)
        };
        self.metrics.requests_sent_total.inc();

        match &request {
            Request::Data { .. } | Request::DataResponse { .. } => {
                trace!("REQ: {} info 0x{:04x}", request.name(), info)
            }
            _ => debug!("REQ: {:?} -> info 0x{:04x}", request, info),
        }

        if info != 0 {
            self.metrics.requests_failed_total.inc();
            return Err(CapiError::RequestFailed {
                request: request.name(),
                info,
            });
        }
        Ok(())
    }
}
