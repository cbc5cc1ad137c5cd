//! Protocol state machine: indications, confirmations and hangup.
//!
//! Every handler runs on the dispatch thread with the connection table
//! locked. Requests go out immediately through the link; host callbacks are
//! collected in an [`Outbox`] and delivered once the table is unlocked.

use chrono::Local;
use std::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::connection::{CallId, Connection, ConnectionTable, Direction, State};
use crate::controller::{plci_of, Confirmation, Controller, Indication, Message, Request};
use crate::error::CapiError;
use crate::handlers::{Deferred, Handlers, Outbox};
use crate::params::{
    self, BProtocol, ACCEPTED_CIPS, INFO_CALL_STATE, INFO_CAUSE, INFO_CHANNEL_ID, INFO_DISCONNECT,
    INFO_FACILITY_Q932, INFO_PROGRESS, NOTIFY_HOLD, NOTIFY_RETRIEVE, REJECT_IGNORE, REJECT_NORMAL,
    SELECTOR_DTMF, SELECTOR_SUPPLEMENTARY,
};
use crate::session::Shared;

type Table<H> = ConnectionTable<<H as Handlers>::Audio>;
type Out<H> = Outbox<<H as Handlers>::Audio>;

impl<C: Controller, H: Handlers> Shared<C, H> {
    // ---
    /// Handles one message from the controller.
    pub(crate) fn handle_message(&self, message: Message) {
        // ---
        let started = Instant::now();
        let mut out = Outbox::new();

        {
            let mut table = self.table.lock();
            match message {
                Message::Indication(indication) => {
                    self.metrics.indications_total.inc();
                    self.on_indication(&mut table, &mut out, indication);
                }
                Message::Confirmation(confirmation) => {
                    self.metrics.confirmations_total.inc();
                    self.on_confirmation(&mut table, &mut out, confirmation);
                }
            }
            self.metrics.active_connections.set(table.len() as i64);
        }

        out.deliver(&*self.handlers);
        self.metrics
            .indication_seconds
            .observe(started.elapsed().as_secs_f64());
    }

    fn on_indication(&self, t: &mut Table<H>, out: &mut Out<H>, indication: Indication) {
        // ---
        match &indication {
            Indication::DataB3 { .. } => trace!("IND: {}", indication.name()),
            _ => debug!("IND: {:?}", indication),
        }

        match indication {
            Indication::Connect {
                plci,
                cip,
                calling,
                called,
            } => self.connect_ind(t, out, plci, cip, &calling, &called),
            Indication::ConnectActive { plci } => self.connect_active_ind(t, out, plci),
            Indication::ConnectB3 { ncci } => self.connect_b3_ind(t, out, ncci),
            Indication::ConnectB3Active { ncci } => self.connect_b3_active_ind(t, out, ncci),
            Indication::DataB3 { ncci, data, handle } => self.data_b3_ind(t, out, ncci, data, handle),
            Indication::Facility {
                address,
                selector,
                params,
            } => self.facility_ind(t, out, address, selector, &params),
            Indication::Info {
                address,
                number,
                element,
            } => self.info_ind(t, out, address, number, &element),
            Indication::DisconnectB3 { ncci, reason_b3 } => {
                self.disconnect_b3_ind(t, out, ncci, reason_b3)
            }
            Indication::Disconnect { plci, reason } => self.disconnect_ind(t, out, plci, reason),
        }
    }

    fn connect_ind(
        &self,
        t: &mut Table<H>,
        out: &mut Out<H>,
        plci: u32,
        cip: u16,
        calling: &[u8],
        called: &[u8],
    ) {
        // ---
        let source = params::decode_calling(calling);
        let target = params::decode_called(called);
        info!("Incoming call from {} to {} (CIP {}, PLCI 0x{:x})", source, target, cip, plci);

        let intern = self.config.accept_intern && source.starts_with("**");
        let anonymous = source == "anonymous" || source == "unknown";
        let stale = t.find_plci(plci);

        let rejection = if !ACCEPTED_CIPS.contains(&cip) && !intern {
            Some("unsupported service")
        } else if self.config.reject_anonymous && anonymous {
            Some("anonymous caller")
        } else if stale.is_none() && t.len() == t.capacity() {
            Some("no free connection slot")
        } else {
            None
        };

        if let Some(reason) = rejection {
            info!("Ignoring call from {}: {}", source, reason);
            self.metrics.calls_rejected_total.inc();
            self.send(
                out,
                None,
                Request::ConnectResponse {
                    plci,
                    reject: REJECT_IGNORE,
                    protocol: BProtocol::TRANSPARENT,
                },
            );
            return;
        }

        if let Some(stale) = stale {
            self.violation(t, out, stale, "CONNECT_IND");
        }

        let id = match t.allocate(Direction::Inbound) {
            Ok(id) => id,
            Err(e) => {
                out.status(None, e);
                return;
            }
        };

        if let Some(conn) = t.get_mut(id) {
            conn.source = source;
            conn.target = target;
        }
        t.assign_plci(id, plci);

        if !self.transition(t, out, id, State::Ringing, "CONNECT_IND") {
            return;
        }

        if let Err(e) = self.link.request(Request::Alert { plci }) {
            self.fail(t, out, id, e);
        }
    }

    fn connect_active_ind(&self, t: &mut Table<H>, out: &mut Out<H>, plci: u32) {
        // ---
        const EVENT: &str = "CONNECT_ACTIVE_IND";

        self.send(out, None, Request::ConnectActiveResponse { plci });

        let Some((id, state)) = self.lookup_plci(t, plci, EVENT) else {
            return;
        };

        match state {
            State::IncomingWait => {
                self.set_connect_time(t, id);
                if self.transition(t, out, id, State::ConnectActive, EVENT) {
                    self.open_audio(t, out, id);
                }
            }
            State::ConnectWait => {
                if let Err(e) = self.link.request(Request::ConnectB3 { plci }) {
                    out.status(self.info(t, id), e);
                    self.hangup_locked(t, out, id);
                    return;
                }
                self.set_connect_time(t, id);
                if self.transition(t, out, id, State::ConnectActive, EVENT) {
                    self.open_audio(t, out, id);
                }
            }
            // Bearer was already requested on in-band progress
            State::ConnectActive | State::ConnectB3Wait | State::Connected => {
                self.set_connect_time(t, id);
            }
            State::DisconnectB3Req
            | State::DisconnectB3Wait
            | State::DisconnectActive
            | State::DisconnectWait => debug!("Call {}: {} ignored in {:?}", id, EVENT, state),
            State::Idle | State::ConnectReq | State::Ringing => self.violation(t, out, id, EVENT),
        }
    }

    fn connect_b3_ind(&self, t: &mut Table<H>, out: &mut Out<H>, ncci: u32) {
        // ---
        const EVENT: &str = "CONNECT_B3_IND";

        self.send(out, None, Request::ConnectB3Response { ncci });

        let Some((id, state)) = self.lookup_plci(t, plci_of(ncci), EVENT) else {
            return;
        };

        if state != State::ConnectActive {
            out.status(
                self.info(t, id),
                CapiError::ProtocolViolation {
                    state,
                    event: EVENT,
                },
            );
            self.hangup_locked(t, out, id);
            return;
        }

        if !t.assign_ncci(id, ncci) {
            self.violation(t, out, id, EVENT);
            return;
        }
        self.transition(t, out, id, State::ConnectB3Wait, EVENT);
    }

    fn connect_b3_active_ind(&self, t: &mut Table<H>, out: &mut Out<H>, ncci: u32) {
        // ---
        const EVENT: &str = "CONNECT_B3_ACTIVE_IND";

        self.send(out, None, Request::ConnectB3ActiveResponse { ncci });

        let plci = plci_of(ncci);
        let Some((id, _)) = self.lookup_plci(t, plci, EVENT) else {
            return;
        };

        if !t.assign_ncci(id, ncci) {
            self.violation(t, out, id, EVENT);
            return;
        }
        if !self.transition(t, out, id, State::Connected, EVENT) {
            return;
        }

        let enable = Request::Facility {
            address: plci,
            selector: SELECTOR_DTMF,
            params: params::dtmf_enable_params(),
        };
        if let Err(e) = self.link.request(enable) {
            out.status(self.info(t, id), e);
        }

        let Some(conn) = t.get_mut(id) else {
            return;
        };
        conn.on_hold = false;

        let call = conn.info();
        if let Err(e) = conn.media.on_active(self, &call, out) {
            out.status(Some(call), e);
        }

        if !conn.announced {
            conn.announced = true;
            info!("Call {} connected: {} -> {}", id, conn.source, conn.target);
            out.push(Deferred::Connected(conn.info()));
        }
    }

    fn data_b3_ind(&self, t: &mut Table<H>, out: &mut Out<H>, ncci: u32, data: Vec<u8>, handle: u16) {
        // ---
        self.send(out, None, Request::DataResponse { ncci, handle });

        let Some(conn) = t.find_ncci(ncci).and_then(|id| t.get(id)) else {
            trace!("DATA_B3_IND for unknown NCCI 0x{:x}", ncci);
            return;
        };

        conn.media.on_payload(|| conn.info(), data, out);
    }

    fn facility_ind(
        &self,
        t: &mut Table<H>,
        out: &mut Out<H>,
        address: u32,
        selector: u16,
        facility: &[u8],
    ) {
        // ---
        const EVENT: &str = "FACILITY_IND";

        self.send(
            out,
            None,
            Request::FacilityResponse {
                address,
                selector,
                params: Vec::new(),
            },
        );

        let plci = plci_of(address);
        let Some((id, _)) = self.lookup_plci(t, plci, EVENT) else {
            return;
        };

        match selector {
            SELECTOR_DTMF => {
                let Some(call) = self.info(t, id) else {
                    return;
                };
                for digit in params::dtmf_digits(facility) {
                    debug!("Call {}: DTMF '{}'", id, digit);
                    out.push(Deferred::Code(call.clone(), digit));
                }
            }
            SELECTOR_SUPPLEMENTARY => match params::supplementary_notification(facility) {
                Some(NOTIFY_HOLD) => {
                    info!("Call {} is on hold", id);
                    if let Some(conn) = t.get_mut(id) {
                        conn.on_hold = true;
                    }
                }
                Some(NOTIFY_RETRIEVE) => {
                    info!("Call {} retrieved", id);
                    if let Err(e) = self.link.request(Request::ConnectB3 { plci }) {
                        out.status(self.info(t, id), e);
                        self.hangup_locked(t, out, id);
                        return;
                    }
                    if self.transition(t, out, id, State::ConnectActive, EVENT) {
                        if let Some(conn) = t.get_mut(id) {
                            conn.on_hold = false;
                        }
                    }
                }
                other => debug!("Call {}: supplementary notification {:04x?}", id, other),
            },
            _ => debug!("Call {}: facility selector {} ignored", id, selector),
        }
    }

    fn info_ind(
        &self,
        t: &mut Table<H>,
        out: &mut Out<H>,
        address: u32,
        number: u16,
        element: &[u8],
    ) {
        // ---
        const EVENT: &str = "INFO_IND";

        self.send(out, None, Request::InfoResponse { address });

        let plci = plci_of(address);
        let Some(id) = t.find_plci(plci) else {
            debug!("INFO 0x{:04x} for unknown PLCI 0x{:x}", number, plci);
            return;
        };

        match number {
            INFO_DISCONNECT => {
                info!("Call {}: network disconnect", id);
                self.hangup_locked(t, out, id);
            }
            INFO_PROGRESS => {
                debug!(
                    "Call {}: progress indicator {:?}",
                    id,
                    params::progress_description(element)
                );

                let Some(conn) = t.get(id) else {
                    return;
                };
                if !conn.media.early_b3() || conn.state != State::ConnectWait {
                    return;
                }

                debug!("Call {}: requesting early bearer", id);
                if let Err(e) = self.link.request(Request::ConnectB3 { plci }) {
                    out.status(self.info(t, id), e);
                    self.hangup_locked(t, out, id);
                    return;
                }
                self.set_connect_time(t, id);
                if self.transition(t, out, id, State::ConnectActive, EVENT) {
                    self.open_audio(t, out, id);
                }
            }
            INFO_CALL_STATE => debug!("Call {}: call state {:02x?}", id, element),
            INFO_CHANNEL_ID => debug!("Call {}: channel identification {:02x?}", id, element),
            INFO_FACILITY_Q932 => debug!("Call {}: Q.932 facility {:02x?}", id, element),
            INFO_CAUSE => debug!("Call {}: cause {:?}", id, params::cause_value(element)),
            _ => debug!("Call {}: info 0x{:04x} {:02x?}", id, number, element),
        }
    }

    fn disconnect_b3_ind(&self, t: &mut Table<H>, out: &mut Out<H>, ncci: u32, reason_b3: u16) {
        // ---
        const EVENT: &str = "DISCONNECT_B3_IND";

        self.send(out, None, Request::DisconnectB3Response { ncci });

        let Some(id) = t.find_ncci(ncci).or_else(|| t.find_plci(plci_of(ncci))) else {
            debug!("{} for unknown NCCI 0x{:x}", EVENT, ncci);
            return;
        };
        let Some(conn) = t.get_mut(id) else {
            return;
        };

        debug!("Call {}: bearer down, reason 0x{:04x}", id, reason_b3);
        conn.reason_b3 = reason_b3;
        conn.ncci = 0;
        conn.media.suspend();

        let state = conn.state;
        match state {
            // Passive: the remote side (or a hold) removed the bearer
            State::Connected | State::ConnectB3Wait => {
                self.transition(t, out, id, State::DisconnectActive, EVENT);
            }
            _ => self.hangup_locked(t, out, id),
        }
    }

    fn disconnect_ind(&self, t: &mut Table<H>, out: &mut Out<H>, plci: u32, reason: u16) {
        // ---
        self.send(out, None, Request::DisconnectResponse { plci });

        let Some(mut conn) = t.find_plci(plci).and_then(|id| t.release(id)) else {
            debug!("DISCONNECT_IND for unknown PLCI 0x{:x}", plci);
            return;
        };

        info!(
            "Call {} disconnected, reason 0x{:04x} (bearer 0x{:04x})",
            conn.id, reason, conn.reason_b3
        );

        conn.reason = reason;
        conn.state = State::Idle;
        conn.plci = 0;
        conn.ncci = 0;

        self.teardown(&mut conn, out);
        out.push(Deferred::Disconnected(conn.info()));
    }

    fn on_confirmation(&self, t: &mut Table<H>, out: &mut Out<H>, confirmation: Confirmation) {
        // ---
        match &confirmation {
            Confirmation::DataB3 { .. } => trace!("CONF: {}", confirmation.name()),
            _ => debug!("CONF: {:?}", confirmation),
        }

        match confirmation {
            Confirmation::Connect { plci, info } => {
                let Some(id) = t.find_pending_dial() else {
                    warn!("CONNECT_CONF without pending dial (PLCI 0x{:x})", plci);
                    return;
                };

                if info != 0 {
                    let error = CapiError::RequestFailed {
                        request: "CONNECT_REQ",
                        info,
                    };
                    self.fail(t, out, id, error);
                    return;
                }

                if !t.assign_plci(id, plci) {
                    self.violation(t, out, id, "CONNECT_CONF");
                    return;
                }
                if !self.transition(t, out, id, State::ConnectWait, "CONNECT_CONF") {
                    return;
                }

                if t.get(id).is_some_and(|c| c.cancel_pending) {
                    debug!("Call {}: executing deferred hangup", id);
                    self.hangup_locked(t, out, id);
                }
            }

            Confirmation::ConnectB3 { ncci, info } => {
                if info == 0 {
                    return;
                }
                let Some(id) = t.find_plci(plci_of(ncci)) else {
                    return;
                };
                let error = CapiError::RequestFailed {
                    request: "CONNECT_B3_REQ",
                    info,
                };
                out.status(self.info(t, id), error);
                self.hangup_locked(t, out, id);
            }

            Confirmation::Alert { plci, info } => {
                let Some(id) = t.find_plci(plci) else {
                    return;
                };
                // 0x0003: alert already sent
                if info == 0 || info == 3 {
                    if let Some(call) = self.info(t, id) {
                        out.push(Deferred::Ring(call));
                    }
                } else {
                    let error = CapiError::RequestFailed {
                        request: "ALERT_REQ",
                        info,
                    };
                    self.fail(t, out, id, error);
                }
            }

            Confirmation::Disconnect { plci, info } => {
                let Some(id) = t.find_plci(plci) else {
                    return;
                };
                if info != 0 {
                    let error = CapiError::RequestFailed {
                        request: "DISCONNECT_REQ",
                        info,
                    };
                    self.fail(t, out, id, error);
                } else if t.get(id).is_some_and(|c| c.state == State::DisconnectActive) {
                    self.transition(t, out, id, State::DisconnectWait, "DISCONNECT_CONF");
                }
            }

            Confirmation::DisconnectB3 { ncci, info } => {
                let Some(id) = t.find_ncci(ncci).or_else(|| t.find_plci(plci_of(ncci))) else {
                    return;
                };
                if info == 0 {
                    if t.get(id).is_some_and(|c| c.state == State::DisconnectB3Req) {
                        self.transition(t, out, id, State::DisconnectB3Wait, "DISCONNECT_B3_CONF");
                    }
                    return;
                }

                let error = CapiError::RequestFailed {
                    request: "DISCONNECT_B3_REQ",
                    info,
                };
                out.status(self.info(t, id), error);
                self.disconnect_fallback(t, out, id);
            }

            Confirmation::DataB3 { .. }
            | Confirmation::Facility { .. }
            | Confirmation::Listen { .. }
            | Confirmation::Info { .. } => {}
        }
    }

    /// Caller-style hangup of `id`, dependent on its state.
    pub(crate) fn hangup_locked(&self, t: &mut Table<H>, out: &mut Out<H>, id: CallId) {
        // ---
        let Some(conn) = t.get_mut(id) else {
            return;
        };

        let (plci, ncci, state) = (conn.plci, conn.ncci, conn.state);
        let requested = conn.disconnect_requested;
        match state {
            State::ConnectReq => {
                debug!("Call {}: hangup deferred until CONNECT_CONF", id);
                conn.cancel_pending = true;
            }
            State::ConnectWait
            | State::ConnectActive
            | State::DisconnectB3Req
            | State::DisconnectB3Wait
            | State::IncomingWait => self.disconnect_fallback(t, out, id),
            // Bearer removed by the remote side or a hold; the call itself is still up
            State::DisconnectActive if plci != 0 && !requested => {
                self.disconnect_fallback(t, out, id);
            }
            State::ConnectB3Wait | State::Connected => {
                match self.link.request(Request::DisconnectB3 { ncci }) {
                    Ok(()) => {
                        self.transition(t, out, id, State::DisconnectB3Req, "hangup");
                    }
                    Err(e) => {
                        out.status(self.info(t, id), e);
                        self.disconnect_fallback(t, out, id);
                    }
                }
            }
            State::Ringing => {
                let reject = Request::ConnectResponse {
                    plci,
                    reject: REJECT_NORMAL,
                    protocol: BProtocol::TRANSPARENT,
                };
                match self.link.request(reject) {
                    // Slot is freed by the DISCONNECT_IND that follows
                    Ok(()) => {
                        self.transition(t, out, id, State::Idle, "hangup");
                    }
                    Err(e) => out.status(self.info(t, id), e),
                }
            }
            State::Idle | State::DisconnectActive | State::DisconnectWait => {
                debug!("Call {}: hangup ignored in {:?}", id, state);
            }
        }
    }

    /// Full disconnect of the signalling leg, also used when the bearer
    /// disconnect could not be requested.
    fn disconnect_fallback(&self, t: &mut Table<H>, out: &mut Out<H>, id: CallId) {
        // ---
        let Some(plci) = t.get(id).map(|c| c.plci) else {
            return;
        };

        match self.link.request(Request::Disconnect { plci }) {
            Ok(()) => {
                if let Some(conn) = t.get_mut(id) {
                    conn.disconnect_requested = true;
                }
                self.transition(t, out, id, State::DisconnectActive, "hangup");
            }
            Err(e) => self.fail(t, out, id, e),
        }
    }

    /// Moves `id` to `next`; an invalid edge resets the connection.
    fn transition(
        &self,
        t: &mut Table<H>,
        out: &mut Out<H>,
        id: CallId,
        next: State,
        event: &'static str,
    ) -> bool {
        // ---
        let Some(conn) = t.get_mut(id) else {
            return false;
        };

        let current = conn.state;
        if current == next {
            return true;
        }
        if current.can_transition_to(next) {
            debug!("Call {}: {:?} -> {:?}", id, current, next);
            conn.state = next;
            return true;
        }

        self.violation(t, out, id, event);
        false
    }

    fn violation(&self, t: &mut Table<H>, out: &mut Out<H>, id: CallId, event: &'static str) {
        // ---
        let state = t.get(id).map_or(State::Idle, |c| c.state);
        warn!("Call {}: unexpected {} in state {:?}, resetting", id, event, state);
        self.fail(t, out, id, CapiError::ProtocolViolation { state, event });
    }

    /// Reports `error` and force-resets `id` to a free slot.
    fn fail(&self, t: &mut Table<H>, out: &mut Out<H>, id: CallId, error: CapiError) {
        // ---
        let Some(mut conn) = t.release(id) else {
            out.status(None, error);
            return;
        };

        out.status(Some(conn.info()), error);
        conn.state = State::Idle;
        self.teardown(&mut conn, out);

        if conn.announced {
            out.push(Deferred::Disconnected(conn.info()));
        }
    }

    /// Frees `id` locally without telling the controller.
    pub(crate) fn discard(&self, t: &mut Table<H>, out: &mut Out<H>, id: CallId) {
        // ---
        let Some(mut conn) = t.release(id) else {
            return;
        };

        conn.state = State::Idle;
        self.teardown(&mut conn, out);
        if conn.announced {
            out.push(Deferred::Disconnected(conn.info()));
        }
    }

    fn teardown(&self, conn: &mut Connection<H::Audio>, out: &mut Out<H>) {
        // ---
        let call = conn.info();
        let flushed = conn.media.on_cleanup(
            &*self.handlers,
            self.config.audio_stop_timeout(),
            &call,
            out,
        );
        self.metrics
            .recorder_frames_flushed_total
            .inc_by(flushed as u64);
    }

    fn open_audio(&self, t: &mut Table<H>, out: &mut Out<H>, id: CallId) {
        // ---
        let Some(conn) = t.get_mut(id) else {
            return;
        };

        if let Err(e) = conn.media.open_audio(&*self.handlers) {
            out.status(Some(conn.info()), e);
            self.hangup_locked(t, out, id);
        }
    }

    fn set_connect_time(&self, t: &mut Table<H>, id: CallId) {
        if let Some(conn) = t.get_mut(id) {
            conn.connect_time.get_or_insert_with(Local::now);
        }
    }

    fn lookup_plci(&self, t: &Table<H>, plci: u32, event: &str) -> Option<(CallId, State)> {
        // ---
        let found = t
            .find_plci(plci)
            .and_then(|id| t.get(id))
            .map(|c| (c.id, c.state));

        if found.is_none() {
            debug!("{} for unknown PLCI 0x{:x}", event, plci);
        }
        found
    }

    fn info(&self, t: &Table<H>, id: CallId) -> Option<crate::CallInfo> {
        t.get(id).map(|c| c.info())
    }

    /// Sends a response; a failure is reported but changes no state.
    fn send(&self, out: &mut Out<H>, call: Option<crate::CallInfo>, request: Request) {
        if let Err(e) = self.link.request(request) {
            out.status(call, e);
        }
    }
}
