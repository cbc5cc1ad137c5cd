//! Error types for the telephony engine
//!
//! Session-init errors are returned to the caller of [`Session::init`].
//! Errors raised while the dispatch thread drives a call are handed to the
//! host through [`Handlers::status`] instead.
//!
//! [`Session::init`]: crate::Session::init
//! [`Handlers::status`]: crate::Handlers::status

use media::RecorderError;
use thiserror::Error;

use crate::connection::{CallId, State};

/// Errors of the CAPI engine.
#[derive(Error, Debug)]
pub enum CapiError {
    #[error("CAPI driver is not installed")]
    ControllerUnavailable,

    #[error("no ISDN controllers installed")]
    NoControllers,

    #[error("CAPI application registration rejected (info 0x{0:04x})")]
    RegistrationFailed(u16),

    #[error("invalid phone number: '{0}'")]
    InvalidNumber(String),

    #[error("invalid DTMF digit: {0:?}")]
    InvalidDigit(char),

    #[error("all {0} connection slots are in use")]
    NoFreeSlot(usize),

    #[error("{request} failed (info 0x{info:04x})")]
    RequestFailed { request: &'static str, info: u16 },

    #[error("unexpected {event} in state {state:?}")]
    ProtocolViolation { state: State, event: &'static str },

    #[error("could not open audio device")]
    AudioOpenFailed,

    #[error("recording failed: {0}")]
    RecorderIo(#[from] RecorderError),

    #[error("unknown call {0}")]
    UnknownCall(CallId),

    #[error("cannot {operation} in state {state:?}")]
    InvalidState {
        operation: &'static str,
        state: State,
    },

    #[error("failed to spawn {0} thread: {1}")]
    Thread(&'static str, #[source] std::io::Error),

    #[error("invalid configuration: {0:#}")]
    Config(anyhow::Error),

    #[error("metrics registry: {0:#}")]
    Metrics(anyhow::Error),

    #[error("session is shut down")]
    SessionClosed,
}

impl CapiError {
    // ---
    /// CAPI info code carried by the error, if it came from the controller.
    pub fn info(&self) -> Option<u16> {
        // ---
        match self {
            CapiError::RegistrationFailed(info) | CapiError::RequestFailed { info, .. } => {
                Some(*info)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_request_failure_reports_info_in_hex() {
        // ---
        let err = CapiError::RequestFailed {
            request: "CONNECT_REQ",
            info: 0x2002,
        };

        assert_eq!(err.to_string(), "CONNECT_REQ failed (info 0x2002)");
        assert_eq!(err.info(), Some(0x2002));
        assert_eq!(CapiError::AudioOpenFailed.info(), None);
    }

    #[test]
    fn test_protocol_violation_names_state() {
        // ---
        let err = CapiError::ProtocolViolation {
            state: State::Ringing,
            event: "CONNECT_B3_IND",
        };
        assert_eq!(err.to_string(), "unexpected CONNECT_B3_IND in state Ringing");
    }
}
