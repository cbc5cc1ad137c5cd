//! CAPI 2.0 telephony engine.
//!
//! Drives an ISDN controller through a message-oriented call-control
//! library: outbound and inbound calls, the per-connection protocol state
//! machine, voice transcoding with dual-channel recording, DTMF, hold and
//! fax pass-through.
//!
//! The host supplies a [`Controller`] (the CAPI library binding) and a
//! [`Handlers`] implementation (audio device and event callbacks), then
//! drives calls through a [`Session`].

mod audio;
pub mod config;
mod connection;
pub mod controller;
mod error;
mod handlers;
mod link;
pub mod params;
mod session;
mod state_machine;
mod transfer;

pub use config::{ReconnectConfig, SessionConfig};
pub use connection::{CallId, CallInfo, Direction, Kind, State};
pub use controller::{
    Confirmation, Controller, Indication, Message, ReceiveError, RegisterParams, Request,
};
pub use error::CapiError;
pub use handlers::Handlers;
pub use session::Session;
pub use transfer::{FaxTransfer, Service};
