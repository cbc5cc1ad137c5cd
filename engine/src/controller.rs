//! Boundary to the CAPI 2.0 message library.
//!
//! The engine never encodes CAPI messages itself. It hands typed
//! [`Request`]s to a [`Controller`] implementation and receives decoded
//! [`Message`]s from it. Structured parameters (party numbers, facility
//! parameters, information elements) are carried as CAPI structs: a length
//! octet followed by the body.

use std::time::Duration;
use thiserror::Error;

use crate::params::{BProtocol, ConnectParams};

/// Application registration parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterParams {
    // ---
    /// Maximum number of simultaneous B-channel connections.
    pub max_logical_connections: u32,

    /// Data blocks the controller may buffer per connection.
    pub max_b_data_blocks: u32,

    /// Size of one data block in bytes.
    pub max_b_data_len: u32,
}

/// Registration used by the engine: two B-channels, six buffers of one
/// 20 ms A-law packet each.
pub const REGISTER_PARAMS: RegisterParams = RegisterParams {
    max_logical_connections: 2,
    max_b_data_blocks: 6,
    max_b_data_len: 160,
};

/// Failure of [`Controller::get_message`].
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveError {
    /// A message was signalled but the queue turned out empty. Transient;
    /// the engine re-registers.
    #[error("receive queue empty")]
    QueueEmpty,

    #[error("receive failed (info 0x{0:04x})")]
    Failed(u16),
}

/// Telephony controller driver.
///
/// All methods take `&self`: the engine serializes requests and message
/// decoding behind its own lock, while [`Controller::wait_for_message`] is
/// called without it.
pub trait Controller: Send + Sync + 'static {
    // ---
    /// Whether the driver is present at all.
    fn is_installed(&self) -> bool;

    /// Number of ISDN controllers the driver reports.
    fn controller_count(&self) -> u32;

    /// Remote CAPI host for network-attached controllers.
    fn set_remote_host(&self, _host: &str) {}

    /// Registers the application; returns the application id or the
    /// driver's info code.
    fn register(&self, params: &RegisterParams) -> Result<u32, u16>;

    /// Releases a registration; returns the info code.
    fn release(&self, appl_id: u32) -> u16;

    /// Blocks up to `timeout` for a message; `true` if one is pending.
    fn wait_for_message(&self, appl_id: u32, timeout: Duration) -> bool;

    /// Fetches and decodes the next message.
    fn get_message(&self, appl_id: u32) -> Result<Message, ReceiveError>;

    /// Sends a request or response; returns the info code (0 = accepted).
    fn send(&self, appl_id: u32, number: u16, request: &Request) -> u16;
}

/// Decoded inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Indication(Indication),
    Confirmation(Confirmation),
}

/// Unsolicited message from the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Indication {
    /// New inbound call.
    Connect {
        plci: u32,
        cip: u16,
        calling: Vec<u8>,
        called: Vec<u8>,
    },

    /// Signaling leg is up.
    ConnectActive { plci: u32 },

    /// Bearer leg is being established.
    ConnectB3 { ncci: u32 },

    /// Bearer leg is up.
    ConnectB3Active { ncci: u32 },

    /// Payload on a bearer leg.
    DataB3 { ncci: u32, data: Vec<u8>, handle: u16 },

    /// Supplementary services or DTMF.
    Facility {
        address: u32,
        selector: u16,
        params: Vec<u8>,
    },

    /// Call progress information.
    Info {
        address: u32,
        number: u16,
        element: Vec<u8>,
    },

    /// Bearer leg is gone.
    DisconnectB3 { ncci: u32, reason_b3: u16 },

    /// Call is gone.
    Disconnect { plci: u32, reason: u16 },
}

/// Answer of the controller to one of our requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Confirmation {
    Connect { plci: u32, info: u16 },
    ConnectB3 { ncci: u32, info: u16 },
    Alert { plci: u32, info: u16 },
    DataB3 { ncci: u32, handle: u16, info: u16 },
    Facility { address: u32, info: u16 },
    Listen { controller: u32, info: u16 },
    Info { address: u32, info: u16 },
    Disconnect { plci: u32, info: u16 },
    DisconnectB3 { ncci: u32, info: u16 },
}

/// Outbound request or response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Listen {
        controller: u32,
        info_mask: u32,
        cip_mask: u32,
    },
    Connect {
        controller: u32,
        cip: u16,
        params: ConnectParams,
    },
    /// `reject`: 0 = accept, 1 = ignore, 3 = reject.
    ConnectResponse {
        plci: u32,
        reject: u16,
        protocol: BProtocol,
    },
    Alert {
        plci: u32,
    },
    ConnectActiveResponse {
        plci: u32,
    },
    ConnectB3 {
        plci: u32,
    },
    ConnectB3Response {
        ncci: u32,
    },
    ConnectB3ActiveResponse {
        ncci: u32,
    },
    Data {
        ncci: u32,
        data: Vec<u8>,
        handle: u16,
    },
    DataResponse {
        ncci: u32,
        handle: u16,
    },
    Facility {
        address: u32,
        selector: u16,
        params: Vec<u8>,
    },
    FacilityResponse {
        address: u32,
        selector: u16,
        params: Vec<u8>,
    },
    InfoResponse {
        address: u32,
    },
    Disconnect {
        plci: u32,
    },
    DisconnectResponse {
        plci: u32,
    },
    DisconnectB3 {
        ncci: u32,
    },
    DisconnectB3Response {
        ncci: u32,
    },
}

impl Request {
    // ---
    /// CAPI message name, used in logs and errors.
    pub fn name(&self) -> &'static str {
        // ---
        match self {
            Request::Listen { .. } => "LISTEN_REQ",
            Request::Connect { .. } => "CONNECT_REQ",
            Request::ConnectResponse { .. } => "CONNECT_RESP",
            Request::Alert { .. } => "ALERT_REQ",
            Request::ConnectActiveResponse { .. } => "CONNECT_ACTIVE_RESP",
            Request::ConnectB3 { .. } => "CONNECT_B3_REQ",
            Request::ConnectB3Response { .. } => "CONNECT_B3_RESP",
            Request::ConnectB3ActiveResponse { .. } => "CONNECT_B3_ACTIVE_RESP",
            Request::Data { .. } => "DATA_B3_REQ",
            Request::DataResponse { .. } => "DATA_B3_RESP",
            Request::Facility { .. } => "FACILITY_REQ",
            Request::FacilityResponse { .. } => "FACILITY_RESP",
            Request::InfoResponse { .. } => "INFO_RESP",
            Request::Disconnect { .. } => "DISCONNECT_REQ",
            Request::DisconnectResponse { .. } => "DISCONNECT_RESP",
            Request::DisconnectB3 { .. } => "DISCONNECT_B3_REQ",
            Request::DisconnectB3Response { .. } => "DISCONNECT_B3_RESP",
        }
    }
}

impl Indication {
    // ---
    pub fn name(&self) -> &'static str {
        // ---
        match self {
            Indication::Connect { .. } => "CONNECT_IND",
            Indication::ConnectActive { .. } => "CONNECT_ACTIVE_IND",
            Indication::ConnectB3 { .. } => "CONNECT_B3_IND",
            Indication::ConnectB3Active { .. } => "CONNECT_B3_ACTIVE_IND",
            Indication::DataB3 { .. } => "DATA_B3_IND",
            Indication::Facility { .. } => "FACILITY_IND",
            Indication::Info { .. } => "INFO_IND",
            Indication::DisconnectB3 { .. } => "DISCONNECT_B3_IND",
            Indication::Disconnect { .. } => "DISCONNECT_IND",
        }
    }
}

impl Confirmation {
    // ---
    pub fn name(&self) -> &'static str {
        // ---
        match self {
            Confirmation::Connect { .. } => "CONNECT_CONF",
            Confirmation::ConnectB3 { .. } => "CONNECT_B3_CONF",
            Confirmation::Alert { .. } => "ALERT_CONF",
            Confirmation::DataB3 { .. } => "DATA_B3_CONF",
            Confirmation::Facility { .. } => "FACILITY_CONF",
            Confirmation::Listen { .. } => "LISTEN_CONF",
            Confirmation::Info { .. } => "INFO_CONF",
            Confirmation::Disconnect { .. } => "DISCONNECT_CONF",
            Confirmation::DisconnectB3 { .. } => "DISCONNECT_B3_CONF",
        }
    }
}

/// PLCI part of an NCCI (or of any PLCI-or-NCCI address).
#[inline]
pub fn plci_of(address: u32) -> u32 {
    address & 0xFFFF
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_plci_of_strips_ncci_bits() {
        // ---
        assert_eq!(plci_of(0x0001_0101), 0x0101);
        assert_eq!(plci_of(0x0101), 0x0101);
    }

    #[test]
    fn test_message_names() {
        // ---
        assert_eq!(Request::Disconnect { plci: 1 }.name(), "DISCONNECT_REQ");
        assert_eq!(Indication::ConnectB3 { ncci: 1 }.name(), "CONNECT_B3_IND");
        assert_eq!(
            Confirmation::Alert { plci: 1, info: 0 }.name(),
            "ALERT_CONF"
        );
    }
}
