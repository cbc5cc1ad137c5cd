//! CAPI parameter structs and constants used by call control.
//!
//! Every struct is built as a CAPI struct (length octet first). An empty
//! `Vec` means the struct is omitted from the message.

/// CIP value of an outbound voice call (telephony).
pub const CIP_VOICE: u16 = 4;

/// CIP value of an outbound fax call (group 2/3 facsimile).
pub const CIP_FAX_G3: u16 = 17;

/// CIP values accepted on inbound calls: speech, 3.1 kHz audio,
/// telephony and fax G2/G3.
pub const ACCEPTED_CIPS: [u16; 4] = [1, 4, 16, 17];

/// Facility selector for DTMF.
pub const SELECTOR_DTMF: u16 = 0x0001;

/// Facility selector for supplementary services.
pub const SELECTOR_SUPPLEMENTARY: u16 = 0x0003;

/// Supplementary service notification: call was put on hold.
pub const NOTIFY_HOLD: u16 = 0x0202;

/// Supplementary service notification: call was retrieved.
pub const NOTIFY_RETRIEVE: u16 = 0x0203;

pub const INFO_CAUSE: u16 = 0x0008;
pub const INFO_CALL_STATE: u16 = 0x0014;
pub const INFO_CHANNEL_ID: u16 = 0x0018;
pub const INFO_FACILITY_Q932: u16 = 0x001C;
pub const INFO_PROGRESS: u16 = 0x001E;

/// INFO number of a DISCONNECT message from the network.
pub const INFO_DISCONNECT: u16 = 0x8045;

/// CONNECT_RESP reject codes.
pub const ACCEPT: u16 = 0;
pub const REJECT_IGNORE: u16 = 1;
pub const REJECT_NORMAL: u16 = 3;

/// Calling number presented for internal calls.
const INTERN_CALLER: &str = "**981";

/// B1/B2/B3 protocol selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BProtocol {
    pub b1: u16,
    pub b2: u16,
    pub b3: u16,
}

impl BProtocol {
    /// 64 kbit/s transparent, used for voice and for software fax.
    pub const TRANSPARENT: BProtocol = BProtocol { b1: 1, b2: 1, b3: 0 };
}

impl Default for BProtocol {
    fn default() -> Self {
        Self::TRANSPARENT
    }
}

/// Optional parameters of a CONNECT_REQ.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectParams {
    // ---
    pub called: Vec<u8>,
    pub calling: Vec<u8>,
    pub protocol: BProtocol,

    /// Bearer capability.
    pub bc: Vec<u8>,

    /// Low layer compatibility.
    pub llc: Vec<u8>,

    /// High layer compatibility.
    pub hlc: Vec<u8>,
}

/// Targets starting with `*` or `#` are internal (PBX) numbers.
pub fn is_internal(target: &str) -> bool {
    target.starts_with('*') || target.starts_with('#')
}

fn cstruct(body: &[u8]) -> Vec<u8> {
    // ---
    let len = body.len().min(u8::MAX as usize);
    let mut out = Vec::with_capacity(len + 1);
    out.push(len as u8);
    out.extend_from_slice(&body[..len]);
    out
}

/// Builds the CONNECT_REQ parameters for a call from `source` to `target`.
pub fn connect_params(source: &str, target: &str, anonymous: bool, cip: u16) -> ConnectParams {
    // ---
    let intern = is_internal(target);

    let mut called = vec![0x80];
    called.extend_from_slice(target.as_bytes());

    let presentation = if anonymous { 0xA0 } else { 0x80 };
    let mut calling = vec![0x00, presentation];
    let mut bc = Vec::new();

    if intern {
        calling.extend_from_slice(INTERN_CALLER.as_bytes());
        bc = cstruct(&[0xE0, 0x90, 0xA3]);
    } else {
        calling.extend_from_slice(source.as_bytes());
    }

    let mut llc = cstruct(&[0x80, 0x90]);
    let mut hlc = Vec::new();

    match cip {
        CIP_VOICE => hlc = cstruct(&[0x91, 0x81]),
        CIP_FAX_G3 => {
            bc.clear();
            llc.clear();
        }
        _ => {}
    }

    ConnectParams {
        called: cstruct(&called),
        calling: cstruct(&calling),
        protocol: BProtocol::TRANSPARENT,
        bc,
        llc,
        hlc,
    }
}

fn digits_to_string(digits: &[u8]) -> String {
    // ---
    let number: String = String::from_utf8_lossy(digits)
        .chars()
        .filter(|c| *c != '\0')
        .collect();

    if number.is_empty() {
        "anonymous".to_string()
    } else {
        number
    }
}

/// Decodes the calling party number of an inbound call.
///
/// With octet 3a present (bit 7 of the second body octet set) the digits
/// start one octet later.
pub fn decode_calling(ie: &[u8]) -> String {
    // ---
    let len = ie.first().copied().unwrap_or(0) as usize;
    if len <= 1 {
        return "unknown".to_string();
    }

    let end = (len + 1).min(ie.len());
    let start = if ie.get(2).is_some_and(|b| b & 0x80 != 0) { 3 } else { 2 };

    digits_to_string(ie.get(start..end).unwrap_or_default())
}

/// Decodes the called party number of an inbound call.
pub fn decode_called(ie: &[u8]) -> String {
    // ---
    let len = ie.first().copied().unwrap_or(0) as usize;
    if len <= 1 {
        return "unknown".to_string();
    }

    let end = (len + 1).min(ie.len());
    digits_to_string(ie.get(2..end).unwrap_or_default())
}

/// Maps a DTMF octet to a digit; anything but `0-9`, `*` and `#` is noise.
pub fn dtmf_digit(byte: u8) -> Option<char> {
    // ---
    match byte {
        b'0'..=b'9' | b'*' | b'#' => Some(byte as char),
        _ => None,
    }
}

/// Digits carried by a DTMF facility indication.
pub fn dtmf_digits(params: &[u8]) -> impl Iterator<Item = char> + '_ {
    // ---
    let len = params.first().copied().unwrap_or(0) as usize;
    let end = (len + 1).min(params.len());

    params
        .get(1..end)
        .unwrap_or_default()
        .iter()
        .filter_map(|&b| dtmf_digit(b))
}

/// Facility parameters enabling DTMF detection (64 ms tone, 64 ms gap).
pub fn dtmf_enable_params() -> Vec<u8> {
    cstruct(&[0x01, 0x00, 0x40, 0x00, 0x40, 0x00, 0x00, 0x02, 0x00, 0x00])
}

/// Facility parameters sending one DTMF digit (48 ms tone, 48 ms gap).
pub fn dtmf_send_params(digit: u8) -> Vec<u8> {
    cstruct(&[0x03, 0x00, 0x30, 0x00, 0x30, 0x00, 0x01, digit])
}

/// Supplementary service parameters for hold (`true`) or retrieve.
pub fn hold_params(hold: bool) -> Vec<u8> {
    // ---
    let function: u16 = if hold { 0x0002 } else { 0x0003 };
    let [lo, hi] = function.to_le_bytes();
    cstruct(&[lo, hi, 0x00])
}

/// Notification code of a supplementary services facility indication.
pub fn supplementary_notification(params: &[u8]) -> Option<u16> {
    // ---
    let lo = *params.get(1)?;
    let hi = *params.get(3)?;
    Some(u16::from(lo) | u16::from(hi) << 8)
}

/// Cause value of a cause information element.
pub fn cause_value(element: &[u8]) -> Option<u8> {
    element.get(2).map(|b| b & 0x7F)
}

/// Progress description of a progress indicator element.
pub fn progress_description(element: &[u8]) -> Option<u8> {
    // ---
    if element.first().copied().unwrap_or(0) < 2 {
        return None;
    }
    element.get(2).map(|b| b & 0x7F)
}
