//! Connection records and the fixed-capacity table that owns them.
//!
//! Slots live in an arena with a free-list. Callers hold [`CallId`]s; an id
//! names a slot *and* the serial of the connection that was allocated into
//! it, so a stale id never reaches a reused slot.

use chrono::{DateTime, Local};
use std::fmt;
use tracing::{debug, warn};

use crate::error::CapiError;
use crate::transfer::Media;

/// Protocol state of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Idle,
    ConnectReq,
    ConnectWait,
    ConnectActive,
    ConnectB3Wait,
    Connected,
    DisconnectB3Req,
    DisconnectB3Wait,
    DisconnectActive,
    DisconnectWait,
    Ringing,
    IncomingWait,
}

impl State {
    // ---
    pub const ALL: [State; 12] = [
        State::Idle,
        State::ConnectReq,
        State::ConnectWait,
        State::ConnectActive,
        State::ConnectB3Wait,
        State::Connected,
        State::DisconnectB3Req,
        State::DisconnectB3Wait,
        State::DisconnectActive,
        State::DisconnectWait,
        State::Ringing,
        State::IncomingWait,
    ];

    /// Whether `self -> next` is an edge of the state machine.
    ///
    /// Every state may fall back to `Idle`; staying in a state is not a
    /// transition and is rejected here.
    pub fn can_transition_to(self, next: State) -> bool {
        // ---
        use State::*;

        if next == Idle {
            return self != Idle;
        }

        matches!(
            (self, next),
            (Idle, ConnectReq)
                | (Idle, Ringing)
                | (ConnectReq, ConnectWait)
                | (ConnectWait, ConnectActive)
                | (ConnectWait, DisconnectActive)
                | (ConnectActive, ConnectB3Wait)
                | (ConnectActive, Connected)
                | (ConnectActive, DisconnectActive)
                | (ConnectB3Wait, Connected)
                | (ConnectB3Wait, DisconnectB3Req)
                | (ConnectB3Wait, DisconnectActive)
                | (Connected, DisconnectB3Req)
                | (Connected, DisconnectActive)
                | (Connected, ConnectActive)
                | (DisconnectB3Req, DisconnectB3Wait)
                | (DisconnectB3Req, DisconnectActive)
                | (DisconnectB3Wait, DisconnectActive)
                | (DisconnectActive, DisconnectWait)
                | (DisconnectActive, ConnectActive)
                | (Ringing, IncomingWait)
                | (Ringing, DisconnectActive)
                | (IncomingWait, ConnectActive)
                | (IncomingWait, DisconnectActive)
        )
    }
}

/// Handle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallId {
    slot: usize,
    serial: u64,
}

impl CallId {
    // ---
    /// Monotonically increasing id of the connection.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    #[cfg(test)]
    pub(crate) fn slot(&self) -> usize {
        self.slot
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.serial)
    }
}

/// Media kind of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    None,
    Voice,
    Fax,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

/// Snapshot of a connection handed to the host.
#[derive(Debug, Clone, PartialEq)]
pub struct CallInfo {
    // ---
    pub id: CallId,
    pub state: State,
    pub kind: Kind,
    pub direction: Direction,
    pub plci: u32,
    pub ncci: u32,
    pub source: String,
    pub target: String,
    pub connect_time: Option<DateTime<Local>>,
    pub muted: bool,
    pub on_hold: bool,
    pub recording: bool,
    pub early_b3: bool,

    /// Reason of the last DISCONNECT_IND.
    pub reason: u16,

    /// Reason of the last DISCONNECT_B3_IND.
    pub reason_b3: u16,
}

/// One call leg.
pub(crate) struct Connection<A> {
    // ---
    pub id: CallId,
    pub state: State,
    pub direction: Direction,
    pub plci: u32,
    pub ncci: u32,
    pub source: String,
    pub target: String,
    pub connect_time: Option<DateTime<Local>>,
    pub on_hold: bool,

    /// Hangup requested before the PLCI was known.
    pub cancel_pending: bool,

    /// `connected` was delivered to the host.
    pub announced: bool,

    /// DISCONNECT_REQ went out for this PLCI.
    pub disconnect_requested: bool,

    pub reason: u16,
    pub reason_b3: u16,
    pub media: Media<A>,
}

impl<A> Connection<A> {
    // ---
    fn new(id: CallId, direction: Direction) -> Self {
        // ---
        Self {
            id,
            state: State::Idle,
            direction,
            plci: 0,
            ncci: 0,
            source: String::new(),
            target: String::new(),
            connect_time: None,
            on_hold: false,
            cancel_pending: false,
            announced: false,
            disconnect_requested: false,
            reason: 0,
            reason_b3: 0,
            media: Media::None,
        }
    }

    pub fn info(&self) -> CallInfo {
        // ---
        let line = self.media.line();

        CallInfo {
            id: self.id,
            state: self.state,
            kind: self.media.kind(),
            direction: self.direction,
            plci: self.plci,
            ncci: self.ncci,
            source: self.source.clone(),
            target: self.target.clone(),
            connect_time: self.connect_time,
            muted: line.is_some_and(|l| l.is_muted()),
            on_hold: self.on_hold,
            recording: line.is_some_and(|l| l.is_recording()),
            early_b3: self.media.early_b3(),
            reason: self.reason,
            reason_b3: self.reason_b3,
        }
    }
}

/// Fixed-capacity pool of connections.
pub(crate) struct ConnectionTable<A> {
    // ---
    slots: Vec<Option<Connection<A>>>,

    /// Free slot indices; the next allocation pops from the back.
    free: Vec<usize>,

    next_serial: u64,
}

impl<A> ConnectionTable<A> {
    // ---
    pub fn new(capacity: usize) -> Self {
        // ---
        let capacity = capacity.max(1);
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            free: (0..capacity).rev().collect(),
            next_serial: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Claims a free slot for a new connection in state `Idle`.
    pub fn allocate(&mut self, direction: Direction) -> Result<CallId, CapiError> {
        // ---
        let Some(slot) = self.free.pop() else {
            return Err(CapiError::NoFreeSlot(self.capacity()));
        };

        let id = CallId {
            slot,
            serial: self.next_serial,
        };
        self.next_serial += 1;
        self.slots[slot] = Some(Connection::new(id, direction));

        debug!("Allocated connection {} in slot {}", id, slot);
        Ok(id)
    }

    /// Frees the slot of `id` and returns its connection.
    pub fn release(&mut self, id: CallId) -> Option<Connection<A>> {
        // ---
        self.get(id)?;
        let connection = self.slots[id.slot].take();
        self.free.push(id.slot);

        debug!("Released connection {}", id);
        connection
    }

    pub fn get(&self, id: CallId) -> Option<&Connection<A>> {
        self.slots
            .get(id.slot)?
            .as_ref()
            .filter(|c| c.id == id)
    }

    pub fn get_mut(&mut self, id: CallId) -> Option<&mut Connection<A>> {
        self.slots
            .get_mut(id.slot)?
            .as_mut()
            .filter(|c| c.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection<A>> {
        self.slots.iter().flatten()
    }

    pub fn ids(&self) -> Vec<CallId> {
        self.iter().map(|c| c.id).collect()
    }

    pub fn find_plci(&self, plci: u32) -> Option<CallId> {
        // ---
        if plci == 0 {
            return None;
        }
        self.iter().find(|c| c.plci == plci).map(|c| c.id)
    }

    pub fn find_ncci(&self, ncci: u32) -> Option<CallId> {
        // ---
        if ncci == 0 {
            return None;
        }
        self.iter().find(|c| c.ncci == ncci).map(|c| c.id)
    }

    /// Oldest outbound connection still waiting for its CONNECT_CONF.
    pub fn find_pending_dial(&self) -> Option<CallId> {
        // ---
        self.iter()
            .filter(|c| c.state == State::ConnectReq)
            .min_by_key(|c| c.id.serial)
            .map(|c| c.id)
    }

    /// Sets the PLCI of `id` unless another live connection already uses it.
    pub fn assign_plci(&mut self, id: CallId, plci: u32) -> bool {
        // ---
        if let Some(other) = self.find_plci(plci).filter(|other| *other != id) {
            warn!("PLCI 0x{:x} already belongs to connection {}", plci, other);
            return false;
        }

        match self.get_mut(id) {
            Some(connection) => {
                connection.plci = plci;
                true
            }
            None => false,
        }
    }

    /// Sets the NCCI of `id` unless another live connection already uses it.
    pub fn assign_ncci(&mut self, id: CallId, ncci: u32) -> bool {
        // ---
        if let Some(other) = self.find_ncci(ncci).filter(|other| *other != id) {
            warn!("NCCI 0x{:x} already belongs to connection {}", ncci, other);
            return false;
        }

        match self.get_mut(id) {
            Some(connection) => {
                connection.ncci = ncci;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    type Table = ConnectionTable<()>;

    #[test]
    fn test_allocate_until_full() {
        // ---
        let mut table = Table::new(2);
        let a = table.allocate(Direction::Outbound).expect("first");
        let b = table.allocate(Direction::Inbound).expect("second");

        assert_ne!(a.slot(), b.slot());
        assert!(b.serial() > a.serial());
        assert_eq!(table.len(), 2);
        assert!(matches!(
            table.allocate(Direction::Outbound),
            Err(CapiError::NoFreeSlot(2))
        ));
    }

    #[test]
    fn test_released_slot_is_reused_zeroed() {
        // ---
        let mut table = Table::new(1);
        let a = table.allocate(Direction::Outbound).expect("allocate");
        {
            let conn = table.get_mut(a).expect("live");
            conn.plci = 0x101;
            conn.state = State::Connected;
            conn.source = "123".into();
        }

        assert!(table.release(a).is_some());
        assert!(table.is_empty());
        assert!(table.release(a).is_none());

        let b = table.allocate(Direction::Inbound).expect("reuse");
        assert_eq!(b.slot(), a.slot());
        assert!(table.get(a).is_none(), "stale id must not resolve");

        let conn = table.get(b).expect("live");
        assert_eq!(conn.plci, 0);
        assert_eq!(conn.state, State::Idle);
        assert!(conn.source.is_empty());
    }

    #[test]
    fn test_lookup_by_keys() {
        // ---
        let mut table = Table::new(3);
        let a = table.allocate(Direction::Outbound).expect("a");
        let b = table.allocate(Direction::Outbound).expect("b");

        assert!(table.assign_plci(a, 0x101));
        assert!(table.assign_plci(b, 0x201));
        assert!(table.assign_ncci(b, 0x1_0201));

        assert_eq!(table.find_plci(0x201), Some(b));
        assert_eq!(table.find_ncci(0x1_0201), Some(b));
        assert_eq!(table.find_plci(0), None);
        assert_eq!(table.find_ncci(0), None);
    }

    #[test]
    fn test_aliasing_keys_rejected() {
        // ---
        let mut table = Table::new(2);
        let a = table.allocate(Direction::Outbound).expect("a");
        let b = table.allocate(Direction::Outbound).expect("b");

        assert!(table.assign_plci(a, 0x101));
        assert!(!table.assign_plci(b, 0x101));
        assert!(table.assign_plci(a, 0x101), "reassigning own key is fine");

        assert!(table.assign_ncci(a, 0x1_0101));
        assert!(!table.assign_ncci(b, 0x1_0101));
    }

    #[test]
    fn test_pending_dial_is_oldest() {
        // ---
        let mut table = Table::new(3);
        let a = table.allocate(Direction::Outbound).expect("a");
        let b = table.allocate(Direction::Outbound).expect("b");
        table.get_mut(b).expect("b").state = State::ConnectReq;
        table.get_mut(a).expect("a").state = State::ConnectReq;

        assert_eq!(table.find_pending_dial(), Some(a));
        table.get_mut(a).expect("a").state = State::ConnectWait;
        assert_eq!(table.find_pending_dial(), Some(b));
    }

    #[test]
    fn test_transition_edges() {
        // ---
        use State::*;

        assert!(Idle.can_transition_to(ConnectReq));
        assert!(ConnectWait.can_transition_to(ConnectActive));
        assert!(Connected.can_transition_to(DisconnectB3Req));
        assert!(DisconnectActive.can_transition_to(ConnectActive));

        assert!(!Idle.can_transition_to(Connected));
        assert!(!Ringing.can_transition_to(Connected));
        assert!(!DisconnectWait.can_transition_to(Connected));
        assert!(!Idle.can_transition_to(Idle));

        for state in State::ALL {
            if state != Idle {
                assert!(state.can_transition_to(Idle), "{state:?} -> Idle");
            }
        }
    }
}
