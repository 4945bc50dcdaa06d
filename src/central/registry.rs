use std::collections::HashMap;

use super::*;
use super::command::CommandLog;

/// Completion of a one-shot connection request or of a cancellation.
pub type ConnectHandler = Box<dyn FnOnce(Result<(), Error>) + Send>;

/// Persistent handler invoked on every transition into connected.
pub type PeripheralHandler = Box<dyn FnMut(Uuid) + Send>;

/// Persistent handler invoked on every transition out of connected.
/// The error is `None` when the disconnection was requested.
pub type DisconnectHandler = Box<dyn FnMut(Uuid, Option<&Error>) + Send>;

/// Persistent handler receiving the values of a subscribed characteristic.
pub type ValueHandler = Box<dyn FnMut(&[u8]) + Send>;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

assert_impl_all!(ConnectionState: Send, Sync);

/// Progress of the connection attempt of a `Connecting` peripheral.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(in crate) enum Attempt {
    None,
    /// Wanted, but the adapter isn't powered on.
    Scheduled,
    /// Issued to the adapter. The number tells attempts apart when a timeout fires.
    Outstanding(u64),
}

pub(in crate) struct PeripheralRecord {
    pub id: Uuid,
    pub maintained: bool,
    pub state: ConnectionState,
    pub attempt: Attempt,
    pub connect_handlers: Vec<ConnectHandler>,
    pub disconnect_handlers: Vec<ConnectHandler>,
    pub on_connect: Option<PeripheralHandler>,
    pub on_disconnect: Option<DisconnectHandler>,
    pub subscriptions: HashMap<CharacteristicRef, ValueHandler>,
    pub commands: CommandLog,
}

impl PeripheralRecord {
    fn new(id: Uuid) -> Self {
        Self {
            id,
            maintained: false,
            state: ConnectionState::Disconnected,
            attempt: Attempt::None,
            connect_handlers: Vec::new(),
            disconnect_handlers: Vec::new(),
            on_connect: None,
            on_disconnect: None,
            subscriptions: HashMap::new(),
            commands: CommandLog::default(),
        }
    }

    /// Whether anything on this record still needs the peripheral to be connected.
    pub fn wants_connection(&self) -> bool {
        self.maintained || !self.connect_handlers.is_empty() || !self.commands.is_empty()
    }

    /// Whether the record holds nothing worth keeping.
    pub fn is_idle(&self) -> bool {
        self.state == ConnectionState::Disconnected
            && !self.wants_connection()
            && self.disconnect_handlers.is_empty()
            && self.on_connect.is_none()
            && self.on_disconnect.is_none()
            && self.subscriptions.is_empty()
    }

    pub fn fail_connect_handlers(&mut self, error: &Error) {
        for h in self.connect_handlers.drain(..) {
            h(Err(error.clone()));
        }
    }

    pub fn succeed_connect_handlers(&mut self) {
        for h in self.connect_handlers.drain(..) {
            h(Ok(()));
        }
    }

    pub fn snapshot(&self) -> PeripheralSnapshot {
        PeripheralSnapshot {
            id: self.id,
            maintained: self.maintained,
            state: self.state,
            pending_commands: self.commands.len(),
        }
    }
}

/// Point-in-time view of a tracked peripheral.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PeripheralSnapshot {
    pub id: Uuid,
    pub maintained: bool,
    pub state: ConnectionState,
    pub pending_commands: usize,
}

assert_impl_all!(PeripheralSnapshot: Send, Sync);

#[derive(Default)]
pub(in crate) struct Registry {
    records: HashMap<Uuid, PeripheralRecord>,
}

impl Registry {
    pub fn get(&self, id: Uuid) -> Option<&PeripheralRecord> {
        self.records.get(&id)
    }

    pub fn get_mut(&mut self, id: Uuid) -> Option<&mut PeripheralRecord> {
        self.records.get_mut(&id)
    }

    /// Returns the record of `id`, creating it on first reference.
    pub fn get_or_insert(&mut self, id: Uuid) -> &mut PeripheralRecord {
        self.records.entry(id).or_insert_with(|| PeripheralRecord::new(id))
    }

    pub fn remove_if_idle(&mut self, id: Uuid) -> bool {
        if self.records.get(&id).map(|r| r.is_idle()).unwrap_or(false) {
            self.records.remove(&id);
            true
        } else {
            false
        }
    }

    /// Ids of all records, sorted so that fan-out over peripherals is deterministic.
    pub fn ids(&self) -> Vec<Uuid> {
        let mut r: Vec<_> = self.records.keys().copied().collect();
        r.sort();
        r
    }

    pub fn iter(&self) -> impl Iterator<Item=&PeripheralRecord> {
        self.records.values()
    }
}
