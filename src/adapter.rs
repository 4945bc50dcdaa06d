//! The boundary to the radio stack.
//!
//! An [`Adapter`](trait.Adapter.html) receives the commands the engine decides to issue, and reports
//! back everything that happens through the [`EventSink`](struct.EventSink.html) it gets attached to.
//! The adapter owns the link-layer protocol; the engine treats commands and their results as opaque.

use static_assertions::*;
use std::collections::HashMap;

use crate::*;
use crate::central::{CharacteristicRef, Command, CommandOutput, ConnectOptions, ScanOptions, Sequence};
use crate::central::engine::Engine;
use crate::error::AdapterError;
use crate::queue::Queue;

/// Outbound side of the radio stack. All methods are called from the central's queue, one at a
/// time, and must not block.
pub trait Adapter: Send + 'static {
    /// Called once before any other method. Events must be reported through `events`.
    fn attach(&mut self, events: EventSink);

    /// Starts scanning for peripherals advertising any of `services`, or all peripherals if
    /// `services` is empty. Replaces a scan already in progress.
    fn scan(&mut self, services: &[Uuid], options: &ScanOptions);

    fn stop_scan(&mut self);

    /// Initiates a connection. The outcome must be reported as either
    /// `PeripheralConnected` or `PeripheralConnectFailed`.
    fn connect(&mut self, peripheral: Uuid, options: &ConnectOptions);

    /// Cancels an active or pending connection. Must be confirmed with `PeripheralDisconnected`.
    fn cancel_connection(&mut self, peripheral: Uuid);

    /// Submits a command to a connected peripheral. The outcome must be reported as
    /// `CommandCompleted` carrying the same `sequence`.
    fn submit(&mut self, peripheral: Uuid, sequence: Sequence, command: &Command);
}

/// Events reported by the adapter.
#[derive(Debug)]
#[non_exhaustive]
pub enum AdapterEvent {
    CommandCompleted {
        peripheral: Uuid,
        sequence: Sequence,
        result: Result<CommandOutput, AdapterError>,
    },

    PeripheralConnected {
        peripheral: Uuid,
    },

    PeripheralConnectFailed {
        peripheral: Uuid,
        error: Option<AdapterError>,
    },

    /// Link lost, or a cancellation confirmed. `error` is `None` for a requested disconnection.
    PeripheralDisconnected {
        peripheral: Uuid,
        error: Option<AdapterError>,
    },

    PeripheralDiscovered {
        peripheral: Uuid,
        advertisement_data: AdvertisementData,
        rssi: i32,
    },

    /// The adapter process was restored and still knows about `peripherals`.
    Restored {
        peripherals: Vec<Uuid>,
    },

    StateChanged {
        new_state: AdapterState,
    },

    /// A notification or indication from a subscribed characteristic.
    ValueUpdated {
        peripheral: Uuid,
        characteristic: CharacteristicRef,
        value: Vec<u8>,
    },
}

assert_impl_all!(AdapterEvent: Send);

/// Handle through which an adapter reports events. Events are processed on the central's queue
/// in the order they were sent. Sending after the central is dropped is a no-op.
#[derive(Clone)]
pub struct EventSink {
    queue: Queue<Engine>,
}

assert_impl_all!(EventSink: Send);

impl EventSink {
    pub(in crate) fn new(queue: Queue<Engine>) -> Self {
        Self { queue }
    }

    pub fn send(&self, event: AdapterEvent) {
        self.queue.dispatch(move |engine| engine.handle_event(event));
    }
}

/// Advertisement payload of a discovered peripheral.
#[derive(Clone, Debug, Default)]
pub struct AdvertisementData {
    connectable: Option<bool>,
    local_name: Option<String>,
    manufacturer_data: Option<Vec<u8>>,
    service_data: ServiceData,
    service_uuids: Vec<Uuid>,
    solicited_service_uuids: Vec<Uuid>,
    overflow_service_uuids: Vec<Uuid>,
    tx_power_level: Option<i32>,
}

assert_impl_all!(AdvertisementData: Send, Sync);

impl AdvertisementData {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn with_connectable(mut self, v: bool) -> Self {
        self.connectable = Some(v);
        self
    }

    pub fn with_local_name(mut self, v: impl Into<String>) -> Self {
        self.local_name = Some(v.into());
        self
    }

    pub fn with_manufacturer_data(mut self, v: impl Into<Vec<u8>>) -> Self {
        self.manufacturer_data = Some(v.into());
        self
    }

    pub fn with_service_data(mut self, service: Uuid, v: impl Into<Vec<u8>>) -> Self {
        self.service_data.0.insert(service, v.into());
        self
    }

    pub fn with_service_uuids(mut self, v: &[Uuid]) -> Self {
        self.service_uuids.extend_from_slice(v);
        self
    }

    pub fn with_solicited_service_uuids(mut self, v: &[Uuid]) -> Self {
        self.solicited_service_uuids.extend_from_slice(v);
        self
    }

    pub fn with_overflow_service_uuids(mut self, v: &[Uuid]) -> Self {
        self.overflow_service_uuids.extend_from_slice(v);
        self
    }

    pub fn with_tx_power_level(mut self, v: i32) -> Self {
        self.tx_power_level = Some(v);
        self
    }

    /// Indicates whether the advertising event type is connectable.
    pub fn is_connectable(&self) -> Option<bool> {
        self.connectable
    }

    /// The local name of a peripheral.
    pub fn local_name(&self) -> Option<&str> {
        self.local_name.as_ref().map(|v| v.as_str())
    }

    /// The manufacturer data of a peripheral.
    pub fn manufacturer_data(&self) -> Option<&[u8]> {
        self.manufacturer_data.as_ref().map(|v| v.as_slice())
    }

    /// Service-specific advertisement data.
    pub fn service_data(&self) -> &ServiceData {
        &self.service_data
    }

    /// Service UUIDs.
    pub fn service_uuids(&self) -> &[Uuid] {
        &self.service_uuids
    }

    /// Service UUIDs found in the overflow area of the advertisement data.
    pub fn overflow_service_uuids(&self) -> &[Uuid] {
        &self.overflow_service_uuids
    }

    /// Solicited service UUIDs.
    pub fn solicited_service_uuids(&self) -> &[Uuid] {
        &self.solicited_service_uuids
    }

    /// The transmit power of a peripheral.
    pub fn tx_power_level(&self) -> Option<i32> {
        self.tx_power_level
    }

    /// Whether the peripheral advertises `service`, either directly, in the overflow area,
    /// or as a service data key.
    pub fn advertises(&self, service: Uuid) -> bool {
        self.service_uuids.contains(&service)
            || self.overflow_service_uuids.contains(&service)
            || self.service_data.get(service).is_some()
    }
}

/// Service-specific advertisement data. The keys represent Service UUIDs.
#[derive(Clone, Debug, Default)]
pub struct ServiceData(HashMap<Uuid, Vec<u8>>);

assert_impl_all!(ServiceData: Send, Sync);

impl ServiceData {
    pub fn get(&self, uuid: Uuid) -> Option<&[u8]> {
        self.0.get(&uuid).map(|v| v.as_slice())
    }

    pub fn keys<'a>(&'a self) -> impl Iterator<Item=Uuid> + 'a {
        self.0.keys().copied()
    }

    pub fn iter<'a>(&'a self) -> impl Iterator<Item=(Uuid, &'a [u8])> + 'a {
        self.0.iter().map(|(k, v)| (*k, v.as_slice()))
    }
}
