//! Scripted in-memory adapter for tests and demos.
//!
//! [`MockAdapter`](struct.MockAdapter.html) records every call the engine makes and lets the
//! caller inject adapter events (state changes, connections, link loss, command completions)
//! at will. Clones share the same state, so keep one clone around after handing the other to
//! the [`Central`](../central/struct.Central.html).

use log::*;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::*;
use crate::adapter::*;
use crate::central::{CharacteristicRef, Command, CommandOutput, ConnectOptions, ScanOptions, Sequence};
use crate::error::AdapterError;

/// A call made by the engine to the adapter.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AdapterCall {
    Scan {
        services: Vec<Uuid>,
        options: ScanOptions,
    },
    StopScan,
    Connect {
        peripheral: Uuid,
    },
    CancelConnection {
        peripheral: Uuid,
    },
    Submit {
        peripheral: Uuid,
        sequence: Sequence,
        command: Command,
    },
}

#[derive(Default)]
struct MockState {
    calls: Vec<AdapterCall>,
    events: Option<EventSink>,
}

#[derive(Clone, Default)]
pub struct MockAdapter(Arc<Mutex<MockState>>);

impl MockAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// All calls recorded so far, oldest first.
    pub fn calls(&self) -> Vec<AdapterCall> {
        self.lock().calls.clone()
    }

    /// Returns the calls recorded so far and forgets them.
    pub fn take_calls(&self) -> Vec<AdapterCall> {
        std::mem::replace(&mut self.lock().calls, Vec::new())
    }

    /// Number of connection attempts issued for `peripheral`.
    pub fn connect_count(&self, peripheral: Uuid) -> usize {
        self.lock().calls.iter()
            .filter(|c| **c == AdapterCall::Connect { peripheral })
            .count()
    }

    /// Commands submitted to `peripheral`, in submission order.
    pub fn submitted(&self, peripheral: Uuid) -> Vec<(Sequence, Command)> {
        self.lock().calls.iter()
            .filter_map(|c| match c {
                AdapterCall::Submit { peripheral: p, sequence, command } if *p == peripheral =>
                    Some((*sequence, command.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn fake_state_change(&self, new_state: AdapterState) {
        self.send(AdapterEvent::StateChanged { new_state });
    }

    pub fn fake_discovery(&self, peripheral: Uuid, advertisement_data: AdvertisementData, rssi: i32) {
        self.send(AdapterEvent::PeripheralDiscovered { peripheral, advertisement_data, rssi });
    }

    /// Completes a connection attempt: successfully if `error` is `None`, with
    /// `PeripheralConnectFailed` otherwise.
    pub fn fake_connect(&self, peripheral: Uuid, error: Option<AdapterError>) {
        self.send(match error {
            None => AdapterEvent::PeripheralConnected { peripheral },
            error @ Some(_) => AdapterEvent::PeripheralConnectFailed { peripheral, error },
        });
    }

    pub fn fake_disconnect(&self, peripheral: Uuid, error: Option<AdapterError>) {
        self.send(AdapterEvent::PeripheralDisconnected { peripheral, error });
    }

    pub fn fake_command_completed(&self,
        peripheral: Uuid,
        sequence: Sequence,
        result: Result<CommandOutput, AdapterError>)
    {
        self.send(AdapterEvent::CommandCompleted { peripheral, sequence, result });
    }

    pub fn fake_value_update(&self, peripheral: Uuid, characteristic: CharacteristicRef, value: &[u8]) {
        self.send(AdapterEvent::ValueUpdated { peripheral, characteristic, value: value.to_vec() });
    }

    pub fn fake_restore(&self, peripherals: &[Uuid]) {
        self.send(AdapterEvent::Restored { peripherals: peripherals.to_vec() });
    }

    fn send(&self, event: AdapterEvent) {
        let events = self.lock().events.clone();
        match events {
            Some(events) => events.send(event),
            None => warn!("mock adapter isn't attached, dropping {:?}", event),
        }
    }

    fn record(&self, call: AdapterCall) {
        trace!("mock adapter: {:?}", call);
        self.lock().calls.push(call);
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        // Poisoned only if a callback panicked, the recorded calls are still intact.
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Adapter for MockAdapter {
    fn attach(&mut self, events: EventSink) {
        self.lock().events = Some(events);
    }

    fn scan(&mut self, services: &[Uuid], options: &ScanOptions) {
        self.record(AdapterCall::Scan {
            services: services.to_vec(),
            options: options.clone(),
        });
    }

    fn stop_scan(&mut self) {
        self.record(AdapterCall::StopScan);
    }

    fn connect(&mut self, peripheral: Uuid, _options: &ConnectOptions) {
        self.record(AdapterCall::Connect { peripheral });
    }

    fn cancel_connection(&mut self, peripheral: Uuid) {
        self.record(AdapterCall::CancelConnection { peripheral });
    }

    fn submit(&mut self, peripheral: Uuid, sequence: Sequence, command: &Command) {
        self.record(AdapterCall::Submit {
            peripheral,
            sequence,
            command: command.clone(),
        });
    }
}
