//! Walks a maintained connection through the failures a real adapter produces: the radio
//! powering on late, the link dropping and the adapter process resetting, while a few reads are
//! in flight. The mock adapter stands in for the radio.
use anyhow::{anyhow, Result};
use log::*;
use std::sync::mpsc;

use ble_reconcile::*;
use ble_reconcile::central::*;
use ble_reconcile::error::AdapterError;
use ble_reconcile::mock::{AdapterCall, MockAdapter};

const SERVICE: &str = "ebe0ccb0-7a0a-4b0c-8a1a-6ff2997da3a6";
const TEMPERATURE: &str = "ebe0ccc1-7a0a-4b0c-8a1a-6ff2997da3a6";

fn print_calls(adapter: &MockAdapter) {
    for call in adapter.take_calls() {
        match call {
            AdapterCall::Submit { sequence, command, .. } => println!("  -> submit {} {:?}", sequence, command),
            call => println!("  -> {:?}", call),
        }
    }
}

pub fn main() -> Result<()> {
    env_logger::init();

    let adapter = MockAdapter::new();
    let central = Central::builder()
        .queue_name("demo-central")
        .build(adapter.clone())?;

    let sensor: Uuid = "8b1c2d3e-0000-4000-8000-00805f9b34fb".parse()?;
    let characteristic = CharacteristicRef::new(SERVICE.parse()?, TEMPERATURE.parse()?);

    central.set_state_handler(|state| println!("adapter: {:?}", state));
    central.set_connection_handler(sensor, |p| println!("{} connected", p));
    central.set_disconnection_handler(sensor, |p, err| match err {
        Some(err) => println!("{} disconnected: {}", p, err),
        None => println!("{} disconnected", p),
    });

    println!("maintaining {} while the adapter is off", sensor);
    adapter.fake_state_change(AdapterState::PoweredOff);
    central.maintain_connection(sensor);
    for _ in 0..3 {
        central.read(sensor, characteristic, |r| match r {
            Ok(v) => println!("read {:02x?}", v),
            Err(e) => println!("read failed: {}", e),
        });
    }
    central.sync();
    print_calls(&adapter);

    println!("powering on");
    adapter.fake_state_change(AdapterState::PoweredOn);
    central.sync();
    print_calls(&adapter);

    adapter.fake_connect(sensor, None);
    central.sync();
    print_calls(&adapter);

    println!("dropping the link before any read completes");
    adapter.fake_disconnect(sensor, Some(AdapterError::new(8, "connection timed out")));
    adapter.fake_connect(sensor, None);
    central.sync();
    print_calls(&adapter);

    println!("resetting the adapter");
    adapter.fake_state_change(AdapterState::Resetting);
    adapter.fake_state_change(AdapterState::PoweredOn);
    adapter.fake_connect(sensor, None);
    central.sync();

    let submitted = adapter.submitted(sensor);
    print_calls(&adapter);
    for (sequence, _) in submitted {
        let raw = 2150i16 + sequence.get() as i16;
        adapter.fake_command_completed(sensor, sequence, Ok(CommandOutput::Value(raw.to_le_bytes().to_vec())));
    }

    let (tx, rx) = mpsc::channel();
    central.peripheral(sensor, move |s| {
        let _ = tx.send(s);
    });
    let snapshot = rx.recv()?.ok_or_else(|| anyhow!("{} is not tracked", sensor))?;
    info!("final state: {:?}", snapshot);
    println!("{} is {:?} with {} pending command(s)", sensor, snapshot.state, snapshot.pending_commands);

    let (tx, rx) = mpsc::channel();
    central.cancel_connection(sensor, move |r| {
        let _ = tx.send(r);
    });
    adapter.fake_disconnect(sensor, None);
    rx.recv()??;
    print_calls(&adapter);
    println!("done");

    Ok(())
}
