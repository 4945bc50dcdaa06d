//! Connection and command reconciliation for Bluetooth low energy peripherals.
//!
//! The crate sits on top of a raw [`Adapter`](adapter/trait.Adapter.html) (scan, connect,
//! disconnect, submit a command) and exposes a few high level intents instead:
//! discover peripherals, keep a peripheral connected, run a command against it.
//! The adapter is allowed to be unreliable: peripherals drop, the radio gets switched off,
//! the process behind the adapter crashes and comes back. The [`Central`](central/struct.Central.html)
//! reconnects peripherals it was asked to maintain and resubmits the commands that were lost
//! in flight, in their original order.
//!
//! Everything is serialized through a single queue: all calls and all adapter events are
//! processed one at a time on a dedicated thread, and all callbacks are invoked there.
//!
//! ## Example
//!
//! The following example drives the central with the [`MockAdapter`](mock/struct.MockAdapter.html).
//! A real application would pass its platform adapter instead.
//!
//! ```no_run
//! use ble_reconcile::*;
//! use ble_reconcile::central::*;
//! use ble_reconcile::mock::MockAdapter;
//!
//! let adapter = MockAdapter::new();
//! let central = Central::new(adapter.clone()).unwrap();
//!
//! let sensor: Uuid = "8b1c2d3e-0000-4000-8000-00805f9b34fb".parse().unwrap();
//! let characteristic = CharacteristicRef::new(
//!     "ebe0ccb0-7a0a-4b0c-8a1a-6ff2997da3a6".parse().unwrap(),
//!     "ebe0ccc1-7a0a-4b0c-8a1a-6ff2997da3a6".parse().unwrap());
//!
//! central.maintain_connection(sensor);
//! central.subscribe(sensor, characteristic, |value| {
//!     let t = i16::from_le_bytes([value[0], value[1]]) as f64 / 100.0;
//!     println!("t = {} C", t);
//! }, |result| {
//!     if let Err(e) = result {
//!         eprintln!("couldn't subscribe: {}", e);
//!     }
//! });
//!
//! adapter.fake_state_change(AdapterState::PoweredOn);
//! adapter.fake_connect(sensor, None);
//! central.sync();
//! ```
//!
//! You can find a longer walkthrough in the `demos` directory.
#![deny(dead_code)]
#![deny(non_snake_case)]
#![deny(unused_imports)]
#![deny(unused_must_use)]

#[macro_use]
mod macros;

pub mod adapter;
pub mod central;
pub mod error;
pub mod mock;
mod queue;
pub mod uuid;

use static_assertions::*;

pub use uuid::Uuid;

/// The possible states of the underlying Bluetooth adapter.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[non_exhaustive]
pub enum AdapterState {
    /// The adapter's state is unknown.
    Unknown = 0,

    /// The connection with the system service was momentarily lost.
    Resetting = 1,

    /// This device doesn’t support the Bluetooth low energy central role.
    Unsupported = 2,

    /// The application isn’t authorized to use the Bluetooth low energy role.
    Unauthorized = 3,

    /// Bluetooth is currently powered off.
    PoweredOff = 4,

    /// Bluetooth is currently powered on and available to use.
    PoweredOn = 5,
}

assert_impl_all!(AdapterState: Send, Sync);

impl AdapterState {
    pub(in crate) fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::Unknown,
            1 => Self::Resetting,
            2 => Self::Unsupported,
            3 => Self::Unauthorized,
            4 => Self::PoweredOff,
            5 => Self::PoweredOn,
            _ => return None,
        })
    }

    /// Whether commands may be dispatched to the adapter in this state.
    pub fn is_powered_on(self) -> bool {
        self == Self::PoweredOn
    }

    /// Whether the state is one the adapter doesn't recover from on its own.
    /// Work that needs the adapter fails immediately in a terminal state instead of waiting.
    pub fn is_terminal(self) -> bool {
        match self {
            Self::Unsupported | Self::Unauthorized => true,
            Self::Unknown | Self::Resetting | Self::PoweredOff | Self::PoweredOn => false,
        }
    }
}
