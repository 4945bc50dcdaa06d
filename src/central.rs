//! Central role: discovering peripherals, keeping them connected and running commands against them.

mod command;
pub(in crate) mod engine;
mod registry;
mod scan;

use enumflags2::BitFlags;
use log::*;
use static_assertions::*;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use crate::*;
use crate::adapter::*;
use crate::error::*;
use crate::queue::Queue;

pub use command::{CharacteristicRef, Command, CommandHandler, CommandOutput, Sequence, WriteKind};
pub use registry::{ConnectHandler, ConnectionState, DisconnectHandler, PeripheralHandler,
    PeripheralSnapshot, ValueHandler};
pub use scan::{Discovery, DiscoveryHandler, ErrorHandler};

use engine::Engine;

const DEFAULT_QUEUE_NAME: &str = "ble-central";

pub struct CentralBuilder {
    queue_name: String,
    connect_options: ConnectOptions,
    connect_timeout: Option<Duration>,
}

impl CentralBuilder {
    pub fn new() -> Self {
        Self {
            queue_name: DEFAULT_QUEUE_NAME.into(),
            connect_options: ConnectOptions::default(),
            connect_timeout: None,
        }
    }

    /// Name of the thread running the central's queue.
    pub fn queue_name(&mut self, v: impl Into<String>) -> &mut Self {
        self.queue_name = v.into();
        self
    }

    /// Options passed to the adapter with every connection attempt.
    pub fn connect_options(&mut self, v: ConnectOptions) -> &mut Self {
        self.connect_options = v;
        self
    }

    /// Fails connection requests that don't complete within `v`. Disabled by default.
    ///
    /// Peripherals with a maintained connection keep their attempt going after the timeout,
    /// only the callers waiting on it are notified.
    pub fn connect_timeout(&mut self, v: Option<Duration>) -> &mut Self {
        self.connect_timeout = v;
        self
    }

    pub fn build(&self, adapter: impl Adapter) -> io::Result<Central> {
        Central::build(self, Box::new(adapter))
    }
}

assert_impl_all!(CentralBuilder: Send, Sync);

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ScanOptions {
    allow_duplicates: bool,
    solicited_services: Vec<Uuid>,
}

impl ScanOptions {
    /// Report every advertisement of a peripheral rather than only the first one.
    pub fn allow_duplicates(mut self, v: bool) -> Self {
        self.allow_duplicates = v;
        self
    }

    pub fn solicited_services(mut self, uuids: &[Uuid]) -> Self {
        self.solicited_services.extend_from_slice(uuids);
        self
    }

    pub fn is_allow_duplicates(&self) -> bool {
        self.allow_duplicates
    }

    pub fn solicited_service_uuids(&self) -> &[Uuid] {
        &self.solicited_services
    }
}

assert_impl_all!(ScanOptions: Send, Sync);

#[derive(BitFlags, Copy, Clone, Debug, Eq, Hash, PartialEq)]
#[repr(u8)]
enum ConnectNotify {
    Connection      = 0x01,
    Disconnection   = 0x02,
    Notification    = 0x04,
}

#[derive(Clone, Copy, Eq, PartialEq)]
pub struct ConnectOptions {
    notify: BitFlags<ConnectNotify>,
    start_delay: Option<Duration>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            notify: BitFlags::empty(),
            start_delay: None,
        }
    }
}

flag_options!(ConnectOptions.notify: ConnectNotify {
    #[doc="Alert the user when the peripheral connects while the app is suspended."]
    notify_on_connection, is_notify_on_connection => Connection,

    #[doc="Alert the user when the peripheral disconnects while the app is suspended."]
    notify_on_disconnection, is_notify_on_disconnection => Disconnection,

    #[doc="Alert the user of notifications received while the app is suspended."]
    notify_on_notification, is_notify_on_notification => Notification,
});

impl ConnectOptions {
    /// Delay before the adapter starts connecting.
    pub fn start_delay(mut self, v: Duration) -> Self {
        self.start_delay = Some(v);
        self
    }

    pub fn get_start_delay(&self) -> Option<Duration> {
        self.start_delay
    }
}

assert_impl_all!(ConnectOptions: Send, Sync);

impl fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("notify", &NotifyDebug(self.notify))
            .field("start_delay", &self.start_delay)
            .finish()
    }
}

struct NotifyDebug(BitFlags<ConnectNotify>);

impl fmt::Debug for NotifyDebug {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_set().entries(self.0.iter()).finish()
    }
}

struct Inner {
    queue: Queue<Engine>,
    state: Arc<AtomicU8>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.queue.stop();
    }
}

/// Handle to the reconciliation engine. Cheap to clone; the engine stops when the last clone
/// is dropped.
///
/// Every method only posts work to the central's queue and returns immediately. Callbacks are
/// invoked on the queue, never on the calling thread. Callbacks must not panic: a panic stops
/// the queue and every later call is dropped.
#[derive(Clone)]
pub struct Central(Arc<Inner>);

assert_impl_all!(Central: Send, Sync);

impl Central {
    pub fn new(adapter: impl Adapter) -> io::Result<Self> {
        CentralBuilder::new().build(adapter)
    }

    pub fn builder() -> CentralBuilder {
        CentralBuilder::new()
    }

    /// The last state reported by the adapter.
    pub fn state(&self) -> AdapterState {
        AdapterState::from_u8(self.0.state.load(Ordering::SeqCst))
            .unwrap_or(AdapterState::Unknown)
    }

    /// Invoked with every state reported by the adapter.
    pub fn set_state_handler(&self, handler: impl FnMut(AdapterState) + Send + 'static) {
        let handler: engine::StateHandler = Box::new(handler);
        self.dispatch(move |e| e.set_state_handler(Some(handler)));
    }

    /// Invoked with the peripherals the adapter still knew about after its process was restored.
    pub fn set_restoration_handler(&self, handler: impl FnMut(&[Uuid]) + Send + 'static) {
        let handler: engine::RestorationHandler = Box::new(handler);
        self.dispatch(move |e| e.set_restoration_handler(Some(handler)));
    }

    /// Scans for peripherals advertising any of `services` (all peripherals if empty).
    /// Replaces the previous scan, if any.
    ///
    /// `on_error` is invoked if the adapter is, or later becomes, unusable; the scan ends then.
    pub fn scan(&self,
        services: &[Uuid],
        options: ScanOptions,
        on_discovered: impl FnMut(Discovery) + Send + 'static,
        on_error: impl FnOnce(Error) + Send + 'static)
    {
        let services = services.to_vec();
        let on_discovered: DiscoveryHandler = Box::new(on_discovered);
        let on_error: ErrorHandler = Box::new(on_error);
        self.dispatch(move |e| e.scan(services, options, on_discovered, on_error));
    }

    pub fn stop_scan(&self) {
        self.dispatch(|e| e.stop_scan());
    }

    /// Keeps the peripheral connected, reconnecting whenever the connection is lost, until
    /// [`cancel_connection`](#method.cancel_connection) is called.
    pub fn maintain_connection(&self, peripheral: Uuid) {
        self.dispatch(move |e| e.maintain_connection(peripheral));
    }

    /// Connects to the peripheral if not connected yet. `on_complete` receives the outcome of the
    /// next connection attempt. Commands connect on their own, so this is rarely needed.
    pub fn connect(&self, peripheral: Uuid, on_complete: impl FnOnce(Result<(), Error>) + Send + 'static) {
        let on_complete: ConnectHandler = Box::new(on_complete);
        self.dispatch(move |e| e.connect(peripheral, on_complete));
    }

    /// Cancels the connection and everything that depends on it: the maintained flag, the
    /// connection and disconnection handlers, subscriptions and pending commands, which fail with
    /// `ConnectionCancelled`. `on_complete` is invoked once the adapter confirms the
    /// disconnection, or right away if not connected.
    pub fn cancel_connection(&self, peripheral: Uuid, on_complete: impl FnOnce(Result<(), Error>) + Send + 'static) {
        let on_complete: ConnectHandler = Box::new(on_complete);
        self.dispatch(move |e| e.cancel_connection(peripheral, on_complete));
    }

    /// Invoked on every connection of the peripheral.
    pub fn set_connection_handler(&self, peripheral: Uuid, handler: impl FnMut(Uuid) + Send + 'static) {
        let handler: PeripheralHandler = Box::new(handler);
        self.dispatch(move |e| e.set_connection_handler(peripheral, Some(handler)));
    }

    pub fn clear_connection_handler(&self, peripheral: Uuid) {
        self.dispatch(move |e| e.set_connection_handler(peripheral, None));
    }

    /// Invoked on every disconnection of the peripheral.
    pub fn set_disconnection_handler(&self, peripheral: Uuid,
        handler: impl FnMut(Uuid, Option<&Error>) + Send + 'static)
    {
        let handler: DisconnectHandler = Box::new(handler);
        self.dispatch(move |e| e.set_disconnection_handler(peripheral, Some(handler)));
    }

    pub fn clear_disconnection_handler(&self, peripheral: Uuid) {
        self.dispatch(move |e| e.set_disconnection_handler(peripheral, None));
    }

    /// Runs `command` against the peripheral, connecting first if needed. If the connection is
    /// lost before the adapter acknowledges the command, it's resubmitted after reconnecting.
    pub fn enqueue(&self,
        peripheral: Uuid,
        command: Command,
        on_complete: impl FnOnce(Result<CommandOutput, Error>) + Send + 'static)
    {
        let on_complete: CommandHandler = Box::new(on_complete);
        self.dispatch(move |e| e.enqueue(peripheral, command, Some(on_complete)));
    }

    pub fn read(&self,
        peripheral: Uuid,
        characteristic: CharacteristicRef,
        on_complete: impl FnOnce(Result<Vec<u8>, Error>) + Send + 'static)
    {
        self.enqueue(peripheral, Command::Read { characteristic }, move |r| {
            on_complete(r.map(|out| match out {
                CommandOutput::Value(v) => v,
                out => {
                    warn!("read of {:?} produced {:?} instead of a value", characteristic, out);
                    Vec::new()
                }
            }))
        });
    }

    pub fn write(&self,
        peripheral: Uuid,
        characteristic: CharacteristicRef,
        value: &[u8],
        kind: WriteKind,
        on_complete: impl FnOnce(Result<(), Error>) + Send + 'static)
    {
        let command = Command::Write {
            characteristic,
            value: value.to_vec(),
            kind,
        };
        self.enqueue(peripheral, command, move |r| on_complete(r.map(|_| ())));
    }

    /// Enables notifications of the characteristic. `on_value` receives every value until
    /// [`unsubscribe`](#method.unsubscribe) or `cancel_connection`; notifications are enabled
    /// again after every reconnection.
    pub fn subscribe(&self,
        peripheral: Uuid,
        characteristic: CharacteristicRef,
        on_value: impl FnMut(&[u8]) + Send + 'static,
        on_complete: impl FnOnce(Result<(), Error>) + Send + 'static)
    {
        let on_value: ValueHandler = Box::new(on_value);
        let on_complete: CommandHandler = Box::new(move |r| on_complete(r.map(|_| ())));
        self.dispatch(move |e| e.subscribe(peripheral, characteristic, on_value, on_complete));
    }

    pub fn unsubscribe(&self,
        peripheral: Uuid,
        characteristic: CharacteristicRef,
        on_complete: impl FnOnce(Result<(), Error>) + Send + 'static)
    {
        let on_complete: CommandHandler = Box::new(move |r| on_complete(r.map(|_| ())));
        self.dispatch(move |e| e.unsubscribe(peripheral, characteristic, on_complete));
    }

    /// Looks up the tracked state of the peripheral.
    pub fn peripheral(&self, peripheral: Uuid, f: impl FnOnce(Option<PeripheralSnapshot>) + Send + 'static) {
        self.dispatch(move |e| f(e.snapshot(peripheral)));
    }

    /// Lists all tracked peripherals, ordered by id.
    pub fn peripherals(&self, f: impl FnOnce(Vec<PeripheralSnapshot>) + Send + 'static) {
        self.dispatch(move |e| f(e.snapshots()));
    }

    /// Blocks until all work posted before this call, including adapter events, has been processed.
    /// Must not be called from a callback.
    pub fn sync(&self) {
        self.0.queue.sync();
    }

    fn dispatch(&self, task: impl FnOnce(&mut Engine) + Send + 'static) {
        self.0.queue.dispatch(task);
    }

    fn build(b: &CentralBuilder, mut adapter: Box<dyn Adapter>) -> io::Result<Self> {
        let state = Arc::new(AtomicU8::new(AdapterState::Unknown as u8));
        let config = engine::Config {
            connect_options: b.connect_options,
            connect_timeout: b.connect_timeout,
        };
        let mirror = state.clone();
        let (queue, worker) = Queue::new();

        // Events the adapter reports as soon as `build` returns must already reach the queue.
        adapter.attach(EventSink::new(queue.clone()));
        let engine_queue = queue.clone();
        worker.start(b.queue_name.clone(), move || {
            Engine::new(adapter, engine_queue, config, mirror)
        })?;
        Ok(Self(Arc::new(Inner {
            queue,
            state,
        })))
    }
}
