//! The reconciliation engine: compares what callers want (maintained connections, pending
//! commands, an active scan) with what the adapter reports, and issues the adapter commands
//! needed to close the gap.
//!
//! The engine runs exclusively on the central's queue, so every method runs to completion
//! before the next event or call is looked at.

use log::*;

use super::*;
use super::registry::{Attempt, Registry};
use super::scan::ScanSession;

pub type StateHandler = Box<dyn FnMut(AdapterState) + Send>;
pub type RestorationHandler = Box<dyn FnMut(&[Uuid]) + Send>;

pub struct Config {
    pub connect_options: ConnectOptions,
    pub connect_timeout: Option<Duration>,
}

pub struct Engine {
    adapter: Box<dyn Adapter>,
    queue: Queue<Engine>,
    config: Config,
    state: AdapterState,
    state_mirror: Arc<AtomicU8>,
    /// Incremented every time the adapter leaves `PoweredOn`. Work submitted in an older epoch
    /// was lost with the adapter session.
    epoch: u64,
    next_sequence: u64,
    next_attempt: u64,
    registry: Registry,
    scan: Option<ScanSession>,
    state_handler: Option<StateHandler>,
    restoration_handler: Option<RestorationHandler>,
}

impl Engine {
    /// `adapter` must already be attached to an `EventSink` of `queue`.
    pub fn new(adapter: Box<dyn Adapter>,
        queue: Queue<Engine>,
        config: Config,
        state_mirror: Arc<AtomicU8>) -> Self
    {
        Self {
            adapter,
            queue,
            config,
            state: AdapterState::Unknown,
            state_mirror,
            epoch: 0,
            next_sequence: 1,
            next_attempt: 1,
            registry: Registry::default(),
            scan: None,
            state_handler: None,
            restoration_handler: None,
        }
    }

    pub fn handle_event(&mut self, event: AdapterEvent) {
        trace!("adapter event: {:?}", event);
        match event {
            AdapterEvent::CommandCompleted { peripheral, sequence, result } =>
                self.command_completed(peripheral, sequence, result),
            AdapterEvent::PeripheralConnected { peripheral } =>
                self.peripheral_connected(peripheral),
            AdapterEvent::PeripheralConnectFailed { peripheral, error } =>
                self.peripheral_connect_failed(peripheral, error),
            AdapterEvent::PeripheralDisconnected { peripheral, error } =>
                self.peripheral_disconnected(peripheral, error),
            AdapterEvent::PeripheralDiscovered { peripheral, advertisement_data, rssi } =>
                self.peripheral_discovered(Discovery { peripheral, advertisement_data, rssi }),
            AdapterEvent::Restored { peripherals } =>
                self.restored(peripherals),
            AdapterEvent::StateChanged { new_state } =>
                self.state_changed(new_state),
            AdapterEvent::ValueUpdated { peripheral, characteristic, value } =>
                self.value_updated(peripheral, characteristic, value),
        }
    }

    pub fn set_state_handler(&mut self, handler: Option<StateHandler>) {
        self.state_handler = handler;
    }

    pub fn set_restoration_handler(&mut self, handler: Option<RestorationHandler>) {
        self.restoration_handler = handler;
    }

    pub fn scan(&mut self,
        services: Vec<Uuid>,
        options: ScanOptions,
        on_discovered: DiscoveryHandler,
        on_error: ErrorHandler)
    {
        if self.scan.take().is_some() {
            debug!("replacing active scan");
        }
        let session = ScanSession::new(services, options, on_discovered, Some(on_error));
        if self.state.is_terminal() {
            session.fail(Error::adapter_unavailable(self.state));
            return;
        }
        if self.state.is_powered_on() {
            info!("scanning for {:?}", session.services);
            self.adapter.scan(&session.services, &session.options);
        } else {
            debug!("scan deferred until powered on ({:?})", self.state);
        }
        self.scan = Some(session);
    }

    pub fn stop_scan(&mut self) {
        if self.scan.take().is_none() {
            return;
        }
        info!("stopping scan");
        if self.state.is_powered_on() {
            self.adapter.stop_scan();
        }
    }

    pub fn maintain_connection(&mut self, id: Uuid) {
        let rec = self.registry.get_or_insert(id);
        if !rec.maintained {
            info!("maintaining connection to {}", id);
            rec.maintained = true;
        }
        self.request_connection(id);
    }

    pub fn connect(&mut self, id: Uuid, on_complete: ConnectHandler) {
        if self.state.is_terminal() {
            on_complete(Err(Error::adapter_unavailable(self.state)));
            return;
        }
        let rec = self.registry.get_or_insert(id);
        match rec.state {
            ConnectionState::Connected => on_complete(Ok(())),
            ConnectionState::Connecting | ConnectionState::Disconnecting => {
                rec.connect_handlers.push(on_complete);
            }
            ConnectionState::Disconnected => {
                rec.connect_handlers.push(on_complete);
                self.request_connection(id);
            }
        }
    }

    pub fn cancel_connection(&mut self, id: Uuid, on_complete: ConnectHandler) {
        let rec = if let Some(rec) = self.registry.get_mut(id) {
            rec
        } else {
            on_complete(Ok(()));
            return;
        };
        info!("cancelling connection to {}", id);

        rec.maintained = false;
        rec.on_connect = None;
        rec.on_disconnect = None;
        rec.subscriptions.clear();
        let cancelled = Error::connection_cancelled();
        rec.fail_connect_handlers(&cancelled);
        rec.commands.fail_all(&cancelled);

        match (rec.state, rec.attempt) {
            (ConnectionState::Connected, _)
            | (ConnectionState::Connecting, Attempt::Outstanding(_)) => {
                rec.state = ConnectionState::Disconnecting;
                rec.attempt = Attempt::None;
                rec.disconnect_handlers.push(on_complete);
                if self.state.is_powered_on() {
                    self.adapter.cancel_connection(id);
                } else {
                    debug!("cancellation of {} deferred until powered on ({:?})", id, self.state);
                }
            }
            (ConnectionState::Disconnecting, _) => rec.disconnect_handlers.push(on_complete),
            (ConnectionState::Connecting, _) | (ConnectionState::Disconnected, _) => {
                rec.state = ConnectionState::Disconnected;
                rec.attempt = Attempt::None;
                on_complete(Ok(()));
                self.registry.remove_if_idle(id);
            }
        }
    }

    pub fn set_connection_handler(&mut self, id: Uuid, handler: Option<PeripheralHandler>) {
        self.registry.get_or_insert(id).on_connect = handler;
    }

    pub fn set_disconnection_handler(&mut self, id: Uuid, handler: Option<DisconnectHandler>) {
        self.registry.get_or_insert(id).on_disconnect = handler;
    }

    pub fn enqueue(&mut self, id: Uuid, command: Command, on_complete: Option<CommandHandler>) {
        if self.state.is_terminal() {
            if let Some(on_complete) = on_complete {
                on_complete(Err(Error::adapter_unavailable(self.state)));
            }
            return;
        }
        let sequence = self.sequence();
        let rec = self.registry.get_or_insert(id);
        trace!("enqueued {} for {}: {:?}", sequence, id, command);
        rec.commands.push(sequence, command, on_complete);
        match rec.state {
            ConnectionState::Connected => self.flush(id),
            ConnectionState::Disconnected => self.request_connection(id),
            ConnectionState::Connecting | ConnectionState::Disconnecting => {}
        }
    }

    pub fn subscribe(&mut self,
        id: Uuid,
        characteristic: CharacteristicRef,
        on_value: ValueHandler,
        on_complete: CommandHandler)
    {
        if self.state.is_terminal() {
            on_complete(Err(Error::adapter_unavailable(self.state)));
            return;
        }
        self.registry.get_or_insert(id).subscriptions.insert(characteristic, on_value);
        self.enqueue(id, Command::SetNotify { characteristic, enabled: true }, Some(on_complete));
    }

    pub fn unsubscribe(&mut self, id: Uuid, characteristic: CharacteristicRef, on_complete: CommandHandler) {
        let state = match self.registry.get_mut(id) {
            Some(rec) => {
                rec.subscriptions.remove(&characteristic);
                rec.state
            }
            None => ConnectionState::Disconnected,
        };
        match state {
            ConnectionState::Connected | ConnectionState::Connecting => {
                self.enqueue(id, Command::SetNotify { characteristic, enabled: false }, Some(on_complete));
            }
            // Notifications don't survive the link.
            ConnectionState::Disconnected | ConnectionState::Disconnecting => {
                on_complete(Ok(CommandOutput::Done));
            }
        }
    }

    pub fn snapshot(&self, id: Uuid) -> Option<PeripheralSnapshot> {
        self.registry.get(id).map(|r| r.snapshot())
    }

    pub fn snapshots(&self) -> Vec<PeripheralSnapshot> {
        let mut r: Vec<_> = self.registry.iter().map(|r| r.snapshot()).collect();
        r.sort_by_key(|s| s.id);
        r
    }

    fn sequence(&mut self) -> Sequence {
        let r = Sequence(self.next_sequence);
        self.next_sequence += 1;
        r
    }

    /// Moves a disconnected peripheral to `Connecting`. No-op if a connection is already under way
    /// or a disconnection is being confirmed; the latter is re-examined once confirmed.
    fn request_connection(&mut self, id: Uuid) {
        let rec = if let Some(rec) = self.registry.get_mut(id) {
            rec
        } else {
            return;
        };
        if rec.state != ConnectionState::Disconnected {
            return;
        }
        rec.state = ConnectionState::Connecting;
        rec.attempt = Attempt::Scheduled;
        self.issue_connect(id);
    }

    /// Sends the connect command of a `Connecting` peripheral if the adapter is usable.
    /// Otherwise the attempt stays scheduled until the adapter powers on.
    fn issue_connect(&mut self, id: Uuid) {
        if !self.state.is_powered_on() {
            debug!("connection to {} deferred until powered on ({:?})", id, self.state);
            return;
        }
        let attempt = self.next_attempt;
        self.next_attempt += 1;
        if let Some(rec) = self.registry.get_mut(id) {
            rec.attempt = Attempt::Outstanding(attempt);
        }
        debug!("connecting to {}", id);
        self.adapter.connect(id, &self.config.connect_options);
        if let Some(timeout) = self.config.connect_timeout {
            self.queue.dispatch_after(timeout, move |e| e.connect_timed_out(id, attempt));
        }
    }

    /// Submits every command of a connected peripheral that wasn't submitted over the current
    /// link, oldest first.
    fn flush(&mut self, id: Uuid) {
        if !self.state.is_powered_on() {
            return;
        }
        let epoch = self.epoch;
        let rec = match self.registry.get_mut(id) {
            Some(rec) if rec.state == ConnectionState::Connected => rec,
            _ => return,
        };
        for e in rec.commands.stale(epoch) {
            trace!("submitting {} to {}", e.sequence, id);
            self.adapter.submit(id, e.sequence, &e.command);
            e.submitted_in = Some(epoch);
        }
    }

    fn state_changed(&mut self, new_state: AdapterState) {
        let old_state = self.state;
        self.state = new_state;
        self.state_mirror.store(new_state as u8, Ordering::SeqCst);
        if old_state == new_state {
            trace!("adapter state unchanged: {:?}", new_state);
        } else {
            info!("adapter state changed: {:?} -> {:?}", old_state, new_state);
            if old_state.is_powered_on() {
                self.invalidate_session();
            }
            if new_state.is_terminal() {
                self.fail_everything(Error::adapter_unavailable(new_state));
            } else if new_state.is_powered_on() {
                self.resume();
            }
        }
        if let Some(handler) = &mut self.state_handler {
            handler(new_state);
        }
    }

    /// The adapter left `PoweredOn`: every connection and attempt it was handling is gone.
    fn invalidate_session(&mut self) {
        self.epoch += 1;
        warn!("adapter session lost ({:?}), now in epoch {}", self.state, self.epoch);
        let lost = Error::adapter_unavailable(self.state);
        for id in self.registry.ids() {
            let rec = if let Some(rec) = self.registry.get_mut(id) {
                rec
            } else {
                continue;
            };
            let was = rec.state;
            rec.attempt = Attempt::None;
            match was {
                ConnectionState::Disconnected => continue,
                ConnectionState::Connected => {
                    if let Some(on_disconnect) = &mut rec.on_disconnect {
                        on_disconnect(id, Some(&lost));
                    }
                }
                ConnectionState::Disconnecting => {
                    for h in rec.disconnect_handlers.drain(..) {
                        h(Ok(()));
                    }
                }
                ConnectionState::Connecting => {}
            }
            if rec.wants_connection() {
                rec.state = ConnectionState::Connecting;
                rec.attempt = Attempt::Scheduled;
            } else {
                rec.state = ConnectionState::Disconnected;
                if was == ConnectionState::Disconnecting {
                    self.registry.remove_if_idle(id);
                }
            }
        }
    }

    /// The adapter entered a terminal state: everybody waiting for it fails. Maintained
    /// peripherals keep their intent in case the adapter ever recovers.
    fn fail_everything(&mut self, error: Error) {
        warn!("{}, failing all pending work", error);
        for id in self.registry.ids() {
            let rec = if let Some(rec) = self.registry.get_mut(id) {
                rec
            } else {
                continue;
            };
            rec.fail_connect_handlers(&error);
            rec.commands.fail_all(&error);
            if rec.state == ConnectionState::Connecting && !rec.wants_connection() {
                rec.state = ConnectionState::Disconnected;
                rec.attempt = Attempt::None;
            }
        }
        if let Some(scan) = self.scan.take() {
            scan.fail(error);
        }
    }

    /// The adapter powered on: issue the connections that were waiting for it and restart the scan.
    fn resume(&mut self) {
        let epoch = self.epoch;
        for id in self.registry.ids() {
            let rec = if let Some(rec) = self.registry.get_mut(id) {
                rec
            } else {
                continue;
            };
            let stale = rec.commands.stale(epoch).count();
            match rec.state {
                ConnectionState::Connecting if rec.attempt == Attempt::Scheduled => {}
                ConnectionState::Disconnected if rec.wants_connection() => {
                    rec.state = ConnectionState::Connecting;
                    rec.attempt = Attempt::Scheduled;
                }
                ConnectionState::Connected => {
                    self.flush(id);
                    continue;
                }
                // Cancelled while the adapter was gated.
                ConnectionState::Disconnecting => {
                    debug!("cancelling connection to {}", id);
                    self.adapter.cancel_connection(id);
                    continue;
                }
                _ => continue,
            }
            if stale > 0 {
                info!("{} command(s) of {} will be resubmitted once reconnected", stale, id);
            }
            self.issue_connect(id);
        }
        if let Some(scan) = &self.scan {
            info!("resuming scan for {:?}", scan.services);
            self.adapter.scan(&scan.services, &scan.options);
        }
    }

    fn peripheral_connected(&mut self, id: Uuid) {
        let rec = self.registry.get_or_insert(id);
        match rec.state {
            ConnectionState::Connected => {
                trace!("{} is already connected", id);
                return;
            }
            ConnectionState::Disconnecting => {
                debug!("{} connected while cancelling, waiting for the disconnection", id);
                return;
            }
            ConnectionState::Connecting | ConnectionState::Disconnected => {}
        }
        info!("connected to {}", id);
        rec.state = ConnectionState::Connected;
        rec.attempt = Attempt::None;
        rec.succeed_connect_handlers();
        if let Some(on_connect) = &mut rec.on_connect {
            on_connect(id);
        }

        let mut characteristics: Vec<_> = rec.subscriptions.keys().copied().collect();
        characteristics.sort();
        let resubscribe: Vec<_> = characteristics.into_iter()
            .map(|characteristic| Command::SetNotify { characteristic, enabled: true })
            .filter(|c| !rec.commands.contains(c))
            .collect();
        for command in resubscribe {
            let sequence = self.sequence();
            debug!("re-enabling notifications of {} with {}", id, sequence);
            if let Some(rec) = self.registry.get_mut(id) {
                rec.commands.push(sequence, command, None);
            }
        }
        self.flush(id);
    }

    fn peripheral_connect_failed(&mut self, id: Uuid, error: Option<AdapterError>) {
        let state = self.registry.get(id).map(|r| (r.state, r.attempt));
        match state {
            Some((ConnectionState::Connecting, Attempt::Scheduled)) => self.session_teardown(id),
            Some((ConnectionState::Connecting, _)) => self.link_lost(id, false, error),
            // The attempt was being cancelled, its failure confirms the cancellation.
            Some((ConnectionState::Disconnecting, _)) => self.disconnection_confirmed(id),
            _ => debug!("ignoring connection failure of {} in state {:?}", id, state),
        }
    }

    fn peripheral_disconnected(&mut self, id: Uuid, error: Option<AdapterError>) {
        let state = self.registry.get(id).map(|r| (r.state, r.attempt));
        match state {
            Some((ConnectionState::Connected, _)) => self.link_lost(id, true, error),
            Some((ConnectionState::Connecting, Attempt::Scheduled)) => self.session_teardown(id),
            Some((ConnectionState::Connecting, _)) => self.link_lost(id, false, error),
            Some((ConnectionState::Disconnecting, _)) => self.disconnection_confirmed(id),
            _ => trace!("ignoring disconnection of {} in state {:?}", id, state),
        }
    }

    /// A link or attempt the adapter tears down after its session was invalidated. The session
    /// loss has already been handled and the work is waiting for the next power-on.
    fn session_teardown(&self, id: Uuid) {
        debug!("{} went down with the previous adapter session", id);
    }

    /// A disconnection the engine asked for has completed.
    fn disconnection_confirmed(&mut self, id: Uuid) {
        let rec = if let Some(rec) = self.registry.get_mut(id) {
            rec
        } else {
            return;
        };
        info!("disconnected from {}", id);
        rec.state = ConnectionState::Disconnected;
        rec.attempt = Attempt::None;
        rec.commands.invalidate();
        let cancelled = !rec.disconnect_handlers.is_empty();
        for h in rec.disconnect_handlers.drain(..) {
            h(Ok(()));
        }
        if rec.wants_connection() {
            debug!("{} was requested again while disconnecting", id);
            self.request_connection(id);
        } else if cancelled {
            self.registry.remove_if_idle(id);
        }
    }

    /// The link went down, or a connection attempt failed, without the engine asking for it.
    fn link_lost(&mut self, id: Uuid, was_connected: bool, cause: Option<AdapterError>) {
        let rec = if let Some(rec) = self.registry.get_mut(id) {
            rec
        } else {
            return;
        };
        rec.state = ConnectionState::Disconnected;
        rec.attempt = Attempt::None;
        rec.commands.invalidate();

        let error = Error::connection_failed(cause.clone());
        if was_connected {
            warn!("lost connection to {}: {}", id, error);
            if let Some(on_disconnect) = &mut rec.on_disconnect {
                let error = cause.map(|c| Error::connection_failed(Some(c)));
                on_disconnect(id, error.as_ref());
            }
        } else {
            warn!("failed to connect to {}: {}", id, error);
        }
        rec.fail_connect_handlers(&error);

        if rec.maintained {
            info!("reconnecting to {}", id);
            self.request_connection(id);
        } else if was_connected && !rec.commands.is_empty() {
            debug!("reconnecting to {} for {} pending command(s)", id, rec.commands.len());
            self.request_connection(id);
        } else {
            rec.commands.fail_all(&error);
        }
    }

    fn connect_timed_out(&mut self, id: Uuid, attempt: u64) {
        let rec = match self.registry.get_mut(id) {
            Some(rec) if rec.state == ConnectionState::Connecting
                && rec.attempt == Attempt::Outstanding(attempt) => rec,
            _ => return,
        };
        let error = Error::timeout();
        warn!("connection to {} timed out", id);
        rec.fail_connect_handlers(&error);
        if rec.maintained {
            return;
        }
        rec.commands.fail_all(&error);
        rec.state = ConnectionState::Disconnecting;
        rec.attempt = Attempt::None;
        self.adapter.cancel_connection(id);
    }

    fn command_completed(&mut self, id: Uuid, sequence: Sequence, result: Result<CommandOutput, AdapterError>) {
        let entry = self.registry.get_mut(id).and_then(|r| r.commands.complete(sequence));
        match entry {
            Some(entry) => {
                trace!("{} of {} completed", sequence, id);
                entry.finish(result.map_err(Error::command_failed));
            }
            None => debug!("ignoring completion of unknown command {} of {}", sequence, id),
        }
    }

    fn value_updated(&mut self, id: Uuid, characteristic: CharacteristicRef, value: Vec<u8>) {
        let handler = self.registry.get_mut(id)
            .and_then(|r| r.subscriptions.get_mut(&characteristic));
        match handler {
            Some(handler) => handler(&value[..]),
            None => trace!("no subscription for {:?} of {}", characteristic, id),
        }
    }

    fn peripheral_discovered(&mut self, discovery: Discovery) {
        self.registry.get_or_insert(discovery.peripheral);
        match &mut self.scan {
            Some(scan) if scan.matches(&discovery.advertisement_data) => scan.discovered(discovery),
            Some(_) => trace!("{} doesn't match the scan filter", discovery.peripheral),
            None => trace!("discovered {} without an active scan", discovery.peripheral),
        }
    }

    fn restored(&mut self, peripherals: Vec<Uuid>) {
        info!("adapter restored with {} peripheral(s)", peripherals.len());
        for &id in &peripherals {
            self.registry.get_or_insert(id);
        }
        if let Some(handler) = &mut self.restoration_handler {
            handler(&peripherals[..]);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mock::{AdapterCall, MockAdapter};
    use std::sync::{mpsc, Mutex};
    use std::thread;

    struct Results<T>(Arc<Mutex<Vec<T>>>);

    impl<T> Clone for Results<T> {
        fn clone(&self) -> Self {
            Self(self.0.clone())
        }
    }

    impl<T: Clone> Results<T> {
        fn new() -> Self {
            Self(Arc::new(Mutex::new(Vec::new())))
        }

        fn push(&self, v: T) {
            self.0.lock().unwrap().push(v);
        }

        fn get(&self) -> Vec<T> {
            self.0.lock().unwrap().clone()
        }
    }

    type ConnectResults = Results<Result<(), ErrorKind>>;
    type CommandResults = Results<Result<CommandOutput, ErrorKind>>;

    fn on_connect(r: &ConnectResults) -> impl FnOnce(Result<(), Error>) + Send + 'static {
        let r = r.clone();
        move |v| r.push(v.map_err(|e| e.kind()))
    }

    fn on_command(r: &CommandResults) -> impl FnOnce(Result<CommandOutput, Error>) + Send + 'static {
        let r = r.clone();
        move |v| r.push(v.map_err(|e| e.kind()))
    }

    fn central() -> (Central, MockAdapter) {
        let _ = env_logger::builder().is_test(true).try_init();
        let adapter = MockAdapter::new();
        let central = Central::new(adapter.clone()).unwrap();
        (central, adapter)
    }

    fn powered_on() -> (Central, MockAdapter) {
        let (central, adapter) = central();
        adapter.fake_state_change(AdapterState::PoweredOn);
        central.sync();
        assert_eq!(central.state(), AdapterState::PoweredOn);
        (central, adapter)
    }

    fn id(n: u16) -> Uuid {
        Uuid::from_u16(n)
    }

    fn characteristic(n: u16) -> CharacteristicRef {
        CharacteristicRef::new(Uuid::from_u16(0x1809), Uuid::from_u16(n))
    }

    fn read(n: u16) -> Command {
        Command::Read { characteristic: characteristic(n) }
    }

    fn snapshot(central: &Central, peripheral: Uuid) -> Option<PeripheralSnapshot> {
        let (tx, rx) = mpsc::channel();
        central.peripheral(peripheral, move |s| tx.send(s).unwrap());
        rx.recv().unwrap()
    }

    fn state(central: &Central, peripheral: Uuid) -> ConnectionState {
        snapshot(central, peripheral).unwrap().state
    }

    fn sequences(adapter: &MockAdapter, peripheral: Uuid) -> Vec<u64> {
        adapter.submitted(peripheral).iter().map(|(s, _)| s.get()).collect()
    }

    fn adapter_error() -> AdapterError {
        AdapterError::new(7, "link supervision timeout")
    }

    #[test]
    fn maintained_reconnects_on_link_loss() {
        let (central, adapter) = powered_on();
        let a = id(1);
        let disconnects = Results::new();
        let d = disconnects.clone();
        central.set_disconnection_handler(a, move |p, e| d.push((p, e.map(|e| e.kind()))));
        central.maintain_connection(a);
        central.sync();
        assert_eq!(adapter.connect_count(a), 1);
        assert_eq!(state(&central, a), ConnectionState::Connecting);

        adapter.fake_connect(a, None);
        central.sync();
        assert_eq!(state(&central, a), ConnectionState::Connected);

        adapter.fake_disconnect(a, Some(adapter_error()));
        central.sync();
        assert_eq!(adapter.connect_count(a), 2);
        assert_eq!(state(&central, a), ConnectionState::Connecting);
        assert_eq!(disconnects.get(), vec![(a, Some(ErrorKind::ConnectionFailed))]);

        // Failed attempts are retried too.
        adapter.fake_connect(a, Some(adapter_error()));
        central.sync();
        assert_eq!(adapter.connect_count(a), 3);
        assert_eq!(disconnects.get().len(), 1);
    }

    #[test]
    fn maintain_is_idempotent() {
        let (central, adapter) = powered_on();
        let a = id(1);
        central.maintain_connection(a);
        central.maintain_connection(a);
        central.sync();
        assert_eq!(adapter.connect_count(a), 1);
        assert!(snapshot(&central, a).unwrap().maintained);
    }

    #[test]
    fn connect_is_gated_until_powered_on() {
        let (central, adapter) = central();
        let a = id(1);
        adapter.fake_state_change(AdapterState::PoweredOff);
        central.maintain_connection(a);
        central.sync();
        assert_eq!(central.state(), AdapterState::PoweredOff);
        assert!(adapter.calls().is_empty());
        assert_eq!(state(&central, a), ConnectionState::Connecting);

        adapter.fake_state_change(AdapterState::PoweredOn);
        central.sync();
        assert_eq!(adapter.calls(), vec![AdapterCall::Connect { peripheral: a }]);
    }

    #[test]
    fn commands_wait_for_connection() {
        let (central, adapter) = powered_on();
        let a = id(1);
        let results = Results::new();
        for n in 1..=3 {
            central.enqueue(a, read(n), on_command(&results));
        }
        central.sync();
        assert_eq!(adapter.connect_count(a), 1);
        assert!(adapter.submitted(a).is_empty());
        assert_eq!(snapshot(&central, a).unwrap().pending_commands, 3);

        adapter.fake_connect(a, None);
        adapter.fake_connect(a, None);
        central.sync();
        assert_eq!(adapter.submitted(a), vec![
            (Sequence(1), read(1)),
            (Sequence(2), read(2)),
            (Sequence(3), read(3)),
        ]);

        adapter.fake_command_completed(a, Sequence(2), Ok(CommandOutput::Value(vec![2])));
        adapter.fake_command_completed(a, Sequence(1), Err(adapter_error()));
        central.sync();
        assert_eq!(results.get(), vec![
            Ok(CommandOutput::Value(vec![2])),
            Err(ErrorKind::CommandFailed),
        ]);
        assert_eq!(snapshot(&central, a).unwrap().pending_commands, 1);
    }

    #[test]
    fn commands_resubmitted_after_link_loss() {
        let (central, adapter) = powered_on();
        let a = id(1);
        let results = Results::new();
        for n in 1..=3 {
            central.enqueue(a, read(n), on_command(&results));
        }
        adapter.fake_connect(a, None);
        central.sync();
        assert_eq!(sequences(&adapter, a), vec![1, 2, 3]);
        adapter.take_calls();

        adapter.fake_disconnect(a, Some(adapter_error()));
        central.sync();
        assert_eq!(adapter.calls(), vec![AdapterCall::Connect { peripheral: a }]);

        adapter.fake_connect(a, None);
        central.sync();
        assert_eq!(sequences(&adapter, a), vec![1, 2, 3]);
        assert!(results.get().is_empty());
    }

    #[test]
    fn one_shot_reconnect_gives_up() {
        let (central, adapter) = powered_on();
        let a = id(1);
        let results = Results::new();
        central.enqueue(a, read(1), on_command(&results));
        adapter.fake_connect(a, None);
        adapter.fake_disconnect(a, None);
        central.sync();
        assert_eq!(adapter.connect_count(a), 2);

        adapter.fake_connect(a, Some(adapter_error()));
        central.sync();
        assert_eq!(adapter.connect_count(a), 2);
        assert_eq!(results.get(), vec![Err(ErrorKind::ConnectionFailed)]);
        assert_eq!(state(&central, a), ConnectionState::Disconnected);
    }

    #[test]
    fn commands_resubmitted_after_adapter_reset() {
        let (central, adapter) = powered_on();
        let a = id(1);
        let b = id(2);
        let disconnects = Results::new();
        let d = disconnects.clone();
        central.set_disconnection_handler(a, move |_, e| d.push(e.map(|e| e.kind())));
        central.maintain_connection(a);
        adapter.fake_connect(a, None);
        for n in 1..=3 {
            central.enqueue(a, read(n), |_| {});
        }
        central.enqueue(b, read(4), |_| {});
        adapter.fake_connect(b, None);
        central.sync();
        assert_eq!(sequences(&adapter, a), vec![1, 2, 3]);
        assert_eq!(sequences(&adapter, b), vec![4]);
        adapter.take_calls();

        adapter.fake_state_change(AdapterState::Resetting);
        central.sync();
        assert_eq!(central.state(), AdapterState::Resetting);
        assert!(adapter.calls().is_empty());
        assert_eq!(state(&central, a), ConnectionState::Connecting);
        assert_eq!(state(&central, b), ConnectionState::Connecting);
        assert_eq!(disconnects.get(), vec![Some(ErrorKind::AdapterUnavailable(AdapterState::Resetting))]);

        adapter.fake_state_change(AdapterState::PoweredOn);
        central.sync();
        assert_eq!(adapter.connect_count(a), 1);
        assert_eq!(adapter.connect_count(b), 1);
        assert!(adapter.submitted(a).is_empty());

        adapter.fake_connect(a, None);
        adapter.fake_connect(b, None);
        central.sync();
        assert_eq!(sequences(&adapter, a), vec![1, 2, 3]);
        assert_eq!(sequences(&adapter, b), vec![4]);
    }

    #[test]
    fn connect_handlers_fire_in_order() {
        let (central, adapter) = powered_on();
        let a = id(1);
        let order = Results::new();
        for i in 0..2 {
            let order = order.clone();
            central.connect(a, move |r| order.push((i, r.is_ok())));
        }
        central.sync();
        assert_eq!(adapter.connect_count(a), 1);

        adapter.fake_connect(a, None);
        central.sync();
        assert_eq!(order.get(), vec![(0, true), (1, true)]);

        let results = Results::new();
        central.connect(a, on_connect(&results));
        central.sync();
        assert_eq!(results.get(), vec![Ok(())]);
        assert_eq!(adapter.connect_count(a), 1);
    }

    #[test]
    fn cancel_fails_waiting_handlers() {
        let (central, adapter) = powered_on();
        let a = id(1);
        let connects = Results::new();
        let commands = Results::new();
        let cancels = Results::new();
        central.maintain_connection(a);
        central.connect(a, on_connect(&connects));
        central.enqueue(a, read(1), on_command(&commands));
        central.cancel_connection(a, on_connect(&cancels));
        central.sync();
        assert_eq!(connects.get(), vec![Err(ErrorKind::ConnectionCancelled)]);
        assert_eq!(commands.get(), vec![Err(ErrorKind::ConnectionCancelled)]);
        assert!(cancels.get().is_empty());
        assert_eq!(adapter.calls(), vec![
            AdapterCall::Connect { peripheral: a },
            AdapterCall::CancelConnection { peripheral: a },
        ]);
        let s = snapshot(&central, a).unwrap();
        assert_eq!(s.state, ConnectionState::Disconnecting);
        assert!(!s.maintained);

        adapter.fake_disconnect(a, None);
        central.sync();
        assert_eq!(cancels.get(), vec![Ok(())]);
        assert_eq!(snapshot(&central, a), None);

        adapter.fake_disconnect(a, None);
        central.sync();
        assert_eq!(adapter.connect_count(a), 1);
    }

    #[test]
    fn cancel_without_connection_completes_at_once() {
        let (central, adapter) = central();
        let a = id(1);
        let cancels = Results::new();
        central.cancel_connection(a, on_connect(&cancels));
        central.maintain_connection(a);
        central.cancel_connection(a, on_connect(&cancels));
        central.sync();
        assert_eq!(cancels.get(), vec![Ok(()), Ok(())]);
        assert_eq!(snapshot(&central, a), None);
        assert!(adapter.calls().is_empty());
    }

    #[test]
    fn connect_while_disconnecting_reconnects() {
        let (central, adapter) = powered_on();
        let a = id(1);
        central.connect(a, |_| {});
        adapter.fake_connect(a, None);
        let cancels = Results::new();
        let connects = Results::new();
        central.cancel_connection(a, on_connect(&cancels));
        central.connect(a, on_connect(&connects));
        central.sync();
        assert_eq!(adapter.connect_count(a), 1);

        adapter.fake_disconnect(a, None);
        central.sync();
        assert_eq!(cancels.get(), vec![Ok(())]);
        assert_eq!(adapter.connect_count(a), 2);

        adapter.fake_connect(a, None);
        central.sync();
        assert_eq!(connects.get(), vec![Ok(())]);
    }

    #[test]
    fn terminal_state_fails_pending_work() {
        let (central, adapter) = central();
        let b = id(2);
        let connects = Results::new();
        let commands = Results::new();
        let scan_errors = Results::new();
        adapter.fake_state_change(AdapterState::PoweredOff);
        central.connect(b, on_connect(&connects));
        central.enqueue(b, read(1), on_command(&commands));
        central.enqueue(b, read(2), on_command(&commands));
        let e = scan_errors.clone();
        central.scan(&[], ScanOptions::default(), |_| {}, move |err| e.push(err.kind()));
        central.sync();
        assert_eq!(central.state(), AdapterState::PoweredOff);
        assert!(connects.get().is_empty());
        assert!(commands.get().is_empty());

        adapter.fake_state_change(AdapterState::Unauthorized);
        central.sync();
        let unavailable = ErrorKind::AdapterUnavailable(AdapterState::Unauthorized);
        assert_eq!(connects.get(), vec![Err(unavailable)]);
        assert_eq!(commands.get(), vec![Err(unavailable), Err(unavailable)]);
        assert_eq!(scan_errors.get(), vec![unavailable]);
        assert_eq!(state(&central, b), ConnectionState::Disconnected);

        central.enqueue(b, read(3), on_command(&commands));
        central.connect(b, on_connect(&connects));
        central.sync();
        assert_eq!(commands.get().len(), 3);
        assert_eq!(connects.get().len(), 2);
        assert!(adapter.calls().is_empty());
        assert_eq!(central.state(), AdapterState::Unauthorized);
    }

    #[test]
    fn subscriptions_survive_reconnection() {
        let (central, adapter) = powered_on();
        let a = id(1);
        let c = characteristic(0x2A1C);
        let values = Results::new();
        let v = values.clone();
        let subscribed = Results::new();
        let s = subscribed.clone();
        central.maintain_connection(a);
        central.subscribe(a, c, move |value| v.push(value.to_vec()), move |r| s.push(r.is_ok()));
        adapter.fake_connect(a, None);
        central.sync();
        let set_notify = Command::SetNotify { characteristic: c, enabled: true };
        assert_eq!(adapter.submitted(a), vec![(Sequence(1), set_notify.clone())]);

        adapter.fake_command_completed(a, Sequence(1), Ok(CommandOutput::Done));
        adapter.fake_value_update(a, c, &[1, 2]);
        adapter.fake_value_update(a, characteristic(0x2A1D), &[3]);
        central.sync();
        assert_eq!(subscribed.get(), vec![true]);
        assert_eq!(values.get(), vec![vec![1, 2]]);
        adapter.take_calls();

        adapter.fake_disconnect(a, Some(adapter_error()));
        adapter.fake_connect(a, None);
        central.sync();
        assert_eq!(adapter.submitted(a), vec![(Sequence(2), set_notify)]);

        let unsubscribed = Results::new();
        central.unsubscribe(a, c, move |r| unsubscribed.push(r.is_ok()));
        adapter.fake_value_update(a, c, &[4]);
        central.sync();
        assert_eq!(adapter.submitted(a).last(),
            Some(&(Sequence(3), Command::SetNotify { characteristic: c, enabled: false })));
        assert_eq!(values.get(), vec![vec![1, 2]]);
    }

    #[test]
    fn scan_follows_adapter_state() {
        let (central, adapter) = central();
        let hr = Uuid::from_u16(0x180D);
        let found = Results::new();
        let f = found.clone();
        central.scan(&[hr], ScanOptions::default(), move |d| f.push(d.peripheral), |_| {});
        central.sync();
        assert_eq!(central.state(), AdapterState::Unknown);
        assert!(adapter.calls().is_empty());

        adapter.fake_state_change(AdapterState::PoweredOn);
        central.sync();
        assert_eq!(central.state(), AdapterState::PoweredOn);
        let scan = AdapterCall::Scan {
            services: vec![hr],
            options: ScanOptions::default(),
        };
        assert_eq!(adapter.take_calls(), vec![scan.clone()]);

        adapter.fake_discovery(id(1), AdvertisementData::new().with_service_uuids(&[hr]), -60);
        adapter.fake_discovery(id(2), AdvertisementData::new(), -70);
        adapter.fake_state_change(AdapterState::PoweredOff);
        adapter.fake_state_change(AdapterState::PoweredOn);
        central.sync();
        assert_eq!(found.get(), vec![id(1)]);
        assert_eq!(adapter.take_calls(), vec![scan]);

        central.stop_scan();
        central.stop_scan();
        adapter.fake_discovery(id(3), AdvertisementData::new().with_service_uuids(&[hr]), -50);
        central.sync();
        assert_eq!(adapter.calls(), vec![AdapterCall::StopScan]);
        assert_eq!(found.get(), vec![id(1)]);

        // Discovered peripherals are tracked even without a scan.
        let ids: Vec<_> = {
            let (tx, rx) = mpsc::channel();
            central.peripherals(move |s| tx.send(s).unwrap());
            rx.recv().unwrap().into_iter().map(|s| s.id).collect()
        };
        assert_eq!(ids, vec![id(1), id(2), id(3)]);
    }

    #[test]
    fn connect_timeout() {
        let _ = env_logger::builder().is_test(true).try_init();
        let adapter = MockAdapter::new();
        let central = Central::builder()
            .connect_timeout(Some(Duration::from_millis(50)))
            .build(adapter.clone())
            .unwrap();
        let a = id(1);
        let b = id(2);
        let results = Results::new();
        let commands = Results::new();
        adapter.fake_state_change(AdapterState::PoweredOn);
        central.connect(a, on_connect(&results));
        central.enqueue(a, read(1), on_command(&commands));
        central.maintain_connection(b);
        central.connect(b, on_connect(&results));
        central.sync();
        assert_eq!(central.state(), AdapterState::PoweredOn);

        thread::sleep(Duration::from_millis(300));
        central.sync();
        assert_eq!(results.get(), vec![Err(ErrorKind::Timeout), Err(ErrorKind::Timeout)]);
        assert_eq!(commands.get(), vec![Err(ErrorKind::Timeout)]);
        assert_eq!(state(&central, a), ConnectionState::Disconnecting);
        assert_eq!(state(&central, b), ConnectionState::Connecting);
        assert!(adapter.calls().contains(&AdapterCall::CancelConnection { peripheral: a }));
        assert!(!adapter.calls().contains(&AdapterCall::CancelConnection { peripheral: b }));

        // The maintained attempt is still outstanding.
        adapter.fake_connect(b, None);
        central.sync();
        assert_eq!(state(&central, b), ConnectionState::Connected);
        assert_eq!(adapter.connect_count(b), 1);
    }

    #[test]
    fn state_and_restoration_handlers() {
        let (central, adapter) = central();
        let states = Results::new();
        let s = states.clone();
        let restored = Results::new();
        let r = restored.clone();
        central.set_state_handler(move |state| s.push(state));
        central.set_restoration_handler(move |ids| r.push(ids.to_vec()));
        adapter.fake_state_change(AdapterState::PoweredOff);
        adapter.fake_restore(&[id(1), id(2)]);
        adapter.fake_state_change(AdapterState::PoweredOn);
        central.sync();
        assert_eq!(states.get(), vec![AdapterState::PoweredOff, AdapterState::PoweredOn]);
        assert_eq!(restored.get(), vec![vec![id(1), id(2)]]);
        assert_eq!(central.state(), AdapterState::PoweredOn);
        assert_eq!(state(&central, id(2)), ConnectionState::Disconnected);
    }

    #[test]
    fn unknown_events_are_ignored() {
        let (central, adapter) = powered_on();
        let a = id(1);
        adapter.fake_disconnect(a, None);
        adapter.fake_connect(id(2), Some(adapter_error()));
        adapter.fake_command_completed(a, Sequence(42), Ok(CommandOutput::Done));
        adapter.fake_value_update(a, characteristic(1), &[0]);
        central.sync();
        assert!(adapter.calls().is_empty());
        assert_eq!(snapshot(&central, id(2)), None);
    }

    #[test]
    fn events_right_after_construction_are_processed() {
        let _ = env_logger::builder().is_test(true).try_init();
        let adapter = MockAdapter::new();
        let central = Central::new(adapter.clone()).unwrap();
        adapter.fake_state_change(AdapterState::PoweredOn);
        central.maintain_connection(id(1));
        central.sync();
        assert_eq!(central.state(), AdapterState::PoweredOn);
        assert_eq!(adapter.connect_count(id(1)), 1);
    }

    #[test]
    fn connection_before_first_power_on_is_gated() {
        let (central, adapter) = central();
        let a = id(1);
        let results = Results::new();
        adapter.fake_restore(&[a]);
        adapter.fake_connect(a, None);
        central.enqueue(a, read(1), on_command(&results));
        central.sync();
        assert_eq!(central.state(), AdapterState::Unknown);
        assert_eq!(state(&central, a), ConnectionState::Connected);
        assert!(adapter.calls().is_empty());

        adapter.fake_state_change(AdapterState::PoweredOn);
        central.sync();
        assert_eq!(adapter.calls(), vec![AdapterCall::Submit {
            peripheral: a,
            sequence: Sequence(1),
            command: read(1),
        }]);
    }

    #[test]
    fn cancel_before_first_power_on_is_deferred() {
        let (central, adapter) = central();
        let a = id(1);
        let cancels = Results::new();
        adapter.fake_connect(a, None);
        central.cancel_connection(a, on_connect(&cancels));
        central.sync();
        assert_eq!(central.state(), AdapterState::Unknown);
        assert_eq!(state(&central, a), ConnectionState::Disconnecting);
        assert!(adapter.calls().is_empty());

        adapter.fake_state_change(AdapterState::PoweredOn);
        central.sync();
        assert_eq!(adapter.calls(), vec![AdapterCall::CancelConnection { peripheral: a }]);
        assert!(cancels.get().is_empty());

        adapter.fake_disconnect(a, None);
        central.sync();
        assert_eq!(cancels.get(), vec![Ok(())]);
        assert_eq!(snapshot(&central, a), None);
    }

    #[test]
    fn teardown_after_power_off_keeps_commands() {
        let (central, adapter) = powered_on();
        let a = id(1);
        let b = id(2);
        let results = Results::new();
        central.enqueue(a, read(1), on_command(&results));
        central.connect(b, on_connect(&Results::new()));
        central.enqueue(b, read(2), on_command(&results));
        adapter.fake_connect(a, None);
        central.sync();
        assert_eq!(sequences(&adapter, a), vec![1]);
        adapter.take_calls();

        // Adapters report the links going down after the state change.
        adapter.fake_state_change(AdapterState::PoweredOff);
        adapter.fake_disconnect(a, Some(adapter_error()));
        adapter.fake_connect(b, Some(adapter_error()));
        central.sync();
        assert_eq!(central.state(), AdapterState::PoweredOff);
        assert!(results.get().is_empty());
        for &p in &[a, b] {
            let s = snapshot(&central, p).unwrap();
            assert_eq!(s.state, ConnectionState::Connecting);
            assert_eq!(s.pending_commands, 1);
        }
        assert!(adapter.calls().is_empty());

        adapter.fake_state_change(AdapterState::PoweredOn);
        adapter.fake_connect(a, None);
        adapter.fake_connect(b, None);
        central.sync();
        assert_eq!(adapter.connect_count(a), 1);
        assert_eq!(adapter.connect_count(b), 1);
        assert_eq!(sequences(&adapter, a), vec![1]);
        assert_eq!(sequences(&adapter, b), vec![2]);
        assert!(results.get().is_empty());
    }

    #[test]
    fn read_without_value_yields_empty() {
        let (central, adapter) = powered_on();
        let a = id(1);
        let values = Results::new();
        let v = values.clone();
        central.read(a, characteristic(1), move |r| v.push(r.map_err(|e| e.kind())));
        adapter.fake_connect(a, None);
        adapter.fake_command_completed(a, Sequence(1), Ok(CommandOutput::Done));
        central.sync();
        assert_eq!(values.get(), vec![Ok(Vec::new())]);
    }
}
