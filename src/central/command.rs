use log::*;
use std::collections::VecDeque;

use super::*;

/// Monotonically increasing number assigned to every enqueued command.
/// Resubmission always happens in ascending sequence order.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Sequence(pub(in crate) u64);

assert_impl_all!(Sequence: Send, Sync);

impl Sequence {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Path to a characteristic of a peripheral.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct CharacteristicRef {
    pub service: Uuid,
    pub characteristic: Uuid,
}

assert_impl_all!(CharacteristicRef: Send, Sync);

impl CharacteristicRef {
    pub fn new(service: Uuid, characteristic: Uuid) -> Self {
        Self {
            service,
            characteristic,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum WriteKind {
    WithResponse = 0,
    WithoutResponse = 1,
}

/// Request against a peripheral's services or characteristics. Interpreted by the adapter only.
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum Command {
    /// Discovers the peripheral's services, restricted to `services` if not empty.
    DiscoverServices {
        services: Vec<Uuid>,
    },
    /// Discovers characteristics of `service`, restricted to `characteristics` if not empty.
    DiscoverCharacteristics {
        service: Uuid,
        characteristics: Vec<Uuid>,
    },
    Read {
        characteristic: CharacteristicRef,
    },
    Write {
        characteristic: CharacteristicRef,
        value: Vec<u8>,
        kind: WriteKind,
    },
    /// Enables or disables notifications/indications of the characteristic's value.
    SetNotify {
        characteristic: CharacteristicRef,
        enabled: bool,
    },
    ReadRssi,
}

assert_impl_all!(Command: Send, Sync);

/// Successful result of a command.
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum CommandOutput {
    /// UUIDs of the discovered services or characteristics.
    Discovered(Vec<Uuid>),
    Value(Vec<u8>),
    Rssi(i32),
    Done,
}

assert_impl_all!(CommandOutput: Send, Sync);

pub type CommandHandler = Box<dyn FnOnce(Result<CommandOutput, Error>) + Send>;

pub(in crate) struct PendingCommand {
    pub sequence: Sequence,
    pub command: Command,
    /// Adapter session epoch of the last submission. `None` if not submitted over the current link.
    pub submitted_in: Option<u64>,
    handler: Option<CommandHandler>,
}

impl PendingCommand {
    pub fn finish(self, result: Result<CommandOutput, Error>) {
        match self.handler {
            Some(handler) => handler(result),
            None => if let Err(e) = result {
                debug!("internal command {} failed: {}", self.sequence, e);
            }
        }
    }
}

/// Ordered log of the commands of one peripheral that the adapter hasn't acknowledged yet.
#[derive(Default)]
pub(in crate) struct CommandLog {
    entries: VecDeque<PendingCommand>,
}

impl CommandLog {
    /// Appends a command. Sequences must be pushed in ascending order.
    pub fn push(&mut self, sequence: Sequence, command: Command, handler: Option<CommandHandler>) {
        debug_assert!(self.entries.back().map(|e| e.sequence < sequence).unwrap_or(true));
        self.entries.push_back(PendingCommand {
            sequence,
            command,
            submitted_in: None,
            handler,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, command: &Command) -> bool {
        self.entries.iter().any(|e| &e.command == command)
    }

    /// Commands that haven't been submitted in session `epoch` over the current link, oldest first.
    pub fn stale(&mut self, epoch: u64) -> impl Iterator<Item=&mut PendingCommand> {
        self.entries.iter_mut().filter(move |e| e.submitted_in != Some(epoch))
    }

    /// Marks every command as not submitted, e.g. after the link went down.
    pub fn invalidate(&mut self) {
        for e in &mut self.entries {
            e.submitted_in = None;
        }
    }

    pub fn complete(&mut self, sequence: Sequence) -> Option<PendingCommand> {
        let i = self.entries.iter().position(|e| e.sequence == sequence)?;
        self.entries.remove(i)
    }

    /// Removes all commands delivering `error` to each caller, oldest first.
    pub fn fail_all(&mut self, error: &Error) {
        for e in self.entries.drain(..) {
            e.finish(Err(error.clone()));
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn read(n: u16) -> Command {
        Command::Read {
            characteristic: CharacteristicRef::new(Uuid::from_u16(0x180F), Uuid::from_u16(n)),
        }
    }

    fn stale_seqs(log: &mut CommandLog, epoch: u64) -> Vec<u64> {
        log.stale(epoch).map(|e| e.sequence.get()).collect()
    }

    #[test]
    fn stale_tracks_submissions() {
        let mut log = CommandLog::default();
        for i in 1..=3 {
            log.push(Sequence(i), read(i as u16), None);
        }
        assert_eq!(stale_seqs(&mut log, 0), vec![1, 2, 3]);

        for e in log.stale(0).take(2) {
            e.submitted_in = Some(0);
        }
        assert_eq!(stale_seqs(&mut log, 0), vec![3]);
        // Everything submitted in an older session is stale.
        assert_eq!(stale_seqs(&mut log, 1), vec![1, 2, 3]);

        for e in log.stale(0) {
            e.submitted_in = Some(0);
        }
        log.invalidate();
        assert_eq!(stale_seqs(&mut log, 0), vec![1, 2, 3]);
    }

    #[test]
    fn complete_and_fail() {
        let results = Arc::new(Mutex::new(Vec::new()));
        let mut log = CommandLog::default();
        for i in 1..=3 {
            let results = results.clone();
            log.push(Sequence(i), read(i as u16), Some(Box::new(move |r| {
                results.lock().unwrap().push((i, r.map_err(|e| e.kind())));
            })));
        }
        assert!(log.contains(&read(2)));
        log.complete(Sequence(2)).unwrap().finish(Ok(CommandOutput::Value(vec![7])));
        assert!(log.complete(Sequence(2)).is_none());
        assert!(!log.contains(&read(2)));
        assert_eq!(log.len(), 2);

        log.fail_all(&Error::connection_cancelled());
        assert!(log.is_empty());
        assert_eq!(*results.lock().unwrap(), vec![
            (2, Ok(CommandOutput::Value(vec![7]))),
            (1, Err(ErrorKind::ConnectionCancelled)),
            (3, Err(ErrorKind::ConnectionCancelled)),
        ]);
    }
}
