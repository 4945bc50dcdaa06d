//! Serial task queue. A single worker thread owns the state and runs the posted tasks one by
//! one in arrival order, so the state never needs locking.

use log::*;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

pub type Task<S> = Box<dyn FnOnce(&mut S) + Send>;

enum Message<S> {
    Run(Task<S>),
    RunAt(Instant, Task<S>),
    Stop,
}

pub struct Queue<S> {
    sender: mpsc::Sender<Message<S>>,
    stopped: Arc<AtomicBool>,
}

impl<S> Clone for Queue<S> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            stopped: self.stopped.clone(),
        }
    }
}

impl<S: 'static> Queue<S> {
    /// Creates the queue without a worker. Tasks posted before the worker is started wait for it.
    pub fn new() -> (Self, Worker<S>) {
        let (sender, receiver) = mpsc::channel();
        let queue = Self {
            sender,
            stopped: Arc::new(AtomicBool::new(false)),
        };
        (queue, Worker { receiver })
    }

    pub fn dispatch(&self, task: impl FnOnce(&mut S) + Send + 'static) {
        self.send(Message::Run(Box::new(task)));
    }

    /// Runs `task` once `delay` has elapsed. Tasks posted in the meantime are not delayed.
    pub fn dispatch_after(&self, delay: Duration, task: impl FnOnce(&mut S) + Send + 'static) {
        self.send(Message::RunAt(Instant::now() + delay, Box::new(task)));
    }

    /// Blocks until every task posted before this call has run.
    /// Must not be called from a task, that would deadlock.
    pub fn sync(&self) {
        let (done, wait) = mpsc::sync_channel(1);
        self.dispatch(move |_| {
            let _ = done.send(());
        });
        // Errors only if the worker is gone, nothing to wait for then.
        let _ = wait.recv();
    }

    /// Asks the worker to exit after running the tasks posted so far. Pending delayed tasks are dropped.
    pub fn stop(&self) {
        self.stopped.store(true, AtomicOrdering::SeqCst);
        self.send(Message::Stop);
    }

    fn send(&self, msg: Message<S>) {
        if self.sender.send(msg).is_err() {
            if self.stopped.load(AtomicOrdering::SeqCst) {
                trace!("queue is stopped, dropping task");
            } else {
                error!("queue worker has died, dropping task");
            }
        }
    }
}

/// Receiving end of a [`Queue`](struct.Queue.html), turned into the worker thread by `start`.
pub struct Worker<S> {
    receiver: mpsc::Receiver<Message<S>>,
}

impl<S: 'static> Worker<S> {
    /// Starts the worker thread. The state is constructed on the worker by `init`.
    /// The worker exits on `Queue::stop` or if a task panics.
    pub fn start<F>(self, name: String, init: F) -> io::Result<()>
        where F: FnOnce() -> S + Send + 'static
    {
        let receiver = self.receiver;
        thread::Builder::new()
            .name(name)
            .spawn(move || run(init(), receiver))?;
        Ok(())
    }
}

struct Timer<S> {
    deadline: Instant,
    seq: u64,
    task: Task<S>,
}

// Reversed so that `BinaryHeap` pops the earliest deadline first. `seq` keeps timers with
// equal deadlines in posting order.
impl<S> Ord for Timer<S> {
    fn cmp(&self, other: &Self) -> Ordering {
        (other.deadline, other.seq).cmp(&(self.deadline, self.seq))
    }
}

impl<S> PartialOrd for Timer<S> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<S> PartialEq for Timer<S> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<S> Eq for Timer<S> {}

fn run<S>(mut state: S, receiver: mpsc::Receiver<Message<S>>) {
    let mut timers = BinaryHeap::new();
    let mut timer_seq = 0;
    loop {
        let now = Instant::now();
        while timers.peek().map(|t: &Timer<S>| t.deadline <= now).unwrap_or(false) {
            if let Some(timer) = timers.pop() {
                (timer.task)(&mut state);
            }
        }

        let msg = if let Some(next) = timers.peek() {
            let timeout = next.deadline.saturating_duration_since(Instant::now());
            match receiver.recv_timeout(timeout) {
                Ok(msg) => msg,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        } else {
            match receiver.recv() {
                Ok(msg) => msg,
                Err(_) => break,
            }
        };

        match msg {
            Message::Run(task) => task(&mut state),
            Message::RunAt(deadline, task) => {
                timers.push(Timer {
                    deadline,
                    seq: timer_seq,
                    task,
                });
                timer_seq += 1;
            }
            Message::Stop => break,
        }
    }
    debug!("queue worker exiting, {} delayed task(s) dropped", timers.len());
}
