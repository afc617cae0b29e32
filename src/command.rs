//! Timestamp-gated setpoint command channel between ingestion threads
//! and the single driving loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, SyncSender, TryRecvError, TrySendError, sync_channel};

use thiserror::Error;

/// An externally issued setpoint command, stamped with the simulation
/// time at which it was received.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SetpointCommand {
    /// Requested active power (MW).
    pub p_mw: f64,
    /// Requested reactive power (MVAr).
    pub q_mvar: f64,
    /// Simulation time the command was issued (s). The driving loop
    /// applies the command only once this time has been reached.
    pub time_s: f64,
}

/// Error returned when a command cannot be enqueued.
#[derive(Debug, Error)]
pub enum CommandSendError {
    #[error("command channel is full (capacity {0})")]
    Full(usize),
    #[error("command channel is closed, the driving loop has stopped")]
    Closed,
}

/// Producer half of the command channel, cloneable across ingestion
/// threads (console reader, protocol adapter).
#[derive(Debug, Clone)]
pub struct CommandSender {
    tx: SyncSender<SetpointCommand>,
    capacity: usize,
}

impl CommandSender {
    /// Enqueues a command without blocking.
    ///
    /// # Errors
    ///
    /// Returns `CommandSendError::Full` when the bounded channel has no
    /// free slot, and `CommandSendError::Closed` when the consuming
    /// loop has dropped its queue. Ingestion paths surface the error to
    /// their own caller; the core never drops an accepted command.
    pub fn send(&self, cmd: SetpointCommand) -> Result<(), CommandSendError> {
        self.tx.try_send(cmd).map_err(|e| match e {
            TrySendError::Full(_) => CommandSendError::Full(self.capacity),
            TrySendError::Disconnected(_) => CommandSendError::Closed,
        })
    }
}

/// Consumer half of the command channel, owned by the driving loop.
///
/// Commands come out strictly in FIFO order, at most one per poll, and
/// only once their timestamp is due. A future-stamped command blocks
/// everything behind it until its time arrives; nothing is ever
/// silently discarded.
#[derive(Debug)]
pub struct CommandQueue {
    rx: Receiver<SetpointCommand>,
    pending: Option<SetpointCommand>,
}

impl CommandQueue {
    /// Returns the next command whose timestamp is `<= now_s`, if any.
    ///
    /// Non-blocking; called exactly once per tick by the driving loop
    /// before the plant step, so command application never interleaves
    /// with an in-progress step.
    pub fn next_due(&mut self, now_s: f64) -> Option<SetpointCommand> {
        if self.pending.is_none() {
            self.pending = match self.rx.try_recv() {
                Ok(cmd) => Some(cmd),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
            };
        }
        match self.pending {
            Some(cmd) if cmd.time_s <= now_s => self.pending.take(),
            _ => None,
        }
    }

    /// Whether a command is sitting in the gate waiting for its time.
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }
}

/// Creates a bounded command channel of the given capacity.
pub fn command_channel(capacity: usize) -> (CommandSender, CommandQueue) {
    let (tx, rx) = sync_channel(capacity);
    (
        CommandSender { tx, capacity },
        CommandQueue { rx, pending: None },
    )
}

/// Shared simulation-time cell, readable from ingestion threads so
/// they can stamp commands with the loop's current time.
///
/// Stores the `f64` bit pattern in an atomic; the driving loop is the
/// only writer.
#[derive(Debug, Clone, Default)]
pub struct SharedTime(Arc<AtomicU64>);

impl SharedTime {
    /// Creates a cell starting at t = 0 s.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current simulation time (s).
    pub fn now_s(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    /// Publishes the loop's current simulation time (s).
    pub fn set_s(&self, time_s: f64) {
        self.0.store(time_s.to_bits(), Ordering::Relaxed);
    }
}
