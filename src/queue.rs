//! Command queue (component C4, spec.md §3 "Command" / §4.4).
//!
//! Commands are plain `Copy` structs rather than pool-allocated heap objects - in safe
//! Rust a `{if_id, kind}` pair needs no arena, so this is a deliberate simplification of
//! the original's pooled-command bookkeeping (tracked in DESIGN.md). The bound itself -
//! `post` never blocks and returns `QueueFull` on overflow, `wait` blocks until a command
//! is available, exactly one Dispatcher Task ever drains it - is unchanged from spec.md.

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::channel::{Channel, TrySendError};

use crate::error::Error;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum CommandKind {
    Start,
    Stop,
    T1Expired,
    T2Expired,
    LeaseExpired,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Command {
    pub if_id: u32,
    pub kind: CommandKind,
}

/// Bounded FIFO of control events. `CAP` should be `MAX_IFACES * MAX_COMMANDS_PER_IFACE`
/// as spec.md §4.4 specifies; `M` is the `RawMutex` implementation backing the channel
/// (`NoopRawMutex` for a single-core / single-executor build, `CriticalSectionRawMutex`
/// otherwise).
pub struct CommandQueue<M, const CAP: usize>
where
    M: RawMutex,
{
    channel: Channel<M, Command, CAP>,
}

impl<M, const CAP: usize> CommandQueue<M, CAP>
where
    M: RawMutex,
{
    pub const fn new() -> Self {
        Self {
            channel: Channel::new(),
        }
    }

    /// Never blocks; `QueueFull` on overflow (spec.md §4.4).
    pub fn post(&self, command: Command) -> Result<(), Error> {
        self.channel.try_send(command).map_err(|err| match err {
            TrySendError::Full(_) => Error::QueueFull,
        })
    }

    /// Blocks until a command is available.
    pub async fn wait(&self) -> Command {
        self.channel.receive().await
    }
}

impl<M, const CAP: usize> Default for CommandQueue<M, CAP>
where
    M: RawMutex,
{
    fn default() -> Self {
        Self::new()
    }
}
