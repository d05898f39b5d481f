// Channel-change requests flowing from the outside world into the playout
// loop.
//
// Two inputs feed one `ChannelSignal`: a requested channel index (jump) and
// a queue of tune commands (up/down/direct). The queue is also topped up
// from an optional command file, read and truncated on every poll.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "lowercase")]
pub enum TuneCommand {
    Up,
    Down,
    Direct { channel: u32 },
}

impl TuneCommand {
    /// Decode a JSON command. Anything unrecognised is logged and dropped.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        match serde_json::from_str(raw) {
            Ok(cmd) => Some(cmd),
            Err(e) => {
                warn!("ignoring channel command {raw:?}: {e}");
                None
            }
        }
    }
}

/// A pending change as seen by the playout loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelChange {
    Command(TuneCommand),
    /// Jump straight to a lineup index.
    Jump(usize),
}

#[derive(Debug)]
pub struct ChannelSignal {
    requested: AtomicUsize,
    commands: parking_lot::Mutex<VecDeque<TuneCommand>>,
    command_file: Option<PathBuf>,
}

impl ChannelSignal {
    pub fn new(initial_index: usize, command_file: Option<PathBuf>) -> Self {
        Self {
            requested: AtomicUsize::new(initial_index),
            commands: parking_lot::Mutex::new(VecDeque::new()),
            command_file,
        }
    }

    /// Queue `command`, returning the commands already ahead of it.
    pub fn push(&self, command: TuneCommand) -> Vec<TuneCommand> {
        debug!("queued channel command {command:?}");
        let mut queue = self.commands.lock();
        let ahead = queue.iter().copied().collect();
        queue.push_back(command);
        ahead
    }

    pub fn request_index(&self, index: usize) {
        self.requested.store(index, Ordering::Release);
    }

    pub fn requested_index(&self) -> usize {
        self.requested.load(Ordering::Acquire)
    }

    /// Record that the loop is now tuned to `index`. The jump request is
    /// cleared only if it still reads `consumed`; a request made since then
    /// stays pending. Queued commands stay queued.
    pub fn settle(&self, consumed: usize, index: usize) {
        let _ = self
            .requested
            .compare_exchange(consumed, index, Ordering::AcqRel, Ordering::Acquire);
    }

    /// Consume the next change for a loop tuned to `tuned`, if any. Queued
    /// commands come before a jump request.
    pub async fn take(&self, tuned: usize) -> Option<ChannelChange> {
        self.drain_command_file().await;
        if let Some(cmd) = self.commands.lock().pop_front() {
            return Some(ChannelChange::Command(cmd));
        }
        let requested = self.requested_index();
        (requested != tuned).then_some(ChannelChange::Jump(requested))
    }

    async fn drain_command_file(&self) {
        let Some(path) = &self.command_file else {
            return;
        };
        let raw = match tokio::fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => {
                debug!("channel command file {}: {e}", path.display());
                return;
            }
        };
        if raw.trim().is_empty() {
            return;
        }
        if let Err(e) = tokio::fs::write(path, b"").await {
            warn!("could not truncate {}: {e}", path.display());
        }
        let mut queue = self.commands.lock();
        queue.extend(raw.lines().filter_map(TuneCommand::parse));
    }
}
