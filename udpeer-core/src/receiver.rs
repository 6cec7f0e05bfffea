//! Receiver session table: routes FILE/CHUNK/END to per-transfer sessions and decides the reply.
//!
//! Host-driven like the rest of the core: the host decodes a datagram, calls the matching
//! handler and sends back `Handled::reply` (if any) to the datagram's source.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::path::{Path, PathBuf};

use crate::integrity;
use crate::protocol::{Message, HASH_MISMATCH};
use crate::session::{ChunkOutcome, EndOutcome, TransferSession};

/// What the table did with a message; for the host's log.
#[derive(Debug)]
pub enum ReceiverEvent {
    Opened { path: PathBuf, size: u64 },
    /// FILE repeated for a live transfer; existing session kept.
    Reoffered,
    /// FILE refused (unusable name or the output file could not be created).
    Refused { reason: String },
    Chunk { seq: u32, outcome: ChunkOutcome },
    /// No live session for this id.
    UnknownTransfer,
    /// Session was discarded after a failed verification; message ignored.
    Discarded,
    Validated {
        path: PathBuf,
        declared: u64,
        written: u64,
    },
    AlreadyValidated,
    Mismatch { local: String, claimed: String },
    Failed(io::Error),
}

#[derive(Debug)]
pub struct Handled {
    pub reply: Option<Message>,
    pub event: ReceiverEvent,
}

impl Handled {
    fn ack(id: &str, event: ReceiverEvent) -> Self {
        Self {
            reply: Some(Message::ack(id)),
            event,
        }
    }

    fn silent(event: ReceiverEvent) -> Self {
        Self { reply: None, event }
    }
}

/// First half of END handling; see [`TransferTable::prepare_end`].
#[derive(Debug)]
pub enum EndStep {
    /// Answered without touching the file.
    Done(Handled),
    /// Sink sealed; fingerprint this file and pass the result to [`TransferTable::conclude_end`].
    Verify(PathBuf),
}

/// How many finished transfers (verified or discarded) are remembered for replayed END/FILE.
pub const RETAINED_FINISHED: usize = 256;

/// Receiver-side sessions keyed by transfer id.
///
/// Live sessions stay until their END. Finished ones are kept so that a replayed END is
/// re-ACKed and a discarded id stays silent, but only the latest [`RETAINED_FINISHED`] of
/// them; older ids are forgotten and their messages treated as unknown.
pub struct TransferTable {
    local_name: String,
    inbox: PathBuf,
    sessions: HashMap<String, TransferSession>,
    discarded: HashSet<String>,
    finished: VecDeque<String>,
    retain_finished: usize,
}

impl TransferTable {
    pub fn new(local_name: impl Into<String>, inbox: impl Into<PathBuf>) -> Self {
        Self {
            local_name: local_name.into(),
            inbox: inbox.into(),
            sessions: HashMap::new(),
            discarded: HashSet::new(),
            finished: VecDeque::new(),
            retain_finished: RETAINED_FINISHED,
        }
    }

    pub fn session(&self, id: &str) -> Option<&TransferSession> {
        self.sessions.get(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// On-disk path for a declared file name: `received_<local>_<name>` in the inbox.
    /// Only the final path component of the declared name is used.
    pub fn target_path(&self, file_name: &str) -> Option<PathBuf> {
        let base = Path::new(file_name).file_name()?.to_str()?;
        Some(
            self.inbox
                .join(format!("received_{}_{}", self.local_name, base)),
        )
    }

    /// FILE: open a session and acknowledge the intent to receive.
    pub fn on_file(&mut self, id: &str, file_name: &str, size: u64) -> Handled {
        if self.discarded.contains(id) {
            return Handled::silent(ReceiverEvent::Discarded);
        }
        if self.sessions.contains_key(id) {
            return Handled::ack(id, ReceiverEvent::Reoffered);
        }
        let Some(path) = self.target_path(file_name) else {
            return Handled::silent(ReceiverEvent::Refused {
                reason: format!("unusable file name {:?}", file_name),
            });
        };
        match TransferSession::create(&path, size) {
            Ok(session) => {
                self.sessions.insert(id.to_string(), session);
                Handled::ack(id, ReceiverEvent::Opened { path, size })
            }
            Err(e) => Handled::silent(ReceiverEvent::Refused {
                reason: format!("cannot create {}: {}", path.display(), e),
            }),
        }
    }

    /// CHUNK: apply to the session. Duplicates and out-of-order chunks are acknowledged too.
    pub fn on_chunk(&mut self, id: &str, seq: u32, data: &[u8]) -> Handled {
        if self.discarded.contains(id) {
            return Handled::silent(ReceiverEvent::Discarded);
        }
        let Some(session) = self.sessions.get_mut(id) else {
            return Handled::silent(ReceiverEvent::UnknownTransfer);
        };
        match session.apply_chunk(seq, data) {
            Ok(outcome) => Handled::ack(id, ReceiverEvent::Chunk { seq, outcome }),
            Err(e) => Handled::silent(ReceiverEvent::Failed(e)),
        }
    }

    /// END: verify the file. A mismatch answers one NACK and discards the session for good.
    ///
    /// Hashes on the calling thread; async hosts use [`Self::prepare_end`] and
    /// [`Self::conclude_end`] to fingerprint elsewhere.
    pub fn on_end(&mut self, id: &str, claimed: &str) -> Handled {
        match self.prepare_end(id) {
            EndStep::Done(handled) => handled,
            EndStep::Verify(path) => {
                let local = integrity::fingerprint_file(&path);
                self.conclude_end(id, claimed, local)
            }
        }
    }

    /// Seal the session's sink, or answer at once when there is nothing to verify.
    pub fn prepare_end(&mut self, id: &str) -> EndStep {
        if self.discarded.contains(id) {
            return EndStep::Done(Handled::silent(ReceiverEvent::Discarded));
        }
        let Some(session) = self.sessions.get_mut(id) else {
            return EndStep::Done(Handled::silent(ReceiverEvent::UnknownTransfer));
        };
        if session.is_validated() {
            return EndStep::Done(Handled::ack(id, ReceiverEvent::AlreadyValidated));
        }
        match session.seal() {
            Ok(()) => EndStep::Verify(session.path().to_path_buf()),
            Err(e) => EndStep::Done(Handled::silent(ReceiverEvent::Failed(e))),
        }
    }

    /// Finish END with the fingerprint `local` computed over the sealed file.
    pub fn conclude_end(&mut self, id: &str, claimed: &str, local: io::Result<String>) -> Handled {
        if self.discarded.contains(id) {
            return Handled::silent(ReceiverEvent::Discarded);
        }
        let Some(session) = self.sessions.get_mut(id) else {
            return Handled::silent(ReceiverEvent::UnknownTransfer);
        };
        let local = match local {
            Ok(local) => local,
            Err(e) => return Handled::silent(ReceiverEvent::Failed(e)),
        };
        match session.verify(local, claimed) {
            EndOutcome::AlreadyValidated => Handled::ack(id, ReceiverEvent::AlreadyValidated),
            EndOutcome::Validated => {
                let event = ReceiverEvent::Validated {
                    path: session.path().to_path_buf(),
                    declared: session.declared_size(),
                    written: session.bytes_written(),
                };
                self.retire(id);
                Handled::ack(id, event)
            }
            EndOutcome::Mismatch { local } => {
                self.sessions.remove(id);
                self.discarded.insert(id.to_string());
                self.retire(id);
                Handled {
                    reply: Some(Message::nack(id, HASH_MISMATCH)),
                    event: ReceiverEvent::Mismatch {
                        local,
                        claimed: claimed.to_string(),
                    },
                }
            }
        }
    }

    /// Remember `id` as finished, forgetting the oldest finished transfer past the limit.
    fn retire(&mut self, id: &str) {
        self.finished.push_back(id.to_string());
        while self.finished.len() > self.retain_finished {
            if let Some(old) = self.finished.pop_front() {
                self.sessions.remove(&old);
                self.discarded.remove(&old);
            }
        }
    }
}
