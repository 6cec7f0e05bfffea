//! Receiver side of one file transfer: in-order append, replay guard, final verification.

use std::collections::HashSet;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::integrity;

/// What happened to an incoming chunk. Every variant is acknowledged on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Appended to the sink; `expected_seq` advanced.
    Written,
    /// Sequence number already accepted; nothing written.
    Duplicate,
    /// Not the next sequence number; dropped without being recorded.
    OutOfOrder { expected: u32 },
    /// Sink already closed by END; nothing written.
    Sealed,
}

/// Result of verifying the transfer at END.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndOutcome {
    /// Verified earlier; nothing recomputed.
    AlreadyValidated,
    Validated,
    Mismatch { local: String },
}

pub struct TransferSession {
    path: PathBuf,
    declared_size: u64,
    expected_seq: u32,
    received: HashSet<u32>,
    bytes_written: u64,
    validated: bool,
    sink: Option<BufWriter<File>>,
}

impl TransferSession {
    /// Create (truncating) the output file at `path`.
    pub fn create(path: impl Into<PathBuf>, declared_size: u64) -> io::Result<Self> {
        let path = path.into();
        let file = File::create(&path)?;
        Ok(Self {
            path,
            declared_size,
            expected_seq: 0,
            received: HashSet::new(),
            bytes_written: 0,
            validated: false,
            sink: Some(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn declared_size(&self) -> u64 {
        self.declared_size
    }

    pub fn expected_seq(&self) -> u32 {
        self.expected_seq
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn is_validated(&self) -> bool {
        self.validated
    }

    /// Apply chunk `seq`. Only the next expected, unseen sequence number is written.
    pub fn apply_chunk(&mut self, seq: u32, data: &[u8]) -> io::Result<ChunkOutcome> {
        if self.received.contains(&seq) {
            return Ok(ChunkOutcome::Duplicate);
        }
        if seq != self.expected_seq {
            return Ok(ChunkOutcome::OutOfOrder {
                expected: self.expected_seq,
            });
        }
        let Some(sink) = self.sink.as_mut() else {
            return Ok(ChunkOutcome::Sealed);
        };
        sink.write_all(data)?;
        self.received.insert(seq);
        self.expected_seq += 1;
        self.bytes_written += data.len() as u64;
        Ok(ChunkOutcome::Written)
    }

    /// Flush and close the sink; later chunks are `Sealed`. The file is complete on disk
    /// afterwards, so it can be fingerprinted off the receive path and handed to [`Self::verify`].
    pub fn seal(&mut self) -> io::Result<()> {
        match self.sink.take() {
            Some(sink) => {
                let file = sink.into_inner().map_err(|e| e.into_error())?;
                file.sync_all()
            }
            None => Ok(()),
        }
    }

    /// Record the result of comparing the sealed file's fingerprint `local` with `claimed`.
    pub fn verify(&mut self, local: String, claimed: &str) -> EndOutcome {
        if self.validated {
            return EndOutcome::AlreadyValidated;
        }
        if integrity::fingerprints_match(&local, claimed) {
            self.validated = true;
            EndOutcome::Validated
        } else {
            EndOutcome::Mismatch { local }
        }
    }
}
