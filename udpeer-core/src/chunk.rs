//! Sender side of a file transfer: split a file into datagram-sized chunks and track the
//! transfer through its phases. No I/O beyond the `Read` handed in.

use std::io::{self, Read};

use crate::protocol::{Message, MAX_DATAGRAM_LEN};
use crate::retry::RetryPolicy;
use crate::wire::chunk_header;

/// Largest raw block whose base64 encoding fits behind a header of `header_len` bytes.
///
/// Rounded down to a multiple of 3 so the padded encoding never exceeds the space left.
pub fn max_raw_block(header_len: usize) -> usize {
    let max_payload = MAX_DATAGRAM_LEN.saturating_sub(header_len);
    max_payload / 4 * 3
}

/// Raw block size for chunk `seq` of transfer `id`.
pub fn block_size(id: &str, seq: u32) -> usize {
    max_raw_block(chunk_header(id, seq).len())
}

/// One block read from the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub seq: u32,
    pub data: Vec<u8>,
}

impl Block {
    pub fn into_message(self, id: &str) -> Message {
        Message::Chunk {
            id: id.to_string(),
            seq: self.seq,
            data: self.data,
        }
    }
}

/// Reads a source sequentially into blocks numbered from 0.
pub struct ChunkReader<R> {
    reader: R,
    id: String,
    next_seq: u32,
    done: bool,
}

impl<R: Read> ChunkReader<R> {
    pub fn new(reader: R, id: impl Into<String>) -> Self {
        Self {
            reader,
            id: id.into(),
            next_seq: 0,
            done: false,
        }
    }
}

impl<R: Read> Iterator for ChunkReader<R> {
    type Item = io::Result<Block>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let limit = block_size(&self.id, self.next_seq);
        let mut data = Vec::with_capacity(limit);
        if let Err(e) = (&mut self.reader).take(limit as u64).read_to_end(&mut data) {
            self.done = true;
            return Some(Err(e));
        }
        if data.is_empty() {
            self.done = true;
            return None;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        Some(Ok(Block { seq, data }))
    }
}

/// Phases of an outbound transfer. `Failed` is reachable from every non-terminal phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPhase {
    Init,
    SendingChunks,
    Finalizing,
    Complete,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    pub sent: u64,
    pub total: u64,
    pub percent: u8,
}

/// State of one outbound transfer.
#[derive(Debug, Clone)]
pub struct OutboundTransfer {
    id: String,
    file_name: String,
    total_bytes: u64,
    acked_bytes: u64,
    acked_chunks: u32,
    phase: TransferPhase,
}

impl OutboundTransfer {
    pub fn new(id: impl Into<String>, file_name: impl Into<String>, total_bytes: u64) -> Self {
        Self {
            id: id.into(),
            file_name: file_name.into(),
            total_bytes,
            acked_bytes: 0,
            acked_chunks: 0,
            phase: TransferPhase::Init,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn phase(&self) -> TransferPhase {
        self.phase
    }

    pub fn acked_chunks(&self) -> u32 {
        self.acked_chunks
    }

    /// The FILE message that opens the transfer.
    pub fn offer(&self) -> Message {
        Message::File {
            id: self.id.clone(),
            file_name: self.file_name.clone(),
            size: self.total_bytes,
        }
    }

    pub fn offer_acked(&mut self) {
        if self.phase == TransferPhase::Init {
            self.phase = TransferPhase::SendingChunks;
        }
    }

    /// Retry budget for the next chunk, given progress so far.
    pub fn chunk_policy(&self) -> RetryPolicy {
        RetryPolicy::for_chunk(self.acked_bytes, self.total_bytes)
    }

    pub fn chunk_acked(&mut self, len: usize) -> TransferProgress {
        debug_assert_eq!(self.phase, TransferPhase::SendingChunks);
        self.acked_bytes += len as u64;
        self.acked_chunks += 1;
        self.progress()
    }

    /// Move to finalizing and build the END message.
    pub fn finalize(&mut self, fingerprint: impl Into<String>) -> Message {
        if self.phase == TransferPhase::SendingChunks {
            self.phase = TransferPhase::Finalizing;
        }
        Message::End {
            id: self.id.clone(),
            fingerprint: fingerprint.into(),
        }
    }

    pub fn complete(&mut self) {
        if self.phase == TransferPhase::Finalizing {
            self.phase = TransferPhase::Complete;
        }
    }

    pub fn fail(&mut self) {
        if self.phase != TransferPhase::Complete {
            self.phase = TransferPhase::Failed;
        }
    }

    pub fn progress(&self) -> TransferProgress {
        let percent = if self.total_bytes == 0 {
            100
        } else {
            (u128::from(self.acked_bytes) * 100 / u128::from(self.total_bytes)).min(100) as u8
        };
        TransferProgress {
            sent: self.acked_bytes,
            total: self.total_bytes,
            percent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire;

    const ID: &str = "1734000000000000000";

    #[test]
    fn raw_block_fits_datagram() {
        for header_len in 20..40 {
            let raw = max_raw_block(header_len);
            let encoded = raw.div_ceil(3) * 4;
            assert!(header_len + encoded <= MAX_DATAGRAM_LEN, "header {header_len}");
            assert_eq!(raw % 3, 0);
        }
    }

    #[test]
    fn every_chunk_datagram_within_limit() {
        let data = vec![0xabu8; 3000];
        for block in ChunkReader::new(&data[..], ID) {
            let bytes = wire::encode(&block.unwrap().into_message(ID)).unwrap();
            assert!(bytes.len() <= MAX_DATAGRAM_LEN);
        }
    }

    #[test]
    fn reader_splits_in_order() {
        let data: Vec<u8> = (0..3000u32).map(|i| (i % 256) as u8).collect();
        let b = block_size(ID, 0);
        let blocks: Vec<Block> = ChunkReader::new(&data[..], ID)
            .collect::<io::Result<_>>()
            .unwrap();
        assert_eq!(blocks.len(), 3000usize.div_ceil(b));
        assert!(blocks.iter().enumerate().all(|(i, b)| b.seq == i as u32));
        let joined: Vec<u8> = blocks.into_iter().flat_map(|b| b.data).collect();
        assert_eq!(joined, data);
    }

    #[test]
    fn empty_source_yields_no_blocks() {
        assert_eq!(ChunkReader::new(io::empty(), ID).count(), 0);
    }

    #[test]
    fn header_growth_shrinks_block() {
        assert!(block_size(ID, 10_000) <= block_size(ID, 0));
    }

    #[test]
    fn phases_advance_in_order() {
        let mut t = OutboundTransfer::new(ID, "a.bin", 100);
        assert_eq!(t.phase(), TransferPhase::Init);
        assert!(matches!(t.offer(), Message::File { size: 100, .. }));
        t.offer_acked();
        assert_eq!(t.phase(), TransferPhase::SendingChunks);
        assert_eq!(t.chunk_acked(60).percent, 60);
        assert_eq!(t.chunk_policy().max_attempts, 7);
        assert_eq!(t.chunk_acked(40).percent, 100);
        let end = t.finalize("ff");
        assert_eq!(t.phase(), TransferPhase::Finalizing);
        assert!(matches!(end, Message::End { ref fingerprint, .. } if fingerprint == "ff"));
        t.complete();
        assert_eq!(t.phase(), TransferPhase::Complete);
        t.fail();
        assert_eq!(t.phase(), TransferPhase::Complete);
    }

    #[test]
    fn failure_from_handshake() {
        let mut t = OutboundTransfer::new(ID, "a.bin", 100);
        t.fail();
        assert_eq!(t.phase(), TransferPhase::Failed);
        t.offer_acked();
        assert_eq!(t.phase(), TransferPhase::Failed);
    }
}
