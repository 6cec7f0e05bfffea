//! Outbound exchanges: TALK, and files driven through FILE -> CHUNK* -> END.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use udpeer_core::{
    integrity, new_transfer_id, wire, ChunkReader, EncodeError, Message, OutboundTransfer,
    RetryPolicy, TransferProgress,
};

use crate::delivery::{deliver, DeliveryError, Link};

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("TALK not acknowledged: {0}")]
    Talk(#[source] DeliveryError),
    #[error("file offer not acknowledged: {0}")]
    Handshake(#[source] DeliveryError),
    #[error("chunk {seq} not acknowledged: {source}")]
    Chunk { seq: u32, source: DeliveryError },
    #[error("transfer not confirmed: {0}")]
    Finalize(#[source] DeliveryError),
    #[error("receiver rejected the file: {reason}")]
    Rejected { reason: String },
    #[error("{} has no usable file name", .0.display())]
    InvalidFileName(PathBuf),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    pub transfer_id: String,
    pub bytes_sent: u64,
    pub chunks: u32,
}

/// Send a text message; 3 attempts, no backoff. Returns the id used.
pub async fn send_talk<L: Link>(link: &L, text: &str) -> Result<String, TransferError> {
    let id = new_transfer_id();
    let datagram = wire::encode(&Message::Talk {
        id: id.clone(),
        text: text.to_string(),
    })?;
    deliver(link, &datagram, &id, RetryPolicy::TALK)
        .await
        .map_err(TransferError::Talk)?;
    Ok(id)
}

/// Transfer the file at `path`. `on_progress` runs after every acknowledged chunk.
///
/// Any step that exhausts its retry budget aborts the transfer.
pub async fn send_file<L, F>(link: &L, path: &Path, mut on_progress: F) -> Result<TransferReport, TransferError>
where
    L: Link,
    F: FnMut(TransferProgress),
{
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| TransferError::InvalidFileName(path.to_path_buf()))?;
    let file = File::open(path)?;
    let size = file.metadata()?.len();

    let mut transfer = OutboundTransfer::new(new_transfer_id(), file_name, size);
    let id = transfer.id().to_string();

    let offer = wire::encode(&transfer.offer())?;
    deliver(link, &offer, &id, RetryPolicy::FILE_OFFER)
        .await
        .map_err(|e| abort(&mut transfer, TransferError::Handshake(e)))?;
    transfer.offer_acked();
    info!(id = %id, file = file_name, size, "offer accepted, sending chunks");

    for block in ChunkReader::new(BufReader::new(file), id.as_str()) {
        let block = block.map_err(|e| abort(&mut transfer, e.into()))?;
        let seq = block.seq;
        let len = block.data.len();
        let policy = transfer.chunk_policy();
        let datagram = wire::encode(&block.into_message(&id))?;
        let delivered = deliver(link, &datagram, &id, policy)
            .await
            .map_err(|source| abort(&mut transfer, TransferError::Chunk { seq, source }))?;
        debug!(id = %id, seq, attempts = delivered.attempts, budget = policy.max_attempts, "chunk acknowledged");
        on_progress(transfer.chunk_acked(len));
    }

    let fingerprint = fingerprint_path(path)
        .await
        .map_err(|e| abort(&mut transfer, e.into()))?;
    let end = wire::encode(&transfer.finalize(fingerprint))?;
    deliver(link, &end, &id, RetryPolicy::END)
        .await
        .map_err(|e| {
            let err = match e {
                DeliveryError::Rejected { reason } => TransferError::Rejected { reason },
                e => TransferError::Finalize(e),
            };
            abort(&mut transfer, err)
        })?;
    transfer.complete();
    info!(id = %id, file = file_name, size, "transfer complete");

    Ok(TransferReport {
        transfer_id: id,
        bytes_sent: transfer.progress().sent,
        chunks: transfer.acked_chunks(),
    })
}

/// Mark the transfer failed, logging the phase it stopped in.
fn abort(transfer: &mut OutboundTransfer, err: TransferError) -> TransferError {
    warn!(id = transfer.id(), phase = ?transfer.phase(), error = %err, "transfer aborted");
    transfer.fail();
    err
}

async fn fingerprint_path(path: &Path) -> io::Result<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || integrity::fingerprint_file(&path))
        .await
        .map_err(io::Error::other)?
}
