//! Block transfer from the tester to the ECU (RequestDownload, TransferData, RequestTransferExit)

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    thread,
    time::Duration,
};

use log::{debug, warn};

use super::{
    DiagnosticSession, FromMessage, GenericResponse, MAX_TRANSFER_DATA_LENGTH, Message, Service,
    responses::require_len,
};
use crate::{DiagError, DiagServerResult};

/// How a failed block is retried
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RetryPolicy {
    /// Additional attempts per block after the first one fails
    pub retries: u32,
    /// Pause before each additional attempt
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 0,
            backoff: Duration::from_millis(100),
        }
    }
}

/// Block transfer options
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TransferOptions {
    /// Retry policy for a single block. No retries by default
    pub retry: RetryPolicy,
}

/// Progress of a block transfer. Shared with observers through an `Arc`
#[derive(Debug)]
pub struct TransferProgress {
    total: u64,
    completed: AtomicU64,
}

impl TransferProgress {
    pub(crate) fn new(total: u64) -> Self {
        Self {
            total,
            completed: AtomicU64::new(0),
        }
    }

    pub(crate) fn advance(&self, bytes: usize) {
        self.completed.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Bytes to transfer
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Bytes acknowledged by the ECU so far
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Completed fraction between 0.0 and 1.0
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.completed() as f64 / self.total as f64
        }
    }

    /// Returns true once every byte has been acknowledged
    pub fn is_finished(&self) -> bool {
        self.completed() >= self.total
    }
}

/// Reply to RequestDownload
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RequestDownloadResponse {
    /// Length format identifier. The high nibble is the byte count of the block length
    pub length_format_identifier: u8,
    /// Largest TransferData request the ECU accepts, including service ID and sequence counter
    pub max_block_length: usize,
}

impl FromMessage for RequestDownloadResponse {
    fn from_message(message: &Message) -> DiagServerResult<Self> {
        require_len(message, 2)?;
        let b = message.bytes();
        let lfid = b[1];
        let count = (lfid >> 4) as usize;
        if !(1..=size_of::<usize>()).contains(&count) {
            return Err(DiagError::DecoderError(format!(
                "unsupported block length format {lfid:02X}"
            )));
        }
        require_len(message, 2 + count)?;
        let max_block_length = b[2..2 + count]
            .iter()
            .fold(0usize, |acc, x| acc << 8 | *x as usize);
        Ok(Self {
            length_format_identifier: lfid,
            max_block_length,
        })
    }
}

impl DiagnosticSession {
    /// Starts a download of `length` bytes to `address`. Both are big endian, 1 to 15 bytes
    pub fn request_download(
        &self,
        compression: u8,
        encryption: u8,
        address: &[u8],
        length: &[u8],
    ) -> DiagServerResult<RequestDownloadResponse> {
        self.request(&Service::RequestDownload {
            compression,
            encryption,
            address: address.to_vec(),
            length: length.to_vec(),
        })
    }

    /// Transfers a single block. Its maximum size depends on the adapter
    pub fn transfer_block(&self, sequence: u8, data: &[u8]) -> DiagServerResult<GenericResponse> {
        self.request(&Service::TransferData {
            sequence,
            data: data.to_vec(),
        })
    }

    /// Ends the transfer. `record` is the transfer request parameter record, empty if the
    /// ECU expects none
    pub fn transfer_exit(&self, record: &[u8]) -> DiagServerResult<GenericResponse> {
        self.request(&Service::RequestTransferExit(record.to_vec()))
    }

    /// Transfers `data` in blocks of `mtu - 2` bytes.
    ///
    /// The block sequence counter starts at 1 and wraps from 0xFF to 0x00. Progress is observable
    /// through [DiagnosticSession::active_transfer_progress] while the transfer runs.
    /// The first block that fails (after the configured retries) ends the transfer, clears the
    /// progress and its error is returned as is. On success the reply to the last block is returned
    pub fn transfer_data(&self, data: &[u8]) -> DiagServerResult<GenericResponse> {
        if data.is_empty() {
            return Err(DiagError::ParameterInvalid);
        }
        let mtu = self.pipeline().mtu();
        if mtu <= 2 {
            return Err(DiagError::ParameterInvalid);
        }
        let chunk_size = (mtu - 2).min(MAX_TRANSFER_DATA_LENGTH);
        let progress = Arc::new(TransferProgress::new(data.len() as u64));
        self.set_progress(Some(progress.clone()));
        debug!(
            "Transferring {} bytes in blocks of {chunk_size}",
            data.len()
        );

        let mut sequence: u8 = 1;
        let mut last = None;
        for chunk in data.chunks(chunk_size) {
            match self.transfer_block_with_retry(sequence, chunk) {
                Ok(response) => {
                    progress.advance(chunk.len());
                    last = Some(response);
                }
                Err(e) => {
                    self.set_progress(None);
                    return Err(e);
                }
            }
            sequence = sequence.wrapping_add(1);
        }
        last.ok_or(DiagError::ParameterInvalid)
    }

    fn transfer_block_with_retry(&self, sequence: u8, chunk: &[u8]) -> DiagServerResult<GenericResponse> {
        let policy = self.options.retry;
        let mut attempt = 0;
        loop {
            match self.transfer_block(sequence, chunk) {
                Ok(r) => return Ok(r),
                Err(e) if attempt < policy.retries && is_retryable(&e) => {
                    attempt += 1;
                    warn!("Block {sequence:02X} failed ({e}), retry {attempt}/{}", policy.retries);
                    thread::sleep(policy.backoff);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn is_retryable(e: &DiagError) -> bool {
    !matches!(
        e,
        DiagError::AdapterGone
            | DiagError::AdapterNotConnected
            | DiagError::ChannelError(_)
            | DiagError::MalformedService
    )
}
