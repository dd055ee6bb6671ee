//! Request / response correlation with a single ECU

use std::sync::{Arc, Mutex, PoisonError};

use automotive_diag::uds::UdsErrorByte;

use super::{FromMessage, POSITIVE_RESPONSE_OFFSET, Pipeline, REPLY_OFFSET, Service, TransferOptions, TransferProgress};
use crate::{DiagError, DiagServerResult, Header};

/// A UDS diagnostic session with one ECU.
///
/// The session does not own the adapter; several sessions may share one [Pipeline], but their
/// requests are serialized by it.
#[derive(Debug)]
pub struct DiagnosticSession {
    id: Header,
    reply: Header,
    pipeline: Pipeline,
    pub(crate) options: TransferOptions,
    pub(crate) progress: Mutex<Option<Arc<TransferProgress>>>,
}

impl DiagnosticSession {
    /// Creates a session that sends on `id` and expects replies on `reply`,
    /// or on `id | 0x08` if no reply header is given
    pub fn new(id: Header, reply: Option<Header>, pipeline: Pipeline) -> Self {
        Self {
            id,
            reply: reply.unwrap_or(id | REPLY_OFFSET),
            pipeline,
            options: TransferOptions::default(),
            progress: Mutex::new(None),
        }
    }

    /// Replaces the block transfer options
    pub fn with_transfer_options(mut self, options: TransferOptions) -> Self {
        self.options = options;
        self
    }

    /// Request header
    pub fn id(&self) -> Header {
        self.id
    }

    /// Reply header
    pub fn reply(&self) -> Header {
        self.reply
    }

    /// Pipeline requests are sent through
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Progress of the block transfer in flight, if any
    pub fn active_transfer_progress(&self) -> Option<Arc<TransferProgress>> {
        self.progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_progress(&self, progress: Option<Arc<TransferProgress>>) {
        *self.progress.lock().unwrap_or_else(PoisonError::into_inner) = progress;
    }

    /// Sends `service` and decodes the positive response as `T`.
    ///
    /// A negative response is returned as [DiagError::UdsNegativeResponse]; codes unknown to
    /// ISO14229 are carried as [crate::Extended]. A negative response naming another service
    /// is [DiagError::WrongMessage].
    pub fn request<T: FromMessage>(&self, service: &Service) -> DiagServerResult<T> {
        let message = self.pipeline.send(self.id, Some(self.reply), service)?;
        if message.is_negative_response() {
            if message.bytes().get(1) != Some(&service.service_id()) {
                return Err(DiagError::WrongMessage);
            }
            let code = message
                .negative_response_code()
                .ok_or(DiagError::InvalidResponseLength)?;
            return Err(DiagError::UdsNegativeResponse(UdsErrorByte::from(code)));
        }
        if message.bytes()[0] != service.service_id().wrapping_add(POSITIVE_RESPONSE_OFFSET) {
            return Err(DiagError::WrongMessage);
        }
        T::from_message(&message)
    }
}
