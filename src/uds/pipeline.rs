//! Turns services into addressed messages and hands them to the adapter

use std::{
    fmt::Debug,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use log::debug;

use super::{Message, Service};
use crate::{
    DiagError, DiagServerResult, Header,
    hardware::{Adapter, AdapterState},
    transcript::Transcript,
};

/// Adapter shared between pipelines and sessions
pub type SharedAdapter = Arc<Mutex<dyn Adapter>>;

/// Sends services to a connected adapter.
///
/// Requests from every clone of a pipeline are serialized by the adapter's mutex, so only
/// one request is ever in flight on the link.
#[derive(Clone)]
pub struct Pipeline {
    adapter: SharedAdapter,
    transcript: Option<Transcript>,
}

impl Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("transcript", &self.transcript.is_some())
            .finish()
    }
}

impl Pipeline {
    /// Creates a pipeline on top of an adapter, which must already be connected
    pub fn new(adapter: SharedAdapter) -> DiagServerResult<Self> {
        let state = lock(&adapter).state();
        if state != AdapterState::Connected {
            return Err(DiagError::AdapterNotConnected);
        }
        Ok(Self {
            adapter,
            transcript: None,
        })
    }

    /// Records every request and reply to `transcript`
    pub fn with_transcript(mut self, transcript: Transcript) -> Self {
        self.transcript = Some(transcript);
        self
    }

    /// The adapter this pipeline sends through
    pub fn adapter(&self) -> SharedAdapter {
        self.adapter.clone()
    }

    /// Largest payload the adapter can carry in one frame
    pub fn mtu(&self) -> usize {
        lock(&self.adapter).mtu()
    }

    /// Sends `service` to `to`, expecting the reply on `reply` (default `to | 0x08`).
    ///
    /// A service whose payload cannot be built fails with [DiagError::MalformedService]
    /// without anything being transmitted.
    pub fn send(
        &self,
        to: Header,
        reply: Option<Header>,
        service: &Service,
    ) -> DiagServerResult<Message> {
        let payload = service.payload();
        if payload.is_empty() {
            return Err(DiagError::MalformedService);
        }
        let message = match reply {
            Some(reply) => Message::with_reply(to, reply, payload)?,
            None => Message::new(to, payload)?,
        };
        debug!("Sending {message}");
        if let Some(t) = &self.transcript {
            t.record_request(&message);
        }
        let result = lock(&self.adapter).send(&message);
        if let Some(t) = &self.transcript {
            t.record_reply(&result);
        }
        match &result {
            Ok(m) => debug!("Received {m}"),
            Err(e) => debug!("Request {message} failed: {e}"),
        }
        result
    }
}

fn lock(adapter: &SharedAdapter) -> MutexGuard<'_, dyn Adapter + 'static> {
    adapter.lock().unwrap_or_else(PoisonError::into_inner)
}
