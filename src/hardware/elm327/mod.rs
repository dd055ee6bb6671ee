//! ELM327 / STN serial adapter driver
//!
//! [SerialAdapter] owns a [CommandQueue] and a [CommandProvider]. After [SerialAdapter::connect]
//! it runs the bring-up sequence on its own as it is polled:
//!
//! 1. A bare carriage return probes for an adapter. No reply means [AdapterState::NotFound].
//! 2. The init sequence resets the adapter, switches echo / line feeds / spaces off, headers on,
//!    identifies the chip and probes its segmentation behaviour.
//! 3. The protocol the adapter locked onto is queried. CAN protocols get their timing and
//!    formatting configured, then a codec is installed and the adapter is [AdapterState::Connected].
//!
//! Diagnostic requests are queued with [SerialAdapter::submit] and complete through a callback,
//! or through the blocking [Adapter] implementation which pumps [SerialAdapter::poll] itself.

use std::{
    collections::VecDeque,
    fmt::{Debug, Formatter, Result as FmtResult},
    sync::mpsc::{self, TryRecvError},
    thread,
    time::{Duration, Instant},
};

use log::{debug, error, info, trace, warn};

mod commands;
mod queue;

pub use commands::*;
pub use queue::*;

use super::{
    Adapter, AdapterCapabilities, AdapterEvent, AdapterEventHandler, AdapterInfo, AdapterIc,
    AdapterState, RECEIVE_ANY,
};
use crate::{
    BusProtocol, DiagError, DiagServerResult, Header,
    bus::{
        BROADCAST_11_BIT, BusProtocolDecoder, BusProtocolEncoder, IsoTpDecoder, KwpDecoder,
        NullProtocolEncoder,
    },
    channel::ByteChannel,
    uds::{Message, NEGATIVE_RESPONSE_INDICATOR, is_response_pending_code},
};

/// Reply ELM327 clones give to `AT@1` when the vendor did not set a description
const ELM327_DEFAULT_DESCRIPTION: &str = "OBDII to RS232 Interpreter";

/// Largest frame an adapter sends without segmentation
const SINGLE_FRAME_LENGTH: usize = 8;

/// Serial adapter options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialAdapterOptions {
    /// Options of the underlying command queue
    pub queue: QueueOptions,
    /// Command timeout until the adapter is connected
    pub bring_up_timeout: Duration,
    /// Command timeout once the adapter is connected
    pub command_timeout: Duration,
    /// Sleep between polls of the blocking [Adapter] methods while nothing happens
    pub poll_interval: Duration,
    /// ECU reply timeout set on CAN protocols, in 4 ms steps
    pub ecu_timeout: u8,
    /// STN ISO-TP flow control timeout
    pub stn_flow_control_timeout: u8,
    /// STN ISO-TP consecutive frame timeout
    pub stn_consecutive_frame_timeout: u8,
}

impl Default for SerialAdapterOptions {
    fn default() -> Self {
        Self {
            queue: QueueOptions::default(),
            bring_up_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(1),
            ecu_timeout: 0xFF,
            stn_flow_control_timeout: 255,
            stn_consecutive_frame_timeout: 255,
        }
    }
}

/// Completion of a submitted message
pub type SendCompletion = Box<dyn FnOnce(DiagServerResult<Vec<Message>>) + Send>;

/// What the adapter learns during bring-up. Committed in one go once the sequence is done
#[derive(Debug, Clone)]
struct BringUp {
    info: AdapterInfo,
    capabilities: AdapterCapabilities,
    detected_ecus: Vec<Header>,
    can_auto_format: bool,
}

impl Default for BringUp {
    fn default() -> Self {
        Self {
            info: AdapterInfo::default(),
            capabilities: AdapterCapabilities::default(),
            detected_ecus: Vec::new(),
            // Every ELM327 compatible adapter starts with CAN auto formatting on
            can_auto_format: true,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum SendStage {
    Header(Header),
    ReceiveFilter(Header),
    Announce,
    Data,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Step {
    BringUp(StringCommand),
    BringUpBarrier,
    Configure(StringCommand),
    ConfigureBarrier,
    Send(SendStage),
}

#[derive(Debug)]
struct PendingStep {
    token: CommandToken,
    step: Step,
    command: Option<StringCommand>,
    request: String,
    parser: Option<ResponseParser>,
}

struct SendJob {
    message: Message,
    frame: Vec<u8>,
    expected_frames: Option<usize>,
    /// Service ID to filter "response pending" frames for. `None` for raw sends
    decode_sid: Option<u8>,
    announce: bool,
    stages: VecDeque<SendStage>,
    completion: SendCompletion,
}

/// Adapter driver for ELM327 compatible serial adapters. See the module documentation
pub struct SerialAdapter<C: ByteChannel> {
    queue: CommandQueue<C>,
    provider: Box<dyn CommandProvider>,
    options: SerialAdapterOptions,
    state: AdapterState,
    desired_protocol: BusProtocol,
    reported_protocol: BusProtocol,
    negotiated_protocol: BusProtocol,
    header: Header,
    reply_header: Header,
    bring_up: BringUp,
    info: Option<AdapterInfo>,
    capabilities: AdapterCapabilities,
    can_auto_format: bool,
    detected_ecus: Vec<Header>,
    battery_voltage: Option<f32>,
    encoder: Option<Box<dyn BusProtocolEncoder>>,
    decoder: Option<Box<dyn BusProtocolDecoder>>,
    mtu: usize,
    steps: VecDeque<PendingStep>,
    jobs: VecDeque<SendJob>,
    active_job: Option<SendJob>,
    handlers: Vec<Box<dyn AdapterEventHandler>>,
}

impl<C: ByteChannel> Debug for SerialAdapter<C> {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("SerialAdapter")
            .field("state", &self.state)
            .field("negotiated_protocol", &self.negotiated_protocol)
            .field("info", &self.info)
            .field("mtu", &self.mtu)
            .field("queue", &self.queue)
            .finish()
    }
}

impl<C: ByteChannel> SerialAdapter<C> {
    /// Creates an adapter on `channel` using the ELM327 / STN command set
    pub fn new(channel: C, options: SerialAdapterOptions) -> Self {
        Self::with_provider(channel, Box::new(DefaultCommandProvider), options)
    }

    /// Creates an adapter with a custom command provider
    pub fn with_provider(
        channel: C,
        provider: Box<dyn CommandProvider>,
        options: SerialAdapterOptions,
    ) -> Self {
        Self {
            queue: CommandQueue::new(channel, options.queue.clone()),
            provider,
            options,
            state: AdapterState::Created,
            desired_protocol: BusProtocol::Auto,
            reported_protocol: BusProtocol::Unknown,
            negotiated_protocol: BusProtocol::Unknown,
            header: BROADCAST_11_BIT,
            reply_header: RECEIVE_ANY,
            bring_up: BringUp::default(),
            info: None,
            capabilities: AdapterCapabilities::default(),
            can_auto_format: true,
            detected_ecus: Vec::new(),
            battery_voltage: None,
            encoder: None,
            decoder: None,
            mtu: 0,
            steps: VecDeque::new(),
            jobs: VecDeque::new(),
            active_job: None,
            handlers: Vec::new(),
        }
    }

    /// Registers an observer. Handlers are called in registration order
    pub fn add_event_handler(&mut self, handler: Box<dyn AdapterEventHandler>) {
        self.handlers.push(handler);
    }

    /// Protocol requested in [SerialAdapter::connect]
    pub fn desired_protocol(&self) -> BusProtocol {
        self.desired_protocol
    }

    /// Capabilities probed during bring-up
    pub fn capabilities(&self) -> AdapterCapabilities {
        self.capabilities
    }

    /// Returns true if the adapter adds CAN PCI bytes itself
    pub fn can_auto_format(&self) -> bool {
        self.can_auto_format
    }

    /// Headers of the ECUs that answered the first bus request
    pub fn detected_ecus(&self) -> &[Header] {
        &self.detected_ecus
    }

    /// Battery voltage read during configuration (CAN protocols only)
    pub fn battery_voltage(&self) -> Option<f32> {
        self.battery_voltage
    }

    /// Installed encoder, once connected
    pub fn encoder(&self) -> Option<&dyn BusProtocolEncoder> {
        self.encoder.as_deref()
    }

    /// Installed decoder, once connected
    pub fn decoder(&self) -> Option<&dyn BusProtocolDecoder> {
        self.decoder.as_deref()
    }

    /// Access to the transport
    pub fn channel_mut(&mut self) -> &mut C {
        self.queue.channel_mut()
    }

    /// Opens the transport and starts the bring-up sequence for `protocol`
    /// ([BusProtocol::Auto] lets the adapter search).
    ///
    /// Only valid once, in [AdapterState::Created].
    pub fn connect(&mut self, protocol: BusProtocol) -> DiagServerResult<()> {
        if self.state != AdapterState::Created {
            return Err(DiagError::IllegalState(self.state));
        }
        self.desired_protocol = protocol;
        let handlers = &mut self.handlers;
        let opened = self.queue.open(|channel| {
            for handler in handlers.iter_mut() {
                handler.on_device_initializable(channel);
            }
        });
        if let Err(e) = opened {
            error!("Could not open transport: {e}");
            self.set_state(AdapterState::Gone);
            return Err(e.into());
        }
        self.set_state(AdapterState::Searching);
        self.send_init_sequence();
        Ok(())
    }

    /// Polls until the adapter is connected.
    ///
    /// Fails with [DiagError::IllegalState] if bring-up ends in a terminal state,
    /// or [DiagError::NoResponse] once `timeout` elapses
    pub fn wait_until_connected(&mut self, timeout: Duration) -> DiagServerResult<()> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.state {
                AdapterState::Connected => return Ok(()),
                AdapterState::Created => return Err(DiagError::IllegalState(self.state)),
                s if s.is_terminal() => return Err(DiagError::IllegalState(s)),
                _ => {}
            }
            if Instant::now() > deadline {
                return Err(DiagError::NoResponse);
            }
            if !self.poll() {
                thread::sleep(self.options.poll_interval);
            }
        }
    }

    /// Queues `message` for sending.
    ///
    /// With `decode` set, the payload goes through the negotiated encoder, "response pending"
    /// frames are dropped and the remaining frames are reassembled into a single message.
    /// Otherwise the payload is sent as is and every reply frame is returned.
    /// `completion` runs from [SerialAdapter::poll]; it is dropped without being called if the
    /// adapter goes away first.
    pub fn submit(
        &mut self,
        message: Message,
        expected_frames: Option<usize>,
        decode: bool,
        completion: impl FnOnce(DiagServerResult<Vec<Message>>) + Send + 'static,
    ) -> DiagServerResult<()> {
        if self.state.is_terminal() {
            return Err(DiagError::AdapterGone);
        }
        if self.state != AdapterState::Connected {
            return Err(DiagError::AdapterNotConnected);
        }
        let (frame, decode_sid) = if decode {
            let encoder = self.encoder.as_ref().ok_or(DiagError::AdapterNotConnected)?;
            let frame = encoder.encode(message.bytes())?;
            let sid = frame
                .get(encoder.payload_offset())
                .copied()
                .ok_or_else(|| DiagError::EncoderError("encoder produced no payload".into()))?;
            (frame, Some(sid))
        } else {
            (message.bytes().to_vec(), None)
        };
        let announce = frame.len() > SINGLE_FRAME_LENGTH && self.info_ic().is_stn();
        self.jobs.push_back(SendJob {
            message,
            frame,
            expected_frames,
            decode_sid,
            announce,
            stages: VecDeque::new(),
            completion: Box::new(completion),
        });
        Ok(())
    }

    /// Advances the adapter: starts queued sends, moves bytes and handles completed commands.
    ///
    /// Returns true if anything happened
    pub fn poll(&mut self) -> bool {
        let started = self.start_next_job();
        let events = self.queue.poll(Instant::now());
        let progressed = started || !events.is_empty();
        for event in events {
            match event {
                QueueEvent::Completed { token, response } => self.on_completed(token, response),
                QueueEvent::StreamClosed => {
                    warn!("Adapter closed the stream");
                    self.abandon(AdapterState::Gone);
                }
                QueueEvent::StreamError(e) => {
                    error!("Adapter stream failed: {e}");
                    self.abandon(AdapterState::Gone);
                }
            }
        }
        progressed
    }

    fn info_ic(&self) -> AdapterIc {
        self.info.as_ref().map(|i| i.ic).unwrap_or_default()
    }

    fn emit(&mut self, event: AdapterEvent) {
        for handler in self.handlers.iter_mut() {
            handler.on_event(&event);
        }
    }

    fn set_state(&mut self, to: AdapterState) {
        let from = self.state;
        if from == to || from.is_terminal() {
            return;
        }
        info!("Adapter state {from} -> {to}");
        self.state = to;
        self.emit(AdapterEvent::StateChanged { from, to });
    }

    /// Drops everything in flight and moves to a terminal state
    fn abandon(&mut self, to: AdapterState) {
        self.queue.flush();
        self.steps.clear();
        if self.active_job.is_some() || !self.jobs.is_empty() {
            debug!("Abandoning {} send(s)", self.jobs.len() + usize::from(self.active_job.is_some()));
        }
        self.active_job = None;
        self.jobs.clear();
        if to == AdapterState::Gone {
            self.queue.close();
        }
        self.set_state(to);
    }

    /// Protocol replies are parsed with before negotiation completes
    fn parse_protocol(&self) -> BusProtocol {
        match self.negotiated_protocol {
            BusProtocol::Unknown => match self.desired_protocol {
                BusProtocol::Auto => BusProtocol::Unknown,
                p => p,
            },
            p => p,
        }
    }

    /// Queues a step. Steps without a command are barriers
    fn issue(&mut self, step: Step, command: Option<StringCommand>) {
        let timeout = if self.state == AdapterState::Connected {
            self.options.command_timeout
        } else {
            self.options.bring_up_timeout
        };
        let spec = command.as_ref().and_then(|c| {
            let spec = self.provider.provide(c);
            if spec.is_none() {
                warn!("No textual form for {c:?} on this adapter");
            }
            spec
        });
        // Unresolvable commands still take a (dummy) slot, so they fail in order
        let (request, termination, parser) = match spec {
            Some(spec) => (spec.request, spec.termination, Some(spec.parser)),
            None => (String::new(), None, None),
        };
        let wire = if request.is_empty() && parser.is_none() {
            String::new()
        } else {
            format!("{request}\r")
        };
        trace!("Issuing {step:?} as {request:?}");
        match self.queue.send(&wire, termination, Some(timeout)) {
            Ok(token) => self.steps.push_back(PendingStep {
                token,
                step,
                command,
                request,
                parser,
            }),
            Err(e) => {
                error!("Could not queue {step:?}: {e}");
                self.abandon(AdapterState::Gone);
            }
        }
    }

    fn on_completed(&mut self, token: CommandToken, response: String) {
        match self.steps.front() {
            Some(p) if p.token == token => {}
            _ => {
                trace!("Ignoring completion of {token:?}");
                return;
            }
        }
        let Some(pending) = self.steps.pop_front() else {
            return;
        };
        let result = match (&pending.command, pending.parser) {
            (Some(_), Some(parser)) => parser(
                &response,
                &ParseContext {
                    request: &pending.request,
                    protocol: self.parse_protocol(),
                },
            ),
            (Some(_), None) => Err(DiagError::UnrecognizedCommand),
            (None, _) => Ok(CommandResponse::Ok),
        };
        if let Some(command) = pending.command {
            debug!("{command:?} -> {result:?}");
            self.emit(AdapterEvent::CommandCompleted {
                command,
                success: result.is_ok(),
            });
        }
        match pending.step {
            Step::BringUp(command) => self.handle_bring_up(&command, result),
            Step::BringUpBarrier => self.finish_bring_up(),
            Step::Configure(command) => self.handle_configure(&command, result),
            Step::ConfigureBarrier => self.negotiate(self.reported_protocol),
            Step::Send(stage) => self.handle_send(stage, result),
        }
    }

    fn send_init_sequence(&mut self) {
        use StringCommand::*;
        let mut sequence = vec![
            Dummy,
            Reset,
            Spaces(false),
            Echo(false),
            Linefeed(false),
            ShowHeaders(true),
            Identify,
            Version1,
            Version2,
            StnExtendedIdentify,
            StnDeviceIdentify,
            StnSerialNumber,
            StnCanSegmentationTransmit(true),
            UnicarsIdentify,
            SetProtocol(self.desired_protocol),
            Connect,
            ProbeAutoSegmentation,
            ProbeSmallFrameNoResponse,
        ];
        // Non CAN protocols end up in a strange state after these
        if self.desired_protocol.is_can() {
            sequence.extend([CanAutoFormat(false), ProbeFullFrameNoResponse, CanAutoFormat(true)]);
        }
        for command in sequence {
            self.issue(Step::BringUp(command.clone()), Some(command));
        }
        self.issue(Step::BringUpBarrier, None);
    }

    fn handle_bring_up(&mut self, command: &StringCommand, result: DiagServerResult<CommandResponse>) {
        let b = &mut self.bring_up;
        let text = match &result {
            Ok(CommandResponse::Text(t)) => Some(t.as_str()),
            _ => None,
        };
        match command {
            StringCommand::Dummy => {
                if matches!(result, Err(DiagError::NoResponse)) {
                    warn!("No adapter answered the presence probe");
                    self.abandon(AdapterState::NotFound);
                } else {
                    self.set_state(AdapterState::Initializing);
                }
            }
            StringCommand::Identify => {
                if let Some(t) = text {
                    match t.split_whitespace().collect::<Vec<_>>().as_slice() {
                        [id, version] => {
                            b.info.identification = id.to_string();
                            b.info.firmware_version = version.to_string();
                        }
                        _ => b.info.identification = t.to_string(),
                    }
                    b.info.ic = AdapterIc::Elm327;
                }
            }
            StringCommand::Version1 => {
                if let Some(t) = text.filter(|t| *t != ELM327_DEFAULT_DESCRIPTION) {
                    b.info.model = t.to_string();
                }
            }
            StringCommand::StnExtendedIdentify => {
                if let Some(t) = text {
                    match t.split_whitespace().collect::<Vec<_>>().as_slice() {
                        [id, version, _, ..] => {
                            b.info.identification = id.to_string();
                            b.info.firmware_version = version.to_string();
                        }
                        _ => b.info.identification = t.to_string(),
                    }
                    b.info.ic = if t.starts_with("STN11") {
                        AdapterIc::Stn11xx
                    } else {
                        AdapterIc::Stn22xx
                    };
                    b.info.vendor = "ScanTool.net".into();
                }
            }
            StringCommand::StnDeviceIdentify => {
                if let Some(t) = text {
                    b.info.model = t.to_string();
                }
            }
            StringCommand::StnSerialNumber => {
                if let Some(t) = text {
                    b.info.serial_number = t.to_string();
                }
            }
            StringCommand::UnicarsIdentify => {
                if let Some(t) = text.filter(|t| t.contains("WGSoft.de")) {
                    b.info.model = if t.contains("2021") {
                        "UniCarScan 2100".into()
                    } else {
                        "UniCarScan 2000".into()
                    };
                    b.info.ic = AdapterIc::UniCarScan;
                    b.info.vendor = "WGSoft.de".into();
                }
            }
            StringCommand::Connect => match result {
                Ok(CommandResponse::Ecus(ecus)) if !ecus.is_empty() => b.detected_ecus = ecus,
                Ok(_) => {}
                Err(e) => debug!("Connect failed: {e}"),
            },
            StringCommand::ProbeAutoSegmentation => {
                b.capabilities.has_auto_segmentation = result.is_ok();
            }
            StringCommand::ProbeSmallFrameNoResponse => {
                b.capabilities.has_small_frame_no_response = text.is_some_and(str::is_empty);
            }
            StringCommand::ProbeFullFrameNoResponse => {
                b.capabilities.has_full_frame_no_response = result.is_ok();
            }
            StringCommand::CanAutoFormat(on) => {
                if result.is_ok() {
                    b.can_auto_format = *on;
                }
            }
            other => {
                if let Err(e) = result {
                    debug!("{other:?} failed during bring-up: {e}");
                }
            }
        }
    }

    fn finish_bring_up(&mut self) {
        let mut b = std::mem::take(&mut self.bring_up);
        b.capabilities.maximum_auto_segmentation_frame_length =
            b.info.ic.maximum_auto_segmentation_frame_length();
        info!(
            "Adapter {} ({}, {:?}) by {}, firmware {}, serial {}",
            b.info.model,
            b.info.identification,
            b.info.ic,
            b.info.vendor,
            b.info.firmware_version,
            b.info.serial_number
        );
        self.info = Some(b.info);
        self.capabilities = b.capabilities;
        self.detected_ecus = b.detected_ecus;
        self.can_auto_format = b.can_auto_format;
        self.set_state(AdapterState::Configuring);
        if self.state == AdapterState::Configuring {
            let command = StringCommand::DescribeProtocolNumeric;
            self.issue(Step::Configure(command.clone()), Some(command));
        }
    }

    fn handle_configure(&mut self, command: &StringCommand, result: DiagServerResult<CommandResponse>) {
        match (command, result) {
            (StringCommand::DescribeProtocolNumeric, result) => match result {
                Ok(CommandResponse::Protocol(p)) if !matches!(p, BusProtocol::Auto | BusProtocol::Unknown) => {
                    self.reported_protocol = p;
                    if p.is_can() {
                        self.send_can_config_sequence();
                    } else {
                        self.negotiate(p);
                    }
                }
                other => {
                    warn!("Adapter did not lock onto a bus protocol: {other:?}");
                    self.abandon(AdapterState::UnsupportedProtocol);
                }
            },
            (StringCommand::ReadVoltage, Ok(CommandResponse::Voltage(v))) => {
                debug!("Battery voltage {v:.1} V");
                self.battery_voltage = Some(v);
            }
            (StringCommand::CanAutoFormat(on), Ok(_)) => self.can_auto_format = *on,
            (other, Err(e)) => debug!("{other:?} failed during configuration: {e}"),
            _ => {}
        }
    }

    fn send_can_config_sequence(&mut self) {
        use StringCommand::*;
        let caps = self.capabilities;
        let caf = !(!caps.has_auto_segmentation && caps.has_full_frame_no_response);
        let mut sequence = vec![
            ReadVoltage,
            CanAutoFormat(caf),
            AdaptiveTiming(false),
            SetTimeout(self.options.ecu_timeout),
        ];
        if self.info_ic().is_stn() {
            sequence.push(StnCanSegmentationTimeouts {
                flow_control: self.options.stn_flow_control_timeout,
                consecutive_frame: self.options.stn_consecutive_frame_timeout,
            });
        }
        for command in sequence {
            self.issue(Step::Configure(command.clone()), Some(command));
        }
        self.issue(Step::ConfigureBarrier, None);
    }

    /// Installs the codec for `protocol` and finishes bring-up
    fn negotiate(&mut self, protocol: BusProtocol) {
        if self.negotiated_protocol != BusProtocol::Unknown {
            warn!("Protocol already negotiated as {}, ignoring {protocol}", self.negotiated_protocol);
            return;
        }
        let caps = self.capabilities;
        let encoder: Box<dyn BusProtocolEncoder>;
        let decoder: Box<dyn BusProtocolDecoder>;
        if protocol.is_kwp() {
            encoder = Box::new(NullProtocolEncoder::new(SINGLE_FRAME_LENGTH - 1));
            decoder = Box::new(KwpDecoder);
        } else if protocol.is_can() {
            encoder = Box::new(
                if caps.has_auto_segmentation && caps.maximum_auto_segmentation_frame_length > 0 {
                    NullProtocolEncoder::new(caps.maximum_auto_segmentation_frame_length)
                } else if self.can_auto_format {
                    NullProtocolEncoder::new(SINGLE_FRAME_LENGTH - 1)
                } else {
                    NullProtocolEncoder::length_prefixed(SINGLE_FRAME_LENGTH)
                },
            );
            decoder = Box::new(IsoTpDecoder);
        } else {
            error!("{}", DiagError::UnsupportedBusProtocol(protocol));
            self.abandon(AdapterState::UnsupportedProtocol);
            return;
        }
        self.mtu = encoder.maximum_payload_length();
        info!(
            "Negotiated {protocol}: {encoder:?} / {}, MTU {}",
            decoder.name(),
            self.mtu
        );
        self.encoder = Some(encoder);
        self.decoder = Some(decoder);
        self.negotiated_protocol = protocol;
        self.emit(AdapterEvent::ProtocolNegotiated(protocol));
        self.set_state(AdapterState::Connected);
    }

    fn start_next_job(&mut self) -> bool {
        if self.active_job.is_some() || self.state != AdapterState::Connected || !self.steps.is_empty() {
            return false;
        }
        let Some(mut job) = self.jobs.pop_front() else {
            return false;
        };
        // Resync adapter side addressing lazily, each independently of the other
        if self.header != job.message.id() {
            job.stages.push_back(SendStage::Header(job.message.id()));
        }
        if self.reply_header != job.message.reply() {
            job.stages.push_back(SendStage::ReceiveFilter(job.message.reply()));
        }
        if job.announce {
            job.stages.push_back(SendStage::Announce);
        }
        job.stages.push_back(SendStage::Data);
        trace!("Sending {} in {} stage(s)", job.message, job.stages.len());
        self.active_job = Some(job);
        self.issue_next_stage();
        true
    }

    fn issue_next_stage(&mut self) {
        let Some(job) = self.active_job.as_mut() else {
            return;
        };
        let Some(stage) = job.stages.pop_front() else {
            return;
        };
        let command = match stage {
            SendStage::Header(h) => StringCommand::SetHeader(h),
            SendStage::ReceiveFilter(h) => StringCommand::CanReceiveArbitration(h),
            SendStage::Announce => StringCommand::StnAnnounce {
                length: job.frame.len(),
                expected_frames: job.expected_frames,
            },
            SendStage::Data => StringCommand::Data {
                bytes: job.frame.clone(),
                // After an announce the frame count travels with the announce
                expected_frames: if job.announce { None } else { job.expected_frames },
            },
        };
        self.issue(Step::Send(stage), Some(command));
    }

    fn handle_send(&mut self, stage: SendStage, result: DiagServerResult<CommandResponse>) {
        let Some(job) = self.active_job.take() else {
            return;
        };
        match (stage, result) {
            (SendStage::Header(h), Ok(_)) => self.header = h,
            (SendStage::ReceiveFilter(h), Ok(_)) => self.reply_header = h,
            (SendStage::Header(_) | SendStage::ReceiveFilter(_), Err(e)) => {
                warn!("Could not set arbitration for {}: {e}", job.message);
                (job.completion)(Err(DiagError::UnrecognizedCommand));
                return;
            }
            (SendStage::Announce, Ok(_)) => {}
            (SendStage::Announce, Err(e)) => {
                (job.completion)(Err(e));
                return;
            }
            (SendStage::Data, result) => {
                let result = result.and_then(|r| self.reassemble(&job, r));
                (job.completion)(result);
                return;
            }
        }
        self.active_job = Some(job);
        self.issue_next_stage();
    }

    fn reassemble(&self, job: &SendJob, response: CommandResponse) -> DiagServerResult<Vec<Message>> {
        let CommandResponse::Frames(frames) = response else {
            return Err(DiagError::WrongMessage);
        };
        let Some(sid) = job.decode_sid else {
            return Ok(frames);
        };
        let frames: Vec<Message> = frames
            .into_iter()
            .filter(|f| {
                let pending = matches!(
                    f.bytes(),
                    [0x03, NEGATIVE_RESPONSE_INDICATOR, s, nrc, ..] if *s == sid && is_response_pending_code(*nrc)
                );
                if pending {
                    warn!("Dropping transient response pending frame {f}");
                }
                !pending
            })
            .collect();
        let Some(first) = frames.first() else {
            return Err(DiagError::NoResponse);
        };
        let bytes: Vec<u8> = frames.iter().flat_map(|f| f.bytes().iter().copied()).collect();
        let decoder = self.decoder.as_ref().ok_or(DiagError::AdapterNotConnected)?;
        let decoded = decoder.decode(&bytes)?;
        Ok(vec![Message::new(first.id(), decoded)?])
    }

    fn run_blocking(
        &mut self,
        message: &Message,
        expected_frames: Option<usize>,
        decode: bool,
    ) -> DiagServerResult<Vec<Message>> {
        let (tx, rx) = mpsc::channel();
        self.submit(message.clone(), expected_frames, decode, move |r| {
            let _ = tx.send(r);
        })?;
        loop {
            match rx.try_recv() {
                Ok(result) => return result,
                Err(TryRecvError::Disconnected) => return Err(DiagError::AdapterGone),
                Err(TryRecvError::Empty) => {}
            }
            if !self.poll() {
                thread::sleep(self.options.poll_interval);
            }
        }
    }
}

impl<C: ByteChannel> Adapter for SerialAdapter<C> {
    fn state(&self) -> AdapterState {
        self.state
    }

    fn info(&self) -> Option<&AdapterInfo> {
        self.info.as_ref()
    }

    fn negotiated_protocol(&self) -> BusProtocol {
        self.negotiated_protocol
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    fn send(&mut self, message: &Message) -> DiagServerResult<Message> {
        self.run_blocking(message, None, true)?
            .pop()
            .ok_or(DiagError::NoResponse)
    }

    fn send_raw(
        &mut self,
        message: &Message,
        expected_frames: Option<usize>,
    ) -> DiagServerResult<Vec<Message>> {
        self.run_blocking(message, expected_frames, false)
    }

    fn shutdown(&mut self) {
        self.abandon(AdapterState::Gone);
    }
}

impl<C: ByteChannel> Drop for SerialAdapter<C> {
    fn drop(&mut self) {
        if !self.queue.is_closed() {
            self.queue.close();
        }
    }
}
