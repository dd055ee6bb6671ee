//! Adapter directives and their textual form
//!
//! [StringCommand] names what the adapter should do. A [CommandProvider] turns it into
//! the ASCII request for a particular adapter family together with the parser for its reply.

use std::{collections::HashSet, fmt::Debug, str::FromStr};

use crate::{
    BusProtocol, DiagError, DiagServerResult, Header, hex_string, parse_hex, uds::Message,
};

/// Every directive the adapter driver issues
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum StringCommand {
    /// Bare carriage return, used to probe for an adapter
    Dummy,
    /// Full reset
    Reset,
    /// Echo of received characters
    Echo(bool),
    /// Line feed after carriage returns
    Linefeed(bool),
    /// Spaces between hex bytes
    Spaces(bool),
    /// Print frame headers
    ShowHeaders(bool),
    /// Generic identification
    Identify,
    /// Device description
    Version1,
    /// Device identifier
    Version2,
    /// STN chip identification
    StnExtendedIdentify,
    /// STN device (product) identification
    StnDeviceIdentify,
    /// STN serial number
    StnSerialNumber,
    /// STN transmit segmentation
    StnCanSegmentationTransmit(bool),
    /// STN ISO-TP flow control / consecutive frame timeouts
    StnCanSegmentationTimeouts {
        /// Flow control timeout
        flow_control: u8,
        /// Consecutive frame timeout
        consecutive_frame: u8,
    },
    /// STN announcement of a long payload, answered with a data prompt
    StnAnnounce {
        /// Number of payload bytes that follow
        length: usize,
        /// Number of reply frames to wait for
        expected_frames: Option<usize>,
    },
    /// UniCarScan identification
    UnicarsIdentify,
    /// Select a bus protocol
    SetProtocol(BusProtocol),
    /// Talk to the bus for the first time, returning every answering ECU
    Connect,
    /// Does the adapter segment long frames by itself
    ProbeAutoSegmentation,
    /// Does the adapter accept a short frame expecting no reply
    ProbeSmallFrameNoResponse,
    /// Does the adapter accept a full frame expecting no reply (auto formatting off)
    ProbeFullFrameNoResponse,
    /// Battery voltage at the OBD port
    ReadVoltage,
    /// CAN auto formatting (PCI bytes added by the adapter)
    CanAutoFormat(bool),
    /// Adaptive timing
    AdaptiveTiming(bool),
    /// ECU reply timeout, in 4 ms steps
    SetTimeout(u8),
    /// Transmit header
    SetHeader(Header),
    /// Receive filter. [crate::hardware::RECEIVE_ANY] removes the filter
    CanReceiveArbitration(Header),
    /// Payload bytes for the bus
    Data {
        /// Payload
        bytes: Vec<u8>,
        /// Number of reply frames to wait for
        expected_frames: Option<usize>,
    },
    /// Report the active protocol by number
    DescribeProtocolNumeric,
}

/// Typed result of a string command
#[derive(Debug, Clone, PartialEq)]
pub enum CommandResponse {
    /// The adapter acknowledged the directive
    Ok,
    /// Free form text
    Text(String),
    /// A bus protocol
    Protocol(BusProtocol),
    /// A voltage
    Voltage(f32),
    /// Headers of the ECUs that answered
    Ecus(Vec<Header>),
    /// Reply frames, one message per line
    Frames(Vec<Message>),
}

/// Context a reply is parsed in
#[derive(Debug, Copy, Clone)]
pub struct ParseContext<'a> {
    /// The request, without its carriage return. Used to recognise echoes
    pub request: &'a str,
    /// Negotiated protocol, [BusProtocol::Unknown] before negotiation
    pub protocol: BusProtocol,
}

/// Converts a raw reply into a [CommandResponse]
pub type ResponseParser = fn(&str, &ParseContext<'_>) -> DiagServerResult<CommandResponse>;

/// Textual form of a [StringCommand]
#[derive(Debug, Clone)]
pub struct CommandSpec {
    /// Request, without the trailing carriage return
    pub request: String,
    /// Reply terminator, if it differs from the queue's default
    pub termination: Option<&'static str>,
    /// Parser for the reply
    pub parser: ResponseParser,
}

impl CommandSpec {
    fn new(request: impl Into<String>, parser: ResponseParser) -> Self {
        Self {
            request: request.into(),
            termination: None,
            parser,
        }
    }
}

/// Maps directives to adapter specific strings
pub trait CommandProvider: Debug + Send {
    /// Returns the textual form of `command`, or `None` if this adapter family has no equivalent
    fn provide(&self, command: &StringCommand) -> Option<CommandSpec>;
}

/// Provider for ELM327 and the STN / UniCarScan chips that extend its command set
#[derive(Debug, Default, Copy, Clone)]
pub struct DefaultCommandProvider;

fn flag(b: bool) -> char {
    if b { '1' } else { '0' }
}

fn header_hex(h: Header) -> String {
    if h <= 0xFFF {
        format!("{h:03X}")
    } else if h <= 0xFF_FFFF {
        format!("{h:06X}")
    } else {
        format!("{h:08X}")
    }
}

impl CommandProvider for DefaultCommandProvider {
    fn provide(&self, command: &StringCommand) -> Option<CommandSpec> {
        use StringCommand::*;
        let spec = match command {
            Dummy => CommandSpec::new("", parse_any),
            Reset => CommandSpec::new("ATZ", parse_text),
            Echo(on) => CommandSpec::new(format!("ATE{}", flag(*on)), parse_ok),
            Linefeed(on) => CommandSpec::new(format!("ATL{}", flag(*on)), parse_ok),
            Spaces(on) => CommandSpec::new(format!("ATS{}", flag(*on)), parse_ok),
            ShowHeaders(on) => CommandSpec::new(format!("ATH{}", flag(*on)), parse_ok),
            Identify => CommandSpec::new("ATI", parse_text),
            Version1 => CommandSpec::new("AT@1", parse_text),
            Version2 => CommandSpec::new("AT@2", parse_text),
            StnExtendedIdentify => CommandSpec::new("STI", parse_text),
            StnDeviceIdentify => CommandSpec::new("STDI", parse_text),
            StnSerialNumber => CommandSpec::new("STSN", parse_text),
            StnCanSegmentationTransmit(on) => {
                CommandSpec::new(format!("STCSEGT{}", flag(*on)), parse_ok)
            }
            StnCanSegmentationTimeouts {
                flow_control,
                consecutive_frame,
            } => CommandSpec::new(
                format!("STCTOR{flow_control},{consecutive_frame}"),
                parse_ok,
            ),
            StnAnnounce {
                length,
                expected_frames,
            } => {
                let mut request = format!("STPX L:{length}");
                if let Some(n) = expected_frames {
                    request.push_str(&format!(", R:{n}"));
                }
                CommandSpec {
                    request,
                    termination: Some(STN_DATA_PROMPT),
                    parser: parse_data_prompt,
                }
            }
            UnicarsIdentify => CommandSpec::new("AT#1", parse_text),
            SetProtocol(p) => CommandSpec::new(format!("ATSP{}", p.code()), parse_ok),
            Connect => CommandSpec::new("0100", parse_ecus),
            ProbeAutoSegmentation => CommandSpec::new("STCSEGR0", parse_ok),
            ProbeSmallFrameNoResponse => CommandSpec::new("3E800", parse_raw),
            ProbeFullFrameNoResponse => CommandSpec::new("023E8000000000000", parse_raw),
            ReadVoltage => CommandSpec::new("ATRV", parse_voltage),
            CanAutoFormat(on) => CommandSpec::new(format!("ATCAF{}", flag(*on)), parse_ok),
            AdaptiveTiming(on) => CommandSpec::new(format!("ATAT{}", flag(*on)), parse_ok),
            SetTimeout(t) => CommandSpec::new(format!("ATST{t:02X}"), parse_ok),
            SetHeader(h) => CommandSpec::new(format!("ATSH{}", header_hex(*h)), parse_ok),
            CanReceiveArbitration(0) => CommandSpec::new("ATCRA", parse_ok),
            CanReceiveArbitration(h) => {
                CommandSpec::new(format!("ATCRA{}", header_hex(*h)), parse_ok)
            }
            Data {
                bytes,
                expected_frames,
            } => {
                let mut request = hex_string(bytes);
                // Only a single hex digit fits
                if let Some(n @ 1..=15) = expected_frames {
                    request.push_str(&format!("{n:X}"));
                }
                CommandSpec::new(request, parse_frames)
            }
            DescribeProtocolNumeric => CommandSpec::new("ATDPN", parse_protocol),
        };
        Some(spec)
    }
}

/// Prompt an STN chip prints when it is ready for the payload of an `STPX`
pub const STN_DATA_PROMPT: &str = "DATA\r";

/// Informational lines the adapter prints that carry no data
const STATUS_LINES: &[&str] = &["SEARCHING...", "BUS INIT: ...OK", "BUS INIT: OK"];

/// Textual error conditions, as printed by ELM327 and STN chips
const ERROR_LINES: &[&str] = &[
    "ACT ALERT",
    "BUFFER FULL",
    "BUS BUSY",
    "BUS ERROR",
    "BUS INIT: ...ERROR",
    "CAN ERROR",
    "DATA ERROR",
    "<DATA ERROR",
    "ERR",
    "FB ERROR",
    "LP ALERT",
    "LV RESET",
    "RX ERROR",
    "STOPPED",
    "UNABLE TO CONNECT",
];

/// Splits a reply into trimmed, non empty lines, dropping the echo of the request
/// and informational status lines
pub fn response_lines<'a>(response: &'a str, request: &str) -> Vec<&'a str> {
    response
        .split(['\r', '\n'])
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .filter(|l| request.is_empty() || !l.eq_ignore_ascii_case(request))
        .filter(|l| !STATUS_LINES.contains(l))
        .collect()
}

/// Maps the adapter's error replies onto [DiagError]
fn classify(lines: &[&str]) -> DiagError {
    match lines {
        [] => DiagError::NoResponse,
        ["?", ..] => DiagError::UnrecognizedCommand,
        ["NO DATA", ..] => DiagError::NoResponse,
        _ => {
            let text = lines.join(" ");
            match lines
                .iter()
                .find(|l| ERROR_LINES.iter().any(|e| l.starts_with(e)))
            {
                Some(l) => DiagError::AdapterError(l.to_string()),
                None => DiagError::AdapterError(text),
            }
        }
    }
}

fn parse_any(response: &str, ctx: &ParseContext<'_>) -> DiagServerResult<CommandResponse> {
    let lines = response_lines(response, ctx.request);
    if response.trim().is_empty() {
        return Err(DiagError::NoResponse);
    }
    Ok(CommandResponse::Text(lines.join(" ")))
}

fn parse_ok(response: &str, ctx: &ParseContext<'_>) -> DiagServerResult<CommandResponse> {
    let lines = response_lines(response, ctx.request);
    if lines.contains(&"OK") {
        Ok(CommandResponse::Ok)
    } else {
        Err(classify(&lines))
    }
}

fn parse_text(response: &str, ctx: &ParseContext<'_>) -> DiagServerResult<CommandResponse> {
    let lines = response_lines(response, ctx.request);
    match lines.as_slice() {
        [] | ["?", ..] => Err(classify(&lines)),
        _ => Ok(CommandResponse::Text(lines.join(" "))),
    }
}

/// Used for probes, where an empty reply is the interesting answer
fn parse_raw(response: &str, ctx: &ParseContext<'_>) -> DiagServerResult<CommandResponse> {
    let lines = response_lines(response, ctx.request);
    match lines.as_slice() {
        ["?", ..] => Err(DiagError::UnrecognizedCommand),
        _ => Ok(CommandResponse::Text(lines.join(" "))),
    }
}

fn parse_data_prompt(response: &str, ctx: &ParseContext<'_>) -> DiagServerResult<CommandResponse> {
    let lines = response_lines(response, ctx.request);
    // The prompt itself is stripped as termination, anything left over is an error
    if lines.is_empty() {
        Ok(CommandResponse::Ok)
    } else {
        Err(classify(&lines))
    }
}

fn parse_voltage(response: &str, ctx: &ParseContext<'_>) -> DiagServerResult<CommandResponse> {
    let lines = response_lines(response, ctx.request);
    lines
        .first()
        .and_then(|l| l.trim_end_matches(['V', 'v']).trim().parse::<f32>().ok())
        .map(CommandResponse::Voltage)
        .ok_or_else(|| classify(&lines))
}

fn parse_protocol(response: &str, ctx: &ParseContext<'_>) -> DiagServerResult<CommandResponse> {
    let lines = response_lines(response, ctx.request);
    let Some(line) = lines.first() else {
        return Err(DiagError::NoResponse);
    };
    // "A6" means protocol 6, found by automatic search
    let code = match line.len() {
        2 if line.starts_with('A') => &line[1..],
        _ => line,
    };
    BusProtocol::from_str(code)
        .map(CommandResponse::Protocol)
        .map_err(|_| classify(&lines))
}

/// Number of header characters on a line, if the protocol does not tell
fn guess_header_characters(line: &str) -> usize {
    if line.len() % 2 == 1 {
        3
    } else if line.starts_with("18") && line.len() > 8 {
        8
    } else {
        6
    }
}

/// Parses `<header><data>` lines into messages
fn parse_frame_lines(lines: &[&str], protocol: BusProtocol) -> DiagServerResult<Vec<Message>> {
    let mut frames = Vec::with_capacity(lines.len());
    for line in lines {
        let compact: String = line.chars().filter(|c| !c.is_whitespace()).collect();
        if !compact.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(classify(&[*line]));
        }
        let header_chars = match protocol {
            BusProtocol::Unknown | BusProtocol::Auto => guess_header_characters(&compact),
            p => p.header_characters(),
        };
        if compact.len() <= header_chars {
            return Err(DiagError::InvalidResponseLength);
        }
        let (header, data) = compact.split_at(header_chars);
        let header =
            Header::from_str_radix(header, 16).map_err(|_| DiagError::InvalidResponseLength)?;
        let data = parse_hex(data).ok_or(DiagError::InvalidResponseLength)?;
        frames.push(Message::new(header, data)?);
    }
    Ok(frames)
}

fn parse_frames(response: &str, ctx: &ParseContext<'_>) -> DiagServerResult<CommandResponse> {
    let lines = response_lines(response, ctx.request);
    if lines.is_empty() || lines.iter().any(|l| *l == "NO DATA" || *l == "?") {
        return Err(classify(&lines));
    }
    parse_frame_lines(&lines, ctx.protocol).map(CommandResponse::Frames)
}

fn parse_ecus(response: &str, ctx: &ParseContext<'_>) -> DiagServerResult<CommandResponse> {
    let CommandResponse::Frames(frames) = parse_frames(response, ctx)? else {
        return Err(DiagError::WrongMessage);
    };
    let mut seen = HashSet::new();
    let ecus = frames
        .iter()
        .map(Message::id)
        .filter(|h| seen.insert(*h))
        .collect();
    Ok(CommandResponse::Ecus(ecus))
}
