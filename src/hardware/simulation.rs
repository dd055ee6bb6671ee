//! Simulated ELM327 / STN adapter for testing diagnostic servers without hardware
//!
//! [SimulatedElm327] is a [ByteChannel] which interprets the AT / ST commands written to it
//! and answers the way a real adapter would, including echo, the `>` prompt and the STN
//! `STPX` data prompt. Bus traffic is answered from a request to reply table.
//! The channel is cheaply cloneable so a test can keep a handle for scripting and
//! inspection while the adapter owns another.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use crate::{
    BusProtocol, hex_string, parse_hex,
    channel::{ByteChannel, ChannelError, ChannelResult},
};

#[derive(Debug)]
struct SimState {
    open: bool,
    hung_up: bool,
    silent: bool,
    stn: bool,
    full_frame_no_response: bool,
    noise: bool,
    max_read_chunk: usize,
    identification: String,
    search_result: BusProtocol,
    voltage: String,

    echo: bool,
    linefeed: bool,
    caf: bool,
    protocol: BusProtocol,
    searched: bool,
    awaiting_data: Option<usize>,

    line: Vec<u8>,
    output: VecDeque<u8>,
    sent: Vec<String>,
    bus_replies: HashMap<String, Vec<String>>,
    command_replies: HashMap<String, String>,
}

impl SimState {
    fn reset(&mut self) {
        self.echo = true;
        self.linefeed = true;
        self.caf = true;
        self.searched = false;
        self.awaiting_data = None;
    }

    fn push_reply(&mut self, lines: &[&str], prompt: &str) {
        let eol = if self.linefeed { "\r\n" } else { "\r" };
        let mut reply = String::new();
        for line in lines {
            reply.push_str(line);
            reply.push_str(eol);
        }
        reply.push_str(eol);
        reply.push_str(prompt);
        for b in reply.bytes() {
            self.output.push_back(b);
            // Cheap adapters are known to emit garbage between lines
            if self.noise && b == b'\r' {
                self.output.extend([0x00, 0xFF]);
            }
        }
    }

    fn handle_line(&mut self, raw: &str) {
        let line: String = raw
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_ascii_uppercase();
        self.sent.push(line.clone());
        if self.silent {
            return;
        }
        if self.echo {
            let echo = format!("{raw}\r");
            self.output.extend(echo.bytes());
        }
        if let Some(reply) = self.command_replies.get(&line).cloned() {
            let lines: Vec<&str> = reply.lines().collect();
            self.push_reply(&lines, ">");
            return;
        }
        if let Some(length) = self.awaiting_data.take() {
            self.handle_data(&line, Some(length));
            return;
        }
        if line.is_empty() {
            self.push_reply(&["?"], ">");
            return;
        }
        if let Some(at) = line.strip_prefix("AT") {
            self.handle_at(at);
        } else if let Some(st) = line.strip_prefix("ST").filter(|_| self.stn) {
            self.handle_st(st);
        } else if line.chars().all(|c| c.is_ascii_hexdigit()) {
            self.handle_data(&line, None);
        } else {
            self.push_reply(&["?"], ">");
        }
    }

    fn handle_at(&mut self, at: &str) {
        let ok = |s: &mut Self| s.push_reply(&["OK"], ">");
        match at {
            "Z" => {
                self.reset();
                let id = self.identification.clone();
                self.push_reply(&["", &id], ">");
            }
            "I" => {
                let id = self.identification.clone();
                self.push_reply(&[&id], ">");
            }
            "@1" => self.push_reply(&["OBDII to RS232 Interpreter"], ">"),
            "RV" => {
                let v = self.voltage.clone();
                self.push_reply(&[&v], ">");
            }
            "DPN" => {
                let reply = match self.protocol {
                    BusProtocol::Auto => format!("A{}", self.search_result.code()),
                    p => p.code().to_string(),
                };
                self.push_reply(&[&reply], ">");
            }
            "E0" | "E1" => {
                self.echo = at == "E1";
                ok(self);
            }
            "L0" | "L1" => {
                self.linefeed = at == "L1";
                ok(self);
            }
            "CAF0" | "CAF1" => {
                self.caf = at == "CAF1";
                ok(self);
            }
            "S0" | "S1" | "H0" | "H1" | "AT0" | "AT1" | "AT2" => ok(self),
            _ if at.starts_with("SP") => match at[2..].parse::<BusProtocol>() {
                Ok(p) => {
                    self.protocol = p;
                    self.searched = false;
                    ok(self);
                }
                Err(_) => self.push_reply(&["?"], ">"),
            },
            _ if at.starts_with("ST") || at.starts_with("SH") || at.starts_with("CRA") => ok(self),
            _ => self.push_reply(&["?"], ">"),
        }
    }

    fn handle_st(&mut self, st: &str) {
        match st {
            "I" => self.push_reply(&["STN1110 v4.1.0"], ">"),
            "DI" => self.push_reply(&["OBDLink SX r4.2"], ">"),
            "SN" => self.push_reply(&["112233445566"], ">"),
            "CSEGT0" | "CSEGT1" | "CSEGR0" | "CSEGR1" => self.push_reply(&["OK"], ">"),
            _ if st.starts_with("CTOR") => self.push_reply(&["OK"], ">"),
            _ if st.starts_with("PXL:") => {
                let length = st[4..].split(',').next().and_then(|l| l.parse::<usize>().ok());
                match length {
                    Some(length) => {
                        self.awaiting_data = Some(length);
                        self.output.extend(b"DATA\r");
                    }
                    None => self.push_reply(&["?"], ">"),
                }
            }
            _ => self.push_reply(&["?"], ">"),
        }
    }

    fn handle_data(&mut self, line: &str, announced: Option<usize>) {
        // An odd digit count carries the number of reply frames to wait for
        let (hex, expected) = match announced {
            None if line.len() % 2 == 1 => (&line[..line.len() - 1], line[line.len() - 1..].parse::<u8>().ok()),
            _ => (line, None),
        };
        let Some(bytes) = parse_hex(hex) else {
            self.push_reply(&["?"], ">");
            return;
        };
        if announced.is_some_and(|l| l != bytes.len()) {
            self.push_reply(&["DATA ERROR"], ">");
            return;
        }
        let limit = if self.stn {
            0xFFF
        } else if self.caf {
            7
        } else {
            8
        };
        if bytes.is_empty() || bytes.len() > limit {
            self.push_reply(&["?"], ">");
            return;
        }
        if !self.caf && bytes.len() == 8 && expected == Some(0) && !self.full_frame_no_response {
            self.push_reply(&["?"], ">");
            return;
        }
        if expected == Some(0) {
            self.push_reply(&[], ">");
            return;
        }
        let payload = if self.caf {
            &bytes[..]
        } else {
            let len = (bytes[0] & 0x0F) as usize;
            &bytes[1..(1 + len).min(bytes.len())]
        };
        let mut lines = Vec::new();
        if self.protocol == BusProtocol::Auto && !self.searched {
            self.searched = true;
            lines.push("SEARCHING...".to_string());
        }
        match self.bus_replies.get(&hex_string(payload)) {
            Some(reply) => lines.extend(reply.iter().cloned()),
            None => lines.push("NO DATA".to_string()),
        }
        let lines: Vec<&str> = lines.iter().map(String::as_str).collect();
        self.push_reply(&lines, ">");
    }
}

/// Scripted ELM327 compatible adapter. See the module documentation
#[derive(Debug, Clone)]
pub struct SimulatedElm327 {
    state: Arc<Mutex<SimState>>,
}

impl Default for SimulatedElm327 {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedElm327 {
    /// Creates a plain ELM327 v1.5 on a CAN 11 bit 500 kbit/s bus with one ECU
    /// answering the initial `0100`
    pub fn new() -> Self {
        let mut bus_replies = HashMap::new();
        bus_replies.insert(
            "0100".to_string(),
            vec!["7E8 06 41 00 BE 3F A8 13 00".to_string()],
        );
        let mut state = SimState {
            open: false,
            hung_up: false,
            silent: false,
            stn: false,
            full_frame_no_response: false,
            noise: false,
            max_read_chunk: usize::MAX,
            identification: "ELM327 v1.5".into(),
            search_result: BusProtocol::Can11B500K,
            voltage: "12.6V".into(),
            echo: true,
            linefeed: true,
            caf: true,
            protocol: BusProtocol::Auto,
            searched: false,
            awaiting_data: None,
            line: Vec::new(),
            output: VecDeque::new(),
            sent: Vec::new(),
            bus_replies,
            command_replies: HashMap::new(),
        };
        state.reset();
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Creates an STN1110 based adapter, which understands the `ST` command set
    pub fn stn() -> Self {
        let sim = Self::new();
        sim.lock().stn = true;
        sim
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Answers bus request `request` (payload without PCI byte) with `lines`,
    /// each `<header> <frame bytes>` as the adapter prints them
    pub fn set_reply(&self, request: &[u8], lines: &[&str]) {
        self.lock()
            .bus_replies
            .insert(hex_string(request), lines.iter().map(|l| l.to_string()).collect());
    }

    /// Overrides the reply to command `command` (e.g. `ATI`). Lines are separated by `\n`
    pub fn set_command_reply(&self, command: &str, reply: &str) {
        self.lock()
            .command_replies
            .insert(command.to_ascii_uppercase(), reply.to_string());
    }

    /// Protocol the automatic search ends on. [BusProtocol::Auto] means it finds nothing
    pub fn set_search_result(&self, protocol: BusProtocol) {
        self.lock().search_result = protocol;
    }

    /// Whether a full 8 byte frame with "expect no reply" is accepted (`ATCAF0` mode)
    pub fn set_full_frame_no_response(&self, supported: bool) {
        self.lock().full_frame_no_response = supported;
    }

    /// Stops answering anything
    pub fn set_silent(&self, silent: bool) {
        self.lock().silent = silent;
    }

    /// Interleaves non ASCII garbage with replies
    pub fn set_noise(&self, noise: bool) {
        self.lock().noise = noise;
    }

    /// Limits how many bytes a single read returns
    pub fn set_max_read_chunk(&self, bytes: usize) {
        self.lock().max_read_chunk = bytes.max(1);
    }

    /// Simulates the adapter being unplugged. Reads signal end of stream from now on
    pub fn hang_up(&self) {
        self.lock().hung_up = true;
    }

    /// Every command line received so far, upper case and without whitespace
    pub fn sent_commands(&self) -> Vec<String> {
        self.lock().sent.clone()
    }

    /// Returns true while the channel is open
    pub fn is_open(&self) -> bool {
        self.lock().open
    }
}

impl ByteChannel for SimulatedElm327 {
    fn open(&mut self) -> ChannelResult<()> {
        self.lock().open = true;
        Ok(())
    }

    fn close(&mut self) -> ChannelResult<()> {
        self.lock().open = false;
        Ok(())
    }

    fn has_space_available(&mut self) -> bool {
        self.lock().open
    }

    fn has_bytes_available(&mut self) -> bool {
        let s = self.lock();
        s.open && (s.hung_up || !s.output.is_empty())
    }

    fn write(&mut self, buffer: &[u8]) -> ChannelResult<usize> {
        let mut s = self.lock();
        if !s.open {
            return Err(ChannelError::InterfaceNotOpen);
        }
        for b in buffer {
            if *b == b'\r' {
                let line = String::from_utf8_lossy(&s.line).into_owned();
                s.line.clear();
                s.handle_line(&line);
            } else {
                s.line.push(*b);
            }
        }
        Ok(buffer.len())
    }

    fn read(&mut self, buffer: &mut [u8]) -> ChannelResult<usize> {
        let mut s = self.lock();
        if !s.open {
            return Err(ChannelError::InterfaceNotOpen);
        }
        if s.hung_up {
            return Ok(0);
        }
        let n = buffer.len().min(s.max_read_chunk).min(s.output.len());
        for (slot, b) in buffer.iter_mut().zip(s.output.drain(..n)) {
            *slot = b;
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exchange(sim: &mut SimulatedElm327, request: &str) -> String {
        sim.write(format!("{request}\r").as_bytes()).unwrap();
        let mut buf = [0u8; 512];
        let n = sim.read(&mut buf).unwrap();
        String::from_utf8_lossy(&buf[..n]).into_owned()
    }

    #[test]
    fn echo_and_prompt() {
        let mut sim = SimulatedElm327::new();
        sim.open().unwrap();
        assert_eq!(exchange(&mut sim, "ATE0"), "ATE0\rOK\r\n\r\n>");
        assert_eq!(exchange(&mut sim, "ATL0"), "OK\r\r>");
        assert_eq!(exchange(&mut sim, "ATI"), "ELM327 v1.5\r\r>");
        assert_eq!(exchange(&mut sim, "STI"), "?\r\r>");
        assert_eq!(sim.sent_commands(), vec!["ATE0", "ATL0", "ATI", "STI"]);
    }

    #[test]
    fn bus_replies() {
        let mut sim = SimulatedElm327::new();
        sim.open().unwrap();
        exchange(&mut sim, "ATE0");
        exchange(&mut sim, "ATL0");
        exchange(&mut sim, "ATSP6");
        sim.set_reply(&[0x22, 0xF1, 0x90], &["7E8 03 7F 22 31"]);
        assert_eq!(exchange(&mut sim, "22F190"), "7E8 03 7F 22 31\r\r>");
        assert_eq!(exchange(&mut sim, "22F1911"), "NO DATA\r\r>");
        assert_eq!(exchange(&mut sim, "3E800"), "\r>");
        assert_eq!(exchange(&mut sim, "ATDPN"), "6\r\r>");
    }

    #[test]
    fn stn_data_prompt() {
        let mut sim = SimulatedElm327::stn();
        sim.open().unwrap();
        exchange(&mut sim, "ATE0");
        exchange(&mut sim, "ATL0");
        let payload = vec![0x2E, 0xF1, 0x98, 1, 2, 3, 4, 5, 6, 7];
        sim.set_reply(&payload, &["7E8 03 6E F1 98"]);
        assert_eq!(exchange(&mut sim, "STPX L:10"), "DATA\r");
        assert_eq!(exchange(&mut sim, &hex_string(&payload)), "7E8 03 6E F1 98\r\r>");
    }

    #[test]
    fn hang_up_is_end_of_stream() {
        let mut sim = SimulatedElm327::new();
        sim.open().unwrap();
        sim.hang_up();
        assert!(sim.has_bytes_available());
        assert_eq!(sim.read(&mut [0u8; 16]).unwrap(), 0);
    }
}
