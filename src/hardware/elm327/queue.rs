//! Sequential request / reply protocol on top of a half duplex [ByteChannel]
//!
//! The queue owns the transport. It keeps at most one command active, writes its
//! request as space becomes available, and collects the reply until it ends with the
//! termination marker. A command whose reply does not arrive in time completes with an
//! empty response. Empty requests are "dummies" and complete without touching the transport,
//! which makes them useful as barriers.

use std::{
    collections::VecDeque,
    fmt::{Debug, Formatter, Result as FmtResult},
    time::{Duration, Instant},
};

use log::{debug, error, trace, warn};

use crate::channel::{ByteChannel, ChannelError, ChannelResult};

/// Command queue options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueOptions {
    /// Marker that ends every reply unless a command overrides it
    pub termination: String,
    /// Timeout used unless a command overrides it. Zero disables the timeout
    pub timeout: Duration,
    /// Maximum bytes pulled from the transport per read
    pub read_chunk_size: usize,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            termination: ">".into(),
            timeout: Duration::from_secs(5),
            read_chunk_size: 1024,
        }
    }
}

/// Identifies a submitted command. Tokens increase in submission order
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandToken(u64);

/// Something that happened while the queue was polled
#[derive(Debug, Clone)]
pub enum QueueEvent {
    /// A command completed. `response` is empty if it timed out
    Completed {
        /// Command that completed
        token: CommandToken,
        /// Sanitized reply with the termination marker removed
        response: String,
    },
    /// The transport reached end of stream. Nothing further will complete
    StreamClosed,
    /// The transport failed. Nothing further will complete
    StreamError(ChannelError),
}

struct Command {
    token: CommandToken,
    request: Vec<u8>,
    termination: String,
    timeout: Duration,
    sent: usize,
    response: Vec<u8>,
    started: Option<Instant>,
    deadline: Option<Instant>,
}

impl Command {
    fn is_dummy(&self) -> bool {
        self.request.is_empty()
    }

    fn is_sending(&self) -> bool {
        self.sent < self.request.len()
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum QueueStatus {
    Created,
    Open,
    Closed,
}

/// Command queue. See the module documentation
pub struct CommandQueue<C: ByteChannel> {
    channel: C,
    options: QueueOptions,
    pending: VecDeque<Command>,
    active: Option<Command>,
    next_token: u64,
    status: QueueStatus,
}

impl<C: ByteChannel> Debug for CommandQueue<C> {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("CommandQueue")
            .field("status", &self.status)
            .field("pending", &self.pending.len())
            .field("active", &self.active.as_ref().map(|c| c.token))
            .finish()
    }
}

/// Printable ASCII plus the line controls the adapter separates lines with
fn is_accepted_byte(b: u8) -> bool {
    (0x20..=0x7E).contains(&b) || b == b'\r' || b == b'\n'
}

impl<C: ByteChannel> CommandQueue<C> {
    /// Creates a queue over `channel`. The channel is not opened until [CommandQueue::open]
    pub fn new(channel: C, options: QueueOptions) -> Self {
        Self {
            channel,
            options,
            pending: VecDeque::new(),
            active: None,
            next_token: 0,
            status: QueueStatus::Created,
        }
    }

    /// Opens the transport, then hands it to `on_open` before any byte is exchanged
    pub fn open(&mut self, on_open: impl FnOnce(&mut C)) -> ChannelResult<()> {
        if self.status != QueueStatus::Created {
            return Err(ChannelError::InterfaceNotOpen);
        }
        self.channel.open()?;
        self.status = QueueStatus::Open;
        on_open(&mut self.channel);
        Ok(())
    }

    /// Drops every command, then closes the transport
    pub fn close(&mut self) {
        self.flush();
        if self.status == QueueStatus::Open {
            if let Err(e) = self.channel.close() {
                warn!("Error closing transport: {e}");
            }
        }
        self.status = QueueStatus::Closed;
    }

    /// Returns true once the transport has been closed, by either side
    pub fn is_closed(&self) -> bool {
        self.status == QueueStatus::Closed
    }

    /// Returns true if no command is active or waiting
    pub fn is_idle(&self) -> bool {
        self.active.is_none() && self.pending.is_empty()
    }

    /// Access to the transport
    pub fn channel_mut(&mut self) -> &mut C {
        &mut self.channel
    }

    /// Submits a command. `request` is sent verbatim; an empty request is a dummy.
    /// `termination` and `timeout` fall back to the queue's [QueueOptions]
    pub fn send(
        &mut self,
        request: &str,
        termination: Option<&str>,
        timeout: Option<Duration>,
    ) -> ChannelResult<CommandToken> {
        if self.status == QueueStatus::Closed {
            return Err(ChannelError::Closed);
        }
        let token = CommandToken(self.next_token);
        self.next_token += 1;
        self.pending.push_back(Command {
            token,
            request: request.as_bytes().to_vec(),
            termination: termination.unwrap_or(&self.options.termination).to_string(),
            timeout: timeout.unwrap_or(self.options.timeout),
            sent: 0,
            response: Vec::new(),
            started: None,
            deadline: None,
        });
        Ok(token)
    }

    /// Drops the active command and every pending command. None of them complete
    pub fn flush(&mut self) {
        if let Some(cmd) = self.active.take() {
            debug!("Flushing active command {:?}", cmd.token);
        }
        if !self.pending.is_empty() {
            debug!("Flushing {} pending command(s)", self.pending.len());
            self.pending.clear();
        }
    }

    /// Runs the queue until it can make no further progress or a command completes.
    ///
    /// `now` drives timeouts.
    pub fn poll(&mut self, now: Instant) -> Vec<QueueEvent> {
        let mut events = Vec::new();
        while self.status == QueueStatus::Open && events.is_empty() {
            let mut progressed = self.start_next(now, &mut events);
            if self.channel.has_space_available() {
                progressed |= self.handle_writable(now, &mut events);
            }
            if self.status == QueueStatus::Open && self.channel.has_bytes_available() {
                progressed |= self.handle_readable(now, &mut events);
            }
            progressed |= self.handle_timeout(now, &mut events);
            if !progressed {
                break;
            }
        }
        events
    }

    fn start_next(&mut self, now: Instant, events: &mut Vec<QueueEvent>) -> bool {
        if self.active.is_some() {
            return false;
        }
        let Some(mut cmd) = self.pending.pop_front() else {
            return false;
        };
        if cmd.is_dummy() {
            trace!("Dummy command {:?} completes immediately", cmd.token);
            events.push(QueueEvent::Completed {
                token: cmd.token,
                response: String::new(),
            });
        } else {
            cmd.started = Some(now);
            self.active = Some(cmd);
        }
        true
    }

    /// Writes as much of the active request as the transport accepts.
    /// Once the request is fully written, the command's timeout starts
    pub fn handle_writable(&mut self, now: Instant, events: &mut Vec<QueueEvent>) -> bool {
        let Some(cmd) = self.active.as_mut().filter(|c| c.is_sending()) else {
            return false;
        };
        match self.channel.write(&cmd.request[cmd.sent..]) {
            Ok(0) => false,
            Ok(n) => {
                trace!("Wrote {:?}", String::from_utf8_lossy(&cmd.request[cmd.sent..cmd.sent + n]));
                cmd.sent += n;
                if !cmd.is_sending() && !cmd.timeout.is_zero() {
                    cmd.deadline = Some(now + cmd.timeout);
                }
                true
            }
            Err(e) => {
                self.fail(QueueEvent::StreamError(e), events);
                true
            }
        }
    }

    /// Pulls available bytes into the active command's reply, completing it
    /// once the reply ends with its termination marker
    pub fn handle_readable(&mut self, now: Instant, events: &mut Vec<QueueEvent>) -> bool {
        let mut buffer = vec![0u8; self.options.read_chunk_size];
        let n = match self.channel.read(&mut buffer) {
            Ok(0) => {
                self.fail(QueueEvent::StreamClosed, events);
                return true;
            }
            Ok(n) => n,
            Err(e) => {
                self.fail(QueueEvent::StreamError(e), events);
                return true;
            }
        };
        let Some(cmd) = self.active.as_mut() else {
            trace!("Ignoring {n} unsolicited byte(s)");
            return true;
        };
        let before = cmd.response.len();
        cmd.response
            .extend(buffer[..n].iter().copied().filter(|b| is_accepted_byte(*b)));
        if cmd.response.len() - before != n {
            trace!("Dropped {} non ASCII byte(s)", n - (cmd.response.len() - before));
        }
        if cmd.response.ends_with(cmd.termination.as_bytes()) {
            if let Some(cmd) = self.active.take() {
                let len = cmd.response.len() - cmd.termination.len();
                let response = String::from_utf8_lossy(&cmd.response[..len]).into_owned();
                if let Some(started) = cmd.started {
                    debug!(
                        "{:?} answered in {:?}",
                        String::from_utf8_lossy(&cmd.request).trim_end(),
                        now.saturating_duration_since(started)
                    );
                }
                events.push(QueueEvent::Completed {
                    token: cmd.token,
                    response,
                });
            }
        }
        true
    }

    /// Completes the active command with an empty response if its deadline has passed
    pub fn handle_timeout(&mut self, now: Instant, events: &mut Vec<QueueEvent>) -> bool {
        let expired = self
            .active
            .as_ref()
            .and_then(|c| c.deadline)
            .is_some_and(|d| now >= d);
        if !expired {
            return false;
        }
        if let Some(cmd) = self.active.take() {
            warn!(
                "{:?} timed out after {:?}",
                String::from_utf8_lossy(&cmd.request).trim_end(),
                cmd.timeout
            );
            events.push(QueueEvent::Completed {
                token: cmd.token,
                response: String::new(),
            });
        }
        true
    }

    fn fail(&mut self, event: QueueEvent, events: &mut Vec<QueueEvent>) {
        match &event {
            QueueEvent::StreamError(e) => error!("Transport error: {e}"),
            _ => error!("Transport reached end of stream"),
        }
        self.close();
        events.push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default)]
    struct MockChannel {
        written: Vec<u8>,
        rx: VecDeque<u8>,
        max_write: Option<usize>,
        max_read: Option<usize>,
        eof: bool,
    }

    impl MockChannel {
        fn push(&mut self, bytes: &[u8]) {
            self.rx.extend(bytes.iter().copied());
        }
    }

    impl ByteChannel for MockChannel {
        fn open(&mut self) -> ChannelResult<()> {
            Ok(())
        }

        fn close(&mut self) -> ChannelResult<()> {
            Ok(())
        }

        fn has_space_available(&mut self) -> bool {
            true
        }

        fn has_bytes_available(&mut self) -> bool {
            !self.rx.is_empty() || self.eof
        }

        fn write(&mut self, buffer: &[u8]) -> ChannelResult<usize> {
            let n = self.max_write.map_or(buffer.len(), |m| m.min(buffer.len()));
            self.written.extend_from_slice(&buffer[..n]);
            Ok(n)
        }

        fn read(&mut self, buffer: &mut [u8]) -> ChannelResult<usize> {
            let n = self
                .max_read
                .map_or(self.rx.len(), |m| m.min(self.rx.len()))
                .min(buffer.len());
            for slot in buffer.iter_mut().take(n) {
                *slot = self.rx.pop_front().unwrap();
            }
            Ok(n)
        }
    }

    fn open_queue() -> CommandQueue<MockChannel> {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut q = CommandQueue::new(MockChannel::default(), QueueOptions::default());
        q.open(|_| {}).unwrap();
        q
    }

    fn drain(q: &mut CommandQueue<MockChannel>, now: Instant) -> Vec<QueueEvent> {
        let mut all = Vec::new();
        loop {
            let events = q.poll(now);
            if events.is_empty() {
                return all;
            }
            all.extend(events);
        }
    }

    fn completed(events: &[QueueEvent]) -> Vec<(CommandToken, String)> {
        events
            .iter()
            .filter_map(|e| match e {
                QueueEvent::Completed { token, response } => Some((*token, response.clone())),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn commands_complete_in_submission_order() {
        let mut q = open_queue();
        let now = Instant::now();
        let t1 = q.send("ATE0\r", None, None).unwrap();
        let t2 = q.send("ATL0\r", None, None).unwrap();
        let t3 = q.send("ATI\r", None, None).unwrap();

        // Only the first request goes out until its reply is complete
        assert!(drain(&mut q, now).is_empty());
        assert_eq!(q.channel_mut().written, b"ATE0\r");

        q.channel_mut().push(b"OK\r\r>");
        let first = completed(&drain(&mut q, now));
        assert_eq!(first, vec![(t1, "OK\r\r".to_string())]);
        assert_eq!(q.channel_mut().written, b"ATE0\rATL0\r");

        q.channel_mut().push(b"OK\r\r>");
        let second = completed(&drain(&mut q, now));
        q.channel_mut().push(b"ELM327 v1.5\r\r>");
        let third = completed(&drain(&mut q, now));
        assert_eq!(second[0].0, t2);
        assert_eq!(third, vec![(t3, "ELM327 v1.5\r\r".to_string())]);
        assert!(q.is_idle());
    }

    #[test]
    fn partial_writes_and_fragmented_reads() {
        let mut q = open_queue();
        q.channel_mut().max_write = Some(2);
        q.channel_mut().max_read = Some(3);
        let now = Instant::now();
        let t = q.send("0902\r", None, None).unwrap();
        drain(&mut q, now);
        assert_eq!(q.channel_mut().written, b"0902\r");
        q.channel_mut().push(b"7E8101449020131\r>");
        assert_eq!(completed(&drain(&mut q, now)), vec![(t, "7E8101449020131\r".to_string())]);
    }

    #[test]
    fn termination_must_end_the_buffer() {
        let mut q = open_queue();
        let now = Instant::now();
        let t = q.send("AT@2\r", None, None).unwrap();
        drain(&mut q, now);
        q.channel_mut().push(b"AB>CD");
        assert!(completed(&drain(&mut q, now)).is_empty());
        q.channel_mut().push(b">");
        assert_eq!(completed(&drain(&mut q, now)), vec![(t, "AB>CD".to_string())]);
    }

    #[test]
    fn custom_termination() {
        let mut q = open_queue();
        let now = Instant::now();
        let t = q.send("STPX L:10\r", Some("DATA\r"), None).unwrap();
        drain(&mut q, now);
        q.channel_mut().push(b"DATA\r");
        assert_eq!(completed(&drain(&mut q, now)), vec![(t, String::new())]);
    }

    #[test]
    fn timeout_completes_empty_and_queue_continues() {
        let mut q = open_queue();
        let now = Instant::now();
        let t1 = q.send("ATZ\r", None, Some(Duration::from_millis(100))).unwrap();
        let t2 = q.send("ATI\r", None, None).unwrap();
        assert!(drain(&mut q, now).is_empty());

        let later = now + Duration::from_millis(150);
        let events = completed(&drain(&mut q, later));
        assert_eq!(events, vec![(t1, String::new())]);
        assert_eq!(q.channel_mut().written, b"ATZ\rATI\r");

        q.channel_mut().push(b"ELM327 v2.1\r>");
        assert_eq!(completed(&drain(&mut q, later)), vec![(t2, "ELM327 v2.1\r".to_string())]);
    }

    #[test]
    fn trickling_reply_does_not_extend_timeout() {
        let mut q = open_queue();
        let now = Instant::now();
        let t = q.send("0100\r", None, Some(Duration::from_millis(100))).unwrap();
        drain(&mut q, now);

        q.channel_mut().push(b"SEARCHING...\r");
        assert!(completed(&drain(&mut q, now + Duration::from_millis(80))).is_empty());
        q.channel_mut().push(b"7E8");
        assert!(completed(&drain(&mut q, now + Duration::from_millis(95))).is_empty());

        let events = completed(&drain(&mut q, now + Duration::from_millis(120)));
        assert_eq!(events, vec![(t, String::new())]);
        assert!(q.is_idle());
    }

    #[test]
    fn non_ascii_bytes_are_dropped() {
        let mut q = open_queue();
        let now = Instant::now();
        let t = q.send("ATRV\r", None, None).unwrap();
        drain(&mut q, now);
        q.channel_mut().push(&[b'1', 0xFF, b'2', 0x00, b'.', 0x80, b'6', b'V', 0x07, b'>']);
        assert_eq!(completed(&drain(&mut q, now)), vec![(t, "12.6V".to_string())]);
    }

    #[test]
    fn dummy_completes_without_transport() {
        let mut q = open_queue();
        let now = Instant::now();
        let t = q.send("", None, None).unwrap();
        assert_eq!(completed(&drain(&mut q, now)), vec![(t, String::new())]);
        assert!(q.channel_mut().written.is_empty());
    }

    #[test]
    fn dummy_waits_for_earlier_commands() {
        let mut q = open_queue();
        let now = Instant::now();
        let t1 = q.send("ATI\r", None, None).unwrap();
        let t2 = q.send("", None, None).unwrap();
        assert!(drain(&mut q, now).is_empty());
        q.channel_mut().push(b"ELM327\r>");
        let events = completed(&drain(&mut q, now));
        assert_eq!(events.iter().map(|e| e.0).collect::<Vec<_>>(), vec![t1, t2]);
    }

    #[test]
    fn flush_drops_everything() {
        let mut q = open_queue();
        let now = Instant::now();
        q.send("ATI\r", None, None).unwrap();
        q.send("AT@1\r", None, None).unwrap();
        drain(&mut q, now);
        q.flush();
        assert!(q.is_idle());
        q.channel_mut().push(b"ELM327\r>");
        assert!(completed(&drain(&mut q, now)).is_empty());
    }

    #[test]
    fn end_of_stream_stops_the_queue() {
        let mut q = open_queue();
        let now = Instant::now();
        q.send("ATI\r", None, None).unwrap();
        q.send("AT@1\r", None, None).unwrap();
        drain(&mut q, now);
        q.channel_mut().eof = true;
        let events = drain(&mut q, now);
        assert!(matches!(events.as_slice(), [QueueEvent::StreamClosed]));
        assert!(q.is_closed());
        assert!(q.send("ATI\r", None, None).is_err());
        assert!(q.poll(now).is_empty());
    }
}
