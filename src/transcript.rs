//! Append-only record of every request and reply passing through a [crate::uds::Pipeline].
//!
//! One line per message: `HEADER,PAYLOAD` in hex for requests and replies, or
//! `ERROR: <description>` for a failed request. Lines are written by a background thread,
//! so recording never blocks the diagnostic traffic on file I/O.

use std::{
    fs::OpenOptions,
    io::{BufWriter, Write},
    path::Path,
    sync::mpsc,
    thread,
};

use log::warn;

use crate::{DiagServerResult, hex_string, uds::Message};

/// Handle to a transcript writer. Cloning it shares the same output
#[derive(Debug, Clone)]
pub struct Transcript {
    sender: mpsc::Sender<String>,
}

impl Transcript {
    /// Appends to the file at `path`, creating it if it does not exist
    pub fn create<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::from_writer(BufWriter::new(file)))
    }

    /// Writes to an arbitrary sink. The writer thread exits once every handle is dropped
    pub fn from_writer<W: Write + Send + 'static>(mut writer: W) -> Self {
        let (sender, receiver) = mpsc::channel::<String>();
        thread::spawn(move || {
            for line in receiver {
                if let Err(e) = writeln!(writer, "{line}").and_then(|_| writer.flush()) {
                    warn!("Transcript write failed: {e}");
                    break;
                }
            }
        });
        Self { sender }
    }

    /// Records an outgoing request
    pub fn record_request(&self, message: &Message) {
        self.record(format_message(message));
    }

    /// Records the outcome of a request
    pub fn record_reply(&self, result: &DiagServerResult<Message>) {
        let line = match result {
            Ok(m) => format_message(m),
            Err(e) => format!("ERROR: {e}"),
        };
        self.record(line);
    }

    fn record(&self, line: String) {
        // The writer thread only goes away after a failed write, which it has already logged
        let _ = self.sender.send(line);
    }
}

fn format_message(message: &Message) -> String {
    format!("{:X},{}", message.id(), hex_string(message.bytes()))
}
