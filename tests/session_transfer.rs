use std::{
    io::Write,
    sync::{Arc, Mutex, OnceLock},
    thread,
    time::Duration,
};

use elm_diagnostics::{
    BusProtocol, DiagError, DiagServerResult,
    hardware::{Adapter, AdapterInfo, AdapterState},
    transcript::Transcript,
    uds::{
        DiagnosticSession, Message, Pipeline, RetryPolicy, SharedAdapter, TransferOptions,
        well_known,
    },
};

/// Adapter which answers every request positively, unless told otherwise
struct ScriptedEcu {
    state: AdapterState,
    mtu: usize,
    requests: Arc<Mutex<Vec<Vec<u8>>>>,
    /// Requests (by index) that fail with [DiagError::NoResponse]
    failures: Vec<usize>,
    /// Fixed reply, instead of the positive echo
    reply: Option<Vec<u8>>,
    /// Called before each request is answered
    on_send: Option<Box<dyn FnMut() + Send>>,
}

impl ScriptedEcu {
    fn new(mtu: usize) -> Self {
        Self {
            state: AdapterState::Connected,
            mtu,
            requests: Arc::new(Mutex::new(Vec::new())),
            failures: Vec::new(),
            reply: None,
            on_send: None,
        }
    }
}

impl Adapter for ScriptedEcu {
    fn state(&self) -> AdapterState {
        self.state
    }

    fn info(&self) -> Option<&AdapterInfo> {
        None
    }

    fn negotiated_protocol(&self) -> BusProtocol {
        BusProtocol::Can11B500K
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    fn send(&mut self, message: &Message) -> DiagServerResult<Message> {
        if let Some(hook) = self.on_send.as_mut() {
            hook();
        }
        let mut requests = self.requests.lock().unwrap();
        let index = requests.len();
        requests.push(message.bytes().to_vec());
        if self.failures.contains(&index) {
            return Err(DiagError::NoResponse);
        }
        let bytes = match &self.reply {
            Some(r) => r.clone(),
            None => {
                let b = message.bytes();
                vec![b[0] + 0x40, b.get(1).copied().unwrap_or_default()]
            }
        };
        Message::new(message.reply(), bytes)
    }

    fn send_raw(&mut self, _message: &Message, _expected_frames: Option<usize>) -> DiagServerResult<Vec<Message>> {
        Err(DiagError::ParameterInvalid)
    }

    fn shutdown(&mut self) {
        self.state = AdapterState::Gone;
    }
}

fn session(ecu: ScriptedEcu) -> (DiagnosticSession, Arc<Mutex<Vec<Vec<u8>>>>) {
    let requests = ecu.requests.clone();
    let adapter: SharedAdapter = Arc::new(Mutex::new(ecu));
    let pipeline = Pipeline::new(adapter).unwrap();
    (DiagnosticSession::new(0x7E0, None, pipeline), requests)
}

#[test]
pub fn transfer_splits_into_mtu_sized_blocks() {
    let (session, requests) = session(ScriptedEcu::new(10));
    let data: Vec<u8> = (0..300u32).map(|i| i as u8).collect();
    let response = session.transfer_data(&data).unwrap();

    let requests = requests.lock().unwrap();
    assert_eq!(requests.len(), 38);
    assert!(requests.iter().all(|r| r[0] == 0x36 && r.len() <= 10));
    let sent: Vec<u8> = requests.iter().flat_map(|r| r[2..].iter().copied()).collect();
    assert_eq!(sent, data);
    assert_eq!(response.record, vec![0x76, 38]);

    let progress = session.active_transfer_progress().unwrap();
    assert_eq!(progress.total(), 300);
    assert_eq!(progress.completed(), 300);
    assert!(progress.is_finished());
}

#[test]
pub fn transfer_progress_is_observable_per_block() {
    let running: Arc<OnceLock<Arc<DiagnosticSession>>> = Arc::new(OnceLock::new());
    let samples = Arc::new(Mutex::new(Vec::new()));
    let mut ecu = ScriptedEcu::new(10);
    let (observed, recorded) = (running.clone(), samples.clone());
    ecu.on_send = Some(Box::new(move || {
        if let Some(progress) = observed.get().and_then(|s| s.active_transfer_progress()) {
            recorded.lock().unwrap().push((progress.completed(), progress.total()));
        }
    }));
    let (session, _) = session(ecu);
    let session = Arc::new(session);
    assert!(running.set(session.clone()).is_ok());

    session.transfer_data(&[0x5A; 40]).unwrap();

    let samples = samples.lock().unwrap();
    assert_eq!(*samples, vec![(0, 40), (8, 40), (16, 40), (24, 40), (32, 40)]);
    let progress = session.active_transfer_progress().unwrap();
    assert_eq!(progress.completed(), progress.total());
}

#[test]
pub fn transfer_sequence_counter_starts_at_one() {
    let mtu = 10;
    let (session, requests) = session(ScriptedEcu::new(mtu));
    session.transfer_data(&vec![0xAA; 2 * mtu - 3]).unwrap();
    let counters: Vec<u8> = requests.lock().unwrap().iter().map(|r| r[1]).collect();
    assert_eq!(counters, vec![1, 2, 3]);
}

#[test]
pub fn transfer_sequence_counter_wraps() {
    // One byte per block
    let (session, requests) = session(ScriptedEcu::new(3));
    session.transfer_data(&[0x55; 300]).unwrap();
    let requests = requests.lock().unwrap();
    assert_eq!(requests.len(), 300);
    assert_eq!(requests[254][1], 0xFF);
    assert_eq!(requests[255][1], 0x00);
    assert_eq!(requests[256][1], 0x01);
}

#[test]
pub fn transfer_stops_at_first_failure() {
    let mut ecu = ScriptedEcu::new(10);
    ecu.failures = vec![3];
    let (session, requests) = session(ecu);
    let result = session.transfer_data(&[0x11; 100]);
    assert!(matches!(result, Err(DiagError::NoResponse)));
    assert_eq!(requests.lock().unwrap().len(), 4);
    assert!(session.active_transfer_progress().is_none());
}

#[test]
pub fn transfer_retries_when_configured() {
    let mut ecu = ScriptedEcu::new(10);
    ecu.failures = vec![1];
    let (session, requests) = session(ecu);
    let session = session.with_transfer_options(TransferOptions {
        retry: RetryPolicy {
            retries: 2,
            backoff: Duration::ZERO,
        },
    });
    session.transfer_data(&[0x22; 16]).unwrap();
    let counters: Vec<u8> = requests.lock().unwrap().iter().map(|r| r[1]).collect();
    // Block 2 is repeated with the same counter
    assert_eq!(counters, vec![1, 2, 2]);
}

#[test]
pub fn transfer_rejects_empty_data() {
    let (session, requests) = session(ScriptedEcu::new(10));
    assert!(matches!(session.transfer_data(&[]), Err(DiagError::ParameterInvalid)));
    assert!(requests.lock().unwrap().is_empty());
}

#[test]
pub fn negative_and_mismatched_replies() {
    let mut ecu = ScriptedEcu::new(7);
    ecu.reply = Some(vec![0x7F, 0x27, 0x35]);
    let (session, _) = session(ecu);
    assert!(matches!(
        session.request_seed(0x01),
        Err(DiagError::UdsNegativeResponse(_))
    ));

    // Negative response to another service
    let mut ecu = ScriptedEcu::new(7);
    ecu.reply = Some(vec![0x7F, 0x22, 0x31]);
    let (session, _) = self::session(ecu);
    assert!(matches!(session.request_seed(0x01), Err(DiagError::WrongMessage)));

    let mut ecu = ScriptedEcu::new(7);
    ecu.reply = Some(vec![0x50, 0x03, 0x00, 0x32, 0x01, 0xF4]);
    let (session, _) = self::session(ecu);
    assert!(matches!(
        session.read_data_by_identifier(well_known::VIN),
        Err(DiagError::WrongMessage)
    ));
}

#[test]
pub fn malformed_service_is_never_sent() {
    let (session, requests) = session(ScriptedEcu::new(7));
    // Seeds are requested on odd levels only
    assert!(matches!(session.request_seed(0x02), Err(DiagError::MalformedService)));
    assert!(matches!(session.send_key(0x01, &[0x00]), Err(DiagError::MalformedService)));
    assert!(requests.lock().unwrap().is_empty());
}

#[test]
pub fn pipeline_requires_connected_adapter() {
    let mut ecu = ScriptedEcu::new(7);
    ecu.state = AdapterState::Configuring;
    let adapter: SharedAdapter = Arc::new(Mutex::new(ecu));
    assert!(matches!(Pipeline::new(adapter), Err(DiagError::AdapterNotConnected)));
}

#[derive(Clone, Default)]
struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[test]
pub fn pipeline_writes_transcript() {
    let mut ecu = ScriptedEcu::new(7);
    ecu.failures = vec![1];
    let buffer = SharedBuffer::default();
    let adapter: SharedAdapter = Arc::new(Mutex::new(ecu));
    let pipeline = Pipeline::new(adapter)
        .unwrap()
        .with_transcript(Transcript::from_writer(buffer.clone()));
    let session = DiagnosticSession::new(0x7E0, None, pipeline);
    session.tester_present().unwrap();
    assert!(session.tester_present().is_err());

    let expected = "7E0,3E00\n7E8,7E00\n7E0,3E00\nERROR: No response\n";
    for _ in 0..100 {
        if buffer.0.lock().unwrap().len() >= expected.len() {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(String::from_utf8(buffer.0.lock().unwrap().clone()).unwrap(), expected);
}
