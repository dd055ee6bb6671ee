use std::{
    sync::{Arc, Mutex, mpsc},
    time::Duration,
};

use elm_diagnostics::{
    BusProtocol, DiagError,
    bus::{BusProtocolDecoder, BusProtocolEncoder},
    hardware::{
        Adapter, AdapterEvent, AdapterIc, AdapterState, RECEIVE_ANY,
        elm327::{SerialAdapter, SerialAdapterOptions},
        simulation::SimulatedElm327,
    },
    obd2::Obd2Session,
    uds::{DiagnosticSession, DiagnosticSessionType, Message, Pipeline, SharedAdapter, well_known},
};

const VIN: &str = "WVWZZZ1JZ3W386752";

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn options() -> SerialAdapterOptions {
    SerialAdapterOptions {
        bring_up_timeout: Duration::from_millis(100),
        command_timeout: Duration::from_millis(100),
        ..Default::default()
    }
}

fn connect(sim: &SimulatedElm327, protocol: BusProtocol) -> SerialAdapter<SimulatedElm327> {
    init_logs();
    let mut adapter = SerialAdapter::new(sim.clone(), options());
    adapter.connect(protocol).unwrap();
    adapter.wait_until_connected(Duration::from_secs(5)).unwrap();
    adapter
}

fn shared(adapter: SerialAdapter<SimulatedElm327>) -> SharedAdapter {
    Arc::new(Mutex::new(adapter))
}

#[test]
pub fn bring_up_can_11_bit() {
    init_logs();
    let sim = SimulatedElm327::new();
    let (tx, rx) = mpsc::channel();
    let mut adapter = SerialAdapter::new(sim.clone(), options());
    adapter.add_event_handler(Box::new(tx));
    adapter.connect(BusProtocol::Can11B500K).unwrap();
    adapter.wait_until_connected(Duration::from_secs(5)).unwrap();

    assert_eq!(adapter.state(), AdapterState::Connected);
    assert_eq!(adapter.negotiated_protocol(), BusProtocol::Can11B500K);
    // No auto segmentation, CAN auto formatting on
    assert!(!adapter.capabilities().has_auto_segmentation);
    assert!(adapter.capabilities().has_small_frame_no_response);
    assert!(!adapter.capabilities().has_full_frame_no_response);
    assert!(adapter.can_auto_format());
    let encoder = adapter.encoder().unwrap();
    assert_eq!(encoder.maximum_frame_length(), 7);
    assert_eq!(encoder.payload_offset(), 0);
    assert_eq!(adapter.decoder().unwrap().name(), "ISO-TP");
    assert_eq!(adapter.mtu(), 7);

    let info = adapter.info().unwrap();
    assert_eq!(info.ic, AdapterIc::Elm327);
    assert_eq!(info.identification, "ELM327");
    assert_eq!(info.firmware_version, "v1.5");
    // The stock AT@1 description is not a model name
    assert_eq!(info.model, "Unspecified");
    assert_eq!(adapter.battery_voltage(), Some(12.6));
    assert_eq!(adapter.detected_ecus(), &[0x7E8]);

    let sent = sim.sent_commands();
    for command in ["", "ATZ", "ATE0", "ATH1", "ATSP6", "0100", "ATDPN", "ATRV", "ATAT0", "ATSTFF"] {
        assert!(sent.iter().any(|c| c == command), "{command} was not sent");
    }
    assert!(!sent.iter().any(|c| c.starts_with("STCTOR")));
    // Protocol is described before the CAN configuration
    let dpn = sent.iter().position(|c| c == "ATDPN").unwrap();
    let rv = sent.iter().position(|c| c == "ATRV").unwrap();
    assert!(dpn < rv);

    let events: Vec<AdapterEvent> = rx.try_iter().collect();
    let transitions: Vec<(AdapterState, AdapterState)> = events
        .iter()
        .filter_map(|e| match e {
            AdapterEvent::StateChanged { from, to } => Some((*from, *to)),
            _ => None,
        })
        .collect();
    assert_eq!(
        transitions,
        vec![
            (AdapterState::Created, AdapterState::Searching),
            (AdapterState::Searching, AdapterState::Initializing),
            (AdapterState::Initializing, AdapterState::Configuring),
            (AdapterState::Configuring, AdapterState::Connected),
        ]
    );
    assert!(events.contains(&AdapterEvent::ProtocolNegotiated(BusProtocol::Can11B500K)));
    assert!(events.iter().any(|e| matches!(
        e,
        AdapterEvent::CommandCompleted { success: false, .. }
    )));
}

#[test]
pub fn bring_up_with_automatic_search() {
    let sim = SimulatedElm327::new();
    sim.set_noise(true);
    sim.set_max_read_chunk(3);
    let adapter = connect(&sim, BusProtocol::Auto);
    assert_eq!(adapter.negotiated_protocol(), BusProtocol::Can11B500K);
    assert!(sim.sent_commands().iter().any(|c| c == "ATSP0"));
}

#[test]
pub fn can_auto_format_probe_only_on_can() {
    init_logs();
    let sim = SimulatedElm327::new();
    sim.set_search_result(BusProtocol::Kwp2000Fast);
    let mut adapter = SerialAdapter::new(sim.clone(), options());
    adapter.connect(BusProtocol::Kwp2000Fast).unwrap();
    adapter.wait_until_connected(Duration::from_secs(5)).unwrap();
    assert_eq!(adapter.negotiated_protocol(), BusProtocol::Kwp2000Fast);
    assert_eq!(adapter.decoder().unwrap().name(), "KWP");
    let sent = sim.sent_commands();
    assert!(!sent.iter().any(|c| c.starts_with("ATCAF")));
    assert!(!sent.iter().any(|c| c == "ATRV"));
}

#[test]
pub fn stn_chip_uses_auto_segmentation() {
    let sim = SimulatedElm327::stn();
    let adapter = connect(&sim, BusProtocol::Can11B500K);
    let info = adapter.info().unwrap().clone();
    assert_eq!(info.ic, AdapterIc::Stn11xx);
    assert_eq!(info.vendor, "ScanTool.net");
    assert_eq!(info.model, "OBDLink SX r4.2");
    assert_eq!(info.serial_number, "112233445566");
    assert!(adapter.capabilities().has_auto_segmentation);
    assert_eq!(adapter.mtu(), 0x7FF);
    assert!(sim.sent_commands().iter().any(|c| c == "STCTOR255,255"));

    let record = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07];
    let mut request = vec![0x2E, 0xF1, 0x98];
    request.extend_from_slice(&record);
    sim.set_reply(&request, &["7E8 03 6E F1 98"]);

    let pipeline = Pipeline::new(shared(adapter)).unwrap();
    let session = DiagnosticSession::new(0x7E0, None, pipeline);
    let response = session
        .write_data_by_identifier(well_known::REPAIR_SHOP_CODE_OR_TESTER_SERIAL_NUMBER, &record)
        .unwrap();
    assert_eq!(response.record, vec![0x6E, 0xF1, 0x98]);
    let sent = sim.sent_commands();
    let announce = sent.iter().position(|c| c == "STPXL:10").unwrap();
    assert_eq!(sent[announce + 1], "2EF19801020304050607");
}

#[test]
pub fn silent_adapter_is_not_found() {
    init_logs();
    let sim = SimulatedElm327::new();
    sim.set_silent(true);
    let mut adapter = SerialAdapter::new(sim.clone(), options());
    adapter.connect(BusProtocol::Auto).unwrap();
    assert!(matches!(
        adapter.wait_until_connected(Duration::from_secs(5)),
        Err(DiagError::IllegalState(AdapterState::NotFound))
    ));
    // Terminal: nothing moves it again
    sim.set_silent(false);
    for _ in 0..10 {
        adapter.poll();
    }
    assert_eq!(adapter.state(), AdapterState::NotFound);
    assert_eq!(sim.sent_commands(), vec![""]);
    assert!(matches!(
        adapter.connect(BusProtocol::Auto),
        Err(DiagError::IllegalState(AdapterState::NotFound))
    ));
}

#[test]
pub fn no_protocol_found_is_unsupported() {
    init_logs();
    let sim = SimulatedElm327::new();
    sim.set_search_result(BusProtocol::Auto);
    let mut adapter = SerialAdapter::new(sim.clone(), options());
    adapter.connect(BusProtocol::Auto).unwrap();
    assert!(matches!(
        adapter.wait_until_connected(Duration::from_secs(5)),
        Err(DiagError::IllegalState(AdapterState::UnsupportedProtocol))
    ));
    assert_eq!(adapter.negotiated_protocol(), BusProtocol::Unknown);
    assert_eq!(adapter.mtu(), 0);
    adapter.shutdown();
    assert_eq!(adapter.state(), AdapterState::UnsupportedProtocol);
    let message = Message::new(0x7DF, vec![0x01, 0x00]).unwrap();
    assert!(matches!(adapter.send(&message), Err(DiagError::AdapterGone)));
}

#[test]
pub fn basic_protocols_are_unsupported() {
    init_logs();
    let sim = SimulatedElm327::new();
    sim.set_search_result(BusProtocol::J1850Pwm);
    let mut adapter = SerialAdapter::new(sim, options());
    adapter.connect(BusProtocol::Auto).unwrap();
    assert!(matches!(
        adapter.wait_until_connected(Duration::from_secs(5)),
        Err(DiagError::IllegalState(AdapterState::UnsupportedProtocol))
    ));
    assert!(adapter.encoder().is_none());
}

#[test]
pub fn connect_only_once() {
    init_logs();
    let sim = SimulatedElm327::new();
    let mut adapter = SerialAdapter::new(sim, options());
    adapter.connect(BusProtocol::Auto).unwrap();
    assert!(matches!(
        adapter.connect(BusProtocol::Auto),
        Err(DiagError::IllegalState(AdapterState::Searching))
    ));
    adapter.wait_until_connected(Duration::from_secs(5)).unwrap();
    assert!(matches!(
        adapter.connect(BusProtocol::Auto),
        Err(DiagError::IllegalState(AdapterState::Connected))
    ));
}

#[test]
pub fn end_of_stream_is_gone() {
    let sim = SimulatedElm327::new();
    let mut adapter = connect(&sim, BusProtocol::Can11B500K);
    let (tx, rx) = mpsc::channel();
    adapter.add_event_handler(Box::new(tx));
    sim.hang_up();
    let message = Message::new(0x7E0, vec![0x3E, 0x00]).unwrap();
    assert!(matches!(adapter.send(&message), Err(DiagError::AdapterGone)));
    assert_eq!(adapter.state(), AdapterState::Gone);
    assert!(!sim.is_open());
    let events: Vec<AdapterEvent> = rx.try_iter().collect();
    assert_eq!(
        events,
        vec![AdapterEvent::StateChanged {
            from: AdapterState::Connected,
            to: AdapterState::Gone
        }]
    );
    assert!(matches!(adapter.send(&message), Err(DiagError::AdapterGone)));
}

#[test]
pub fn response_pending_frames_are_dropped() {
    let sim = SimulatedElm327::new();
    sim.set_reply(
        &[0x22, 0xF1, 0x90],
        &[
            "7E8 03 7F 22 78 00 00 00 00",
            "7E8 10 14 62 F1 90 57 56 57",
            "7E8 21 5A 5A 5A 31 4A 5A 33",
            "7E8 22 57 33 38 36 37 35 32",
        ],
    );
    let adapter = connect(&sim, BusProtocol::Can11B500K);
    let pipeline = Pipeline::new(shared(adapter)).unwrap();
    let session = DiagnosticSession::new(0x7E0, None, pipeline);
    let response = session.read_data_by_identifier(well_known::VIN).unwrap();
    assert_eq!(response.id, well_known::VIN);
    assert_eq!(response.ascii(), VIN);

    let sent = sim.sent_commands();
    let data = sent.iter().position(|c| c == "22F190").unwrap();
    assert_eq!(sent[data - 2], "ATSH7E0");
    assert_eq!(sent[data - 1], "ATCRA7E8");

    // Arbitration is only resynchronised when it changes
    session.read_data_by_identifier(well_known::VIN).unwrap();
    assert_eq!(sim.sent_commands().iter().filter(|c| c.starts_with("ATSH")).count(), 1);
}

#[test]
pub fn negative_response_over_the_bus() {
    let sim = SimulatedElm327::new();
    sim.set_reply(&[0x10, 0x03], &["7E8 03 7F 10 22 00 00 00 00"]);
    let adapter = connect(&sim, BusProtocol::Can11B500K);
    let pipeline = Pipeline::new(shared(adapter)).unwrap();
    let session = DiagnosticSession::new(0x7E0, None, pipeline);
    assert!(matches!(
        session.start(DiagnosticSessionType::Extended),
        Err(DiagError::UdsNegativeResponse(_))
    ));
    assert!(matches!(session.tester_present(), Err(DiagError::NoResponse)));
}

#[test]
pub fn obd2_vin_and_raw_frames() {
    let sim = SimulatedElm327::new();
    sim.set_reply(
        &[0x09, 0x02],
        &[
            "7E8 10 14 49 02 01 57 56 57",
            "7E8 21 5A 5A 5A 31 4A 5A 33",
            "7E8 22 57 33 38 36 37 35 32",
        ],
    );
    let mut adapter = connect(&sim, BusProtocol::Can11B500K);

    let frames = adapter
        .send_raw(
            &Message::with_reply(0x7DF, RECEIVE_ANY, vec![0x01, 0x00]).unwrap(),
            Some(1),
        )
        .unwrap();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].id(), 0x7E8);
    assert_eq!(frames[0].bytes(), &[0x06, 0x41, 0x00, 0xBE, 0x3F, 0xA8, 0x13, 0x00]);
    assert!(sim.sent_commands().iter().any(|c| c == "01001"));

    let pipeline = Pipeline::new(shared(adapter)).unwrap();
    let obd = Obd2Session::new(pipeline);
    assert_eq!(obd.header(), 0x7DF);
    assert_eq!(obd.read_vin().unwrap(), VIN);
    // Broadcast header and open receive filter are the adapter's defaults
    assert!(!sim.sent_commands().iter().any(|c| c.starts_with("ATSH") || c.starts_with("ATCRA")));
}
