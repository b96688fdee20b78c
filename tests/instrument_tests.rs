use groundlink::bus::*;
use groundlink::error::{ConfigError, TransportError};
use groundlink::instrument::transport::Transport;
use groundlink::instrument::*;
use groundlink::protocol::*;
use groundlink::registry::TransportRegistry;
use groundlink::station::Station;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const PSU: &str = r#"
provider: psu
transport: fake
parameters:
  voltage:
    description: Output voltage
    type: float
    default: 0.0
    get:
      instrument_command:
        - query: "VOLT?"
    set:
      signature: [[float], null]
      instrument_command:
        - write: "VOLT {0}"
        - query: "VOLT?"
  output:
    description: Output enable
    type: bool
    set:
      signature: [[bool], null]
      instrument_command:
        - write: "OUTP {0}"
  label:
    description: Front panel label
    type: str
    set:
      signature: [[], null]
      instrument_command:
        - write: "DISP:TEXT hello"
  link:
    description: Link check
    type: str
    get:
      instrument_command:
        - query: "DROP?"
"#;

/// In-memory stand-in for a SCPI power supply.
#[derive(Clone, Default)]
struct Device {
    log: Arc<Mutex<Vec<String>>>,
    registers: Arc<Mutex<HashMap<String, String>>>,
}

impl Device {
    fn with_voltage(volts: &str) -> Self {
        let device = Self::default();
        device.registers.lock().unwrap().insert("VOLT?".into(), volts.into());
        device
    }

    fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

struct FakeLink {
    device: Device,
}

impl Transport for FakeLink {
    fn kind(&self) -> &'static str {
        "fake"
    }

    fn write(&mut self, command: &str) -> Result<(), TransportError> {
        self.device.log.lock().unwrap().push(format!("W:{command}"));
        if let Some(value) = command.strip_prefix("VOLT ") {
            self.device
                .registers
                .lock()
                .unwrap()
                .insert("VOLT?".into(), value.to_string());
        }
        Ok(())
    }

    fn query(&mut self, command: &str) -> Result<String, TransportError> {
        self.device.log.lock().unwrap().push(format!("Q:{command}"));
        if command == "DROP?" {
            return Err(TransportError::Closed);
        }
        self.device
            .registers
            .lock()
            .unwrap()
            .get(command)
            .cloned()
            .ok_or(TransportError::Timeout)
    }
}

fn registry_for(device: &Device) -> Arc<TransportRegistry> {
    let mut registry = TransportRegistry::new();
    let device = device.clone();
    registry
        .register("fake", &[], move |_| Ok(Box::new(FakeLink { device: device.clone() }) as Box<dyn Transport>))
        .unwrap();
    registry
        .register("dead", &[], |_| {
            Err(TransportError::Io(std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused")))
        })
        .unwrap();
    Arc::new(registry)
}

fn psu_config() -> InstrumentConfig {
    serde_yaml::from_str(PSU).unwrap()
}

fn psu(device: &Device) -> Instrument {
    Instrument::new(psu_config(), registry_for(device), MessageBus::new()).unwrap()
}

fn set(id: &str, args: &[&str]) -> ServiceRequest {
    ServiceRequest::new(id, RequestType::Set)
        .with_provider("psu")
        .with_args(args.iter().copied())
}

fn get(id: &str) -> ServiceRequest {
    ServiceRequest::new(id, RequestType::Get).with_provider("psu")
}

fn error_text(response: &ServiceResponse) -> String {
    assert_eq!(response.kind, ResponseType::Error, "expected an error, got {response:?}");
    response.value.as_ref().and_then(|v| v.as_str()).unwrap_or_default().to_string()
}

#[test]
fn test_get_before_connect_is_refused_on_the_wire() {
    let yaml = r#"
provider: p
transport: fake
parameters:
  x:
    type: str
    get:
      signature: [[], str]
      instrument_command:
        - query: "X?"
"#;
    let bus = MessageBus::new();
    let mut registry = TransportRegistry::new();
    registry
        .register("fake", &[], |_| Ok(Box::new(FakeLink { device: Device::default() }) as Box<dyn Transport>))
        .unwrap();
    let mut station = Station::new(bus.clone(), registry);
    station.add_instrument(serde_yaml::from_str(yaml).unwrap()).unwrap();

    let lines = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&lines);
    let _sub = bus.subscribe(RAW_TM, move |message| {
        if let Message::Line(line) = message {
            sink.lock().unwrap().push(line.clone());
        }
        Ok(())
    });

    bus.publish(RAW_TC, Message::Raw(b"tm p_x\r\n".to_vec())).unwrap();

    assert_eq!(
        *lines.lock().unwrap(),
        vec!["> ERROR p_x Not possible to perform command before connection is established\r\n"]
    );
}

#[test]
fn test_full_path_connect_set_get() {
    let device = Device::with_voltage("3.3");
    let bus = MessageBus::new();
    let registry = TransportRegistry::new();
    let station = Station::new(bus.clone(), registry);
    // Station owns its registry, so build the instrument against ours
    let instrument = Instrument::new(psu_config(), registry_for(&device), bus.clone()).unwrap();
    instrument.start().unwrap();

    let lines = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&lines);
    let _sub = bus.subscribe(RAW_TM, move |message| {
        if let Message::Line(line) = message {
            sink.lock().unwrap().push(line.clone());
        }
        Ok(())
    });

    bus.publish(RAW_TC, Message::Raw(b"tc psu_connect\r\ntm psu_voltage\r\n".to_vec())).unwrap();
    bus.publish(RAW_TC, Message::Raw(b"tc psu_voltage 5\r\n".to_vec())).unwrap();

    let lines = lines.lock().unwrap().clone();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0], "> OK psu_connect\r\n");
    assert!(lines[1].starts_with("> OK psu_voltage;"));
    assert!(lines[1].ends_with(";3.3;3.3;0;1\r\n"));
    assert_eq!(lines[2], "> OK psu_voltage\r\n");

    assert_eq!(device.log(), vec!["Q:VOLT?", "W:VOLT 5", "Q:VOLT?"]);
    assert_eq!(instrument.memory().get("voltage"), Some(json!(5.0)));
    assert_eq!(instrument.state(), ConnectionState::Connected);

    station.shutdown().unwrap();
}

#[test]
fn test_defaults_seed_shared_memory() {
    let instrument = psu(&Device::default());
    assert_eq!(instrument.memory().get("voltage"), Some(json!(0.0)));
    assert_eq!(instrument.memory().get("output"), None);
}

#[test]
fn test_catalog_includes_builtin_lifecycle_setters() {
    let instrument = psu(&Device::default());
    let catalog = instrument.catalog();

    let find = |id: &str, kind| catalog.iter().find(|i| i.id == id && i.kind == kind);
    assert_eq!(find("voltage", ParameterType::Get).unwrap().signature, json!([[], "float"]));
    assert_eq!(find("voltage", ParameterType::Set).unwrap().signature, json!([["float"], null]));
    assert!(find("output", ParameterType::Get).is_none());
    assert_eq!(find("connect", ParameterType::Set).unwrap().signature, json!([[], null]));
    assert!(find("disconnect", ParameterType::Set).is_some());
    assert!(catalog.iter().all(|i| i.provider == "psu"));
}

#[test]
fn test_other_provider_is_ignored() {
    let instrument = psu(&Device::default());
    let request = ServiceRequest::new("voltage", RequestType::Get).with_provider("gen");
    assert!(instrument.execute(&request).is_none());
}

#[test]
fn test_request_before_connect_is_refused() {
    let device = Device::with_voltage("1.0");
    let instrument = psu(&device);

    let response = instrument.execute(&get("voltage")).unwrap();
    assert_eq!(
        error_text(&response),
        "Not possible to perform command before connection is established"
    );
    assert!(device.log().is_empty());
}

#[test]
fn test_disconnect_when_disconnected_is_a_no_op() {
    let instrument = psu(&Device::default());

    let response = instrument.execute(&set("disconnect", &[])).unwrap();
    assert_eq!(response.kind, ResponseType::Set);
    assert_eq!(instrument.state(), ConnectionState::Disconnected);

    let again = instrument.execute(&set("disconnect", &[])).unwrap();
    assert_eq!(again, response);
}

#[test]
fn test_connect_disconnect_cycle() {
    let instrument = psu(&Device::with_voltage("2.5"));

    assert_eq!(instrument.execute(&set("connect", &[])).unwrap().kind, ResponseType::Set);
    assert_eq!(instrument.state(), ConnectionState::Connected);
    // Connecting twice keeps the link
    assert_eq!(instrument.execute(&set("connect", &[])).unwrap().kind, ResponseType::Set);

    assert_eq!(instrument.execute(&set("disconnect", &[])).unwrap().kind, ResponseType::Set);
    assert_eq!(instrument.state(), ConnectionState::Disconnected);

    let response = instrument.execute(&get("voltage")).unwrap();
    assert_eq!(response.kind, ResponseType::Error);
}

#[test]
fn test_failed_connect_is_unreachable() {
    let mut config = psu_config();
    config.transport = "dead".into();
    let instrument = Instrument::new(config, registry_for(&Device::default()), MessageBus::new()).unwrap();

    let response = instrument.execute(&set("connect", &[])).unwrap();
    assert_eq!(error_text(&response), "Instrument is unreachable");
    assert_eq!(instrument.state(), ConnectionState::Unreachable);

    let response = instrument.execute(&get("voltage")).unwrap();
    assert_eq!(
        error_text(&response),
        "Not possible to perform command before connection is established"
    );
}

#[test]
fn test_wrong_argument_count_names_the_parameter() {
    let instrument = psu(&Device::with_voltage("1"));
    instrument.execute(&set("connect", &[])).unwrap();

    let response = instrument.execute(&set("voltage", &["1", "2"])).unwrap();
    assert_eq!(error_text(&response), "Wrong number of arguments for voltage: expected 1, got 2");

    let response = instrument.execute(&set("voltage", &[])).unwrap();
    assert_eq!(error_text(&response), "Wrong number of arguments for voltage: expected 1, got 0");
}

#[test]
fn test_argument_types_are_checked() {
    let device = Device::with_voltage("1");
    let instrument = psu(&device);
    instrument.execute(&set("connect", &[])).unwrap();

    let response = instrument.execute(&set("voltage", &["high"])).unwrap();
    assert!(error_text(&response).contains("not a valid float"));
    assert!(device.log().is_empty());
}

#[test]
fn test_write_only_setter_stores_its_argument() {
    let device = Device::default();
    let instrument = psu(&device);
    instrument.execute(&set("connect", &[])).unwrap();

    let response = instrument.execute(&set("output", &["on"])).unwrap();
    assert_eq!(response.kind, ResponseType::Set);
    assert_eq!(device.log(), vec!["W:OUTP on"]);
    assert_eq!(instrument.memory().get("output"), Some(json!(true)));
}

#[test]
fn test_setter_without_arguments() {
    let device = Device::default();
    let instrument = psu(&device);
    instrument.execute(&set("connect", &[])).unwrap();

    let response = instrument.execute(&set("label", &[])).unwrap();
    assert_eq!(response.kind, ResponseType::Set);
    assert_eq!(device.log(), vec!["W:DISP:TEXT hello"]);
}

#[test]
fn test_transport_failure_is_reported() {
    let device = Device::default();
    let instrument = psu(&device);
    instrument.execute(&set("connect", &[])).unwrap();

    // No register behind VOLT? so the fake times out
    let response = instrument.execute(&get("voltage")).unwrap();
    assert!(error_text(&response).starts_with("Instrument communication error"));
    assert_eq!(instrument.state(), ConnectionState::Connected);
}

#[test]
fn test_connection_loss_degrades_to_disconnected() {
    let instrument = psu(&Device::with_voltage("1"));
    instrument.execute(&set("connect", &[])).unwrap();

    let response = instrument.execute(&get("link")).unwrap();
    assert_eq!(response.kind, ResponseType::Error);
    assert_eq!(instrument.state(), ConnectionState::Disconnected);

    let response = instrument.execute(&get("voltage")).unwrap();
    assert_eq!(
        error_text(&response),
        "Not possible to perform command before connection is established"
    );
}

#[test]
fn test_declared_connect_sequence_runs_on_connect() {
    let yaml = r#"
provider: psu
transport: fake
parameters:
  connect:
    set:
      instrument_command:
        - write: "*RST"
        - write: "SYST:REM"
"#;
    let device = Device::default();
    let instrument = Instrument::new(serde_yaml::from_str(yaml).unwrap(), registry_for(&device), MessageBus::new()).unwrap();

    instrument.execute(&set("connect", &[])).unwrap();
    assert_eq!(device.log(), vec!["W:*RST", "W:SYST:REM"]);
    // Declared connect replaces the built-in entry
    assert_eq!(instrument.catalog().iter().filter(|i| i.id == "connect").count(), 1);
}

#[test]
fn test_start_publishes_catalog_and_duplicate_provider_fails() {
    let bus = MessageBus::new();
    let controller = groundlink::ProtocolController::attach(&bus);
    let device = Device::default();

    let first = Instrument::new(psu_config(), registry_for(&device), bus.clone()).unwrap();
    first.start().unwrap();
    assert_eq!(controller.catalog_len(), first.catalog().len());

    let second = Instrument::new(psu_config(), registry_for(&device), bus.clone()).unwrap();
    assert!(second.start().is_err());
    assert_eq!(bus.topic(IO_SERVICE_REQUEST).subscriber_count(), 1);
}

#[test]
fn test_quit_disconnects() {
    let bus = MessageBus::new();
    let instrument = Instrument::new(psu_config(), registry_for(&Device::default()), bus.clone()).unwrap();
    instrument.start().unwrap();
    instrument.execute(&set("connect", &[])).unwrap();

    bus.publish(QUIT, Message::Quit).unwrap();
    assert_eq!(instrument.state(), ConnectionState::Disconnected);
}

fn compile_error(yaml: &str) -> ConfigError {
    let config: InstrumentConfig = serde_yaml::from_str(yaml).unwrap();
    match Instrument::new(config, registry_for(&Device::default()), MessageBus::new()) {
        Ok(_) => panic!("expected a configuration error"),
        Err(e) => e,
    }
}

#[test]
fn test_get_with_signature_arguments_is_rejected() {
    let err = compile_error(
        r#"
provider: p
transport: fake
parameters:
  x:
    type: float
    get:
      signature: [[int], float]
      instrument_command:
        - query: "X? {0}"
"#,
    );
    assert_eq!(err, ConfigError::GetSignatureNotEmpty { id: "x".into() });
}

#[test]
fn test_get_without_query_is_rejected() {
    let err = compile_error(
        r#"
provider: p
transport: fake
parameters:
  x:
    type: float
    get:
      instrument_command:
        - write: "X"
"#,
    );
    assert_eq!(err, ConfigError::GetWithoutQuery { id: "x".into() });
}

#[test]
fn test_get_without_type_is_rejected() {
    let err = compile_error(
        r#"
provider: p
transport: fake
parameters:
  x:
    get:
      instrument_command:
        - query: "X?"
"#,
    );
    assert_eq!(err, ConfigError::MissingType { id: "x".into() });
}

#[test]
fn test_malformed_set_signature_is_rejected() {
    let err = compile_error(
        r#"
provider: p
transport: fake
parameters:
  x:
    set:
      signature: [float]
      instrument_command:
        - write: "X {0}"
"#,
    );
    assert!(matches!(err, ConfigError::MalformedSignature { ref id, .. } if id == "x"));
}

#[test]
fn test_placeholder_beyond_signature_is_rejected() {
    let err = compile_error(
        r#"
provider: p
transport: fake
parameters:
  x:
    set:
      signature: [[float], null]
      instrument_command:
        - write: "X {0},{1}"
"#,
    );
    assert!(matches!(err, ConfigError::InvalidStep { ref id, .. } if id == "x"));
}

#[test]
fn test_step_with_both_write_and_query_is_rejected() {
    let err = compile_error(
        r#"
provider: p
transport: fake
parameters:
  x:
    type: str
    get:
      instrument_command:
        - write: "X"
          query: "X?"
"#,
    );
    assert!(matches!(err, ConfigError::InvalidStep { .. }));
}

#[test]
fn test_parameter_without_accessor_is_rejected() {
    let err = compile_error(
        r#"
provider: p
transport: fake
parameters:
  x:
    type: str
"#,
    );
    assert_eq!(err, ConfigError::NoAccessor { id: "x".into() });
}

#[test]
fn test_unknown_cyclic_parameter_is_rejected() {
    let err = compile_error(
        r#"
provider: p
transport: fake
cyclic:
  mode: poll
  parameters: [missing]
parameters: {}
"#,
    );
    assert_eq!(
        err,
        ConfigError::UnknownCyclicParameter {
            instrument: "p".into(),
            id: "missing".into()
        }
    );
}

#[test]
fn test_transport_requirements_are_enforced() {
    let registry = Arc::new(TransportRegistry::with_builtins());

    let tcp = InstrumentConfig::new("psu", "tcp");
    let err = Instrument::new(tcp, Arc::clone(&registry), MessageBus::new()).err();
    assert_eq!(
        err,
        Some(ConfigError::MissingField {
            instrument: "psu".into(),
            field: "address"
        })
    );

    let sim = InstrumentConfig::new("gen", "simulation");
    let err = Instrument::new(sim, Arc::clone(&registry), MessageBus::new()).err();
    assert_eq!(
        err,
        Some(ConfigError::MissingField {
            instrument: "gen".into(),
            field: "simulation"
        })
    );

    let unknown = InstrumentConfig::new("x", "xmlrpc");
    let err = Instrument::new(unknown, registry, MessageBus::new()).err();
    assert_eq!(err, Some(ConfigError::UnknownTransport("xmlrpc".into())));
}

#[test]
fn test_duplicate_transport_id_is_rejected() {
    let mut registry = TransportRegistry::with_builtins();
    let err = registry
        .register("tcp", &[], |_| Err(TransportError::Unsupported("tcp")))
        .unwrap_err();
    assert_eq!(err, ConfigError::DuplicateTransport("tcp".into()));
}

#[test]
fn test_cyclic_poll_publishes_unsolicited_values() {
    let yaml = r#"
provider: psu
transport: fake
cyclic:
  mode: poll
  interval_ms: 10
  parameters: [voltage]
parameters:
  voltage:
    type: float
    get:
      instrument_command:
        - query: "VOLT?"
"#;
    let bus = MessageBus::new();
    let device = Device::with_voltage("4.2");
    let instrument = Instrument::new(serde_yaml::from_str(yaml).unwrap(), registry_for(&device), bus.clone()).unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let _sub = bus.subscribe(TM, move |message| {
        if let Message::Response(response) = message {
            sink.lock().unwrap().push(response.clone());
        }
        Ok(())
    });

    instrument.execute(&set("connect", &[])).unwrap();
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while seen.lock().unwrap().is_empty() && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    instrument.execute(&set("disconnect", &[])).unwrap();

    let seen = seen.lock().unwrap().clone();
    assert!(!seen.is_empty());
    assert_eq!(
        seen[0],
        ServiceResponse::new(Some("psu".into()), "voltage", ResponseType::Get, Some(json!(4.2)))
    );
    assert_eq!(instrument.memory().get("voltage"), Some(json!(4.2)));
}

#[test]
fn test_record_accumulator_joins_fragments() {
    let mut acc = RecordAccumulator::new(b"\n");

    assert!(acc.push(b"temp=21").is_empty());
    assert_eq!(acc.pending(), b"temp=21");
    assert_eq!(acc.push(b".5;volt=3.3\nte"), vec!["temp=21.5;volt=3.3"]);
    assert_eq!(acc.push(b"mp=22\n\nvolt=1\n"), vec!["temp=22", "volt=1"]);
    assert!(acc.pending().is_empty());
}

#[test]
fn test_record_accumulator_handles_split_terminator() {
    let mut acc = RecordAccumulator::new(b"\r\n");
    assert!(acc.push(b"a=1\r").is_empty());
    assert_eq!(acc.push(b"\nb=2\r\n"), vec!["a=1", "b=2"]);
}

#[test]
fn test_record_accumulator_drops_oversized_record_whole() {
    let mut acc = RecordAccumulator::new(b"\n");

    let mut oversized = vec![b'x'; groundlink::instrument::cyclic::RECORD_CAPACITY + 10];
    oversized.extend_from_slice(b"temp=9");
    assert!(acc.push(&oversized).is_empty());
    assert!(acc.is_discarding());

    // The tail of the oversized record must not surface as a record
    assert_eq!(acc.push(b"\nvolt=1\n"), vec!["volt=1"]);
    assert!(!acc.is_discarding());
}

#[test]
fn test_record_accumulator_finds_split_terminator_while_discarding() {
    let mut acc = RecordAccumulator::new(b"\r\n");

    let mut oversized = vec![b'x'; groundlink::instrument::cyclic::RECORD_CAPACITY * 2];
    oversized.extend_from_slice(b"temp=9\r");
    assert!(acc.push(&oversized).is_empty());
    assert_eq!(acc.push(b"\na=1\r\n"), vec!["a=1"]);
}
