/* End-to-end scenarios driven entirely through public crate surface:
 * the driver registry, the `Transport` trait, and the key-table
 * compiler. `Engine` always calls the real `transport::connect`, so these
 * exercise the driver/keytable/matcher/diff layers directly instead. */
use std::time::Duration;

use brl_engine::command::{Block, FLG_LONG_PRESS};
use brl_engine::diff;
use brl_engine::driver::{load_braille_driver, ReadCommandOutcome};
use brl_engine::keytable::compiler;
use brl_engine::keytable::matcher::{MatchOutcome, Matcher};
use brl_engine::keytable::{Context, Group, KeyEvent, KeyId, KeyNameTable, KeyTable};
use brl_engine::transport::mock::MockTransport;
use brl_engine::transport::{Result as TransportResult, Transport};

fn compile_ktb(src: &str, names: KeyNameTable) -> KeyTable {
    let path = std::env::temp_dir().join(format!(
        "brl-engine-scenarios-{:?}-{:x}.ktb",
        std::thread::current().id(),
        src.len()
    ));
    std::fs::write(&path, src).unwrap();
    let table = compiler::compile(&path, names).expect("compiles");
    std::fs::remove_file(&path).ok();
    table
}

#[test]
fn cebra_probe_reports_forty_columns_through_the_registry() {
    let mut driver = load_braille_driver("ce").expect("ce is registered");
    let mut transport = MockTransport::new();
    transport.feed(&[0xFE, 0x74]);

    let info = driver.construct(Box::new(transport)).unwrap();
    assert_eq!(info.geometry.text_columns, 40);
    assert_eq!(info.identity.driver_code, "ce");
}

#[test]
fn voyager_write_diff_applies_its_hidden_lead_in_through_the_registry() {
    let mut driver = load_braille_driver("vo").expect("vo is registered");
    let mut transport = MockTransport::new();
    transport.feed(&[0x1B, 0x81, 44]);
    let info = driver.construct(Box::new(transport)).unwrap();
    assert_eq!(info.geometry.text_columns, 44);

    let last = vec![0u8; 44];
    let mut current = last.clone();
    current[22] = 0x15;
    let range = diff::diff(&last, &current, 44, false).unwrap();

    driver.write_window(&current, Some(range)).unwrap();

    let layout = driver.hidden_layout().expect("voyager reports a hidden layout");
    let projected = diff::project_hidden(range, layout);
    assert_eq!(projected.from, 24);
    assert_eq!(projected.to, 25);
}

#[test]
fn dotpad_withholds_the_second_write_until_its_ack_arrives() {
    let mut driver = load_braille_driver("dp").expect("dp is registered");

    struct RecordingTransport {
        written: std::sync::Arc<std::sync::Mutex<Vec<u8>>>,
        inbox: std::collections::VecDeque<u8>,
    }
    impl Transport for RecordingTransport {
        fn write(&mut self, bytes: &[u8]) -> TransportResult<usize> {
            self.written.lock().unwrap().extend_from_slice(bytes);
            Ok(bytes.len())
        }
        fn read(&mut self, buf: &mut [u8], _i: Duration, _s: Duration) -> TransportResult<usize> {
            match self.inbox.pop_front() {
                Some(b) => {
                    buf[0] = b;
                    Ok(1)
                }
                None => Ok(0),
            }
        }
    }

    let written = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let mut probe_reply = vec![0x02u8, 60];
    probe_reply.push(probe_reply.iter().fold(0u8, |a, b| a.wrapping_add(*b)));
    let mut inbox: std::collections::VecDeque<u8> = probe_reply.into_iter().collect();
    inbox.push_back(0x06); // ack, drained by the later read_command call

    let transport = RecordingTransport { written: written.clone(), inbox };
    let info = driver.construct(Box::new(transport)).unwrap();
    assert_eq!(info.geometry.text_columns, 60);

    let last = vec![0u8; 60];
    let mut current = last.clone();
    current[5] = 1;
    let range = diff::diff(&last, &current, 60, false).unwrap();

    driver.write_window(&current, Some(range)).unwrap();
    assert_eq!(written.lock().unwrap().len(), 1, "first write must go out");

    let mut current2 = current.clone();
    current2[6] = 1;
    let range2 = diff::diff(&current, &current2, 60, false).unwrap();
    driver.write_window(&current2, Some(range2)).unwrap();
    assert_eq!(written.lock().unwrap().len(), 1, "second write withheld while ack is pending");

    let table = KeyTable { bindings: std::collections::HashMap::new() };
    let mut matcher = Matcher::new();
    driver.read_command(&mut matcher, &table, Context::Default, 0);

    driver.write_window(&current2, Some(range2)).unwrap();
    assert_eq!(written.lock().unwrap().len(), 2, "write proceeds once the ack clears");
}

#[test]
fn generic_hid_driver_parses_its_descriptor_and_reports_cell_count() {
    fn item(tag: u8, item_type: u8, data: &[u8]) -> Vec<u8> {
        let size_code = match data.len() {
            0 => 0,
            1 => 1,
            2 => 2,
            4 => 3,
            _ => panic!("unsupported item data length"),
        };
        let mut out = vec![(tag << 4) | (item_type << 2) | size_code];
        out.extend_from_slice(data);
        out
    }

    const TYPE_MAIN: u8 = 0;
    const TYPE_GLOBAL: u8 = 1;
    const TYPE_LOCAL: u8 = 2;
    const TAG_USAGE: u8 = 0x0;
    const TAG_REPORT_SIZE: u8 = 0x7;
    const TAG_REPORT_ID: u8 = 0x8;
    const TAG_REPORT_COUNT: u8 = 0x9;
    const TAG_INPUT: u8 = 0x8;
    const TAG_OUTPUT: u8 = 0x9;

    let mut descriptor = Vec::new();
    descriptor.extend(item(TAG_REPORT_ID, TYPE_GLOBAL, &[0x01]));
    for usage in 1..=8u8 {
        descriptor.extend(item(TAG_USAGE, TYPE_LOCAL, &[usage]));
    }
    descriptor.extend(item(TAG_REPORT_SIZE, TYPE_GLOBAL, &[0x01]));
    descriptor.extend(item(TAG_REPORT_COUNT, TYPE_GLOBAL, &[0x08]));
    descriptor.extend(item(TAG_INPUT, TYPE_MAIN, &[0x02]));
    descriptor.extend(item(TAG_REPORT_SIZE, TYPE_GLOBAL, &[0x08]));
    descriptor.extend(item(TAG_REPORT_COUNT, TYPE_GLOBAL, &[0x28]));
    descriptor.extend(item(TAG_OUTPUT, TYPE_MAIN, &[0x02]));

    struct DescriptorTransport {
        descriptor: Vec<u8>,
        log: std::sync::Arc<std::sync::Mutex<Vec<u8>>>,
    }
    impl Transport for DescriptorTransport {
        fn write(&mut self, _bytes: &[u8]) -> TransportResult<usize> {
            Ok(0)
        }
        fn read(&mut self, _buf: &mut [u8], _i: Duration, _s: Duration) -> TransportResult<usize> {
            Ok(0)
        }
        fn set_hid_report(&mut self, report: &[u8]) -> TransportResult<()> {
            self.log.lock().unwrap().extend_from_slice(report);
            Ok(())
        }
        fn get_hid_descriptor(&mut self) -> TransportResult<Vec<u8>> {
            Ok(self.descriptor.clone())
        }
    }

    let log = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let mut driver = load_braille_driver("hid").expect("hid is registered");
    let info = driver
        .construct(Box::new(DescriptorTransport { descriptor, log: log.clone() }))
        .unwrap();
    assert_eq!(info.geometry.text_columns, 40);

    let cells = [0xAAu8; 40];
    driver.write_window(&cells, Some(diff::DiffRange { from: 0, to: 40 })).unwrap();
    let mut expected = vec![0x01u8];
    expected.extend_from_slice(&cells);
    assert_eq!(*log.lock().unwrap(), expected);
}

#[test]
fn long_press_route_binding_reports_the_held_routing_key_number() {
    let driver = load_braille_driver("dp").expect("dp is registered");
    let table = compile_ktb("bind RoutingKey ROUTE long_press\n", driver.name_table());

    let mut matcher = Matcher::new().with_long_press_threshold_ms(200);
    let key = KeyId::new(Group::ROUTING, 7);
    let press = KeyEvent { key, pressed: true, timestamp_ms: 0 };
    assert_eq!(matcher.on_event(&table, Context::Default, press), MatchOutcome::Pending);

    match matcher.poll_deadline(&table, Context::Default, 250) {
        MatchOutcome::Emit { command, .. } => {
            assert!(command.is_route());
            assert_eq!(command.route_key_number(), 7);
            assert!(command.has_flag(FLG_LONG_PRESS));
        }
        other => panic!("expected a long-press route command, got {other:?}"),
    }
}

#[test]
fn braillememo_driver_resyncs_past_garbage_through_the_registry() {
    // Magic-header framing: MAGIC, command, subcode, little-endian u16
    // body length, body. `CMD_KEY = 0x10`, dot group = 2.
    fn key_frame(key_number: u8, pressed: bool) -> Vec<u8> {
        let body = [key_number, pressed as u8];
        let mut out = vec![0xBE, 0xEF, 0x10, 0x02];
        out.extend_from_slice(&(body.len() as u16).to_le_bytes());
        out.extend_from_slice(&body);
        out
    }
    fn probe_reply(cells: u8) -> Vec<u8> {
        let mut out = vec![0xBE, 0xEF, 0x81, 0x00];
        out.extend_from_slice(&1u16.to_le_bytes());
        out.push(cells);
        out
    }

    let mut driver = load_braille_driver("bm").expect("bm is registered");
    let mut transport = MockTransport::new();
    transport.feed(&probe_reply(32));
    driver.construct(Box::new(transport)).unwrap();

    let table = compile_ktb("bind Dot1 HOME\n", driver.name_table());
    let mut matcher = Matcher::new();

    // The probe above already consumed its reply; feed the post-construct
    // stream through a second registry instance whose only transport is the
    // garbage-then-key sequence, since `construct` is the only public way to
    // install a transport and it always reprobes first.
    let mut driver = load_braille_driver("bm").expect("bm is registered");
    let mut stream = MockTransport::new();
    stream.feed(&probe_reply(32));
    stream.feed(&[0x11, 0xEF, 0xBE]); // garbage containing a partial magic
    stream.feed(&key_frame(1, true));
    stream.feed(&key_frame(1, false));
    driver.construct(Box::new(stream)).unwrap();

    let outcome = driver.read_command(&mut matcher, &table, Context::Default, 0);
    match outcome {
        ReadCommandOutcome::Command(c) => assert_eq!(c.block(), Some(Block::Home)),
        other => panic!("expected a command, got {other:?}"),
    }
}
