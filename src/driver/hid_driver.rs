/* Generic-HID driver: the one driver with no fixed wire framing of its
 * own — geometry and key layout come entirely from
 * the descriptor walked in `hid_descriptor`. Input reports arrive whole
 * (the HID transport delivers one complete report per `read`, per
 * `transport::hid::HidTransport`), so there is no byte-at-a-time
 * `PacketReader` here; reports are diffed bit-by-bit against a pressed-
 * keys mask instead. */
use std::time::Duration;

use crate::diff::DiffRange;
use crate::display::{Geometry, Identity};
use crate::keytable::matcher::Matcher;
use crate::keytable::{Context, Group, KeyEvent, KeyName, KeyNameTable, KeyId, KeyTable};
use crate::transport::{Transport, TransportError};

use super::hid_descriptor::{self, ParsedDescriptor};
use super::{match_events, BrailleDriver, ConstructInfo, DriverError, DriverResult, ReadCommandOutcome};

const READ_TIMEOUT: Duration = Duration::from_millis(20);

const NAMES: KeyNameTable = &[
    KeyName { name: "Dot1", key: KeyId { group: Group::DOT, number: 1 } },
    KeyName { name: "Dot2", key: KeyId { group: Group::DOT, number: 2 } },
    KeyName { name: "Dot3", key: KeyId { group: Group::DOT, number: 3 } },
    KeyName { name: "Dot4", key: KeyId { group: Group::DOT, number: 4 } },
    KeyName { name: "Dot5", key: KeyId { group: Group::DOT, number: 5 } },
    KeyName { name: "Dot6", key: KeyId { group: Group::DOT, number: 6 } },
    KeyName { name: "Dot7", key: KeyId { group: Group::DOT, number: 7 } },
    KeyName { name: "Dot8", key: KeyId { group: Group::DOT, number: 8 } },
    KeyName { name: "Space", key: KeyId { group: Group::NAVIGATION, number: 1 } },
    KeyName { name: "PanLeft", key: KeyId { group: Group::NAVIGATION, number: 2 } },
    KeyName { name: "PanRight", key: KeyId { group: Group::NAVIGATION, number: 3 } },
    KeyName { name: "DPadUp", key: KeyId { group: Group::NAVIGATION, number: 4 } },
    KeyName { name: "DPadDown", key: KeyId { group: Group::NAVIGATION, number: 5 } },
    KeyName { name: "DPadLeft", key: KeyId { group: Group::NAVIGATION, number: 6 } },
    KeyName { name: "DPadRight", key: KeyId { group: Group::NAVIGATION, number: 7 } },
    KeyName { name: "DPadCenter", key: KeyId { group: Group::NAVIGATION, number: 8 } },
    KeyName { name: "RockerUp", key: KeyId { group: Group::NAVIGATION, number: 9 } },
    KeyName { name: "RockerDown", key: KeyId { group: Group::NAVIGATION, number: 10 } },
    KeyName { name: "RoutingKey", key: KeyId { group: Group::ROUTING, number: 0 } },
];

pub struct GenericHidDriver {
    transport: Option<Box<dyn Transport>>,
    parsed: Option<ParsedDescriptor>,
    pressed: Vec<bool>,
}

impl GenericHidDriver {
    pub fn new() -> Self {
        Self {
            transport: None,
            parsed: None,
            pressed: Vec::new(),
        }
    }
}

impl Default for GenericHidDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl BrailleDriver for GenericHidDriver {
    fn code(&self) -> &'static str {
        "hid"
    }

    fn name_table(&self) -> KeyNameTable {
        NAMES
    }

    fn construct(&mut self, mut transport: Box<dyn Transport>) -> DriverResult<ConstructInfo> {
        let descriptor_bytes = transport.get_hid_descriptor()?;
        let parsed = hid_descriptor::parse(&descriptor_bytes)?;

        self.pressed = vec![false; parsed.bit_to_key.len()];
        let cells = parsed.output_cell_count;
        self.parsed = Some(parsed);
        self.transport = Some(transport);

        Ok(ConstructInfo {
            identity: Identity {
                driver_code: "hid".to_string(),
                ..Identity::default()
            },
            geometry: Geometry::simple(cells, 1, 0),
        })
    }

    fn destruct(&mut self) {
        self.transport = None;
        self.parsed = None;
        self.pressed.clear();
    }

    fn write_window(&mut self, cells: &[u8], range: Option<DiffRange>) -> DriverResult<()> {
        if range.is_none() {
            return Ok(());
        }
        let parsed = self.parsed.as_ref().ok_or(DriverError::NotConstructed)?;
        let transport = self.transport.as_mut().ok_or(DriverError::NotConstructed)?;

        let mut report = Vec::with_capacity(cells.len() + 1);
        report.push(parsed.input_report_id);
        report.extend_from_slice(cells);
        transport.set_hid_report(&report)?;
        Ok(())
    }

    fn read_command(&mut self, matcher: &mut Matcher, key_table: &KeyTable, context: Context, now_ms: u64) -> ReadCommandOutcome {
        let (Some(transport), Some(parsed)) = (self.transport.as_mut(), self.parsed.as_ref()) else {
            return ReadCommandOutcome::Eof;
        };

        let report_len = 1 + parsed.bit_to_key.len().div_ceil(8);
        let mut buf = vec![0u8; report_len];
        match transport.read(&mut buf, READ_TIMEOUT, READ_TIMEOUT) {
            Ok(0) => match_events(matcher, key_table, context, &[], now_ms),
            Ok(_) => {
                let mut events = Vec::new();
                for (i, key) in parsed.bit_to_key.iter().enumerate() {
                    let Some(key) = key else { continue };
                    let byte_idx = 1 + i / 8;
                    if byte_idx >= buf.len() {
                        continue;
                    }
                    let value = (buf[byte_idx] >> (i % 8)) & 1 != 0;
                    if value != self.pressed[i] {
                        self.pressed[i] = value;
                        events.push(KeyEvent {
                            key: *key,
                            pressed: value,
                            timestamp_ms: now_ms,
                        });
                    }
                }
                match_events(matcher, key_table, context, &events, now_ms)
            }
            Err(TransportError::Disconnected) => ReadCommandOutcome::Restart,
            Err(_) => ReadCommandOutcome::Pending {
                poll_after_ms: matcher.suggested_poll_ms(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Block;

    struct HidMockTransport {
        descriptor: Vec<u8>,
        reports: std::collections::VecDeque<Vec<u8>>,
        written: Vec<u8>,
    }

    impl Transport for HidMockTransport {
        fn write(&mut self, bytes: &[u8]) -> crate::transport::Result<usize> {
            self.written.extend_from_slice(bytes);
            Ok(bytes.len())
        }

        fn read(&mut self, buf: &mut [u8], _i: Duration, _s: Duration) -> crate::transport::Result<usize> {
            match self.reports.pop_front() {
                Some(report) => {
                    let n = report.len().min(buf.len());
                    buf[..n].copy_from_slice(&report[..n]);
                    Ok(n)
                }
                None => Ok(0),
            }
        }

        fn set_hid_report(&mut self, report: &[u8]) -> crate::transport::Result<()> {
            self.written.extend_from_slice(report);
            Ok(())
        }

        fn get_hid_descriptor(&mut self) -> crate::transport::Result<Vec<u8>> {
            Ok(self.descriptor.clone())
        }
    }

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

    fn sample_descriptor() -> Vec<u8> {
        const TYPE_MAIN: u8 = 0;
        const TYPE_GLOBAL: u8 = 1;
        const TYPE_LOCAL: u8 = 2;
        const TAG_USAGE: u8 = 0x0;
        const TAG_REPORT_SIZE: u8 = 0x7;
        const TAG_REPORT_ID: u8 = 0x8;
        const TAG_REPORT_COUNT: u8 = 0x9;
        const TAG_INPUT: u8 = 0x8;
        const TAG_OUTPUT: u8 = 0x9;

        let mut d = Vec::new();
        d.extend(item(TAG_REPORT_ID, TYPE_GLOBAL, &[0x01]));
        for usage in 1..=8u8 {
            d.extend(item(TAG_USAGE, TYPE_LOCAL, &[usage]));
        }
        d.extend(item(TAG_REPORT_SIZE, TYPE_GLOBAL, &[0x01]));
        d.extend(item(TAG_REPORT_COUNT, TYPE_GLOBAL, &[0x08]));
        d.extend(item(TAG_INPUT, TYPE_MAIN, &[0x02]));
        d.extend(item(TAG_REPORT_SIZE, TYPE_GLOBAL, &[0x08]));
        d.extend(item(TAG_REPORT_COUNT, TYPE_GLOBAL, &[0x28]));
        d.extend(item(TAG_OUTPUT, TYPE_MAIN, &[0x02]));
        d
    }

    #[test]
    fn construct_reports_forty_cells_from_descriptor() {
        let mut driver = GenericHidDriver::new();
        let transport = HidMockTransport {
            descriptor: sample_descriptor(),
            reports: Default::default(),
            written: Vec::new(),
        };
        let info = driver.construct(Box::new(transport)).unwrap();
        assert_eq!(info.geometry.text_columns, 40);
    }

    #[test]
    fn input_report_toggles_dot1_and_dot4() {
        let mut driver = GenericHidDriver::new();
        let transport = HidMockTransport {
            descriptor: sample_descriptor(),
            reports: std::collections::VecDeque::from([vec![0x01, 0x09]]),
            written: Vec::new(),
        };
        driver.construct(Box::new(transport)).unwrap();

        let path = std::env::temp_dir().join("brl-engine-hid-test.ktb");
        std::fs::write(&path, "bind Dot1 HOME\n").unwrap();
        let table = crate::keytable::compiler::compile(&path, NAMES).unwrap();
        std::fs::remove_file(&path).ok();

        let mut matcher = Matcher::new();
        let outcome = driver.read_command(&mut matcher, &table, Context::Default, 0);
        match outcome {
            ReadCommandOutcome::Command(c) => assert_eq!(c.block(), Some(Block::Home)),
            other => panic!("expected a command, got {other:?}"),
        }
        assert!(driver.pressed[0]);
        assert!(driver.pressed[3]);
        assert!(!driver.pressed[1]);
    }

    #[test]
    fn write_window_sends_report_id_prefixed_cells() {
        use std::sync::{Arc, Mutex};

        struct RecordingTransport {
            descriptor: Vec<u8>,
            log: Arc<Mutex<Vec<u8>>>,
        }
        impl Transport for RecordingTransport {
            fn write(&mut self, _bytes: &[u8]) -> crate::transport::Result<usize> {
                Ok(0)
            }
            fn read(&mut self, _buf: &mut [u8], _i: Duration, _s: Duration) -> crate::transport::Result<usize> {
                Ok(0)
            }
            fn set_hid_report(&mut self, report: &[u8]) -> crate::transport::Result<()> {
                self.log.lock().unwrap().extend_from_slice(report);
                Ok(())
            }
            fn get_hid_descriptor(&mut self) -> crate::transport::Result<Vec<u8>> {
                Ok(self.descriptor.clone())
            }
        }

        let log = Arc::new(Mutex::new(Vec::new()));
        let mut driver = GenericHidDriver::new();
        driver
            .construct(Box::new(RecordingTransport {
                descriptor: sample_descriptor(),
                log: log.clone(),
            }))
            .unwrap();

        let cells = [0xAAu8; 40];
        driver.write_window(&cells, Some(DiffRange { from: 0, to: 40 })).unwrap();

        let mut expected = vec![0x01u8];
        expected.extend_from_slice(&cells);
        assert_eq!(*log.lock().unwrap(), expected);
    }
}
