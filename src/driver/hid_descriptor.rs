/* Generic-HID descriptor walker: short-form HID report descriptor items,
 * one byte prefix (`tag<<4 | type<<2 | size_code`) followed by
 * `size_code`-many little-endian data bytes. Tracks the global/local state
 * `main` items consume rather than parsing ad hoc per call site. */
use crate::keytable::{Group, KeyId};

use super::{DriverError, DriverResult};

const TYPE_MAIN: u8 = 0;
const TYPE_GLOBAL: u8 = 1;
const TYPE_LOCAL: u8 = 2;

const TAG_USAGE_PAGE: u8 = 0x0;
const TAG_REPORT_SIZE: u8 = 0x7;
const TAG_REPORT_ID: u8 = 0x8;
const TAG_REPORT_COUNT: u8 = 0x9;

const TAG_USAGE: u8 = 0x0;
const TAG_USAGE_MIN: u8 = 0x1;
const TAG_USAGE_MAX: u8 = 0x2;

const TAG_INPUT: u8 = 0x8;
const TAG_OUTPUT: u8 = 0x9;
const TAG_COLLECTION: u8 = 0xA;
const TAG_END_COLLECTION: u8 = 0xC;

/* Fixed usage table: dot keys, space, the two pan keys, a D-pad, a
 * two-way rocker, and a contiguous run of router-key usages. */
const USAGE_DOT_MIN: u16 = 0x01;
const USAGE_DOT_MAX: u16 = 0x08;
const USAGE_SPACE: u16 = 0x09;
const USAGE_PAN_LEFT: u16 = 0x0A;
const USAGE_PAN_RIGHT: u16 = 0x0B;
const USAGE_DPAD_UP: u16 = 0x0C;
const USAGE_DPAD_DOWN: u16 = 0x0D;
const USAGE_DPAD_LEFT: u16 = 0x0E;
const USAGE_DPAD_RIGHT: u16 = 0x0F;
const USAGE_DPAD_CENTER: u16 = 0x10;
const USAGE_ROCKER_UP: u16 = 0x11;
const USAGE_ROCKER_DOWN: u16 = 0x12;
const USAGE_ROUTER_MIN: u16 = 0x20;
const USAGE_ROUTER_MAX: u16 = 0x5F;

fn internal_key_for_usage(usage: u16) -> Option<KeyId> {
    match usage {
        USAGE_DOT_MIN..=USAGE_DOT_MAX => Some(KeyId::new(Group::DOT, usage as u8)),
        USAGE_SPACE => Some(KeyId::new(Group::NAVIGATION, 1)),
        USAGE_PAN_LEFT => Some(KeyId::new(Group::NAVIGATION, 2)),
        USAGE_PAN_RIGHT => Some(KeyId::new(Group::NAVIGATION, 3)),
        USAGE_DPAD_UP => Some(KeyId::new(Group::NAVIGATION, 4)),
        USAGE_DPAD_DOWN => Some(KeyId::new(Group::NAVIGATION, 5)),
        USAGE_DPAD_LEFT => Some(KeyId::new(Group::NAVIGATION, 6)),
        USAGE_DPAD_RIGHT => Some(KeyId::new(Group::NAVIGATION, 7)),
        USAGE_DPAD_CENTER => Some(KeyId::new(Group::NAVIGATION, 8)),
        USAGE_ROCKER_UP => Some(KeyId::new(Group::NAVIGATION, 9)),
        USAGE_ROCKER_DOWN => Some(KeyId::new(Group::NAVIGATION, 10)),
        USAGE_ROUTER_MIN..=USAGE_ROUTER_MAX => {
            Some(KeyId::new(Group::ROUTING, (usage - USAGE_ROUTER_MIN + 1) as u8))
        }
        _ => None,
    }
}

/* What construct() needs out of a descriptor: the input report's bit
 * layout and the output report's cell count. */
#[derive(Debug, Clone)]
pub struct ParsedDescriptor {
    pub input_report_id: u8,
    pub bit_to_usage: Vec<u16>,
    pub bit_to_key: Vec<Option<KeyId>>,
    pub router_key_first_bit: Option<usize>,
    pub output_cell_count: usize,
}

pub fn parse(bytes: &[u8]) -> DriverResult<ParsedDescriptor> {
    let mut i = 0;

    let mut report_size: u32 = 0;
    let mut report_count: u32 = 0;
    let mut report_id: u8 = 0;
    let mut usages: Vec<u16> = Vec::new();
    let mut usage_min: Option<u16> = None;
    let mut usage_max: Option<u16> = None;

    let mut input_report_id: Option<u8> = None;
    let mut bit_to_usage: Vec<u16> = Vec::new();
    let mut output_report_id: Option<u8> = None;
    let mut output_cell_count: Option<usize> = None;
    let mut output_count = 0;

    while i < bytes.len() {
        let prefix = bytes[i];
        i += 1;
        let size = match prefix & 0x3 {
            0 => 0,
            1 => 1,
            2 => 2,
            _ => 4,
        };
        if i + size > bytes.len() {
            return Err(DriverError::Descriptor("truncated item at end of descriptor".into()));
        }
        let data = &bytes[i..i + size];
        i += size;
        let value = data.iter().rev().fold(0u32, |acc, b| (acc << 8) | *b as u32);
        let item_type = (prefix >> 2) & 0x3;
        let tag = (prefix >> 4) & 0xF;

        match (item_type, tag) {
            (TYPE_GLOBAL, TAG_USAGE_PAGE) => { /* usages are matched by id alone, page is informational */ }
            (TYPE_GLOBAL, TAG_REPORT_SIZE) => report_size = value,
            (TYPE_GLOBAL, TAG_REPORT_COUNT) => report_count = value,
            (TYPE_GLOBAL, TAG_REPORT_ID) => report_id = value as u8,
            (TYPE_LOCAL, TAG_USAGE) => usages.push(value as u16),
            (TYPE_LOCAL, TAG_USAGE_MIN) => usage_min = Some(value as u16),
            (TYPE_LOCAL, TAG_USAGE_MAX) => usage_max = Some(value as u16),
            (TYPE_MAIN, TAG_INPUT) => {
                match input_report_id {
                    Some(existing) if existing != report_id => {
                        return Err(DriverError::Descriptor("more than one input report ID".into()));
                    }
                    Some(_) => {}
                    None => input_report_id = Some(report_id),
                }
                for k in 0..report_count {
                    let usage = usages
                        .get(k as usize)
                        .copied()
                        .or_else(|| match (usage_min, usage_max) {
                            (Some(min), Some(max)) if min + k as u16 <= max => Some(min + k as u16),
                            _ => None,
                        })
                        .unwrap_or(0);
                    bit_to_usage.push(usage);
                }
                usages.clear();
                usage_min = None;
                usage_max = None;
            }
            (TYPE_MAIN, TAG_OUTPUT) => {
                output_count += 1;
                if output_count > 1 {
                    return Err(DriverError::Descriptor("more than one output report".into()));
                }
                if report_size != 8 {
                    return Err(DriverError::Descriptor("output report must use 8-bit fields".into()));
                }
                if let Some(input_id) = input_report_id {
                    if input_id != report_id {
                        return Err(DriverError::Descriptor("input and output report IDs differ".into()));
                    }
                }
                output_report_id = Some(report_id);
                output_cell_count = Some(report_count as usize);
                usages.clear();
                usage_min = None;
                usage_max = None;
            }
            (TYPE_MAIN, TAG_COLLECTION) | (TYPE_MAIN, TAG_END_COLLECTION) => {}
            _ => {}
        }
    }

    let Some(input_report_id) = input_report_id else {
        return Err(DriverError::Descriptor("no input report in descriptor".into()));
    };
    let Some(output_cell_count) = output_cell_count else {
        return Err(DriverError::Descriptor("no output report in descriptor".into()));
    };
    let _ = output_report_id;

    let mut bit_to_key = Vec::with_capacity(bit_to_usage.len());
    let mut router_key_first_bit = None;
    for (idx, &usage) in bit_to_usage.iter().enumerate() {
        let key = internal_key_for_usage(usage);
        if router_key_first_bit.is_none() && matches!(key, Some(k) if k.group == Group::ROUTING) {
            router_key_first_bit = Some(idx);
        }
        bit_to_key.push(key);
    }

    Ok(ParsedDescriptor {
        input_report_id,
        bit_to_usage,
        bit_to_key,
        router_key_first_bit,
        output_cell_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

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

    /* One collection: 8 dot bits + 1 space bit on input report 1, then a
     * 40-cell output report on the same report ID. */
    fn sample_descriptor() -> Vec<u8> {
        let mut d = Vec::new();
        d.extend(item(TAG_USAGE_PAGE, TYPE_GLOBAL, &[0x00, 0xFF]));
        d.extend(item(TAG_REPORT_ID, TYPE_GLOBAL, &[0x01]));
        d.extend(item(TAG_COLLECTION, TYPE_MAIN, &[0x00]));
        for usage in 1..=8u8 {
            d.extend(item(TAG_USAGE, TYPE_LOCAL, &[usage]));
        }
        d.extend(item(TAG_REPORT_SIZE, TYPE_GLOBAL, &[0x01]));
        d.extend(item(TAG_REPORT_COUNT, TYPE_GLOBAL, &[0x08]));
        d.extend(item(TAG_INPUT, TYPE_MAIN, &[0x02]));
        d.extend(item(TAG_USAGE, TYPE_LOCAL, &[USAGE_SPACE as u8]));
        d.extend(item(TAG_REPORT_COUNT, TYPE_GLOBAL, &[0x01]));
        d.extend(item(TAG_INPUT, TYPE_MAIN, &[0x02]));
        d.extend(item(TAG_REPORT_SIZE, TYPE_GLOBAL, &[0x08]));
        d.extend(item(TAG_REPORT_COUNT, TYPE_GLOBAL, &[0x28]));
        d.extend(item(TAG_OUTPUT, TYPE_MAIN, &[0x02]));
        d.extend(item(TAG_END_COLLECTION, TYPE_MAIN, &[]));
        d
    }

    #[test]
    fn parses_dot_and_space_bits_and_forty_cell_output() {
        let parsed = parse(&sample_descriptor()).unwrap();
        assert_eq!(parsed.input_report_id, 1);
        assert_eq!(parsed.output_cell_count, 40);
        assert_eq!(parsed.bit_to_key.len(), 9);
        assert_eq!(parsed.bit_to_key[0], Some(KeyId::new(Group::DOT, 1)));
        assert_eq!(parsed.bit_to_key[3], Some(KeyId::new(Group::DOT, 4)));
        assert_eq!(parsed.bit_to_key[8], Some(KeyId::new(Group::NAVIGATION, 1)));
    }

    #[test]
    fn rejects_descriptors_with_two_input_report_ids() {
        let mut d = Vec::new();
        d.extend(item(TAG_REPORT_ID, TYPE_GLOBAL, &[0x01]));
        d.extend(item(TAG_REPORT_SIZE, TYPE_GLOBAL, &[0x01]));
        d.extend(item(TAG_REPORT_COUNT, TYPE_GLOBAL, &[0x01]));
        d.extend(item(TAG_INPUT, TYPE_MAIN, &[0x02]));
        d.extend(item(TAG_REPORT_ID, TYPE_GLOBAL, &[0x02]));
        d.extend(item(TAG_INPUT, TYPE_MAIN, &[0x02]));
        assert!(matches!(parse(&d), Err(DriverError::Descriptor(_))));
    }

    #[test]
    fn rejects_output_report_id_mismatch() {
        let mut d = Vec::new();
        d.extend(item(TAG_REPORT_ID, TYPE_GLOBAL, &[0x01]));
        d.extend(item(TAG_REPORT_SIZE, TYPE_GLOBAL, &[0x01]));
        d.extend(item(TAG_REPORT_COUNT, TYPE_GLOBAL, &[0x01]));
        d.extend(item(TAG_INPUT, TYPE_MAIN, &[0x02]));
        d.extend(item(TAG_REPORT_ID, TYPE_GLOBAL, &[0x02]));
        d.extend(item(TAG_REPORT_SIZE, TYPE_GLOBAL, &[0x08]));
        d.extend(item(TAG_REPORT_COUNT, TYPE_GLOBAL, &[0x28]));
        d.extend(item(TAG_OUTPUT, TYPE_MAIN, &[0x02]));
        assert!(matches!(parse(&d), Err(DriverError::Descriptor(_))));
    }
}
