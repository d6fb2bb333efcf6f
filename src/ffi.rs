/* Foreign-call surface: the flat C ABI a host screen reader links
 * against. Every function here must be called from the single "engine
 * thread"; there is no internal locking because the contract forbids
 * concurrent callers, so the live `Engine` lives in a `thread_local!`
 * `RefCell` rather than behind a `Mutex`. */
use std::cell::RefCell;
use std::ffi::{c_char, CStr, CString};
use std::path::PathBuf;

use tracing::{error, warn};

use crate::command;
use crate::engine::Engine;
use crate::transport::TransportDescriptor;

thread_local! {
    static ENGINE: RefCell<Option<Engine>> = RefCell::new(None);
}

/* The FFI layer's own mapping from a driver code to the transport family it
 * naturally speaks, so `initialize`'s single `device_id` string can be
 * turned into the richer `TransportDescriptor` the engine actually needs.
 * The external interface names only a flat device id, not a full
 * descriptor list, so this crate picks the one alternative each driver
 * family is built for rather than probing every transport kind. */
fn descriptor_for(driver_code: &str, device_id: &str) -> Vec<TransportDescriptor> {
    match driver_code {
        "hid" => vec![TransportDescriptor::Hid { path: device_id.to_string() }],
        _ => vec![TransportDescriptor::Serial { path: device_id.to_string(), baud: 9600 }],
    }
}

unsafe fn borrow_str<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    unsafe { CStr::from_ptr(ptr) }.to_str().ok()
}

/// Load `driver_code`'s driver, connect to `device_id`, probe, and compile
/// the key table from `tables_dir/<driver_code>/default.ktb`. Returns
/// `false` on any failure; the reason is logged, not returned.
///
/// # Safety
/// `driver_code`, `device_id`, and `tables_dir` must each be a valid,
/// NUL-terminated, UTF-8 C string for the duration of this call.
#[no_mangle]
pub unsafe extern "C" fn brl_engine_initialize(
    driver_code: *const c_char,
    device_id: *const c_char,
    tables_dir: *const c_char,
) -> bool {
    let (Some(driver_code), Some(device_id), Some(tables_dir)) =
        (unsafe { borrow_str(driver_code) }, unsafe { borrow_str(device_id) }, unsafe { borrow_str(tables_dir) })
    else {
        error!("initialize: argument was not valid UTF-8");
        return false;
    };

    ENGINE.with(|cell| {
        if cell.borrow().is_some() {
            error!("initialize: engine already initialized");
            return false;
        }

        let descriptors = descriptor_for(driver_code, device_id);
        match Engine::initialize(driver_code, &descriptors, &PathBuf::from(tables_dir)) {
            Ok(engine) => {
                *cell.borrow_mut() = Some(engine);
                true
            }
            Err(err) => {
                error!("initialize failed: {err}");
                false
            }
        }
    })
}

/// Tear down the live engine, if any. Idempotent: a second call is logged
/// and otherwise a no-op.
///
/// # Safety
/// Must be called from the same thread that called `brl_engine_initialize`.
#[no_mangle]
pub unsafe extern "C" fn brl_engine_destroy() {
    ENGINE.with(|cell| match cell.borrow_mut().take() {
        Some(mut engine) => engine.destroy(),
        None => warn!("destroy: engine was not initialized"),
    });
}

/// Returns the next command, or `NO_COMMAND` if none is ready, or `RESTART`
/// / `EOF`. `read_delay_ms` is set to a positive delay when
/// the host should poll again without a fresh command (long-press arming,
/// auto-repeat), zero otherwise.
///
/// # Safety
/// `read_delay_ms` must point to a valid, writable `i32`.
#[no_mangle]
pub unsafe extern "C" fn brl_engine_read_command(read_delay_ms: *mut i32) -> i32 {
    let report = ENGINE.with(|cell| {
        cell.borrow_mut()
            .as_mut()
            .map(|engine| engine.read_command())
    });

    match report {
        Some(report) => {
            if !read_delay_ms.is_null() {
                unsafe { *read_delay_ms = report.read_delay_ms };
            }
            report.command
        }
        None => {
            warn!("read_command: engine was not initialized");
            if !read_delay_ms.is_null() {
                unsafe { *read_delay_ms = 0 };
            }
            command::NO_COMMAND
        }
    }
}

/// Write one line of cells. `dot_pattern` is truncated or zero-padded to
/// the display's cell count.
///
/// # Safety
/// `dot_pattern` must point to `len` readable bytes.
#[no_mangle]
pub unsafe extern "C" fn brl_engine_write_window(dot_pattern: *const u8, len: usize) -> bool {
    if dot_pattern.is_null() && len != 0 {
        return false;
    }
    let pattern = if len == 0 { &[][..] } else { unsafe { std::slice::from_raw_parts(dot_pattern, len) } };

    ENGINE.with(|cell| match cell.borrow_mut().as_mut() {
        Some(engine) => match engine.write_window(pattern) {
            Ok(()) => true,
            Err(err) => {
                warn!("write_window failed: {err}");
                false
            }
        },
        None => {
            warn!("write_window: engine was not initialized");
            false
        }
    })
}

#[no_mangle]
pub extern "C" fn brl_engine_text_cell_count() -> usize {
    ENGINE.with(|cell| cell.borrow().as_ref().map(|e| e.text_cell_count()).unwrap_or(0))
}

#[no_mangle]
pub extern "C" fn brl_engine_status_cell_count() -> usize {
    ENGINE.with(|cell| cell.borrow().as_ref().map(|e| e.status_cell_count()).unwrap_or(0))
}

/// One binding reported to a `list_key_map` callback: a packed command, its
/// long-press flag, and its key names as NUL-terminated C strings.
#[repr(C)]
pub struct KeyMapEntry {
    pub command: i32,
    pub is_long_press: bool,
    pub key_names: *const *const c_char,
    pub key_names_len: usize,
}

/// For each non-hidden binding in the default context, invoke `callback`
/// once (plus once more for any synthesized long-press routing binding),
/// stopping early if it returns `false`.
///
/// # Safety
/// `callback` must be a valid function pointer that does not retain the
/// `KeyMapEntry` or its `key_names` array past the call.
#[no_mangle]
pub unsafe extern "C" fn brl_engine_list_key_map(
    callback: extern "C" fn(*const KeyMapEntry) -> bool,
) {
    ENGINE.with(|cell| {
        let borrow = cell.borrow();
        let Some(engine) = borrow.as_ref() else {
            warn!("list_key_map: engine was not initialized");
            return;
        };

        engine.list_key_map(|cmd, key_names, is_long_press| {
            let names: Vec<CString> = key_names
                .iter()
                .map(|n| CString::new(*n).expect("key names never contain NUL"))
                .collect();
            let pointers: Vec<*const c_char> = names.iter().map(|n| n.as_ptr()).collect();

            let entry = KeyMapEntry {
                command: cmd.0 as i32,
                is_long_press,
                key_names: pointers.as_ptr(),
                key_names_len: pointers.len(),
            };

            callback(&entry as *const KeyMapEntry)
        });
    });
}
