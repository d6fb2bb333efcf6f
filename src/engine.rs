/* Engine: the single explicitly-constructed value that replaces
 * process-wide globals for driver state. Exactly one `Engine` is ever
 * live; the foreign-call surface in `ffi` enforces that by holding it
 * behind a single `Option` rather than letting this type self-enforce a
 * singleton. */
use std::path::Path;

use tracing::{debug, info, warn};

use crate::command::{self, Command};
use crate::diff;
use crate::display::{self, Display};
use crate::driver::{self, BrailleDriver, ReadCommandOutcome};
use crate::error::{EngineError, Result};
use crate::handler::{HandlerFrame, HandlerStack, Propagation};
use crate::keytable::compiler;
use crate::keytable::matcher::Matcher;
use crate::keytable::Context;
use crate::queue::{CommandQueue, DispatchPreferences};
use crate::timer::{Clock, MonotonicClock};
use crate::transport::{self, TransportDescriptor};

/* The fixed key-table file name looked up under
 * `tables_dir/<driver_code>/`. The external interface names a
 * `binding_name` in its path template but never threads one through
 * `initialize`'s parameter list, so it is fixed to "default". */
const DEFAULT_BINDING_NAME: &str = "default";

pub struct Engine {
    driver: Box<dyn BrailleDriver>,
    display: Display,
    queue: CommandQueue,
    handlers: HandlerStack,
    matcher: Matcher,
    clock: Box<dyn Clock>,
    context: Context,
    dispatch_prefs: DispatchPreferences,
}

/* What `read_command` reports to the foreign-call surface: a command (or
 * one of the `NO_COMMAND`/`RESTART`/`EOF` sentinels from `command.rs`) plus
 * a poll delay the host should honor before calling again. */
pub struct ReadCommandReport {
    pub command: i32,
    pub read_delay_ms: i32,
}

impl Engine {
    /* Load a driver, connect its transport, probe, compile the key table,
     * install the default handler frame, and begin the command queue. */
    pub fn initialize(
        driver_code: &str,
        descriptors: &[TransportDescriptor],
        tables_dir: &Path,
    ) -> Result<Engine> {
        let mut driver = driver::load_braille_driver(driver_code)
            .ok_or_else(|| EngineError::UnknownDriver(driver_code.to_string()))?;

        let transport = transport::connect(descriptors)
            .map_err(crate::driver::DriverError::Io)?;

        let info = driver.construct(transport)?;
        let cells = info.geometry.usable_cells();
        if cells > display::MAX_CELLS {
            driver.destruct();
            return Err(EngineError::TooManyCells { cells });
        }

        let ktb_path = tables_dir.join(driver.code()).join(format!("{DEFAULT_BINDING_NAME}.ktb"));
        let key_table = match compiler::compile(&ktb_path, driver.name_table()) {
            Ok(table) => table,
            Err(err) => {
                driver.destruct();
                return Err(err.into());
            }
        };

        let display = Display::new(info.identity, info.geometry, key_table);

        let mut handlers = HandlerStack::new();
        handlers.push(default_handler_frame());

        info!("initialized {driver_code} driver, {cells} usable cells");

        Ok(Engine {
            driver,
            display,
            queue: CommandQueue::new(),
            handlers,
            matcher: Matcher::new(),
            clock: Box::new(MonotonicClock::new()),
            context: Context::Default,
            dispatch_prefs: DispatchPreferences::default(),
        })
    }

    /* Tear down the queue, handlers, and driver. Idempotent at this layer
     * because it only touches `self`; the true double-destroy guard lives
     * in `ffi`, which only calls this once per live `Engine`. */
    pub fn destroy(&mut self) {
        self.handlers = HandlerStack::new();
        self.driver.destruct();
        info!("engine destroyed");
    }

    fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /* Drain driver input into the command queue, then dispatch whatever the
     * queue's alarm allows, returning the first command the host should
     * see. */
    pub fn read_command(&mut self) -> ReadCommandReport {
        loop {
            let now_ms = self.now_ms();

            if let Some(report) = self.try_dispatch(now_ms) {
                return report;
            }

            match self.driver.read_command(&mut self.matcher, &self.display.key_table, self.context, now_ms) {
                ReadCommandOutcome::Command(cmd) => {
                    self.queue.push(cmd, now_ms);
                    continue;
                }
                ReadCommandOutcome::Pending { poll_after_ms } => {
                    return ReadCommandReport {
                        command: command::NO_COMMAND,
                        read_delay_ms: poll_after_ms.unwrap_or(0) as i32,
                    };
                }
                ReadCommandOutcome::Eof => {
                    return ReadCommandReport { command: command::EOF, read_delay_ms: 0 };
                }
                ReadCommandOutcome::Restart => {
                    warn!("driver reported RESTART");
                    return ReadCommandReport { command: command::RESTART, read_delay_ms: 0 };
                }
            }
        }
    }

    /* Pop and run one command through the handler stack if the queue's
     * alarm is due: pop one command, traverse the command-handler stack
     * top-down, rearm the alarm if work remains. */
    fn try_dispatch(&mut self, now_ms: u64) -> Option<ReadCommandReport> {
        if !self.queue.alarm_due(now_ms) {
            return None;
        }
        let cmd = self.queue.begin_dispatch(self.dispatch_prefs)?;
        let handled = self.handlers.dispatch(cmd);
        self.queue.finish_dispatch(now_ms);
        debug!("dispatched command {:#010x}, handled={handled}", cmd.0);
        Some(ReadCommandReport { command: cmd.0 as i32, read_delay_ms: 0 })
    }

    /* Apply a deferred resize, diff the new text against the last-written
     * shadow, and send the minimal update through the driver. The pattern
     * is truncated or zero-padded to the display's cell count by
     * `Display::set_text`. */
    pub fn write_window(&mut self, pattern: &[u8]) -> Result<()> {
        if let Some(text_columns) = self.driver.take_resize() {
            self.apply_resize(text_columns);
        }

        self.display.set_text(pattern);
        let length = self.display.cells.len();
        let range = diff::diff(
            &self.display.last_written,
            &self.display.cells,
            length,
            self.display.force_rewrite,
        );
        let Some(range) = range else {
            return Ok(());
        };

        self.driver.write_window(&self.display.cells, Some(range))?;
        self.display.last_written[range.from..range.to]
            .copy_from_slice(&self.display.cells[range.from..range.to]);
        self.display.force_rewrite = false;
        Ok(())
    }

    pub fn write_status(&mut self, cells: &[u8]) -> Result<()> {
        for (i, cell) in self.display.status_cells.iter_mut().enumerate() {
            *cell = cells.get(i).copied().unwrap_or(0);
        }
        self.driver.write_status(&self.display.status_cells)?;
        Ok(())
    }

    fn apply_resize(&mut self, text_columns: usize) {
        self.display.geometry.text_columns = text_columns;
        let usable = self.display.geometry.usable_cells();
        self.display.geometry.physical_cells = usable;
        self.display.cells.resize(usable, 0);
        self.display.last_written.resize(usable, 0);
        self.display.force_rewrite = true;
        info!("geometry resized to {text_columns} columns");
    }

    pub fn text_cell_count(&self) -> usize {
        self.display.text_cell_count()
    }

    pub fn status_cell_count(&self) -> usize {
        self.display.status_cell_count()
    }

    /* For each non-hidden binding in the default context (including any
     * compiler-synthesized `ROUTE | LONG_PRESS` binding), invoke `callback`
     * once; stop early if it returns false. */
    pub fn list_key_map(&self, mut callback: impl FnMut(Command, &[&'static str], bool) -> bool) {
        for binding in self.display.key_table.context(Context::Default) {
            if binding.is_hidden() {
                continue;
            }
            if !callback(binding.command, &binding.key_names, binding.is_long_press()) {
                break;
            }
        }
    }
}

fn default_handler_frame() -> HandlerFrame {
    HandlerFrame {
        name: "default".to_string(),
        context: Context::Default,
        on_command: Box::new(|_data, _cmd| Propagation::Unhandled),
        data: Box::new(()),
    }
}
