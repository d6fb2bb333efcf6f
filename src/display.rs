/* Display: the single active device. Exactly one `Display` is live per
 * process at a time; the process-wide singleton is enforced by
 * `engine::Engine`, not by this type itself. */
use crate::keytable::KeyTable;

/* Static identity strings reported by a driver's probe. */
#[derive(Debug, Clone, Default)]
pub struct Identity {
    pub driver_code: String,
    pub serial_number: String,
    pub firmware_version: String,
    pub hardware_version: String,
}

/* Physical cell geometry. `hidden_layout` maps usable-cell index to
 * physical-cell index for drivers whose geometry has gaps; `None` means
 * usable and physical indices coincide. */
#[derive(Debug, Clone)]
pub struct Geometry {
    pub text_columns: usize,
    pub text_rows: usize,
    pub status_columns: usize,
    pub hidden_layout: Option<Vec<usize>>,
    pub physical_cells: usize,
}

impl Geometry {
    pub fn simple(text_columns: usize, text_rows: usize, status_columns: usize) -> Self {
        let usable = text_columns * text_rows;
        Self {
            text_columns,
            text_rows,
            status_columns,
            hidden_layout: None,
            physical_cells: usable,
        }
    }

    pub fn usable_cells(&self) -> usize {
        self.text_columns * self.text_rows
    }
}

/* The 127-cell ceiling: the ROUTE command packs its routing-key argument
 * (and long-press bit) into a single byte. */
pub const MAX_CELLS: usize = 127;

pub struct Display {
    pub identity: Identity,
    pub geometry: Geometry,
    /* Current cell contents, canonical ISO-11548-1 dot order. */
    pub cells: Vec<u8>,
    /* Shadow of the last buffer actually written to the device. */
    pub last_written: Vec<u8>,
    pub status_cells: Vec<u8>,
    pub key_table: KeyTable,
    pub force_rewrite: bool,
}

impl Display {
    pub fn new(identity: Identity, geometry: Geometry, key_table: KeyTable) -> Self {
        let usable = geometry.usable_cells();
        let status = geometry.status_columns;
        Self {
            identity,
            geometry,
            cells: vec![0u8; usable],
            last_written: vec![0u8; usable],
            status_cells: vec![0u8; status],
            key_table,
            force_rewrite: true,
        }
    }

    /* Set the text-cell buffer from host-supplied dot patterns, truncating
     * or zero-padding to the display's cell count. */
    pub fn set_text(&mut self, pattern: &[u8]) {
        let n = self.cells.len();
        for (i, cell) in self.cells.iter_mut().enumerate() {
            *cell = pattern.get(i).copied().unwrap_or(0);
        }
        let _ = n;
    }

    pub fn text_cell_count(&self) -> usize {
        self.cells.len()
    }

    pub fn status_cell_count(&self) -> usize {
        self.status_cells.len()
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /* Whether this display reports status cells as a physically separate
     * cluster rather than interleaved with the text cells. */
    pub fn is_status_split(&self) -> bool {
        self.geometry.status_columns > 0
    }
}
