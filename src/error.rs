/* Shared error definitions: EngineError aggregates driver/key-table/transport failures for
 * callers that need a single error type at the foreign-call boundary. */
use thiserror::Error;

use crate::driver::DriverError;
use crate::keytable::KeyTableError;

/* Errors that may surface from `brl_engine`'s public surface. */
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no driver registered for code {0:?}")]
    UnknownDriver(String),

    #[error("driver error: {0}")]
    Driver(#[from] DriverError),

    #[error("key table error: {0}")]
    KeyTable(#[from] KeyTableError),

    #[error("display reports {cells} cells, which exceeds the 127-cell limit")]
    TooManyCells { cells: usize },

    #[error("engine already initialized")]
    AlreadyInitialized,

    #[error("engine not initialized")]
    NotInitialized,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
