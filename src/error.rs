use thiserror::Error as ThisError;

/// Symbolic error kinds, matching spec.md §7 one-to-one.
#[derive(ThisError, Debug)]
pub enum Error {
    /// Null/zero-length input, unknown format enum, missing read+execute
    /// access to the image file.
    #[error("invalid argument: {0}")]
    InvalidArg(String),

    /// Unknown capability bits, unsupported ELF class/type/machine,
    /// unhandled vCPU exit reason, unknown PIO port.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Host allocation or hypervisor mapping failure.
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// Memory-map region overlap.
    #[error("conflicting memory region: {0}")]
    Conflict(String),

    /// Filesystem or hypervisor-driver I/O failure, short reads.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Hypervisor subsystem init failure or VM/vCPU creation failure.
    #[error("hypervisor not available: {0}")]
    NotAvailable(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<goblin::error::Error> for Error {
    fn from(e: goblin::error::Error) -> Self {
        Error::Unsupported(format!("elf parse error: {e}"))
    }
}
