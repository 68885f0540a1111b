use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Couldn't open the backing file
    #[error("Opening the backing file failed")]
    Open(#[source] std::io::Error),
    /// Couldn't lock the backing file
    #[error("Failed to lock the backing file for exclusive use")]
    Lock(#[source] std::io::Error),
    /// I/O on the backing file failed
    #[error("I/O on the backing file failed")]
    Io(#[source] std::io::Error),
    /// Couldn't synchronize to the backing file
    #[error("Synchronizing to the backing file failed")]
    Sync(#[source] std::io::Error),
    /// No record covers the requested page at the requested state
    #[error("No record covers page 0x{page:x} at state {state}")]
    NotFound { page: u64, state: u64 },
    /// No allocation covers the given address
    #[error("No allocation covers address 0x{address:x}")]
    InvalidAddress { address: u64 },
    /// Offset is not aligned to the page size
    #[error("Offset 0x{offset:x} is not a multiple of the page size {page_size}")]
    Misaligned { offset: u64, page_size: u32 },
    /// Invalid argument or request
    #[error("Invalid: {0}")]
    Invalid(&'static str),
    /// The address space is exhausted
    #[error("Out of memory: unable to allocate {size} bytes")]
    OutOfMemory { size: usize },
    /// Stored data failed validation
    #[error("Data corruption: {0}")]
    Corruption(&'static str),
    /// A structural invariant was broken; not recoverable
    #[error("Internal error: {0}")]
    Internal(&'static str),
}
