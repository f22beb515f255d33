use thiserror::Error as ThisError;

/// Fatal core-layer errors. Every variant here terminates the emulator
/// process at the host boundary; none are recoverable inside the core.
#[derive(ThisError, Debug)]
pub enum Error {
    #[error("invalid elf: {0}")]
    InvalidElf(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("elf parse error: {0}")]
    Parsing(#[from] goblin::error::Error),

    #[error("mmap failed at {addr:#x}: {source}")]
    MmapFailure {
        addr: u64,
        #[source]
        source: nix::Error,
    },

    #[error("illegal instruction {raw:#010x} at pc {pc:#x}")]
    IllegalInstruction { raw: u32, pc: u64 },

    #[error("unsupported csr {0:#x}")]
    UnsupportedCsr(u16),
}

pub type Result<T> = std::result::Result<T, Error>;
