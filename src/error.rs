//! Error taxonomy for the emulation core.
//!
//! Most runtime faults (decode misses, bus misses, cart protocol violations)
//! are recoverable and handled locally -- see §7 of the design notes for the
//! taxonomy this mirrors. Only load-time and savestate failures, plus
//! scheduler exhaustion, unwind as [`CoreError`].

use thiserror::Error;

/// Errors surfaced across a component boundary to the host.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// `load_rom` rejected the image before any state was retained.
    #[error("ROM validation failed: {0}")]
    RomValidation(#[from] RomError),

    /// A savestate section's tag or declared size did not match what the
    /// component expected. The emulation context is left in the pre-load
    /// state.
    #[error("savestate section mismatch: expected `{expected}`, got `{found}` ({reason})")]
    SavestateMismatch {
        expected: &'static str,
        found: String,
        reason: &'static str,
    },

    /// The scheduler's fixed-capacity event pool was exhausted. Treated as
    /// fatal: it means an invariant elsewhere (an unbounded reschedule loop)
    /// was broken.
    #[error("scheduler event pool exhausted (capacity {capacity})")]
    SchedulerOverflow { capacity: usize },

    /// No cartridge is inserted for an operation that requires one.
    #[error("no cartridge inserted")]
    NoCartridge,
}

/// Failure reasons for [`CoreError::RomValidation`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RomError {
    #[error("ROM is smaller than its declared header size ({declared} > {actual})")]
    TooSmall { declared: usize, actual: usize },

    #[error("ROM header is shorter than the minimum 0x200 bytes")]
    HeaderTooShort,

    #[error("CPU-A code section ({offset:#x}, {size:#x}) falls outside the ROM image")]
    CodeSectionOutOfRange { offset: u32, size: u32 },

    #[error("CPU-B code section ({offset:#x}, {size:#x}) falls outside the ROM image")]
    CodeSectionOutOfRangeB { offset: u32, size: u32 },
}

pub type CoreResult<T> = Result<T, CoreError>;
