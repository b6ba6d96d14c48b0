//! Loader error taxonomy.
//!
//! Every variant is fatal for the current boot attempt: the loader never
//! continues with a partially copied or partially relocated image. Errors
//! bubble up to `efi_main`, which logs them and hands [`BootError::status`]
//! back to the firmware.

use core::fmt;

/// Raw firmware status word, kept verbatim so it can be reported unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareStatus(pub usize);

impl FirmwareStatus {
    pub(crate) const ERROR_BIT: usize = 1 << (usize::BITS - 1);

    pub const SUCCESS: Self = Self(0);
    pub const LOAD_ERROR: Self = Self(Self::ERROR_BIT | 1);
    pub const INVALID_PARAMETER: Self = Self(Self::ERROR_BIT | 2);
    pub const UNSUPPORTED: Self = Self(Self::ERROR_BIT | 3);
    pub const BUFFER_TOO_SMALL: Self = Self(Self::ERROR_BIT | 5);
    pub const OUT_OF_RESOURCES: Self = Self(Self::ERROR_BIT | 9);
    pub const END_OF_FILE: Self = Self(Self::ERROR_BIT | 31);

    pub fn is_error(self) -> bool {
        self.0 & Self::ERROR_BIT != 0
    }
}

impl fmt::Display for FirmwareStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_error() {
            write!(f, "EFI error {}", self.0 & !Self::ERROR_BIT)
        } else {
            write!(f, "EFI status {:#x}", self.0)
        }
    }
}

/// The image bytes do not describe something this loader can stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatError {
    BadLegacyMagic(u16),
    BadSignature(u32),
    UnsupportedOptionalHeader(u16),
    OptionalHeaderSize(u16),
    UnsupportedMachine(u16),
    WrongSubsystem(u16),
    NoSections,
    /// Entrypoint RVA is not inside the staged footprint.
    EntrypointOutsideImage { rva: u32, footprint: u64 },
    /// Image has its relocations stripped but could not get its preferred base.
    NotRelocatable { preferred: u64, actual: u64 },
    /// A relocation block header claims fewer bytes than the header itself.
    MalformedRelocationBlock { offset: usize, size: u32 },
    /// A copy or fixup would land outside the staged region.
    OutOfBounds { offset: usize, len: usize, extent: usize },
}

impl fmt::Display for FormatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::BadLegacyMagic(m) => write!(f, "bad legacy header magic {m:#06x}"),
            Self::BadSignature(s) => write!(f, "bad image signature {s:#010x}"),
            Self::UnsupportedOptionalHeader(m) => write!(f, "optional header magic {m:#06x} is not PE32+"),
            Self::OptionalHeaderSize(s) => write!(f, "unexpected optional header size {s}"),
            Self::UnsupportedMachine(m) => write!(f, "unsupported machine type {m:#06x}"),
            Self::WrongSubsystem(s) => write!(f, "subsystem {s} is not an EFI application"),
            Self::NoSections => f.write_str("image has no sections"),
            Self::EntrypointOutsideImage { rva, footprint } => {
                write!(f, "entrypoint rva {rva:#x} outside image of {footprint:#x} bytes")
            }
            Self::NotRelocatable { preferred, actual } => write!(
                f,
                "relocations stripped but image landed at {actual:#x} instead of {preferred:#x}"
            ),
            Self::MalformedRelocationBlock { offset, size } => {
                write!(f, "relocation block at {offset:#x} has size {size}")
            }
            Self::OutOfBounds { offset, len, extent } => {
                write!(f, "{len:#x} bytes at {offset:#x} exceed region of {extent:#x} bytes")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoError {
    /// The file layer failed; status is passed through untouched.
    Firmware(FirmwareStatus),
    /// End of file reached before the requested bytes were read.
    ShortRead { offset: u64, expected: usize, read: usize },
}

impl fmt::Display for IoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Firmware(status) => write!(f, "file i/o failed: {status}"),
            Self::ShortRead { offset, expected, read } => {
                write!(f, "short read at {offset:#x}: wanted {expected} bytes, got {read}")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootError {
    Format(FormatError),
    Io(IoError),
    Allocation { bytes: usize, status: FirmwareStatus },
    /// GetMemoryMap failed for a reason other than buffer size.
    MemoryMap(FirmwareStatus),
    /// Memory map still did not fit after the single re-fetch.
    MapCapture { required: usize, provided: usize },
    /// ExitBootServices rejected after the single permitted retry.
    ExitBootServices(FirmwareStatus),
}

impl BootError {
    /// Status code reported back to firmware when the loader gives up.
    pub fn status(&self) -> FirmwareStatus {
        match *self {
            Self::Format(_) => FirmwareStatus::LOAD_ERROR,
            Self::Io(IoError::Firmware(status)) => status,
            Self::Io(IoError::ShortRead { .. }) => FirmwareStatus::END_OF_FILE,
            Self::Allocation { status, .. } => status,
            Self::MemoryMap(status) => status,
            Self::MapCapture { .. } => FirmwareStatus::BUFFER_TOO_SMALL,
            Self::ExitBootServices(status) => status,
        }
    }

    /// Whether console output and timers may still be used to report this
    /// error. A rejected exit can leave boot services partly shut down.
    pub fn console_usable(&self) -> bool {
        !matches!(self, Self::ExitBootServices(_))
    }
}

impl fmt::Display for BootError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Format(e) => write!(f, "invalid kernel image: {e}"),
            Self::Io(e) => write!(f, "{e}"),
            Self::Allocation { bytes, status } => {
                write!(f, "allocation of {bytes:#x} bytes failed: {status}")
            }
            Self::MemoryMap(status) => write!(f, "memory map query failed: {status}"),
            Self::MapCapture { required, provided } => write!(
                f,
                "memory map needs {required} bytes, buffer of {provided} still too small"
            ),
            Self::ExitBootServices(status) => write!(f, "ExitBootServices rejected: {status}"),
        }
    }
}

impl From<FormatError> for BootError {
    fn from(e: FormatError) -> Self {
        Self::Format(e)
    }
}

impl From<IoError> for BootError {
    fn from(e: IoError) -> Self {
        Self::Io(e)
    }
}

pub type BootResult<T> = Result<T, BootError>;
