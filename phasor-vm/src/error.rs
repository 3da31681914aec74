//! The error taxonomy raised by every stage of the toolchain: loading a
//! binary or textual container, generating bytecode, and running it.

use thiserror::Error;

pub use phasor_isa::PanicReason;

/// Result alias for fallible VM operations whose error is a [`RuntimeError`].
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Result alias for fallible load/decode operations whose error is a
/// [`LoadError`].
pub type LoadResult<T> = std::result::Result<T, LoadError>;

/// A fault that unwinds the active instance's call stack.
///
/// Every variant here corresponds to one of the runtime fault kinds: format
/// errors are surfaced separately (see [`LoadError`]) because they are
/// raised before an instance even exists.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuntimeError {
    /// A structural, stack, arithmetic, call, module or I/O fault. The
    /// [`PanicReason`] names the specific condition.
    #[error("{reason}: {message}")]
    Fault {
        /// The categorised reason for the fault.
        reason: PanicReason,
        /// A human-readable detail message.
        message: String,
    },
    /// The host-side native function registered under this name returned an
    /// error rather than a value.
    #[error("native function `{0}` failed: {1}")]
    NativeFunction(String, String),
}

impl From<PanicReason> for RuntimeError {
    fn from(reason: PanicReason) -> Self {
        let message = reason.to_string();
        RuntimeError::Fault { reason, message }
    }
}

impl RuntimeError {
    /// Builds a fault with the given reason and message.
    pub fn fault(reason: PanicReason, message: impl Into<String>) -> Self {
        Self::Fault { reason, message: message.into() }
    }

    /// The categorised reason for this error, for status reporting.
    pub fn reason(&self) -> PanicReason {
        match self {
            RuntimeError::Fault { reason, .. } => *reason,
            RuntimeError::NativeFunction(..) => PanicReason::NativeFunctionNotFound,
        }
    }
}

/// An error raised while decoding a binary container, parsing textual IR, or
/// resolving a module manifest — before any instance exists to attribute the
/// fault to.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LoadError {
    /// The container's magic number did not match `"PHSB"`.
    #[error("bad magic number: expected 0x{expected:08x}, found 0x{found:08x}")]
    BadMagic {
        /// The magic number this codec expects.
        expected: u32,
        /// The magic number actually read.
        found: u32,
    },
    /// The container's version is not supported by this runtime.
    #[error("unsupported bytecode version 0x{0:08x}")]
    UnsupportedVersion(u32),
    /// The container's CRC32 did not match its payload.
    #[error("checksum mismatch: corrupted bytecode")]
    ChecksumMismatch,
    /// A section tag byte did not match any known section.
    #[error("unknown section tag 0x{0:02x}")]
    UnknownSectionTag(u8),
    /// A constant's type tag byte did not match any known type.
    #[error("unknown constant type tag {0}")]
    UnknownConstantTag(u8),
    /// The byte stream or text ended before a declared value.
    #[error("unexpected end of input")]
    UnexpectedEndOfInput,
    /// A textual IR line did not parse.
    #[error("malformed syntax at line {line}: {detail}")]
    MalformedSyntax {
        /// 1-based line number.
        line: usize,
        /// What went wrong.
        detail: String,
    },
    /// A Struct or Array constant was asked to be written to the binary
    /// container, which only supports scalar constants.
    #[error("struct/array values cannot be written to the binary container")]
    UnencodableConstant,
    /// Reading the manifest or a source file from disk failed.
    #[error("I/O error: {0}")]
    Io(String),
    /// The manifest's JSON was malformed or missing a required field.
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),
    /// A source file's SHA-256 checksum did not match the manifest.
    #[error("checksum mismatch for source `{0}`")]
    SourceChecksumMismatch(String),
    /// The manifest's `sources` and `checksums` arrays had different
    /// lengths.
    #[error("manifest declares {sources} sources but {checksums} checksums")]
    ChecksumCountMismatch {
        /// Number of entries in `sources`.
        sources: usize,
        /// Number of entries in `checksums`.
        checksums: usize,
    },
}

impl From<std::io::Error> for LoadError {
    fn from(e: std::io::Error) -> Self {
        LoadError::Io(e.to_string())
    }
}

impl From<LoadError> for RuntimeError {
    fn from(e: LoadError) -> Self {
        let reason = match &e {
            LoadError::BadMagic { .. } => PanicReason::BadMagicNumber,
            LoadError::UnsupportedVersion(_) => PanicReason::UnsupportedVersion,
            LoadError::ChecksumMismatch => PanicReason::ChecksumMismatch,
            LoadError::UnknownSectionTag(_) => PanicReason::UnknownSectionTag,
            LoadError::UnknownConstantTag(_) => PanicReason::UnknownSectionTag,
            LoadError::UnexpectedEndOfInput => PanicReason::UnexpectedEndOfInput,
            LoadError::MalformedSyntax { .. } => PanicReason::MalformedSyntax,
            LoadError::UnencodableConstant => PanicReason::MalformedSyntax,
            LoadError::Io(_) => PanicReason::FileReadError,
            LoadError::InvalidManifest(_) => PanicReason::ModuleManifestInvalid,
            LoadError::SourceChecksumMismatch(_) => PanicReason::ModuleChecksumMismatch,
            LoadError::ChecksumCountMismatch { .. } => PanicReason::ModuleChecksumCountMismatch,
        };
        RuntimeError::fault(reason, e.to_string())
    }
}
