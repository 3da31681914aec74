//! Fixed limits and magic values shared across the codecs and the
//! interpreter.

/// Number of general-purpose registers per frame. Re-exported from
/// `phasor-isa` so callers needn't depend on both crates just to size a
/// register file.
pub use phasor_isa::REGISTER_COUNT;

/// Maximum number of nested call frames (including cross-instance calls)
/// before the interpreter raises [`crate::error::RuntimeError`] with
/// [`phasor_isa::PanicReason::CallStackOverflow`].
///
/// Chosen to stay well under the host's own stack limit since `RETURN`
/// unwinding and cross-instance `execute` both recurse on the Rust call
/// stack.
pub const MAX_CALL_STACK_DEPTH: usize = 2048;

/// Magic number identifying a Phasor binary container: ASCII `"PHSB"`
/// stored little-endian.
pub const BINARY_MAGIC: u32 = 0x4253_4850;

/// Binary container format version this crate reads and writes.
pub const BINARY_VERSION: u32 = 0x0300_0000;

/// Sentinel value used in the manifest's `checksums` array to bypass
/// checksum validation for a source file.
pub const CHECKSUM_SKIP: &str = "SKIP";
