//! Crate-wide error type.

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// The error type shared by every component of the update engine.
pub enum WolfBootError {
    /// An operation is not permitted in the current partition state, or an
    /// impossible state was observed.
    InvalidState,
    /// Firmware authentication (signature) failed.
    FwAuthFailed,
    /// Image integrity (hash) check failed.
    IntegrityCheckFailed,
    /// The size field in an image header is not a value this core accepts.
    InvalidFirmwareSize,
    /// Walked off the end of the header without finding the requested TLV.
    TlvNotFound,
    /// A TLV's declared length does not fit within the header region.
    InvalidHdrFieldLength,
    /// The image does not carry the expected magic, or is otherwise malformed.
    InvalidImage,
    /// A signature TLV was malformed or rejected by the verifier.
    BadSignature,
    /// Version-policy violation: downgrade refused, or delta base mismatch.
    BadVersion,
    /// A requested header or trailer field was never populated.
    FieldNotSet,
    /// The public-key hint does not resolve to any entry in the key store.
    KeyNotFound,
    /// A key-store entry is not permitted to sign the requested partition.
    KeyNotPermitted,
    /// The sector-flag byte read back from the trailer is not one of the
    /// four legal encodings.
    InvalidSectFlag,
    /// A flash read, write, or erase call returned an error.
    FlashIoError,
    /// A scoped lock/unlock call was made while already locked/unlocked.
    LockStateError,
    /// The delta-patch stream is malformed, or has been exhausted.
    InvalidPatch,
    /// A delta patch's declared base doesn't match the current image.
    DeltaBaseMismatch,
    /// No installed encryption key; or the key slot holds the erase sentinel.
    NoEncryptionKey,
    /// Signature verification backend returned no usable value.
    CryptoError,
    /// A pointer/length combination would read or write out of bounds.
    OutOfBounds,

    #[doc(hidden)]
    __Nonexhaustive,
}

pub type Result<T> = core::result::Result<T, WolfBootError>;

impl fmt::Display for WolfBootError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            WolfBootError::InvalidState => write!(f, "operation not permitted in current state"),
            WolfBootError::FwAuthFailed => write!(f, "firmware authentication failed"),
            WolfBootError::IntegrityCheckFailed => write!(f, "image integrity check failed"),
            WolfBootError::InvalidFirmwareSize => write!(f, "malformed firmware size"),
            WolfBootError::TlvNotFound => write!(f, "reached end of header without a match"),
            WolfBootError::InvalidHdrFieldLength => write!(f, "TLV length does not fit header"),
            WolfBootError::InvalidImage => write!(f, "not a valid wolfBoot image"),
            WolfBootError::BadSignature => write!(f, "bad signature"),
            WolfBootError::BadVersion => write!(f, "bad or disallowed image version"),
            WolfBootError::FieldNotSet => write!(f, "field not set"),
            WolfBootError::KeyNotFound => write!(f, "public key hint did not resolve"),
            WolfBootError::KeyNotPermitted => write!(f, "key not permitted for this partition"),
            WolfBootError::InvalidSectFlag => write!(f, "invalid sector flag value"),
            WolfBootError::FlashIoError => write!(f, "flash I/O error"),
            WolfBootError::LockStateError => write!(f, "flash lock/unlock imbalance"),
            WolfBootError::InvalidPatch => write!(f, "malformed delta patch stream"),
            WolfBootError::DeltaBaseMismatch => write!(f, "delta base version/hash mismatch"),
            WolfBootError::NoEncryptionKey => write!(f, "no encryption key installed"),
            WolfBootError::CryptoError => write!(f, "cryptographic backend error"),
            WolfBootError::OutOfBounds => write!(f, "access out of bounds"),
            WolfBootError::__Nonexhaustive => unreachable!(),
        }
    }
}
