//! Error types and handling for contact management.
//!
//! One crate-wide error type groups the failures of each layer: the binary
//! codecs, the ratchet, the contact state machine, the PANDA coordinator and
//! configuration loading.

use thiserror::Error;

/// Result type alias for the contacts library
pub type Result<T> = std::result::Result<T, ContactsError>;

/// Comprehensive error type for all contact operations
#[derive(Error, Debug, Clone)]
pub enum ContactsError {
    /// Binary encoding and decoding errors
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Ratchet and key exchange errors
    #[error("Ratchet error: {0}")]
    Ratchet(#[from] RatchetError),

    /// Contact state machine errors
    #[error("Contact error: {0}")]
    Contact(#[from] ContactError),

    /// PANDA exchange errors
    #[error("PANDA error: {0}")]
    Panda(#[from] PandaError),

    /// Configuration and I/O errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Generic I/O errors
    #[error("I/O error: {0}")]
    Io(String),
}

/// Binary codec errors
#[derive(Error, Debug, Clone)]
pub enum CodecError {
    /// A value could not be serialized
    #[error("Encoding failed for {what}: {reason}")]
    Encoding { what: String, reason: String },

    /// Input bytes are malformed, truncated or incomplete
    #[error("Decoding failed for {what}: {reason}")]
    Decoding { what: String, reason: String },
}

/// Ratchet and key exchange errors
#[derive(Error, Debug, Clone)]
pub enum RatchetError {
    /// Ratchet generation failed, usually because the randomness source failed
    #[error("Ratchet initialization failed: {reason}")]
    Init { reason: String },

    /// Serialized ratchet state is corrupt or from a foreign format
    #[error("Ratchet restore failed: {reason}")]
    Restore { reason: String },

    /// The ratchet has already consumed key exchange material
    #[error("Replayed or stale key exchange: {reason}")]
    ReplayOrStale { reason: String },

    /// Signature on a key exchange did not verify
    #[error("Key exchange signature verification failed")]
    SignatureVerification,

    /// Operation not valid in the ratchet's current state
    #[error("Invalid ratchet state: {state}")]
    InvalidState { state: String },

    /// Encryption operation failure
    #[error("Encryption failed: {reason}")]
    Encryption { reason: String },

    /// Decryption operation failure
    #[error("Decryption failed: {reason}")]
    Decryption { reason: String },

    /// Message ordering violation
    #[error("Message ordering violation: expected {expected}, got {actual}")]
    MessageOrdering { expected: u32, actual: u32 },

    /// Key derivation failure
    #[error("Key derivation failed: {reason}")]
    KeyDerivation { reason: String },
}

/// Contact state machine errors
#[derive(Error, Debug, Clone)]
pub enum ContactError {
    /// The key exchange with this contact was already completed
    #[error("Contact {nickname} is already established")]
    AlreadyEstablished { nickname: String },

    /// The contact has not completed its key exchange yet
    #[error("Contact {nickname} is still pending")]
    NotEstablished { nickname: String },

    /// No contact with the given id or nickname
    #[error("Contact not found: {key}")]
    NotFound { key: String },

    /// Nicknames are unique within a contact book
    #[error("Nickname already in use: {nickname}")]
    DuplicateNickname { nickname: String },

    /// Nickname failed validation
    #[error("Invalid nickname: {reason}")]
    InvalidNickname { reason: String },

    /// The book has handed out every contact id
    #[error("No contact ids left")]
    IdsExhausted,
}

/// PANDA exchange errors
#[derive(Error, Debug, Clone)]
pub enum PandaError {
    /// The peer's payload did not authenticate under our shared secret
    #[error("PANDA authentication failed")]
    AuthenticationFailed,

    /// The peer's payload authenticated but its contents were unusable
    #[error("PANDA protocol error: {reason}")]
    Protocol { reason: String },

    /// No peer material was found within the attempt budget
    #[error("PANDA exchange gave up after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    /// The rendezvous service reported an error
    #[error("Rendezvous error: {reason}")]
    Rendezvous { reason: String },

    /// Shared secret was empty
    #[error("PANDA shared secret must not be empty")]
    EmptySecret,

    /// The persisted PANDA state cannot be resumed
    #[error("PANDA exchange cannot be resumed: {reason}")]
    NotResumable { reason: String },
}

/// Configuration and setup errors
#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    /// Invalid configuration value
    #[error("Invalid configuration value for {field}: {value}")]
    InvalidValue { field: String, value: String },

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// Configuration parsing error
    #[error("Configuration parse error: {reason}")]
    ParseError { reason: String },

    /// TOML parsing error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Directory creation failure
    #[error("Failed to create directory: {path}")]
    DirectoryCreation { path: String },
}

impl ContactsError {
    /// Returns true if the caller can recover by rejecting the input or retrying
    /// with new material
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Codec(_)
                | Self::Contact(ContactError::DuplicateNickname { .. })
                | Self::Contact(ContactError::InvalidNickname { .. })
                | Self::Panda(PandaError::RetriesExhausted { .. })
                | Self::Panda(PandaError::Rendezvous { .. })
        )
    }

    /// Returns true if this error indicates a security violation
    pub fn is_security_violation(&self) -> bool {
        matches!(
            self,
            Self::Ratchet(RatchetError::SignatureVerification)
                | Self::Ratchet(RatchetError::Decryption { .. })
                | Self::Ratchet(RatchetError::ReplayOrStale { .. })
                | Self::Panda(PandaError::AuthenticationFailed)
        )
    }
}

impl CodecError {
    pub(crate) fn encoding(what: &str, err: impl std::fmt::Display) -> Self {
        Self::Encoding {
            what: what.to_string(),
            reason: err.to_string(),
        }
    }

    pub(crate) fn decoding(what: &str, err: impl std::fmt::Display) -> Self {
        Self::Decoding {
            what: what.to_string(),
            reason: err.to_string(),
        }
    }
}

impl From<std::io::Error> for ContactsError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
