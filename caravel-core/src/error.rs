//! Error types for Caravel core operations.
//!
//! All errors are handled explicitly. Parsing failures surface immediately
//! to the caller and are never retried internally.

use std::fmt;

/// The result type for core operations.
pub type Result<T> = std::result::Result<T, AddressError>;

/// Errors raised while normalizing an endpoint address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    /// The input was empty or contained no address at all.
    Empty,

    /// The endpoint string does not follow the `/<proto>/<host>/tcp/<port>` form.
    Malformed {
        /// The offending input, as received.
        input: String,
        /// Which part of the input failed to parse.
        reason: &'static str,
    },

    /// The protocol segment names a transport this cluster does not speak.
    UnsupportedProtocol {
        /// The protocol segment found in the input.
        protocol: String,
    },
}

impl fmt::Display for AddressError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "empty address"),
            Self::Malformed { input, reason } => {
                write!(f, "malformed address {input:?}: {reason}")
            }
            Self::UnsupportedProtocol { protocol } => {
                write!(f, "unsupported address protocol {protocol:?}")
            }
        }
    }
}

impl std::error::Error for AddressError {}
