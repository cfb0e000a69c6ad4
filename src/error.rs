//! Error types for hadron.

use std::io;

use thiserror::Error;

use crate::backend::BackendKind;
use crate::event::Descriptor;

/// Result type alias using hadron's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Every failure a multiplexer operation can report.
///
/// Signal interruption of a blocking wait is deliberately absent: it is
/// reported as a poll that dispatched zero events.
#[derive(Error, Debug)]
pub enum Error {
    /// An explicitly requested backend is not available on this platform.
    #[error("{kind} backend is not supported on this platform")]
    Configuration {
        /// Requested backend.
        kind: BackendKind,
    },

    /// The OS facility could not be created (descriptor table limits, sandbox
    /// restrictions, missing kernel support).
    #[error("cannot acquire {kind} resources: {source}")]
    ResourceExhaustion {
        /// Backend being initialized.
        kind: BackendKind,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// Every candidate of the automatic fallback chain failed.
    #[error("no usable backend among {attempted:?}")]
    NoBackend {
        /// Candidates tried, in order.
        attempted: Vec<BackendKind>,
        /// Failure of the last candidate.
        #[source]
        last: Box<Error>,
    },

    /// The descriptor is already registered with this instance.
    #[error("descriptor {0} is already registered")]
    AlreadyRegistered(Descriptor),

    /// The descriptor is not registered with this instance.
    #[error("descriptor {0} is not registered")]
    NotRegistered(Descriptor),

    /// The descriptor does not fit into the fixed-capacity select sets.
    #[error("descriptor {descriptor} exceeds select capacity of {capacity}")]
    CapacityExceeded {
        /// Rejected descriptor.
        descriptor: Descriptor,
        /// Capacity of the descriptor sets.
        capacity: usize,
    },

    /// The backend cannot watch this kind of descriptor, or the operation has
    /// no meaning on it.
    #[error("descriptor {descriptor} is not supported by this backend: {source}")]
    Unsupported {
        /// Rejected descriptor.
        descriptor: Descriptor,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// A wait or registration call failed for a reason other than
    /// interruption.
    #[error("multiplexer facility error: {0}")]
    Facility(#[from] io::Error),

    /// A backend name could not be parsed.
    #[error("unknown backend name: {0:?}")]
    InvalidBackendName(String),
}

impl Error {
    pub(crate) fn resource(kind: BackendKind, source: io::Error) -> Error {
        Error::ResourceExhaustion { kind, source }
    }

    pub(crate) fn unsupported(descriptor: Descriptor, source: io::Error) -> Error {
        Error::Unsupported { descriptor, source }
    }
}
