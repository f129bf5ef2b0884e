//! Error types surfaced by the controller.

use crate::address::Address;

/// Result alias with the crate's [`Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced to callers of the controller.
///
/// Errors from the external collaborators (object store, pubsub, cache,
/// access-controller factory) pass through unchanged as [`Error::Other`].
/// Errors on the inbound pubsub path are logged and swallowed and never
/// appear here.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The given type tag is not in the type registry.
    #[error("Invalid database type '{0}'")]
    InvalidType(String),

    /// A database address was passed where a plain name was required.
    #[error("Given database name is an address. Please give only the name of the database!")]
    NameIsAddress,

    /// `create` found an existing cache entry and `overwrite` was false.
    #[error("Database '{0}' already exists!")]
    AlreadyExists(Address),

    /// The manifest declares a different type than the caller requested.
    #[error("Database '{address}' is type '{actual}' but was opened as '{requested}'")]
    TypeMismatch {
        /// Address of the database.
        address: Address,
        /// Type recorded in the manifest.
        actual: String,
        /// Type the caller asked for.
        requested: String,
    },

    /// `open` was given something that is not an address, without `create`.
    #[error("'create' set to 'false'. If you want to create a database, set 'create' to 'true'.")]
    CreateNotSet,

    /// `open` with `create` but without a type.
    #[error("Database type not provided! Provide a type with 'type' ({0})")]
    TypeMissing(String),

    /// `open` with `local_only` found no local copy of the database.
    #[error("Database '{0}' doesn't exist!")]
    NotFoundLocally(Address),

    /// An internal contract was breached.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// The input does not parse as a database address.
    #[error("Not a valid OrbitDB address: '{0}'")]
    MalformedAddress(String),

    /// Error from an external collaborator, passed through unchanged.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub(crate) fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }
}
