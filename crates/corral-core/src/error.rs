//! Core error types for corral.

/// Core error type for all component and task operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid name: {name:?}")]
    InvalidName { name: String },

    #[error("constructing {type_:?} controller: {message}")]
    ControllerConstruction { type_: String, message: String },

    #[error("unmarshalling {what}: {message}")]
    Unmarshal { what: String, message: String },

    #[error("{type_:?} controller does not implement {capability}")]
    CapabilityMismatch {
        capability: &'static str,
        type_: String,
    },

    #[error("path {path:?} escapes workspace root")]
    PathEscape { path: String },

    #[error("no such parent task: {id}")]
    NoSuchParent { id: String },

    #[error("task {id} is unavailable")]
    TaskUnavailable { id: String },

    #[error("child name conflict: {name:?}")]
    DuplicateChildName { name: String },

    #[error("unresolvable ref: {reference:?}")]
    UnresolvableRef { reference: String },

    #[error("no such component: {id}")]
    NoSuchComponent { id: String },

    #[error("no such workspace: {reference}")]
    NoSuchWorkspace { reference: String },

    #[error("no such task: {id}")]
    NoSuchTask { id: String },

    #[error("manifest error: {message}")]
    Manifest { message: String },

    #[error("provider error: {message}")]
    Provider { message: String },

    #[error("task {id} was canceled")]
    Canceled { id: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] corral_local_db::Error),
}

impl Error {
    pub fn invalid_name<S: Into<String>>(name: S) -> Self {
        Self::InvalidName { name: name.into() }
    }

    pub fn unmarshal<W: Into<String>, M: ToString>(what: W, message: M) -> Self {
        Self::Unmarshal {
            what: what.into(),
            message: message.to_string(),
        }
    }

    pub fn capability_mismatch<S: Into<String>>(capability: &'static str, type_: S) -> Self {
        Self::CapabilityMismatch {
            capability,
            type_: type_.into(),
        }
    }

    pub fn unresolvable<S: Into<String>>(reference: S) -> Self {
        Self::UnresolvableRef {
            reference: reference.into(),
        }
    }

    /// Create a new manifest loading error.
    pub fn manifest<S: Into<String>>(message: S) -> Self {
        Self::Manifest {
            message: message.into(),
        }
    }

    /// Create a new resource provider error.
    pub fn provider<S: Into<String>>(message: S) -> Self {
        Self::Provider {
            message: message.into(),
        }
    }
}
