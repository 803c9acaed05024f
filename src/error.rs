//! Error types for the mesh operator

use std::fmt;

use thiserror::Error;

use crate::component::ComponentName;

/// Main error type for meshop operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// The values tree could not be translated
    #[error("translation error at '{path}': {message}")]
    Translation {
        /// Dotted source path that failed
        path: String,
        /// What was wrong with it
        message: String,
    },

    /// The chart renderer failed for a component
    #[error("render error for {component}: {message}")]
    Render {
        /// Component being rendered
        component: String,
        /// Renderer output or failure reason
        message: String,
    },

    /// A single rendered object could not be applied or removed
    #[error("failed to {action} {kind}/{name}: {message}")]
    Apply {
        /// apply, prune or delete
        action: &'static str,
        /// Object kind
        kind: String,
        /// Object name
        name: String,
        /// Underlying failure
        message: String,
    },

    /// Optimistic concurrency conflict on write
    #[error("conflict writing {kind}/{name}")]
    Conflict {
        /// Object kind
        kind: String,
        /// Object name
        name: String,
    },

    /// Create raced with another writer
    #[error("{kind}/{name} already exists")]
    AlreadyExists {
        /// Object kind
        kind: String,
        /// Object name
        name: String,
    },

    /// A lifecycle listener hook failed
    #[error("listener {hook} failed: {message}")]
    Listener {
        /// Hook name
        hook: &'static str,
        /// Failure reason
        message: String,
    },

    /// Several independent failures from one reconcile pass
    #[error("{0}")]
    Aggregate(AggregateError),

    /// A profile could not be loaded
    #[error("profile '{profile}': {message}")]
    Profile {
        /// Profile name or path
        profile: String,
        /// Why it could not be used
        message: String,
    },

    /// Validation error for control-plane specs
    #[error("validation error: {0}")]
    Validation(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Internal error with context
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Where it happened
        context: &'static str,
        /// What happened
        message: String,
    },
}

impl Error {
    /// Create a translation error for a source path
    pub fn translation(path: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Translation {
            path: path.into(),
            message: msg.into(),
        }
    }

    /// Create a render error for a component
    pub fn render(component: impl fmt::Display, msg: impl Into<String>) -> Self {
        Self::Render {
            component: component.to_string(),
            message: msg.into(),
        }
    }

    /// Create a per-object apply/prune/delete error
    pub fn apply(
        action: &'static str,
        kind: impl Into<String>,
        name: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Apply {
            action,
            kind: kind.into(),
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Create a listener hook error
    pub fn listener(hook: &'static str, msg: impl Into<String>) -> Self {
        Self::Listener {
            hook,
            message: msg.into(),
        }
    }

    /// Create a profile loading error
    pub fn profile(profile: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Profile {
            profile: profile.into(),
            message: msg.into(),
        }
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create an internal error with context
    pub fn internal(context: &'static str, msg: impl Into<String>) -> Self {
        Self::Internal {
            context,
            message: msg.into(),
        }
    }

    /// True for optimistic concurrency conflicts (HTTP 409 Conflict)
    pub fn is_conflict(&self) -> bool {
        match self {
            Self::Conflict { .. } => true,
            Self::Kube(kube::Error::Api(ae)) => ae.code == 409 && ae.reason != "AlreadyExists",
            _ => false,
        }
    }

    /// True when a create found the object already present
    pub fn is_already_exists(&self) -> bool {
        match self {
            Self::AlreadyExists { .. } => true,
            Self::Kube(kube::Error::Api(ae)) => ae.code == 409 && ae.reason == "AlreadyExists",
            _ => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<crate::yaml::YamlError> for Error {
    fn from(e: crate::yaml::YamlError) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<crate::tree::TreeError> for Error {
    fn from(e: crate::tree::TreeError) -> Self {
        Self::Translation {
            path: e.path,
            message: e.message,
        }
    }
}

/// One failure from a reconcile pass, attributed to a component when known
#[derive(Debug)]
pub struct Failure {
    /// Component whose resources failed, if attributable
    pub component: Option<ComponentName>,
    /// The failure itself
    pub error: Error,
}

/// Failures collected across a reconcile pass instead of aborting on the first.
#[derive(Debug, Default)]
pub struct AggregateError {
    failures: Vec<Failure>,
}

impl AggregateError {
    /// Empty collection
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure attributed to `component`
    pub fn push(&mut self, component: Option<ComponentName>, error: Error) {
        self.failures.push(Failure { component, error });
    }

    /// Move every failure from `other` into this collection
    pub fn extend(&mut self, other: AggregateError) {
        self.failures.extend(other.failures);
    }

    /// True when nothing failed
    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    /// Number of failures
    pub fn len(&self) -> usize {
        self.failures.len()
    }

    /// Recorded failures in the order they happened
    pub fn failures(&self) -> &[Failure] {
        &self.failures
    }

    /// Take the recorded failures
    pub fn into_failures(self) -> Vec<Failure> {
        self.failures
    }

    /// `Ok(())` when empty, otherwise an [`Error::Aggregate`]
    pub fn into_result(self) -> Result<(), Error> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(Error::Aggregate(self))
        }
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error(s) occurred:", self.failures.len())?;
        for failure in &self.failures {
            match failure.component {
                Some(component) => write!(f, "\n\t* [{}] {}", component, failure.error)?,
                None => write!(f, "\n\t* {}", failure.error)?,
            }
        }
        Ok(())
    }
}

impl std::error::Error for AggregateError {}
