use std::sync::Arc;

use thiserror::Error;

/// A failure produced by a rule body, shared between every caller waiting
/// on the same task.
#[derive(Debug, Error, Clone)]
#[error(transparent)]
pub struct TaskError(#[from] pub(crate) Arc<anyhow::Error>);

impl TaskError {
    pub fn new(err: impl Into<anyhow::Error>) -> Self {
        Self(Arc::new(err.into()))
    }
}

impl From<anyhow::Error> for TaskError {
    fn from(e: anyhow::Error) -> Self {
        TaskError(Arc::new(e))
    }
}

/// Defects in the rule configuration, detected while compiling the rule
/// graph. These are always fatal and never worked around at run time.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("no rule produces `{product}` from the available parameters [{available}]")]
    NoRule { product: String, available: String },

    #[error("multiple rules produce `{product}` from indistinguishable parameters: {rules:?}")]
    Ambiguous { product: String, rules: Vec<String> },

    #[error("the rule graph cycles while resolving `{product}`")]
    Cycle { product: String },

    #[error("rule `{rule}` clashes with `{existing}`: both produce `{product}` from the same parameter signature")]
    DuplicateRule {
        rule: String,
        existing: String,
        product: String,
    },
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("rule `{rule}` transitively requested itself at run time")]
    RuntimeCycle { rule: String },

    #[error("rule `{rule}` issued an undeclared request for `{product}` given `{param}`")]
    UndeclaredGet {
        rule: String,
        product: &'static str,
        param: &'static str,
    },

    #[error("a parameter of type `{0}` is already present")]
    DuplicateParam(&'static str),

    #[error("no parameter of type `{0}` is available")]
    MissingParam(&'static str),

    #[error("requested `{requested}`, but the resolved rule produced `{produced}`")]
    ProductType {
        requested: &'static str,
        produced: &'static str,
    },

    #[error(transparent)]
    Pattern(#[from] glob::PatternError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("rule `{rule}`:\n{source}")]
    Task {
        rule: String,
        #[source]
        source: TaskError,
    },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("content {0} not found in store")]
    NotFound(String),

    #[error("couldn't decode directory node {0}")]
    Decode(String),

    #[error("couldn't encode directory node:\n{0}")]
    Encode(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Process execution failures. A non-zero exit code is *not* one of these;
/// it is an ordinary [`ProcessResult`](crate::ProcessResult) the calling
/// rule interprets.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("couldn't materialize inputs for `{executable}`:\n{source}")]
    Materialize {
        executable: String,
        #[source]
        source: StoreError,
    },

    #[error("couldn't spawn `{executable}`:\n{source}")]
    Spawn {
        executable: String,
        #[source]
        source: std::io::Error,
    },

    #[error("couldn't capture outputs of `{executable}`:\n{source}")]
    Capture {
        executable: String,
        #[source]
        source: StoreError,
    },

    #[error("couldn't fingerprint the invocation of `{executable}`:\n{source}")]
    Fingerprint {
        executable: String,
        #[source]
        source: ciborium::ser::Error<std::io::Error>,
    },
}

#[cfg(feature = "watch")]
#[derive(Debug, Error)]
pub enum WatchError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Notify(#[from] notify::Error),

    #[error(transparent)]
    Recv(#[from] std::sync::mpsc::RecvError),
}
