#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod error;
mod exec;
mod graph;
mod hash;
mod invalidate;
mod rule;
mod scheduler;
mod store;

#[cfg(feature = "logging")]
mod utils;
#[cfg(feature = "watch")]
mod watch;

pub use error::{EngineError, ExecError, GraphError, StoreError, TaskError};
#[cfg(feature = "watch")]
pub use error::WatchError;
pub use exec::{Executor, ProcessRequest, ProcessResult};
pub use hash::Hash32;
pub use rule::{GetDecl, Params, Product, ProductType, Registry, Rule, RuleBuilder};
pub use scheduler::{Engine, EngineConfig, RuleContext};
pub use store::{Digest, Store, TreeEntry, TreeNode};

#[cfg(feature = "logging")]
pub use utils::init_logging;
#[cfg(feature = "watch")]
pub use watch::watch;
