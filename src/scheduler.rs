//! The execution scheduler.
//!
//! Turns compiled rule graph entries into live, memoized tasks. Each task
//! is one rule invocation with concrete parameter values; its identity is
//! (rule name, parameter fingerprint). The task table enforces
//! at-most-one-concurrent-execution per identity: the first requester
//! claims the slot and runs the body, concurrent requesters wait on a
//! condvar and share the result. A completed task records its sensitivity
//! set and consumed children in the ledger for later invalidation.

use std::any::{TypeId, type_name};
use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::{Arc, Condvar, Mutex};

use camino::{Utf8Path, Utf8PathBuf};
use petgraph::graph::NodeIndex;
use rayon::iter::{IntoParallelIterator, ParallelIterator};

use crate::error::{EngineError, TaskError};
use crate::graph::{ParamSource, RuleGraph};
use crate::hash::Hash32;
use crate::invalidate::{Ledger, WatchSpec};
use crate::rule::{Params, Product, ProductType, Registry, Rule};
use crate::store::{Digest, Store};

/// The identity of one rule invocation with concrete parameter values.
#[derive(Clone, PartialEq, Eq, Hash)]
pub(crate) struct TaskKey {
    rule: Arc<str>,
    params: Hash32,
}

impl TaskKey {
    pub(crate) fn new(rule: Arc<str>, params: Hash32) -> Self {
        Self { rule, params }
    }
}

impl std::fmt::Debug for TaskKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.rule, &self.params.to_hex()[..8])
    }
}

#[derive(Clone)]
enum NodeSlot {
    Running,
    Done(Product),
    Failed(TaskError),
}

/// Behavioral knobs for one engine instance.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineConfig {
    /// When true, a request hitting a cached failure evicts it and re-runs
    /// the rule instead of returning the stored error.
    pub recompute_failures: bool,
}

struct Inner {
    graph: Mutex<RuleGraph>,
    store: Arc<Store>,
    tasks: Mutex<HashMap<TaskKey, NodeSlot>>,
    done: Condvar,
    ledger: Mutex<Ledger>,
    config: EngineConfig,
}

/// The engine: compiled rule graph, task table, invalidation ledger, and
/// the content-addressed store, behind one cloneable handle.
///
/// All state is per-instance rather than ambient, so independent engines
/// can coexist in one process (and in tests).
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    pub fn new(registry: Registry, store: Arc<Store>, config: EngineConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                graph: Mutex::new(RuleGraph::new(Arc::new(registry))),
                store,
                tasks: Mutex::new(HashMap::new()),
                done: Condvar::new(),
                ledger: Mutex::new(Ledger::default()),
                config,
            }),
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.inner.store
    }

    /// Requests a product of type `T` given concrete root parameters.
    /// Synchronous from the caller's point of view; concurrent identical
    /// requests coalesce onto a single execution.
    pub fn request<T>(&self, params: Params) -> Result<Arc<T>, EngineError>
    where
        T: Send + Sync + 'static,
    {
        let product = self.request_product(ProductType::of::<T>(), &params)?;
        let produced = product.product_type().name();
        product.downcast::<T>().ok_or(EngineError::ProductType {
            requested: type_name::<T>(),
            produced,
        })
    }

    /// Type-erased variant of [`request`](Engine::request).
    pub fn request_product(
        &self,
        product: ProductType,
        params: &Params,
    ) -> Result<Product, EngineError> {
        let entry = {
            let mut graph = self.inner.graph.lock().unwrap();
            graph.resolve(product, &params.types())?
        };
        self.run_entry(entry, params, &CallPath::default(), None)
    }

    /// Consumes a batch of the external change signal: evicts every task
    /// sensitive to one of `changed`, transitively. Returns the number of
    /// evicted tasks.
    pub fn invalidate(&self, changed: &[Utf8PathBuf]) -> usize {
        let evicted = self.inner.ledger.lock().unwrap().evict(changed);

        if !evicted.is_empty() {
            let mut tasks = self.inner.tasks.lock().unwrap();
            for key in &evicted {
                tasks.remove(key);
            }
            drop(tasks);
            // Waiters on an evicted in-flight slot re-claim it themselves.
            self.inner.done.notify_all();
        }

        evicted.len()
    }

    /// The compiled rule graph rendered as a mermaid diagram.
    pub fn render_rule_graph(&self) -> String {
        self.inner.graph.lock().unwrap().to_string()
    }

    fn run_entry(
        &self,
        index: NodeIndex,
        ambient: &Params,
        path: &CallPath,
        parent: Option<&RuleContext>,
    ) -> Result<Product, EngineError> {
        let (rule, sources, gets) = {
            let graph = self.inner.graph.lock().unwrap();
            let entry = graph.entry(index);
            (entry.rule.clone(), entry.sources.clone(), entry.gets.clone())
        };

        let mut params = Params::new();
        for source in sources {
            match source {
                ParamSource::Ambient(ty) => {
                    let value = ambient
                        .get_product(ty)
                        .ok_or(EngineError::MissingParam(ty.name()))?;
                    params.insert_product(value.clone())?;
                }
                ParamSource::Nested(nested) => {
                    let value = self.run_entry(nested, ambient, path, parent)?;
                    params.insert_product(value)?;
                }
            }
        }

        self.run_task(rule, gets, params, path, parent)
    }

    fn run_task(
        &self,
        rule: Arc<Rule>,
        gets: HashMap<(TypeId, TypeId), NodeIndex>,
        params: Params,
        path: &CallPath,
        parent: Option<&RuleContext>,
    ) -> Result<Product, EngineError> {
        let key = TaskKey::new(rule.name_arc(), params.fingerprint());

        // A key already on the call path means the rule transitively
        // requested itself through dynamically varying parameters.
        if path.contains(&key) {
            return Err(EngineError::RuntimeCycle {
                rule: rule.name().to_owned(),
            });
        }

        // Claim the slot or wait for whoever holds it.
        let mut tasks = self.inner.tasks.lock().unwrap();
        loop {
            match tasks.get(&key).cloned() {
                Some(NodeSlot::Done(product)) => {
                    if let Some(parent) = parent {
                        parent.record_child(key);
                    }
                    return Ok(product);
                }
                Some(NodeSlot::Failed(err)) => {
                    if self.inner.config.recompute_failures {
                        tasks.remove(&key);
                        continue;
                    }
                    if let Some(parent) = parent {
                        parent.record_child(key.clone());
                    }
                    return Err(EngineError::Task {
                        rule: rule.name().to_owned(),
                        source: err,
                    });
                }
                Some(NodeSlot::Running) => {
                    // Waits only ever target entries reachable from the
                    // waiter's own compiled entry, and compiled entries form
                    // an acyclic graph, so two live tasks cannot end up
                    // waiting on each other.
                    tasks = self.inner.done.wait(tasks).unwrap();
                }
                None => {
                    tasks.insert(key.clone(), NodeSlot::Running);
                    break;
                }
            }
        }
        drop(tasks);

        let ctx = RuleContext {
            engine: self.clone(),
            rule: rule.clone(),
            params: params.clone(),
            gets,
            path: path.push(key.clone()),
            sensitive: Mutex::new(Vec::new()),
            children: Mutex::new(HashSet::new()),
        };

        tracing::debug!(rule = rule.name(), task = ?key, "task started");
        let result = (rule.body())(&ctx, &params);

        let mut tasks = self.inner.tasks.lock().unwrap();
        // Invalidation may have dropped the slot mid-run; in that case the
        // result is handed to this caller but not cached, and a later
        // request recomputes from current content.
        let still_claimed = matches!(tasks.get(&key), Some(NodeSlot::Running));

        let outcome = match result {
            Ok(product) => {
                if still_claimed {
                    tasks.insert(key.clone(), NodeSlot::Done(product.clone()));
                }
                Ok(product)
            }
            Err(err) => {
                tracing::debug!(rule = rule.name(), task = ?key, "task failed: {err:#}");
                let err = TaskError::new(err);
                if still_claimed {
                    tasks.insert(key.clone(), NodeSlot::Failed(err.clone()));
                }
                Err(EngineError::Task {
                    rule: rule.name().to_owned(),
                    source: err,
                })
            }
        };
        drop(tasks);
        self.inner.done.notify_all();

        // Failures sit in the task table like successes, so they must be
        // evictable the same way: the ledger gets the sensitivity set and
        // child edges for both outcomes.
        if still_claimed {
            let sensitive = std::mem::take(&mut *ctx.sensitive.lock().unwrap());
            let children = std::mem::take(&mut *ctx.children.lock().unwrap());
            self.inner.ledger.lock().unwrap().record(&key, sensitive, children);
        }

        if let Some(parent) = parent {
            parent.record_child(key);
        }

        outcome
    }
}

/// The chain of task identities leading to the current execution, used to
/// detect runtime self-cycles.
#[derive(Clone, Default)]
struct CallPath(Vec<TaskKey>);

impl CallPath {
    fn contains(&self, key: &TaskKey) -> bool {
        self.0.contains(key)
    }

    fn push(&self, key: TaskKey) -> Self {
        let mut next = self.0.clone();
        next.push(key);
        CallPath(next)
    }
}

/// Passed to every rule body. Issues Gets, records sensitivity, and gives
/// access to the content-addressed store.
pub struct RuleContext {
    engine: Engine,
    rule: Arc<Rule>,
    params: Params,
    gets: HashMap<(TypeId, TypeId), NodeIndex>,
    path: CallPath,
    sensitive: Mutex<Vec<WatchSpec>>,
    children: Mutex<HashSet<TaskKey>>,
}

impl RuleContext {
    /// Requests the sub-product `P` for `input`. The (P, I) pair must be
    /// declared on the rule; resolution goes through the entry compiled
    /// from the rule's declared parameter types, so it cannot depend on
    /// undeclared runtime state.
    pub fn get<P, I>(&self, input: I) -> Result<Arc<P>, EngineError>
    where
        P: Send + Sync + 'static,
        I: Send + Sync + Hash + 'static,
    {
        let entry = *self
            .gets
            .get(&(TypeId::of::<P>(), TypeId::of::<I>()))
            .ok_or_else(|| EngineError::UndeclaredGet {
                rule: self.rule.name().to_owned(),
                product: type_name::<P>(),
                param: type_name::<I>(),
            })?;

        let mut scope = self.params.clone();
        scope.set_product(Product::new(input));

        let product = self.engine.run_entry(entry, &scope, &self.path, Some(self))?;
        let produced = product.product_type().name();
        product.downcast::<P>().ok_or(EngineError::ProductType {
            requested: type_name::<P>(),
            produced,
        })
    }

    /// Issues one Get per input in parallel on the rayon pool.
    pub fn get_all<P, I>(&self, inputs: Vec<I>) -> Result<Vec<Arc<P>>, EngineError>
    where
        P: Send + Sync + 'static,
        I: Send + Sync + Hash + 'static,
    {
        inputs
            .into_par_iter()
            .map(|input| self.get::<P, I>(input))
            .collect()
    }

    /// A declared parameter value of the running rule.
    pub fn param<T: Send + Sync + 'static>(&self) -> Result<Arc<T>, EngineError> {
        self.params.get::<T>()
    }

    pub fn store(&self) -> &Arc<Store> {
        self.engine.store()
    }

    /// Marks the task's result as sensitive to `path` (a file, or a
    /// directory covering everything inside it).
    pub fn record_sensitive(&self, path: impl Into<Utf8PathBuf>) {
        self.sensitive
            .lock()
            .unwrap()
            .push(WatchSpec::Path(path.into()));
    }

    /// Marks the task's result as sensitive to every path matching the
    /// glob pattern.
    pub fn record_sensitive_glob(&self, pattern: &str) -> Result<(), EngineError> {
        glob::Pattern::new(pattern)?;
        self.sensitive
            .lock()
            .unwrap()
            .push(WatchSpec::Glob(pattern.to_owned()));
        Ok(())
    }

    /// Captures `paths` under `root` into the store and marks the task as
    /// sensitive to each of them.
    pub fn snapshot(&self, root: &Utf8Path, paths: &[Utf8PathBuf]) -> Result<Digest, EngineError> {
        for path in paths {
            self.record_sensitive(root.join(path));
        }
        Ok(self.store().snapshot(root, paths)?)
    }

    fn record_child(&self, key: TaskKey) {
        self.children.lock().unwrap().insert(key);
    }
}
