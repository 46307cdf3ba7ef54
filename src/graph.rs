//! The rule graph compiler.
//!
//! Transforms "what rules exist" into "what plan satisfies query Q": a
//! memoized depth-first search over (product type, available parameter
//! types) queries, producing one immutable [`Entry`] per distinct query
//! shape. Entries live in a petgraph arena and reference each other by
//! `NodeIndex`, with a visited set rejecting cyclic resolutions up front.

use std::any::TypeId;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use petgraph::graph::{DiGraph, NodeIndex};

use crate::error::GraphError;
use crate::rule::{ProductType, Registry, Rule};

/// Where one declared parameter of a selected rule comes from.
#[derive(Debug, Clone, Copy)]
pub(crate) enum ParamSource {
    /// Taken directly from the caller's parameter set.
    Ambient(ProductType),
    /// Produced by another compiled entry first.
    Nested(NodeIndex),
}

/// The compiled plan for one (product, parameter types) query: the selected
/// rule, a source per declared parameter, and the pre-resolved target for
/// every Get the rule may issue.
#[derive(Clone)]
pub(crate) struct Entry {
    pub rule: Arc<Rule>,
    pub sources: Vec<ParamSource>,
    pub gets: HashMap<(TypeId, TypeId), NodeIndex>,
}

type Query = (ProductType, BTreeSet<ProductType>);

pub(crate) struct RuleGraph {
    registry: Arc<Registry>,
    graph: DiGraph<Entry, ()>,
    memo: HashMap<Query, NodeIndex>,
}

impl RuleGraph {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            graph: DiGraph::new(),
            memo: HashMap::new(),
        }
    }

    pub fn entry(&self, index: NodeIndex) -> &Entry {
        &self.graph[index]
    }

    /// Resolves the entry satisfying `product` given the `ambient`
    /// parameter types, compiling it (and anything it needs) on first use.
    pub fn resolve(
        &mut self,
        product: ProductType,
        ambient: &BTreeSet<ProductType>,
    ) -> Result<NodeIndex, GraphError> {
        let mut visiting = HashSet::new();
        self.resolve_inner(product, ambient, &mut visiting)
    }

    fn resolve_inner(
        &mut self,
        product: ProductType,
        ambient: &BTreeSet<ProductType>,
        visiting: &mut HashSet<Query>,
    ) -> Result<NodeIndex, GraphError> {
        let query = (product, ambient.clone());

        if let Some(&index) = self.memo.get(&query) {
            return Ok(index);
        }

        // Re-entering a query already on the DFS stack means the rule set
        // requires the product to build itself, with no narrowing.
        if !visiting.insert(query.clone()) {
            return Err(GraphError::Cycle {
                product: product.name().to_owned(),
            });
        }

        let compiled = self.compile(product, ambient, visiting);
        visiting.remove(&query);

        let index = compiled?;
        self.memo.insert(query, index);
        Ok(index)
    }

    fn compile(
        &mut self,
        product: ProductType,
        ambient: &BTreeSet<ProductType>,
        visiting: &mut HashSet<Query>,
    ) -> Result<NodeIndex, GraphError> {
        let mut candidates = self.registry.candidates(product);

        if candidates.is_empty() {
            return Err(GraphError::NoRule {
                product: product.name().to_owned(),
                available: render_types(ambient),
            });
        }

        // Parameter-subset filtering: with several candidates, prefer the
        // one fully satisfiable from the ambient set. Anything short of a
        // single winner is a configuration defect, never a priority pick.
        if candidates.len() > 1 {
            let narrowed: Vec<Arc<Rule>> = candidates
                .iter()
                .filter(|rule| rule.params().iter().all(|p| ambient.contains(p)))
                .cloned()
                .collect();

            if narrowed.len() == 1 {
                candidates = narrowed;
            } else {
                // Several survivors: name only the rules still competing.
                // No survivor at all: nothing was filtered, name them all.
                let competing = if narrowed.is_empty() {
                    &candidates
                } else {
                    &narrowed
                };
                return Err(GraphError::Ambiguous {
                    product: product.name().to_owned(),
                    rules: competing
                        .iter()
                        .map(|rule| rule.name().to_owned())
                        .collect(),
                });
            }
        }

        let rule = candidates.pop().unwrap();
        let mut edges = Vec::new();

        let mut sources = Vec::with_capacity(rule.params().len());
        for &param in rule.params() {
            if ambient.contains(&param) {
                sources.push(ParamSource::Ambient(param));
            } else {
                let index = self.resolve_inner(param, ambient, visiting)?;
                sources.push(ParamSource::Nested(index));
                edges.push(index);
            }
        }

        // Gets resolve against the rule's *declared* parameter types plus
        // the Get input, never against ad hoc runtime types.
        let declared: BTreeSet<ProductType> = rule.params().iter().copied().collect();
        let mut gets = HashMap::new();
        for get in rule.gets() {
            let mut scope = declared.clone();
            scope.insert(get.param);

            let index = self.resolve_inner(get.product, &scope, visiting)?;
            gets.insert((get.product.id(), get.param.id()), index);
            edges.push(index);
        }

        tracing::debug!(rule = rule.name(), product = ?product, "compiled entry");

        let node = self.graph.add_node(Entry { rule, sources, gets });
        for target in edges {
            self.graph.add_edge(node, target, ());
        }

        Ok(node)
    }
}

impl std::fmt::Display for RuleGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "graph LR")?;

        for index in self.graph.node_indices() {
            let entry = &self.graph[index];
            let name = entry.rule.name().replace('"', "\\\"");
            writeln!(f, "    {:?}[\"{}\"]", index.index(), name)?;
        }

        for edge in self.graph.edge_indices() {
            let (source, target) = self.graph.edge_endpoints(edge).unwrap();
            let product = self.graph[target]
                .rule
                .product()
                .name()
                .replace('<', "&lt;")
                .replace('>', "&gt;");
            writeln!(
                f,
                "    {:?} -- \"{}\" --> {:?}",
                source.index(),
                product,
                target.index()
            )?;
        }

        Ok(())
    }
}

fn render_types(types: &BTreeSet<ProductType>) -> String {
    types
        .iter()
        .map(|ty| ty.name())
        .collect::<Vec<_>>()
        .join(", ")
}
