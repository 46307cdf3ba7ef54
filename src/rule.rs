//! Rule declarations: typed products, parameter sets, and the registry the
//! graph compiler resolves against.

use std::any::{Any, TypeId, type_name};
use std::collections::{BTreeMap, BTreeSet};
use std::hash::Hash;
use std::sync::Arc;

use crate::error::{EngineError, GraphError};
use crate::hash::{Blake3Hasher, Hash32};
use crate::scheduler::RuleContext;

/// A type-erased, thread-safe container for product values.
pub(crate) type Dynamic = Arc<dyn Any + Send + Sync>;

/// A token naming a product (or parameter) type.
///
/// Ordered by type name rather than `TypeId`, so every derived ordering and
/// fingerprint is deterministic across runs of the same binary.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProductType {
    id: TypeId,
    name: &'static str,
}

impl ProductType {
    pub fn of<T: 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: type_name::<T>(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn id(&self) -> TypeId {
        self.id
    }
}

impl PartialOrd for ProductType {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ProductType {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.name, self.id).cmp(&(other.name, other.id))
    }
}

impl std::fmt::Debug for ProductType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// A type-erased product value paired with its content fingerprint.
///
/// The fingerprint is computed once at construction by feeding the value's
/// `Hash` impl through BLAKE3, and is what task identity and memoization
/// key on.
#[derive(Clone)]
pub struct Product {
    ty: ProductType,
    fingerprint: Hash32,
    value: Dynamic,
}

impl Product {
    pub fn new<T>(value: T) -> Self
    where
        T: Send + Sync + Hash + 'static,
    {
        let mut hasher = Blake3Hasher::default();
        std::hash::Hasher::write(&mut hasher, type_name::<T>().as_bytes());
        value.hash(&mut hasher);

        Self {
            ty: ProductType::of::<T>(),
            fingerprint: hasher.into(),
            value: Arc::new(value),
        }
    }

    pub fn product_type(&self) -> ProductType {
        self.ty
    }

    pub fn fingerprint(&self) -> Hash32 {
        self.fingerprint
    }

    pub fn downcast<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.value.clone().downcast::<T>().ok()
    }
}

impl std::fmt::Debug for Product {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Product({:?}, {})", self.ty, &self.fingerprint.to_hex()[..12])
    }
}

/// An unordered collection of typed values, at most one per type.
#[derive(Clone, Default)]
pub struct Params {
    entries: BTreeMap<ProductType, Product>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// A parameter set holding a single value.
    pub fn of<T>(value: T) -> Self
    where
        T: Send + Sync + Hash + 'static,
    {
        let mut params = Self::new();
        params.entries.insert(ProductType::of::<T>(), Product::new(value));
        params
    }

    /// Adds a value; a second value of the same type is an error, since it
    /// would make rule selection ambiguous.
    pub fn insert<T>(&mut self, value: T) -> Result<(), EngineError>
    where
        T: Send + Sync + Hash + 'static,
    {
        self.insert_product(Product::new(value))
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> Result<Arc<T>, EngineError> {
        self.entries
            .get(&ProductType::of::<T>())
            .and_then(Product::downcast::<T>)
            .ok_or(EngineError::MissingParam(type_name::<T>()))
    }

    pub fn types(&self) -> BTreeSet<ProductType> {
        self.entries.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn insert_product(&mut self, product: Product) -> Result<(), EngineError> {
        let ty = product.product_type();
        if self.entries.contains_key(&ty) {
            return Err(EngineError::DuplicateParam(ty.name()));
        }
        self.entries.insert(ty, product);
        Ok(())
    }

    /// Inserts or replaces; used when a Get narrows an already-present
    /// parameter type with a new value.
    pub(crate) fn set_product(&mut self, product: Product) {
        self.entries.insert(product.product_type(), product);
    }

    pub(crate) fn get_product(&self, ty: ProductType) -> Option<&Product> {
        self.entries.get(&ty)
    }

    /// Deterministic fingerprint over every (type name, value fingerprint)
    /// pair, in type-name order.
    pub(crate) fn fingerprint(&self) -> Hash32 {
        let mut hasher = blake3::Hasher::new();
        for (ty, product) in &self.entries {
            hasher.update(ty.name().as_bytes());
            hasher.update(&[0x1F]);
            hasher.update(product.fingerprint().to_hex().as_bytes());
        }
        hasher.finalize().into()
    }
}

impl std::fmt::Debug for Params {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.entries.keys()).finish()
    }
}

/// A sub-product request a rule may issue at run time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetDecl {
    pub product: ProductType,
    pub param: ProductType,
}

pub(crate) type RuleFn =
    Arc<dyn Fn(&RuleContext, &Params) -> anyhow::Result<Product> + Send + Sync>;

/// A typed computation unit: declared parameter types in, one product type
/// out, plus the set of Gets its body may issue. Immutable once registered.
#[derive(Clone)]
pub struct Rule {
    name: Arc<str>,
    params: Vec<ProductType>,
    product: ProductType,
    gets: Vec<GetDecl>,
    body: RuleFn,
}

impl Rule {
    pub fn new(name: impl Into<Arc<str>>) -> RuleBuilder {
        RuleBuilder {
            name: name.into(),
            params: Vec::new(),
            gets: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn name_arc(&self) -> Arc<str> {
        self.name.clone()
    }

    pub fn product(&self) -> ProductType {
        self.product
    }

    pub fn params(&self) -> &[ProductType] {
        &self.params
    }

    pub fn gets(&self) -> &[GetDecl] {
        &self.gets
    }

    pub(crate) fn body(&self) -> &RuleFn {
        &self.body
    }
}

impl std::fmt::Debug for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rule")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("product", &self.product)
            .field("gets", &self.gets)
            .finish_non_exhaustive()
    }
}

pub struct RuleBuilder {
    name: Arc<str>,
    params: Vec<ProductType>,
    gets: Vec<GetDecl>,
}

impl RuleBuilder {
    /// Declares a parameter type the rule consumes.
    pub fn param<T: 'static>(mut self) -> Self {
        self.params.push(ProductType::of::<T>());
        self
    }

    /// Declares that the body may issue `ctx.get::<P, I>(..)`.
    pub fn get<P: 'static, I: 'static>(mut self) -> Self {
        self.gets.push(GetDecl {
            product: ProductType::of::<P>(),
            param: ProductType::of::<I>(),
        });
        self
    }

    /// Finishes the rule with its body. The output type of the closure is
    /// the rule's declared product type.
    pub fn build<O, F>(self, body: F) -> Rule
    where
        O: Send + Sync + Hash + 'static,
        F: Fn(&RuleContext, &Params) -> anyhow::Result<O> + Send + Sync + 'static,
    {
        Rule {
            name: self.name,
            params: self.params,
            product: ProductType::of::<O>(),
            gets: self.gets,
            body: Arc::new(move |ctx, params| Ok(Product::new(body(ctx, params)?))),
        }
    }
}

/// The catalog of declared rules for one engine instance.
#[derive(Default, Clone)]
pub struct Registry {
    rules: Vec<Arc<Rule>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a rule. Two rules producing the same product type from an
    /// identical parameter-type signature would make graph compilation
    /// ambiguous, so the second registration is rejected.
    pub fn register(&mut self, rule: Rule) -> Result<(), GraphError> {
        let signature: BTreeSet<ProductType> = rule.params().iter().copied().collect();

        for existing in &self.rules {
            let existing_signature: BTreeSet<ProductType> =
                existing.params().iter().copied().collect();

            if existing.product() == rule.product() && existing_signature == signature {
                return Err(GraphError::DuplicateRule {
                    rule: rule.name().to_owned(),
                    existing: existing.name().to_owned(),
                    product: rule.product().name().to_owned(),
                });
            }
        }

        tracing::debug!(rule = rule.name(), product = ?rule.product(), "registered");
        self.rules.push(Arc::new(rule));
        Ok(())
    }

    /// All rules whose declared product matches. An empty result is a
    /// normal "not found", consumed by the graph compiler.
    pub(crate) fn candidates(&self, product: ProductType) -> Vec<Arc<Rule>> {
        self.rules
            .iter()
            .filter(|rule| rule.product() == product)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
