//! Hierarchical policy resolution for the Palisade data-access governance
//! platform.
//!
//! Palisade organises resources as a tree of *System* → *Directory* → *File*
//! nodes. Access and redaction policies may be registered against any node of
//! that tree, and additionally against a resource *type* that cuts across the
//! hierarchy. The [`HierarchicalPolicyService`] resolves the rules applicable
//! to a resource by walking its ancestry and merging every registered
//! [`Policy`]'s rule set in a fixed, deterministic order: the root system
//! first, then each intermediate directory root-to-leaf, then the resource's
//! own policy, and finally (for resource-level resolution) the type-keyed
//! policy.
//!
//! Two kinds of rules exist:
//! - *resource-level* rules decide whether a file may be returned to a caller
//!   at all ([`HierarchicalPolicyService::can_access`]);
//! - *record-level* rules are resolved here but executed elsewhere, by the
//!   downstream enforcement point that streams the file's contents
//!   ([`HierarchicalPolicyService::record_rules_for`]).
//!
//! "No policy found" and "policy found but empty" are distinct outcomes. A
//! resource with no policy anywhere on its chain is denied outright, while a
//! policy whose rule set is empty contributes nothing and leaves the resource
//! accessible unchanged.
//!
//! Policies live in a [`PolicyStore`], an asynchronous key→[`Policy`] cache.
//! The engine itself is stateless: every call resolves independently against
//! the shared store, and the service may be cloned freely across tasks.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use palisade_policy::*;
//!
//! # tokio_test::block_on(async {
//! // Build a small resource tree. Ancestors are shared via `Arc`; children
//! // hold weak, navigation-only handles to their parents.
//! let system = SystemResource::new("/data");
//! let reports = DirectoryResource::new("/data/reports", &system);
//! let file = FileResource::new("/data/reports/q3.txt", &reports)
//!     .with_type("report")
//!     .with_serialised_format("txt")
//!     .with_connection_detail("hdfs://data/reports/q3.txt")
//!     .shared();
//!
//! let officer = User::new("alice").with_auths(["Sensitive"]);
//!
//! let store = Arc::new(InMemoryPolicyStore::new());
//! let service = HierarchicalPolicyService::new(store);
//!
//! // Registered at the system root, so it applies to every file underneath:
//! // any text file may be listed, but account numbers are stripped from its
//! // records when the contents are later streamed.
//! let policy = Policy::new(officer.clone())
//!     .with_resource_rule(
//!         "Serialised format is txt",
//!         PredicateRule::new(|file: &LeafResource, _: &User, _: &Context| {
//!             file.serialised_format() == "txt"
//!         }),
//!     )
//!     .with_record_rule(
//!         "Redact account numbers",
//!         FnRule::new(|record: Record, _: &User, _: &Context| {
//!             Some(record.without_field("account_number"))
//!         }),
//!     );
//! service.set_resource_policy(&Resource::from(&system), policy).await?;
//!
//! let context = Context::new("quarterly-audit");
//! let accessible = service
//!     .can_access(&[Arc::clone(&file)], &officer, &context)
//!     .await?;
//! assert_eq!(accessible, vec![Arc::clone(&file)]);
//!
//! // The record rules are handed back for the enforcement point to execute.
//! let record_rules = service
//!     .record_rules_for(&[file], &officer, &context)
//!     .await?;
//! assert_eq!(record_rules.len(), 1);
//! # Ok::<(), PolicyError>(())
//! # }).unwrap();
//! ```
//!
//! ## Hierarchy semantics
//!
//! Rule sets merge by list concatenation, never by keyed union, so evaluation
//! order and the derived human-readable [`Rules::message`] are reproducible:
//! a policy at the system root always contributes its rules before a policy
//! on a directory below it, and the type-keyed policy always contributes
//! last. Lookups for the levels of a chain are dispatched concurrently but
//! folded in that fixed order regardless of completion order.

#![allow(clippy::type_complexity)]
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, Weak};

use async_trait::async_trait;
use futures::future;
use thiserror::Error;

const NO_RULES_SET_MESSAGE: &str = "no rules set";
const RULE_MESSAGE_SEPARATOR: &str = ", ";

/// Reserved key prefix under which type-keyed policies are stored.
///
/// Resource ids are path-like (`/data/reports/q3.txt`), so a prefixed type
/// name can never collide with a resource id key.
const TYPE_POLICY_KEY_PREFIX: &str = "palisade.type.";

/// Derives the store key for a type-keyed policy.
pub fn type_policy_key(type_name: &str) -> String {
    format!("{TYPE_POLICY_KEY_PREFIX}{type_name}")
}

/// The end user on whose behalf a resource is requested.
///
/// Carries the authorisations and roles that bespoke rules test against.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct User {
    user_id: String,
    auths: HashSet<String>,
    roles: HashSet<String>,
}

impl User {
    /// Creates a user with no authorisations or roles.
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            auths: HashSet::new(),
            roles: HashSet::new(),
        }
    }

    /// Grants the user the given authorisations.
    pub fn with_auths<I, S>(mut self, auths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.auths.extend(auths.into_iter().map(Into::into));
        self
    }

    /// Grants the user the given roles.
    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles.extend(roles.into_iter().map(Into::into));
        self
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn auths(&self) -> &HashSet<String> {
        &self.auths
    }

    pub fn roles(&self) -> &HashSet<String> {
        &self.roles
    }

    /// Whether the user holds the named authorisation.
    pub fn has_auth(&self, auth: &str) -> bool {
        self.auths.contains(auth)
    }

    /// Whether the user holds the named role.
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }
}

/// The declared purpose of a request, plus free-form key/value entries that
/// bespoke rules may consult.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Context {
    purpose: String,
    contents: HashMap<String, String>,
}

impl Context {
    pub fn new(purpose: impl Into<String>) -> Self {
        Self {
            purpose: purpose.into(),
            contents: HashMap::new(),
        }
    }

    /// Attaches an extra key/value entry to the context.
    pub fn with_content(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.contents.insert(key.into(), value.into());
        self
    }

    pub fn purpose(&self) -> &str {
        &self.purpose
    }

    /// Looks up an extra context entry by key.
    pub fn content(&self, key: &str) -> Option<&str> {
        self.contents.get(key).map(String::as_str)
    }
}

/// An individual row within a file's streamed contents.
///
/// The engine never reads records itself; it only resolves the
/// [`Rules<Record>`](Rules) that the downstream enforcement point executes
/// against each record as the file is streamed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record {
    fields: HashMap<String, String>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a field, returning the updated record.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Removes a field, returning the updated record. Redaction rules use
    /// this to strip sensitive columns.
    pub fn without_field(mut self, key: &str) -> Self {
        self.fields.remove(key);
        self
    }

    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    pub fn fields(&self) -> &HashMap<String, String> {
        &self.fields
    }
}

/// The root of a resource tree.
#[derive(Debug)]
pub struct SystemResource {
    id: String,
}

impl SystemResource {
    pub fn new(id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self { id: id.into() })
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

/// An intermediate node of a resource tree.
#[derive(Debug)]
pub struct DirectoryResource {
    id: String,
    parent: ParentRef,
}

impl DirectoryResource {
    pub fn new(id: impl Into<String>, parent: impl Into<ParentRef>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            parent: parent.into(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn parent(&self) -> &ParentRef {
        &self.parent
    }
}

/// A leaf of the resource tree: the unit actually returned to clients.
///
/// Carries the access-relevant metadata bespoke rules test against. Equality
/// and hashing are by id, so leaves can key result maps even though their
/// parent handles cannot be compared.
#[derive(Debug)]
pub struct FileResource {
    id: String,
    resource_type: String,
    serialised_format: String,
    connection_detail: String,
    parent: ParentRef,
}

impl FileResource {
    pub fn new(id: impl Into<String>, parent: impl Into<ParentRef>) -> Self {
        Self {
            id: id.into(),
            resource_type: String::new(),
            serialised_format: String::new(),
            connection_detail: String::new(),
            parent: parent.into(),
        }
    }

    /// Sets the type classifying the file's schema/domain.
    pub fn with_type(mut self, resource_type: impl Into<String>) -> Self {
        self.resource_type = resource_type.into();
        self
    }

    /// Sets the serialised format of the file's contents.
    pub fn with_serialised_format(mut self, serialised_format: impl Into<String>) -> Self {
        self.serialised_format = serialised_format.into();
        self
    }

    /// Sets the detail needed to connect to the file's contents.
    pub fn with_connection_detail(mut self, connection_detail: impl Into<String>) -> Self {
        self.connection_detail = connection_detail.into();
        self
    }

    /// Finishes construction, yielding the shared leaf handle.
    pub fn shared(self) -> LeafResource {
        Arc::new(self)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    pub fn serialised_format(&self) -> &str {
        &self.serialised_format
    }

    pub fn connection_detail(&self) -> &str {
        &self.connection_detail
    }

    pub fn parent(&self) -> &ParentRef {
        &self.parent
    }
}

impl PartialEq for FileResource {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for FileResource {}

impl std::hash::Hash for FileResource {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Shared handle to a [`FileResource`].
pub type LeafResource = Arc<FileResource>;

/// A non-owning, navigation-only handle to a node's parent.
///
/// Ancestors are shared across many children, so children hold only weak
/// handles; whoever builds the tree keeps the owning `Arc`s alive. A handle
/// that no longer upgrades surfaces as [`PolicyError::BrokenHierarchy`]
/// during resolution.
#[derive(Debug, Clone)]
pub enum ParentRef {
    System(Weak<SystemResource>),
    Directory(Weak<DirectoryResource>),
}

impl ParentRef {
    fn upgrade(&self) -> Option<Resource> {
        match self {
            ParentRef::System(weak) => weak.upgrade().map(Resource::System),
            ParentRef::Directory(weak) => weak.upgrade().map(Resource::Directory),
        }
    }
}

impl From<&Arc<SystemResource>> for ParentRef {
    fn from(system: &Arc<SystemResource>) -> Self {
        ParentRef::System(Arc::downgrade(system))
    }
}

impl From<&Arc<DirectoryResource>> for ParentRef {
    fn from(directory: &Arc<DirectoryResource>) -> Self {
        ParentRef::Directory(Arc::downgrade(directory))
    }
}

/// A uniform handle to any tier of the resource tree.
#[derive(Debug, Clone)]
pub enum Resource {
    System(Arc<SystemResource>),
    Directory(Arc<DirectoryResource>),
    File(LeafResource),
}

impl Resource {
    pub fn id(&self) -> &str {
        match self {
            Resource::System(system) => system.id(),
            Resource::Directory(directory) => directory.id(),
            Resource::File(file) => file.id(),
        }
    }

    /// The parent handle, or `None` at the root.
    pub fn parent(&self) -> Option<&ParentRef> {
        match self {
            Resource::System(_) => None,
            Resource::Directory(directory) => Some(directory.parent()),
            Resource::File(file) => Some(file.parent()),
        }
    }
}

impl From<&Arc<SystemResource>> for Resource {
    fn from(system: &Arc<SystemResource>) -> Self {
        Resource::System(Arc::clone(system))
    }
}

impl From<&Arc<DirectoryResource>> for Resource {
    fn from(directory: &Arc<DirectoryResource>) -> Self {
        Resource::Directory(Arc::clone(directory))
    }
}

impl From<&LeafResource> for Resource {
    fn from(file: &LeafResource) -> Self {
        Resource::File(Arc::clone(file))
    }
}

/// The ancestor chain from the tree root down to `resource` inclusive.
fn ancestor_chain(resource: &Resource) -> Result<Vec<Resource>, PolicyError> {
    let mut chain = vec![resource.clone()];
    let mut current = resource.clone();
    loop {
        let next = match current.parent() {
            None => break,
            Some(parent) => parent.upgrade().ok_or_else(|| PolicyError::BrokenHierarchy {
                id: current.id().to_string(),
            })?,
        };
        chain.push(next.clone());
        current = next;
    }
    chain.reverse();
    Ok(chain)
}

/// A single named decision unit: given a target, the requesting user and the
/// request context, either passes the (possibly transformed) target through
/// or returns `None` to deny/redact it.
pub trait Rule<T>: Send + Sync {
    fn apply(&self, target: T, user: &User, context: &Context) -> Option<T>;
}

/// Adapts any `Fn(T, &User, &Context) -> Option<T>` closure into a [`Rule`].
pub struct FnRule<F>(F);

impl<F> FnRule<F> {
    pub fn new(apply: F) -> Self {
        Self(apply)
    }
}

impl<T, F> Rule<T> for FnRule<F>
where
    F: Fn(T, &User, &Context) -> Option<T> + Send + Sync,
{
    fn apply(&self, target: T, user: &User, context: &Context) -> Option<T> {
        (self.0)(target, user, context)
    }
}

/// A [`Rule`] specialised to a boolean test: `true` passes the target through
/// unchanged, `false` denies it.
pub struct PredicateRule<F>(F);

impl<F> PredicateRule<F> {
    pub fn new(test: F) -> Self {
        Self(test)
    }
}

impl<T, F> Rule<T> for PredicateRule<F>
where
    F: Fn(&T, &User, &Context) -> bool + Send + Sync,
{
    fn apply(&self, target: T, user: &User, context: &Context) -> Option<T> {
        if (self.0)(&target, user, context) {
            Some(target)
        } else {
            None
        }
    }
}

/// An ordered collection of labelled rules.
///
/// Entries preserve insertion order and labels need not be unique. Merging
/// concatenates entry lists, never unions by label, so both evaluation order
/// and the derived [`message`](Rules::message) are reproducible.
pub struct Rules<T> {
    entries: Vec<(String, Arc<dyn Rule<T>>)>,
}

impl<T> Rules<T> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Appends a labelled rule, builder-style.
    pub fn add_rule(mut self, label: impl Into<String>, rule: impl Rule<T> + 'static) -> Self {
        self.entries.push((label.into(), Arc::new(rule)));
        self
    }

    /// Appends a labelled [`PredicateRule`], builder-style.
    pub fn add_predicate<F>(self, label: impl Into<String>, test: F) -> Self
    where
        F: Fn(&T, &User, &Context) -> bool + Send + Sync + 'static,
    {
        self.add_rule(label, PredicateRule::new(test))
    }

    /// A new collection holding this collection's entries followed by
    /// `other`'s.
    pub fn merge(&self, other: &Rules<T>) -> Rules<T> {
        let mut entries = self.entries.clone();
        entries.extend(other.entries.iter().cloned());
        Rules { entries }
    }

    /// The labels joined with `", "`, or `"no rules set"` when empty.
    pub fn message(&self) -> String {
        if self.entries.is_empty() {
            NO_RULES_SET_MESSAGE.to_string()
        } else {
            self.entries
                .iter()
                .map(|(label, _)| label.as_str())
                .collect::<Vec<_>>()
                .join(RULE_MESSAGE_SEPARATOR)
        }
    }

    pub fn entries(&self) -> &[(String, Arc<dyn Rule<T>>)] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Folds every rule over the target in insertion order, short-circuiting
    /// on the first rule that denies it.
    pub fn apply(&self, target: T, user: &User, context: &Context) -> Option<T> {
        let mut current = target;
        for (label, rule) in &self.entries {
            match rule.apply(current, user, context) {
                Some(next) => current = next,
                None => {
                    tracing::trace!(rule = %label, "rule denied target");
                    return None;
                }
            }
        }
        Some(current)
    }
}

impl<T> Default for Rules<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Rules<T> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
        }
    }
}

impl<T> fmt::Debug for Rules<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rules")
            .field("len", &self.len())
            .field("message", &self.message())
            .finish()
    }
}

/// A resource-level and a record-level rule set, registered by an owning
/// user against either a resource id or a resource type.
#[derive(Debug, Clone)]
pub struct Policy {
    resource_rules: Rules<LeafResource>,
    record_rules: Rules<Record>,
    owner: User,
}

impl Policy {
    /// Creates a policy with empty rule sets. An empty policy still counts
    /// as a contribution during resolution; absence of any policy does not.
    pub fn new(owner: User) -> Self {
        Self {
            resource_rules: Rules::new(),
            record_rules: Rules::new(),
            owner,
        }
    }

    /// Replaces the resource-level rule set.
    pub fn with_resource_rules(mut self, rules: Rules<LeafResource>) -> Self {
        self.resource_rules = rules;
        self
    }

    /// Replaces the record-level rule set.
    pub fn with_record_rules(mut self, rules: Rules<Record>) -> Self {
        self.record_rules = rules;
        self
    }

    /// Appends a single resource-level rule.
    pub fn with_resource_rule(
        mut self,
        label: impl Into<String>,
        rule: impl Rule<LeafResource> + 'static,
    ) -> Self {
        self.resource_rules = std::mem::take(&mut self.resource_rules).add_rule(label, rule);
        self
    }

    /// Appends a single record-level rule.
    pub fn with_record_rule(
        mut self,
        label: impl Into<String>,
        rule: impl Rule<Record> + 'static,
    ) -> Self {
        self.record_rules = std::mem::take(&mut self.record_rules).add_rule(label, rule);
        self
    }

    pub fn resource_rules(&self) -> &Rules<LeafResource> {
        &self.resource_rules
    }

    pub fn record_rules(&self) -> &Rules<Record> {
        &self.record_rules
    }

    pub fn owner(&self) -> &User {
        &self.owner
    }
}

/// Failure of the backing policy store.
///
/// Distinct from a key having no policy: a store failure propagates to the
/// caller and is never treated as "no policy".
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("policy store unavailable: {0}")]
pub struct StoreError(String);

impl StoreError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Errors surfaced by policy resolution.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// The backing store rejected a lookup or registration.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// A node's parent handle no longer resolves, so the ancestor chain
    /// cannot be fully walked. A partial chain's result is never substituted.
    #[error("broken resource hierarchy: parent of '{id}' no longer resolves")]
    BrokenHierarchy { id: String },
}

/// The asynchronous key→[`Policy`] cache the engine resolves against.
///
/// Keys are either resource ids or reserved type keys (see
/// [`type_policy_key`]). Same-key read-after-write visibility is assumed; no
/// ordering is required between operations on different keys.
#[async_trait]
pub trait PolicyStore: Send + Sync {
    /// Upserts the policy under the given key.
    async fn put(&self, key: &str, policy: Policy) -> Result<bool, StoreError>;

    /// The policy registered under exactly the given key, if any.
    async fn get(&self, key: &str) -> Result<Option<Policy>, StoreError>;
}

/// A process-local [`PolicyStore`] backed by a map.
///
/// Suitable for tests and single-process deployments; production deployments
/// back the same contract with a shared network cache.
#[derive(Debug, Default)]
pub struct InMemoryPolicyStore {
    policies: RwLock<HashMap<String, Policy>>,
}

impl InMemoryPolicyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PolicyStore for InMemoryPolicyStore {
    async fn put(&self, key: &str, policy: Policy) -> Result<bool, StoreError> {
        self.policies
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), policy);
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<Policy>, StoreError> {
        Ok(self
            .policies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned())
    }
}

/// The hierarchical policy resolution engine.
///
/// Holds a shared handle to one [`PolicyStore`] and no other state, so it is
/// cheap to clone and safe to call concurrently from many tasks. No engine
/// method blocks a thread: every store interaction composes asynchronously.
#[derive(Clone)]
pub struct HierarchicalPolicyService {
    store: Arc<dyn PolicyStore>,
}

impl HierarchicalPolicyService {
    pub fn new(store: Arc<dyn PolicyStore>) -> Self {
        Self { store }
    }

    /// Registers (or overwrites) the policy for a resource, keyed by its id.
    #[tracing::instrument(skip_all, fields(resource_id = resource.id()))]
    pub async fn set_resource_policy(
        &self,
        resource: &Resource,
        policy: Policy,
    ) -> Result<bool, PolicyError> {
        tracing::debug!(owner = %policy.owner().user_id(), "registering resource policy");
        Ok(self.store.put(resource.id(), policy).await?)
    }

    /// Registers (or overwrites) the policy for a resource type.
    #[tracing::instrument(skip_all, fields(type_name = %type_name))]
    pub async fn set_type_policy(
        &self,
        type_name: &str,
        policy: Policy,
    ) -> Result<bool, PolicyError> {
        tracing::debug!(owner = %policy.owner().user_id(), "registering type policy");
        Ok(self.store.put(&type_policy_key(type_name), policy).await?)
    }

    /// Resolves the resource-level rules applicable to `resource`.
    ///
    /// Merges contributions root→leaf along the ancestor chain, then the
    /// type-keyed policy last. `Ok(None)` means no policy exists anywhere on
    /// the chain or under the type; `Ok(Some(rules))` with zero entries means
    /// at least one policy exists but contributes no resource-level rules.
    #[tracing::instrument(skip_all, fields(resource_id = resource.id(), resource_type = %resource_type))]
    pub async fn applicable_resource_rules(
        &self,
        resource: &Resource,
        resource_type: &str,
    ) -> Result<Option<Rules<LeafResource>>, PolicyError> {
        self.resolve_rules(resource, Some(resource_type), Policy::resource_rules)
            .await
    }

    /// Resolves the record-level rules applicable to `resource`.
    ///
    /// Record-level resolution walks the hierarchy only; type-keyed policies
    /// contribute to resource-level resolution alone.
    #[tracing::instrument(skip_all, fields(resource_id = resource.id()))]
    pub async fn applicable_record_rules(
        &self,
        resource: &Resource,
    ) -> Result<Option<Rules<Record>>, PolicyError> {
        self.resolve_rules(resource, None, Policy::record_rules).await
    }

    async fn resolve_rules<T>(
        &self,
        resource: &Resource,
        resource_type: Option<&str>,
        select: impl Fn(&Policy) -> &Rules<T>,
    ) -> Result<Option<Rules<T>>, PolicyError> {
        let chain = ancestor_chain(resource)?;
        let mut keys: Vec<String> = chain.iter().map(|node| node.id().to_string()).collect();
        if let Some(type_name) = resource_type {
            keys.push(type_policy_key(type_name));
        }
        tracing::trace!(levels = keys.len(), "resolving policy chain");

        // Lookups are dispatched concurrently but folded in root→leaf→type
        // order below, never completion order, so the merged rule order and
        // message stay deterministic.
        let lookups = keys.iter().map(|key| self.store.get(key));
        let policies = future::try_join_all(lookups).await?;

        let mut merged = Rules::new();
        let mut contributed = false;
        for (key, policy) in keys.iter().zip(policies) {
            match policy {
                Some(policy) => {
                    let selected = select(&policy);
                    tracing::trace!(key = %key, rules = selected.len(), "policy contributes");
                    merged = merged.merge(selected);
                    contributed = true;
                }
                None => tracing::trace!(key = %key, "no policy at level"),
            }
        }

        if contributed {
            Ok(Some(merged))
        } else {
            tracing::debug!(resource_id = resource.id(), "no policy found");
            Ok(None)
        }
    }

    /// Filters a batch of leaf resources down to those the user may access.
    ///
    /// Each leaf resolves independently and concurrently; input order is
    /// preserved in the result. A leaf with no policy anywhere is excluded,
    /// as is one whose accumulated resource-level rules deny it. Any store
    /// or hierarchy failure fails the whole batch.
    #[tracing::instrument(skip_all, fields(
        resources = resources.len(),
        user = %user.user_id(),
        purpose = %context.purpose(),
    ))]
    pub async fn can_access(
        &self,
        resources: &[LeafResource],
        user: &User,
        context: &Context,
    ) -> Result<Vec<LeafResource>, PolicyError> {
        let checks = resources
            .iter()
            .map(|leaf| self.check_access(leaf, user, context));
        let decisions = future::try_join_all(checks).await?;

        let accessible: Vec<LeafResource> = resources
            .iter()
            .zip(decisions)
            .filter(|(_, granted)| *granted)
            .map(|(leaf, _)| Arc::clone(leaf))
            .collect();
        tracing::debug!(accessible = accessible.len(), "access decision complete");
        Ok(accessible)
    }

    async fn check_access(
        &self,
        leaf: &LeafResource,
        user: &User,
        context: &Context,
    ) -> Result<bool, PolicyError> {
        let node = Resource::from(leaf);
        let rules = match self
            .applicable_resource_rules(&node, leaf.resource_type())
            .await?
        {
            Some(rules) => rules,
            None => {
                tracing::debug!(resource_id = %leaf.id(), "no policy anywhere, denying");
                return Ok(false);
            }
        };

        // Rules run against the leaf handle itself; the original handle is
        // what ends up in the accessible set.
        let granted = rules.apply(Arc::clone(leaf), user, context).is_some();
        tracing::debug!(
            resource_id = %leaf.id(),
            granted,
            rules = %rules.message(),
            "resource-level decision"
        );
        Ok(granted)
    }

    /// Resolves, per leaf resource, the record-level rules a downstream
    /// enforcement point must execute while streaming that resource's
    /// contents.
    ///
    /// Leaves with no record-level policy anywhere are omitted from the map,
    /// mirroring [`can_access`](Self::can_access): no policy means the
    /// resource is not forwarded downstream. `user` and `context` identify
    /// the request the resolved rules will later be executed under; they do
    /// not influence resolution itself.
    #[tracing::instrument(skip_all, fields(
        resources = resources.len(),
        user = %user.user_id(),
        purpose = %context.purpose(),
    ))]
    pub async fn record_rules_for(
        &self,
        resources: &[LeafResource],
        user: &User,
        context: &Context,
    ) -> Result<HashMap<LeafResource, Rules<Record>>, PolicyError> {
        let lookups = resources.iter().map(|leaf| async move {
            let rules = self.applicable_record_rules(&Resource::from(leaf)).await?;
            Ok::<_, PolicyError>((Arc::clone(leaf), rules))
        });
        let resolved = future::try_join_all(lookups).await?;

        let map: HashMap<LeafResource, Rules<Record>> = resolved
            .into_iter()
            .filter_map(|(leaf, rules)| rules.map(|rules| (leaf, rules)))
            .collect();
        tracing::debug!(forwarded = map.len(), "record-level resolution complete");
        Ok(map)
    }
}
