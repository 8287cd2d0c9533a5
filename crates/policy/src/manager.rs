//! Loading, validating and hot-swapping the active policy.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, RwLock},
};

use config::{PolicyDecl, PolicySpec};
use serde::Deserialize;
use thiserror::Error;

use crate::{
    builtin::{
        AnthropicUppercasePolicy, DebugLoggingPolicy, NoOpPolicy, ToolFilterConfig, ToolFilterPolicy,
        TranscriptRecorderPolicy, UppercasePolicy,
    },
    compose::{ParallelPolicy, SerialPolicy},
    hooks::Policy,
};

/// Errors raised while loading a policy from configuration.
#[derive(Debug, Error)]
pub enum PolicyLoadError {
    /// The class reference is not of the form `module.path:ClassName`.
    #[error("invalid policy class reference '{0}', expected 'module.path:ClassName'")]
    InvalidClassRef(String),

    /// No policy is registered under this class reference.
    #[error("unknown policy class '{0}'")]
    UnknownClass(String),

    /// The constructor kwargs did not match the policy's configuration.
    #[error("invalid config for policy '{class}': {source}")]
    InvalidConfig {
        /// The class reference being constructed.
        class: String,
        /// The underlying deserialization error.
        source: serde_yaml::Error,
    },

    /// The policy document could not be read or parsed.
    #[error(transparent)]
    Spec(#[from] config::PolicySpecError),
}

type Factory =
    Box<dyn Fn(&BTreeMap<String, serde_yaml::Value>, &PolicyRegistry) -> Result<Arc<dyn Policy>, PolicyLoadError> + Send + Sync>;

/// Maps class reference strings to policy constructors.
///
/// Rust has no dynamic import; the `module.path:ClassName` strings from
/// the YAML policy document resolve through this explicit registry.
pub struct PolicyRegistry {
    factories: HashMap<String, Factory>,
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

fn kwargs_value(kwargs: &BTreeMap<String, serde_yaml::Value>) -> serde_yaml::Value {
    let mut mapping = serde_yaml::Mapping::new();
    for (key, value) in kwargs {
        mapping.insert(serde_yaml::Value::String(key.clone()), value.clone());
    }
    serde_yaml::Value::Mapping(mapping)
}

fn typed_kwargs<T: for<'de> Deserialize<'de>>(
    class: &str,
    kwargs: &BTreeMap<String, serde_yaml::Value>,
) -> Result<T, PolicyLoadError> {
    serde_yaml::from_value(kwargs_value(kwargs)).map_err(|source| PolicyLoadError::InvalidConfig {
        class: class.to_string(),
        source,
    })
}

/// Kwargs for the serial and parallel composition policies.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CompositionConfig {
    policies: Vec<PolicyDecl>,
}

impl PolicyRegistry {
    /// The registry of built-in policies.
    pub fn builtin() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };

        registry.register("warden.policies:NoOpPolicy", |class, kwargs, _| {
            let _: EmptyConfig = typed_kwargs(class, kwargs)?;
            Ok(Arc::new(NoOpPolicy) as Arc<dyn Policy>)
        });

        registry.register("warden.policies:UppercasePolicy", |class, kwargs, _| {
            let _: EmptyConfig = typed_kwargs(class, kwargs)?;
            Ok(Arc::new(UppercasePolicy::boxed()) as Arc<dyn Policy>)
        });

        registry.register("warden.policies:ToolFilterPolicy", |class, kwargs, _| {
            let config: ToolFilterConfig = typed_kwargs(class, kwargs)?;
            Ok(Arc::new(ToolFilterPolicy::boxed(config)) as Arc<dyn Policy>)
        });

        registry.register("warden.policies:DebugLoggingPolicy", |class, kwargs, _| {
            let _: EmptyConfig = typed_kwargs(class, kwargs)?;
            Ok(Arc::new(DebugLoggingPolicy) as Arc<dyn Policy>)
        });

        registry.register("warden.policies:TranscriptRecorderPolicy", |class, kwargs, _| {
            let _: EmptyConfig = typed_kwargs(class, kwargs)?;
            Ok(Arc::new(TranscriptRecorderPolicy) as Arc<dyn Policy>)
        });

        registry.register("warden.policies:AnthropicUppercasePolicy", |class, kwargs, _| {
            let _: EmptyConfig = typed_kwargs(class, kwargs)?;
            Ok(Arc::new(AnthropicUppercasePolicy) as Arc<dyn Policy>)
        });

        registry.register("warden.policies:SerialPolicy", |class, kwargs, registry| {
            let config: CompositionConfig = typed_kwargs(class, kwargs)?;
            let policies = config
                .policies
                .iter()
                .map(|decl| registry.construct(decl))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Arc::new(SerialPolicy::new(policies)) as Arc<dyn Policy>)
        });

        registry.register("warden.policies:ParallelPolicy", |class, kwargs, registry| {
            let config: CompositionConfig = typed_kwargs(class, kwargs)?;
            let policies = config
                .policies
                .iter()
                .map(|decl| registry.construct(decl))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Arc::new(ParallelPolicy::new(policies)) as Arc<dyn Policy>)
        });

        registry
    }

    /// Register a policy constructor under a class reference.
    pub fn register<F>(&mut self, class: &str, factory: F)
    where
        F: Fn(&str, &BTreeMap<String, serde_yaml::Value>, &PolicyRegistry) -> Result<Arc<dyn Policy>, PolicyLoadError>
            + Send
            + Sync
            + 'static,
    {
        let class_owned = class.to_string();
        self.factories.insert(
            class.to_string(),
            Box::new(move |kwargs, registry| factory(&class_owned, kwargs, registry)),
        );
    }

    /// Construct a policy from a declaration.
    pub fn construct(&self, decl: &PolicyDecl) -> Result<Arc<dyn Policy>, PolicyLoadError> {
        if !decl.class.contains(':') {
            return Err(PolicyLoadError::InvalidClassRef(decl.class.clone()));
        }

        let factory = self
            .factories
            .get(&decl.class)
            .ok_or_else(|| PolicyLoadError::UnknownClass(decl.class.clone()))?;

        factory(&decl.config, self)
    }

    /// The registered class references, sorted.
    pub fn classes(&self) -> Vec<&str> {
        let mut classes: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        classes.sort_unstable();
        classes
    }
}

/// Kwargs shape for policies that take no configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct EmptyConfig {}

/// Holds the active policy and swaps it atomically.
///
/// `current()` is a single snapshot read: in-flight transactions keep the
/// reference they captured at request start, newly arriving transactions
/// observe the swapped policy.
pub struct PolicyManager {
    registry: PolicyRegistry,
    active: RwLock<Arc<dyn Policy>>,
}

impl Default for PolicyManager {
    fn default() -> Self {
        Self::new(PolicyRegistry::builtin())
    }
}

impl PolicyManager {
    /// A manager starting with the no-op policy.
    pub fn new(registry: PolicyRegistry) -> Self {
        Self {
            registry,
            active: RwLock::new(Arc::new(NoOpPolicy)),
        }
    }

    /// Snapshot of the active policy.
    pub fn current(&self) -> Arc<dyn Policy> {
        self.active
            .read()
            .map(|active| Arc::clone(&active))
            .unwrap_or_else(|poisoned| Arc::clone(&poisoned.into_inner()))
    }

    /// Atomically replace the active policy for future transactions.
    pub fn swap(&self, policy: Arc<dyn Policy>) {
        let name = policy.name().to_string();
        match self.active.write() {
            Ok(mut active) => *active = policy,
            Err(poisoned) => *poisoned.into_inner() = policy,
        }
        log::info!("Active policy swapped to '{name}'");
    }

    /// Construct a policy from a declaration without activating it.
    pub fn load(&self, decl: &PolicyDecl) -> Result<Arc<dyn Policy>, PolicyLoadError> {
        self.registry.construct(decl)
    }

    /// Load a policy and make it active. A failed load leaves the active
    /// policy unchanged.
    pub fn activate(&self, decl: &PolicyDecl) -> Result<Arc<dyn Policy>, PolicyLoadError> {
        let policy = self.load(decl)?;
        self.swap(Arc::clone(&policy));
        Ok(policy)
    }

    /// Load and activate the policy document at `path`.
    pub fn activate_from_file(&self, path: &str) -> Result<Arc<dyn Policy>, PolicyLoadError> {
        let spec = PolicySpec::load(path)?;
        self.activate(&spec.policy)
    }

    /// The constructor registry.
    pub fn registry(&self) -> &PolicyRegistry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;

    fn decl_from_yaml(yaml: &str) -> PolicyDecl {
        PolicySpec::parse(yaml).unwrap().policy
    }

    #[test]
    fn loads_builtin_noop() {
        let manager = PolicyManager::default();
        let policy = manager
            .load(&decl_from_yaml(indoc! {r#"
                policy:
                  class: "warden.policies:NoOpPolicy"
            "#}))
            .unwrap();

        assert_eq!(policy.name(), "noop");
    }

    #[test]
    fn loads_tool_filter_with_kwargs() {
        let manager = PolicyManager::default();
        let policy = manager
            .load(&decl_from_yaml(indoc! {r#"
                policy:
                  class: "warden.policies:ToolFilterPolicy"
                  config:
                    blocked_tools: ["delete_file"]
            "#}))
            .unwrap();

        assert_eq!(policy.name(), "tool-filter");
    }

    #[test]
    fn loads_nested_serial_chain() {
        let manager = PolicyManager::default();
        let policy = manager
            .load(&decl_from_yaml(indoc! {r#"
                policy:
                  class: "warden.policies:SerialPolicy"
                  config:
                    policies:
                      - class: "warden.policies:NoOpPolicy"
                      - class: "warden.policies:UppercasePolicy"
            "#}))
            .unwrap();

        assert_eq!(policy.name(), "serial(noop,uppercase)");
    }

    #[test]
    fn unknown_class_is_a_typed_error() {
        let manager = PolicyManager::default();
        let error = manager
            .load(&decl_from_yaml(indoc! {r#"
                policy:
                  class: "warden.policies:DoesNotExist"
            "#}))
            .unwrap_err();

        assert!(matches!(error, PolicyLoadError::UnknownClass(_)));
    }

    #[test]
    fn malformed_class_ref_is_rejected() {
        let manager = PolicyManager::default();
        let error = manager
            .load(&decl_from_yaml(indoc! {r#"
                policy:
                  class: "NoColonHere"
            "#}))
            .unwrap_err();

        assert!(matches!(error, PolicyLoadError::InvalidClassRef(_)));
    }

    #[test]
    fn unknown_kwargs_are_surfaced_as_constructor_errors() {
        let manager = PolicyManager::default();
        let error = manager
            .load(&decl_from_yaml(indoc! {r#"
                policy:
                  class: "warden.policies:NoOpPolicy"
                  config:
                    verbosity: high
            "#}))
            .unwrap_err();

        assert!(matches!(error, PolicyLoadError::InvalidConfig { .. }));
    }

    #[test]
    fn failed_activation_keeps_the_current_policy() {
        let manager = PolicyManager::default();
        let before = manager.current();

        let result = manager.activate(&decl_from_yaml(indoc! {r#"
            policy:
              class: "warden.policies:DoesNotExist"
        "#}));

        assert!(result.is_err());
        assert!(Arc::ptr_eq(&before, &manager.current()));
    }

    #[test]
    fn swap_is_visible_to_new_snapshots_only() {
        let manager = PolicyManager::default();
        let captured_at_request_start = manager.current();

        manager
            .activate(&decl_from_yaml(indoc! {r#"
                policy:
                  class: "warden.policies:UppercasePolicy"
            "#}))
            .unwrap();

        // The in-flight transaction keeps its captured reference.
        assert_eq!(captured_at_request_start.name(), "noop");
        assert_eq!(manager.current().name(), "uppercase");
    }
}
