//! Custom properties: host-supplied named facts, literal or generated per
//! evaluation, plus the engine-provided `rox.*` device properties.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::Utc;

use crate::model::{Context, DynamicValue};

/// Generator callback of a computed property; receives the evaluation-time
/// context.
pub type PropertyGenerator = Arc<dyn Fn(Option<&Context>) -> DynamicValue + Send + Sync>;

/// Host-installed fallback consulted when neither a custom property nor a
/// context entry matches a `property` lookup.
pub type DynamicRuleFn = Arc<dyn Fn(&str, Option<&Context>) -> Option<DynamicValue> + Send + Sync>;

/// The rule consulting the context, installed when the host does not supply
/// its own.
pub fn default_dynamic_rule() -> DynamicRuleFn {
    Arc::new(|name, context| context.and_then(|context| context.get(name)))
}

/// External type of a custom property as the configuration service sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyKind {
    String,
    Bool,
    Int,
    Double,
    Semver,
    DateTime,
}

impl PropertyKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            PropertyKind::String => "string",
            PropertyKind::Bool => "bool",
            PropertyKind::Int => "int",
            PropertyKind::Double => "double",
            PropertyKind::Semver => "semver",
            PropertyKind::DateTime => "datetime",
        }
    }

    pub fn external_type(&self) -> &'static str {
        match self {
            PropertyKind::String => "String",
            PropertyKind::Bool => "Boolean",
            PropertyKind::Int | PropertyKind::Double => "Number",
            PropertyKind::Semver => "Semver",
            PropertyKind::DateTime => "DateTime",
        }
    }
}

enum PropertySource {
    Literal(DynamicValue),
    Generated(PropertyGenerator),
}

/// A named fact. Names beginning with `rox.` are reserved for the
/// engine-provided device properties.
pub struct CustomProperty {
    name: String,
    kind: PropertyKind,
    source: PropertySource,
}

impl CustomProperty {
    pub fn literal(
        name: impl Into<String>,
        kind: PropertyKind,
        value: impl Into<DynamicValue>,
    ) -> CustomProperty {
        CustomProperty {
            name: name.into(),
            kind,
            source: PropertySource::Literal(value.into()),
        }
    }

    pub fn generated<F>(name: impl Into<String>, kind: PropertyKind, generator: F) -> CustomProperty
    where
        F: Fn(Option<&Context>) -> DynamicValue + Send + Sync + 'static,
    {
        CustomProperty {
            name: name.into(),
            kind,
            source: PropertySource::Generated(Arc::new(generator)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> PropertyKind {
        self.kind
    }

    /// The property's value for this evaluation: the literal, or whatever
    /// the generator produces for the given context.
    pub fn value(&self, context: Option<&Context>) -> DynamicValue {
        match &self.source {
            PropertySource::Literal(value) => value.clone(),
            PropertySource::Generated(generator) => generator(context),
        }
    }

    /// Registration record reported to the property-added listeners.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "name": self.name,
            "type": self.kind.type_name(),
            "externalType": self.kind.external_type(),
        })
    }
}

impl std::fmt::Debug for CustomProperty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CustomProperty")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish()
    }
}

type PropertyAddedListener = Box<dyn Fn(&CustomProperty) + Send + Sync>;

/// One property per name. Registrations are serialized by the inner lock;
/// reads are lock-held only for the map lookup.
#[derive(Default)]
pub struct CustomPropertyRepository {
    properties: RwLock<HashMap<String, Arc<CustomProperty>>>,
    listeners: RwLock<Vec<PropertyAddedListener>>,
}

impl CustomPropertyRepository {
    pub fn new() -> CustomPropertyRepository {
        CustomPropertyRepository::default()
    }

    /// Adds `property`, replacing any previous registration by the same name.
    pub fn add(&self, property: CustomProperty) {
        let property = Arc::new(property);
        self.properties
            .write()
            .unwrap()
            .insert(property.name().to_string(), Arc::clone(&property));
        self.notify(&property);
    }

    /// Adds `property` only when the name is still free. Returns whether the
    /// property was added.
    pub fn add_if_absent(&self, property: CustomProperty) -> bool {
        let property = Arc::new(property);
        {
            let mut properties = self.properties.write().unwrap();
            if properties.contains_key(property.name()) {
                return false;
            }
            properties.insert(property.name().to_string(), Arc::clone(&property));
        }
        self.notify(&property);
        true
    }

    pub fn get(&self, name: &str) -> Option<Arc<CustomProperty>> {
        self.properties.read().unwrap().get(name).cloned()
    }

    pub fn all(&self) -> Vec<Arc<CustomProperty>> {
        self.properties.read().unwrap().values().cloned().collect()
    }

    /// Registers a listener called synchronously on each add.
    pub fn on_property_added<F>(&self, listener: F)
    where
        F: Fn(&CustomProperty) + Send + Sync + 'static,
    {
        self.listeners.write().unwrap().push(Box::new(listener));
    }

    fn notify(&self, property: &CustomProperty) {
        for listener in self.listeners.read().unwrap().iter() {
            listener(property);
        }
    }
}

/// Registers the reserved `rox.*` device properties. Called once during
/// setup; the distinct id is the stable per-installation identity.
pub(crate) fn register_device_properties(
    repository: &CustomPropertyRepository,
    app_release: Option<&str>,
    distinct_id: &str,
) {
    repository.add(CustomProperty::literal(
        "rox.platform",
        PropertyKind::String,
        "Rust",
    ));
    repository.add(CustomProperty::literal(
        "rox.api_version",
        PropertyKind::Semver,
        env!("CARGO_PKG_VERSION"),
    ));
    repository.add(CustomProperty::literal(
        "rox.lang",
        PropertyKind::String,
        "rust",
    ));
    repository.add(CustomProperty::literal(
        "rox.app_release",
        PropertyKind::Semver,
        app_release.unwrap_or("0.0.0"),
    ));
    repository.add(CustomProperty::literal(
        "rox.distinct_id",
        PropertyKind::String,
        distinct_id,
    ));
    repository.add(CustomProperty::generated(
        "rox.now",
        PropertyKind::DateTime,
        |_| DynamicValue::Double(Utc::now().timestamp_millis() as f64),
    ));
}
