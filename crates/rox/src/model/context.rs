//! Evaluation contexts: host-supplied facts accompanying a flag read.

use std::collections::HashMap;
use std::sync::Arc;

use crate::model::DynamicValue;

/// An immutable `name -> value` mapping. Contexts compose: a merged context
/// consults the local side first, then the global one; neither is mutated.
#[derive(Debug, Clone, Default)]
pub struct Context {
    values: Arc<HashMap<String, DynamicValue>>,
    parent: Option<Arc<Context>>,
}

impl Context {
    pub fn empty() -> Context {
        Context::default()
    }

    pub fn from_map(values: HashMap<String, DynamicValue>) -> Context {
        Context {
            values: Arc::new(values),
            parent: None,
        }
    }

    pub fn builder() -> ContextBuilder {
        ContextBuilder::new()
    }

    /// Composes `global` and `local` without copying either.
    pub fn merged(global: Option<&Context>, local: Option<&Context>) -> Context {
        match (global, local) {
            (Some(global), Some(local)) => Context {
                values: Arc::clone(&local.values),
                parent: Some(Arc::new(global.clone())),
            },
            (Some(single), None) | (None, Some(single)) => single.clone(),
            (None, None) => Context::empty(),
        }
    }

    pub fn get(&self, key: &str) -> Option<DynamicValue> {
        if let Some(value) = self.values.get(key) {
            return Some(value.clone());
        }
        self.parent.as_ref().and_then(|parent| parent.get(key))
    }
}

/// Builder mirroring the typed `add_*` setters of the host surface.
#[derive(Debug, Default)]
pub struct ContextBuilder {
    values: HashMap<String, DynamicValue>,
}

impl ContextBuilder {
    pub fn new() -> ContextBuilder {
        ContextBuilder::default()
    }

    pub fn with_value(mut self, name: impl Into<String>, value: impl Into<DynamicValue>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }

    pub fn with_null(mut self, name: impl Into<String>) -> Self {
        self.values.insert(name.into(), DynamicValue::Null);
        self
    }

    pub fn with_undefined(mut self, name: impl Into<String>) -> Self {
        self.values.insert(name.into(), DynamicValue::Undefined);
        self
    }

    pub fn build(self) -> Context {
        Context::from_map(self.values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merged_context_prefers_local() {
        let global = Context::builder()
            .with_value("platform", "server")
            .with_value("region", "eu")
            .build();
        let local = Context::builder().with_value("region", "us").build();

        let merged = Context::merged(Some(&global), Some(&local));
        assert_eq!(merged.get("region"), Some(DynamicValue::from("us")));
        assert_eq!(merged.get("platform"), Some(DynamicValue::from("server")));
        assert_eq!(merged.get("missing"), None);

        // Sources are untouched.
        assert_eq!(global.get("region"), Some(DynamicValue::from("eu")));
        assert_eq!(local.get("platform"), None);
    }

    #[test]
    fn merged_with_one_side_is_that_side() {
        let local = Context::builder().with_value("k", 1i64).build();
        let merged = Context::merged(None, Some(&local));
        assert_eq!(merged.get("k"), Some(DynamicValue::Int(1)));
    }
}
