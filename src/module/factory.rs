use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Host-assigned module identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct ModuleId(String);

impl ModuleId {
    pub fn new(id: impl Into<String>) -> Self {
        ModuleId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ModuleId {
    fn from(id: &str) -> Self {
        ModuleId(id.to_string())
    }
}

impl From<String> for ModuleId {
    fn from(id: String) -> Self {
        ModuleId(id)
    }
}

impl From<u64> for ModuleId {
    fn from(id: u64) -> Self {
        ModuleId(id.to_string())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FactoryError {
    #[error("{0}")]
    Message(String),

    #[error("factory panicked: {0}")]
    Panicked(String),
}

pub type FactoryFn = Arc<dyn Fn() -> Result<ModuleExports, FactoryError> + Send + Sync>;

/// An executable module body together with the source text it came from.
///
/// The source is kept next to the closure so the interceptor can rewrite it;
/// cloning shares both.
#[derive(Clone)]
pub struct ModuleFactory {
    source: Arc<str>,
    run: FactoryFn,
}

impl ModuleFactory {
    pub fn new<F>(source: impl Into<Arc<str>>, run: F) -> Self
    where
        F: Fn() -> Result<ModuleExports, FactoryError> + Send + Sync + 'static,
    {
        Self {
            source: source.into(),
            run: Arc::new(run),
        }
    }

    /// A factory that always yields `exports`.
    pub fn constant(source: impl Into<Arc<str>>, exports: ModuleExports) -> Self {
        Self::new(source, move || Ok(exports.clone()))
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Run the module body.
    pub fn invoke(&self) -> Result<ModuleExports, FactoryError> {
        (self.run)()
    }

    /// Whether both handles refer to the same factory instance.
    pub fn ptr_eq(&self, other: &ModuleFactory) -> bool {
        Arc::ptr_eq(&self.run, &other.run)
    }
}

impl fmt::Debug for ModuleFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleFactory")
            .field("source_len", &self.source.len())
            .finish_non_exhaustive()
    }
}

/// One exported binding.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportValue {
    /// Source text of the exported expression.
    pub source: String,
    /// Value, when the expression is a JSON-representable literal.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub literal: Option<serde_json::Value>,
}

impl ExportValue {
    pub fn expression(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            literal: None,
        }
    }

    pub fn literal(source: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            source: source.into(),
            literal: Some(value),
        }
    }
}

/// What a module exposes once executed, keyed by export name.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ModuleExports {
    values: BTreeMap<String, ExportValue>,
}

impl ModuleExports {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: ExportValue) -> Option<ExportValue> {
        self.values.insert(name.into(), value)
    }

    pub fn with(mut self, name: impl Into<String>, value: ExportValue) -> Self {
        self.insert(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&ExportValue> {
        self.values.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ExportValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
