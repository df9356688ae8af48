//! Scripting host boundary.
//!
//! Scripts hand values to the server as [`ScriptValue`]s, a closed set of
//! Luau-like value kinds. The server exposes capabilities to scripts by
//! registering named [`ScriptFunc`]s with a [`ScriptHost`].

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::RwLock;
use tracing::debug;

use crate::error::{Error, Result};

/// A value passed in from a script.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptValue {
    Nil,
    Boolean(bool),
    Integer(i64),
    Number(f64),
    String(String),
    /// Raw bytes (a Luau `buffer`).
    Buffer(Vec<u8>),
    Array(Vec<ScriptValue>),
    Table(BTreeMap<String, ScriptValue>),
}

impl ScriptValue {
    /// Script-facing type name, used in diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            ScriptValue::Nil => "nil",
            ScriptValue::Boolean(_) => "boolean",
            ScriptValue::Integer(_) | ScriptValue::Number(_) => "number",
            ScriptValue::String(_) => "string",
            ScriptValue::Buffer(_) => "buffer",
            ScriptValue::Array(_) | ScriptValue::Table(_) => "table",
        }
    }

    /// The value as an integer, if it is one.
    ///
    /// Script numbers are doubles; a number with an exact integral value
    /// counts as an integer.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            ScriptValue::Integer(i) => Some(*i),
            ScriptValue::Number(n)
                if n.fract() == 0.0 && *n >= i64::MIN as f64 && *n < i64::MAX as f64 =>
            {
                Some(*n as i64)
            }
            _ => None,
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, ScriptValue::Nil)
    }

    /// Look up a field of a table. Non-tables have no fields.
    pub fn get(&self, key: &str) -> Option<&ScriptValue> {
        match self {
            ScriptValue::Table(t) => t.get(key),
            _ => None,
        }
    }
}

impl From<serde_json::Value> for ScriptValue {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => ScriptValue::Nil,
            serde_json::Value::Bool(b) => ScriptValue::Boolean(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => ScriptValue::Integer(i),
                None => ScriptValue::Number(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => ScriptValue::String(s),
            serde_json::Value::Array(items) => {
                ScriptValue::Array(items.into_iter().map(ScriptValue::from).collect())
            }
            serde_json::Value::Object(map) => ScriptValue::Table(
                map.into_iter()
                    .map(|(k, v)| (k, ScriptValue::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for ScriptValue {
    fn from(s: &str) -> Self {
        ScriptValue::String(s.to_string())
    }
}

impl From<Vec<u8>> for ScriptValue {
    fn from(b: Vec<u8>) -> Self {
        ScriptValue::Buffer(b)
    }
}

/// Future returned by a script function.
pub type ScriptFuture = BoxFuture<'static, ()>;

/// A function callable from scripts. It takes one argument and returns
/// nothing; failures stay on the server side.
pub type ScriptFunc = Arc<dyn Fn(ScriptValue) -> ScriptFuture + Send + Sync>;

/// Wrap an async closure as a [`ScriptFunc`].
pub fn script_func<F, Fut>(f: F) -> ScriptFunc
where
    F: Fn(ScriptValue) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |arg: ScriptValue| -> ScriptFuture { Box::pin(f(arg)) })
}

/// A scripting runtime that can expose server capabilities to scripts.
pub trait ScriptHost: Send + Sync {
    /// Register a function under a global name.
    fn register_func(&self, name: &str, func: ScriptFunc) -> Result<()>;
}

/// In-process script host: a name to function table.
#[derive(Default)]
pub struct FuncRegistry {
    funcs: RwLock<HashMap<String, ScriptFunc>>,
}

impl FuncRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Call a registered function.
    pub async fn call(&self, name: &str, arg: ScriptValue) -> Result<()> {
        let func = self
            .funcs
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Script(format!("no function named {:?}", name)))?;
        func(arg).await;
        Ok(())
    }

    /// Registered function names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.funcs.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn contains(&self, name: &str) -> bool {
        self.funcs.read().contains_key(name)
    }
}

impl ScriptHost for FuncRegistry {
    fn register_func(&self, name: &str, func: ScriptFunc) -> Result<()> {
        if name.is_empty() {
            return Err(Error::Script("function name is empty".to_string()));
        }
        let mut funcs = self.funcs.write();
        if funcs.contains_key(name) {
            return Err(Error::Script(format!(
                "function {:?} is already registered",
                name
            )));
        }
        debug!("registered script function: {}", name);
        funcs.insert(name.to_string(), func);
        Ok(())
    }
}

impl fmt::Debug for FuncRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FuncRegistry")
            .field("funcs", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_from_json() {
        let v = ScriptValue::from(json!({
            "topic": "a/b",
            "qos": 1,
            "ratio": 0.5,
            "retain": true,
            "payload": [1, 2, 3],
            "extra": null,
        }));
        assert_eq!(v.get("topic"), Some(&ScriptValue::String("a/b".to_string())));
        assert_eq!(v.get("qos"), Some(&ScriptValue::Integer(1)));
        assert_eq!(v.get("ratio"), Some(&ScriptValue::Number(0.5)));
        assert_eq!(v.get("retain"), Some(&ScriptValue::Boolean(true)));
        assert_eq!(
            v.get("payload"),
            Some(&ScriptValue::Array(vec![
                ScriptValue::Integer(1),
                ScriptValue::Integer(2),
                ScriptValue::Integer(3),
            ]))
        );
        assert_eq!(v.get("extra"), Some(&ScriptValue::Nil));
        assert_eq!(v.get("missing"), None);
    }

    #[test]
    fn test_type_names() {
        assert_eq!(ScriptValue::Nil.type_name(), "nil");
        assert_eq!(ScriptValue::Number(2.5).type_name(), "number");
        assert_eq!(ScriptValue::Buffer(vec![]).type_name(), "buffer");
        assert_eq!(ScriptValue::Array(vec![]).type_name(), "table");
    }

    #[test]
    fn test_as_integer() {
        assert_eq!(ScriptValue::Integer(-7).as_integer(), Some(-7));
        assert_eq!(ScriptValue::Number(2.0).as_integer(), Some(2));
        assert_eq!(ScriptValue::Number(2.5).as_integer(), None);
        assert_eq!(ScriptValue::Number(f64::NAN).as_integer(), None);
        assert_eq!(ScriptValue::String("1".into()).as_integer(), None);
    }

    #[test]
    fn test_registry_call() {
        let registry = FuncRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        registry
            .register_func(
                "count",
                script_func(move |_arg| {
                    let c = c.clone();
                    async move {
                        c.fetch_add(1, Ordering::SeqCst);
                    }
                }),
            )
            .unwrap();

        tokio_test::block_on(registry.call("count", ScriptValue::Nil)).unwrap();
        tokio_test::block_on(registry.call("count", ScriptValue::Nil)).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(registry.names(), vec!["count".to_string()]);

        let err = tokio_test::block_on(registry.call("missing", ScriptValue::Nil)).unwrap_err();
        assert!(matches!(err, Error::Script(_)));
    }

    #[test]
    fn test_registry_rejects_duplicates() {
        let registry = FuncRegistry::new();
        let noop = script_func(|_| async {});
        registry.register_func("publish", noop.clone()).unwrap();
        assert!(registry.register_func("publish", noop.clone()).is_err());
        assert!(registry.register_func("", noop).is_err());
        assert!(format!("{:?}", registry).contains("publish"));
    }
}
