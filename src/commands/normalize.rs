//! # Remote value normalization.
//!
//! Turns whatever a page evaluation produced into the single string sent back to the caller.
//! Precedence:
//!
//! 1. fault → `"<kind>: <message>"`
//! 2. pending → normalize the settled value
//! 3. sequence (including JSON arrays) → normalize each element, join with `", "`
//! 4. callable / symbol → its textual form
//! 5. anything else → compact JSON (`undefined` has no JSON form and renders as `undefined`)
//!
//! # Example
//! ```
//! use futures::executor::block_on;
//! use serde_json::json;
//! use streamvisor::{normalize, RemoteValue};
//!
//! let joined = block_on(normalize(RemoteValue::Data(json!([1, "a", true]))));
//! assert_eq!(joined, r#"1, "a", true"#);
//!
//! let object = block_on(normalize(RemoteValue::Data(json!({"ok": true}))));
//! assert_eq!(object, r#"{"ok":true}"#);
//! ```

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;

/// A value produced by evaluating a script in the page.
pub enum RemoteValue {
    /// A thrown or returned error object.
    Fault { kind: String, message: String },
    /// A value that settles later.
    Pending(BoxFuture<'static, RemoteValue>),
    /// An ordered collection.
    Sequence(Vec<RemoteValue>),
    /// A function; carries its source text.
    Callable(String),
    /// An opaque symbolic reference; carries its description.
    Symbol(String),
    Undefined,
    /// Plain structured data.
    Data(Value),
}

impl RemoteValue {
    pub fn fault(kind: impl Into<String>, message: impl Into<String>) -> Self {
        RemoteValue::Fault {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Wraps a future that settles to a value.
    pub fn pending<F>(fut: F) -> Self
    where
        F: std::future::Future<Output = RemoteValue> + Send + 'static,
    {
        RemoteValue::Pending(fut.boxed())
    }
}

impl From<Value> for RemoteValue {
    fn from(v: Value) -> Self {
        RemoteValue::Data(v)
    }
}

impl std::fmt::Debug for RemoteValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemoteValue::Fault { kind, message } => f
                .debug_struct("Fault")
                .field("kind", kind)
                .field("message", message)
                .finish(),
            RemoteValue::Pending(_) => f.write_str("Pending(..)"),
            RemoteValue::Sequence(items) => f.debug_tuple("Sequence").field(items).finish(),
            RemoteValue::Callable(text) => f.debug_tuple("Callable").field(text).finish(),
            RemoteValue::Symbol(text) => f.debug_tuple("Symbol").field(text).finish(),
            RemoteValue::Undefined => f.write_str("Undefined"),
            RemoteValue::Data(v) => f.debug_tuple("Data").field(v).finish(),
        }
    }
}

/// Converts a remote value into its canonical string.
pub fn normalize(value: RemoteValue) -> BoxFuture<'static, String> {
    async move {
        match value {
            RemoteValue::Fault { kind, message } => format!("{kind}: {message}"),
            RemoteValue::Pending(settling) => normalize(settling.await).await,
            RemoteValue::Sequence(items) => {
                let mut parts = Vec::with_capacity(items.len());
                for item in items {
                    parts.push(normalize(item).await);
                }
                parts.join(", ")
            }
            RemoteValue::Callable(text) | RemoteValue::Symbol(text) => text,
            RemoteValue::Undefined => "undefined".to_string(),
            RemoteValue::Data(data) => render(data),
        }
    }
    .boxed()
}

fn render(data: Value) -> String {
    match data {
        Value::Array(items) => items.into_iter().map(render).collect::<Vec<_>>().join(", "),
        other => other.to_string(),
    }
}
