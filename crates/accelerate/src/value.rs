//! Attribute and metric values, and their normalization.
//!
//! Hosts register values either as literals or as deferred async resolvers.
//! Before a value reaches an event or the endpoint it is resolved and reduced
//! to one of the canonical shapes:
//!
//! - endpoint attributes: `Vec<String>`
//! - event attributes: `String`
//! - metrics: `f64`
//!
//! Stringification and numeric coercion follow the browser's `String()` and
//! `Number()` rules so that values compare the same way they would in the
//! page script.

use crate::error::{Error, Result};
use serde_json::Value as Json;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Error type returned by deferred resolvers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

type ResolveFuture = Pin<Box<dyn Future<Output = std::result::Result<Json, BoxError>> + Send>>;
type Resolver = Arc<dyn Fn() -> ResolveFuture + Send + Sync>;

/// A raw attribute or metric value.
#[derive(Clone)]
pub enum Value {
    /// A concrete JSON value (scalar or array).
    Literal(Json),
    /// A resolver invoked every time the value is needed.
    Deferred(Resolver),
}

/// Raw attribute values keyed by name.
pub type Attributes = BTreeMap<String, Value>;

/// Raw metric values keyed by name.
pub type Metrics = BTreeMap<String, Value>;

impl Value {
    /// Wrap an async closure as a deferred value.
    pub fn deferred<F, Fut>(resolver: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Json, BoxError>> + Send + 'static,
    {
        Value::Deferred(Arc::new(move || Box::pin(resolver())))
    }

    /// Obtain the concrete JSON value, awaiting the resolver if needed.
    pub async fn resolve(&self, name: &str) -> Result<Json> {
        match self {
            Value::Literal(json) => Ok(json.clone()),
            Value::Deferred(resolver) => resolver().await.map_err(|e| Error::Resolve {
                name: name.to_string(),
                message: e.to_string(),
            }),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Literal(json) => f.debug_tuple("Literal").field(json).finish(),
            Value::Deferred(_) => f.write_str("Deferred(..)"),
        }
    }
}

macro_rules! literal_from {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::Literal(Json::from(v))
                }
            }
        )*
    };
}

literal_from!(&str, String, bool, i32, i64, u32, u64, f64, Vec<String>, Vec<&str>);

impl From<Json> for Value {
    fn from(v: Json) -> Self {
        Value::Literal(v)
    }
}

/// Stringify a JSON value the way `String(value)` does in the browser.
pub fn js_string(value: &Json) -> String {
    match value {
        Json::Null => "null".into(),
        Json::Bool(b) => b.to_string(),
        Json::Number(n) => match n.as_f64() {
            Some(f) => format_number(f),
            None => n.to_string(),
        },
        Json::String(s) => s.clone(),
        Json::Array(items) => items
            .iter()
            .map(|item| match item {
                Json::Null => String::new(),
                other => js_string(other),
            })
            .collect::<Vec<_>>()
            .join(","),
        Json::Object(_) => "[object Object]".into(),
    }
}

fn format_number(f: f64) -> String {
    if f.is_nan() {
        "NaN".into()
    } else if f.is_infinite() {
        let sign = if f > 0.0 { "" } else { "-" };
        format!("{sign}Infinity")
    } else if f.fract() == 0.0 && f.abs() < 1e21 {
        format!("{}", f as i128)
    } else {
        f.to_string()
    }
}

/// Coerce a JSON value to a number the way `Number(value)` does.
pub fn js_number(value: &Json) -> f64 {
    match value {
        Json::Null => 0.0,
        Json::Bool(b) => {
            if *b {
                1.0
            } else {
                0.0
            }
        }
        Json::Number(n) => n.as_f64().unwrap_or(f64::NAN),
        Json::String(s) => parse_numeric_str(s),
        Json::Array(items) => match items.as_slice() {
            [] => 0.0,
            [single] => parse_numeric_str(&js_string(single)),
            _ => f64::NAN,
        },
        Json::Object(_) => f64::NAN,
    }
}

fn parse_numeric_str(s: &str) -> f64 {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return 0.0;
    }
    match trimmed {
        "Infinity" | "+Infinity" => return f64::INFINITY,
        "-Infinity" => return f64::NEG_INFINITY,
        _ => {}
    }
    // Rust accepts "inf" and "nan" spellings that the browser rejects.
    let numeric = trimmed
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '.' | '-' | '+' | 'e' | 'E'));
    if !numeric {
        return f64::NAN;
    }
    trimmed.parse::<f64>().unwrap_or(f64::NAN)
}

/// Endpoint form of an attribute: every element stringified.
pub fn attribute_array(value: &Json) -> Vec<String> {
    match value {
        Json::Array(items) => items.iter().map(js_string).collect(),
        scalar => vec![js_string(scalar)],
    }
}

/// Event form of an attribute: the first element (or the scalar) stringified.
pub fn attribute_scalar(value: &Json) -> String {
    match value {
        Json::Array(items) => items.first().map(js_string).unwrap_or_default(),
        scalar => js_string(scalar),
    }
}

/// Metric form of a value. `None` when the coercion is not a finite number.
pub fn metric_value(value: &Json) -> Option<f64> {
    let number = match value {
        Json::Array(items) => items.first().map(js_number).unwrap_or(f64::NAN),
        scalar => js_number(scalar),
    };
    number.is_finite().then_some(number)
}

async fn resolve_all(values: &BTreeMap<String, Value>) -> Result<BTreeMap<String, Json>> {
    let mut resolved = BTreeMap::new();
    for (name, value) in values {
        resolved.insert(name.clone(), value.resolve(name).await?);
    }
    Ok(resolved)
}

/// Resolve and normalize attributes into their endpoint (array) form.
pub async fn prepare_endpoint_attributes(
    attributes: &Attributes,
) -> Result<BTreeMap<String, Vec<String>>> {
    Ok(resolve_all(attributes)
        .await?
        .into_iter()
        .map(|(name, json)| (name, attribute_array(&json)))
        .collect())
}

/// Resolve and normalize attributes into their event (scalar) form.
pub async fn prepare_event_attributes(attributes: &Attributes) -> Result<BTreeMap<String, String>> {
    Ok(resolve_all(attributes)
        .await?
        .into_iter()
        .map(|(name, json)| (name, attribute_scalar(&json)))
        .collect())
}

/// Resolve and normalize metrics to floats.
pub async fn prepare_metrics(metrics: &Metrics) -> Result<BTreeMap<String, f64>> {
    Ok(resolve_all(metrics)
        .await?
        .into_iter()
        .filter_map(|(name, json)| metric_value(&json).map(|v| (name, v)))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_js_string_numbers() {
        assert_eq!(js_string(&json!(5.0)), "5");
        assert_eq!(js_string(&json!(2.5)), "2.5");
        assert_eq!(js_string(&json!(-3)), "-3");
        assert_eq!(js_string(&json!(true)), "true");
        assert_eq!(js_string(&json!(null)), "null");
        assert_eq!(js_string(&json!(["a", 1, null])), "a,1,");
    }

    #[test]
    fn test_js_number_coercion() {
        assert_eq!(js_number(&json!("42")), 42.0);
        assert_eq!(js_number(&json!(" 1.5 ")), 1.5);
        assert_eq!(js_number(&json!("")), 0.0);
        assert_eq!(js_number(&json!(null)), 0.0);
        assert_eq!(js_number(&json!(true)), 1.0);
        assert!(js_number(&json!("abc")).is_nan());
        assert!(js_number(&json!("inf")).is_nan());
        assert_eq!(js_number(&json!(["7"])), 7.0);
    }

    #[test]
    fn test_attribute_forms() {
        assert_eq!(attribute_array(&json!("US")), vec!["US"]);
        assert_eq!(attribute_array(&json!([1, "b"])), vec!["1", "b"]);
        assert_eq!(attribute_scalar(&json!(["first", "second"])), "first");
        assert_eq!(attribute_scalar(&json!(3)), "3");
        assert_eq!(attribute_scalar(&json!([])), "");
    }

    #[test]
    fn test_metric_value_truncates_arrays() {
        assert_eq!(metric_value(&json!([3, 9])), Some(3.0));
        assert_eq!(metric_value(&json!("12.5")), Some(12.5));
        assert_eq!(metric_value(&json!("nope")), None);
        assert_eq!(metric_value(&json!([])), None);
    }

    #[tokio::test]
    async fn test_prepare_resolves_deferred_values() {
        let mut attributes = Attributes::new();
        attributes.insert("plan".into(), Value::from("pro"));
        attributes.insert(
            "tags".into(),
            Value::deferred(|| async { Ok::<_, BoxError>(json!(["a", "b"])) }),
        );

        let endpoint = prepare_endpoint_attributes(&attributes).await.unwrap();
        assert_eq!(endpoint["plan"], vec!["pro"]);
        assert_eq!(endpoint["tags"], vec!["a", "b"]);

        let event = prepare_event_attributes(&attributes).await.unwrap();
        assert_eq!(event["tags"], "a");
    }

    #[tokio::test]
    async fn test_prepare_metrics() {
        let mut metrics = Metrics::new();
        metrics.insert("score".into(), Value::from("4"));
        metrics.insert("bad".into(), Value::from("x"));
        metrics.insert(
            "later".into(),
            Value::deferred(|| async { Ok::<_, BoxError>(json!(10)) }),
        );

        let prepared = prepare_metrics(&metrics).await.unwrap();
        assert_eq!(prepared["score"], 4.0);
        assert_eq!(prepared["later"], 10.0);
        assert!(!prepared.contains_key("bad"));
    }

    #[tokio::test]
    async fn test_resolver_error_propagates() {
        let mut attributes = Attributes::new();
        attributes.insert(
            "broken".into(),
            Value::deferred(|| async { Err::<Json, BoxError>("boom".into()) }),
        );

        let err = prepare_event_attributes(&attributes).await.unwrap_err();
        assert!(matches!(err, Error::Resolve { ref name, .. } if name == "broken"));
    }
}
