//! Audience definitions and the client-side rule matcher.
//!
//! An audience is a two level tree: the audience combines groups with `any`
//! or `all`, and each group combines rules the same way. Both levels seed
//! their result from the combinator (`all` starts true, `any` starts false)
//! and stop at the first counter-example.
//!
//! Rules read values from a [`DataSurface`]. A field may hold several values
//! (multi-valued endpoint attributes); a rule passes when any one of them
//! satisfies the operator.

use crate::types::Endpoint;
use crate::value::{js_number, js_string};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::{BTreeMap, HashMap};

/// How a list of conditions is combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Include {
    Any,
    All,
}

/// Rule comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = "=")]
    Equals,
    #[serde(rename = "!=")]
    NotEquals,
    #[serde(rename = "*=")]
    Contains,
    #[serde(rename = "!*")]
    NotContains,
    #[serde(rename = "^=")]
    StartsWith,
    #[serde(rename = "gt")]
    GreaterThan,
    #[serde(rename = "gte")]
    GreaterThanOrEqual,
    #[serde(rename = "lt")]
    LessThan,
    #[serde(rename = "lte")]
    LessThanOrEqual,
}

/// Declared type of a rule operand.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleType {
    #[default]
    String,
    Number,
}

/// A single field comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    /// Dot path into the data surface, e.g. `endpoint.Location.Country`.
    pub field: String,
    pub operator: Operator,
    #[serde(default)]
    pub value: Json,
    #[serde(default, rename = "type")]
    pub rule_type: RuleType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub include: Include,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudienceConfig {
    pub include: Include,
    #[serde(default)]
    pub groups: Vec<Group>,
}

/// An audience as supplied by the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudienceDefinition {
    pub id: u64,
    pub config: AudienceConfig,
}

type Accessor = fn(&DataSurface, &str) -> Option<Vec<Json>>;

/// Field namespaces and their extraction functions.
const ACCESSORS: &[(&str, Accessor)] = &[
    ("attributes", DataSurface::attribute_values),
    ("metrics", DataSurface::metric_values),
    ("endpoint", DataSurface::endpoint_values),
];

/// Everything a rule can look at.
#[derive(Debug, Clone)]
pub struct DataSurface {
    attributes: BTreeMap<String, Vec<String>>,
    metrics: BTreeMap<String, f64>,
    endpoint: Endpoint,
    endpoint_json: Json,
}

impl DataSurface {
    /// Build a surface from the page's prepared attributes and metrics and
    /// the current endpoint.
    pub fn new(
        attributes: BTreeMap<String, Vec<String>>,
        metrics: BTreeMap<String, f64>,
        endpoint: Endpoint,
    ) -> Self {
        let endpoint_json = serde_json::to_value(&endpoint).unwrap_or(Json::Null);
        Self {
            attributes,
            metrics,
            endpoint,
            endpoint_json,
        }
    }

    /// Current values for `field`. Unknown fields resolve to `[null]`.
    pub fn resolve(&self, field: &str) -> Vec<Json> {
        let (root, rest) = field.split_once('.').unwrap_or((field, ""));
        ACCESSORS
            .iter()
            .find(|(name, _)| *name == root)
            .and_then(|(_, accessor)| accessor(self, rest))
            .unwrap_or_else(|| vec![Json::Null])
    }

    /// Page attribute first, then the endpoint's stored values.
    fn attribute_values(&self, name: &str) -> Option<Vec<Json>> {
        self.attributes
            .get(name)
            .or_else(|| self.endpoint.attributes.get(name))
            .map(|values| values.iter().cloned().map(Json::String).collect())
    }

    /// Page metric first, then the endpoint's stored metric.
    fn metric_values(&self, name: &str) -> Option<Vec<Json>> {
        self.metrics
            .get(name)
            .copied()
            .or_else(|| self.endpoint.metric(name))
            .map(|v| vec![Json::from(v)])
    }

    fn endpoint_values(&self, path: &str) -> Option<Vec<Json>> {
        walk_path(&self.endpoint_json, path).map(|found| match found {
            Json::Array(items) => items.clone(),
            other => vec![other.clone()],
        })
    }
}

fn walk_path<'a>(root: &'a Json, path: &str) -> Option<&'a Json> {
    if path.is_empty() {
        return Some(root);
    }
    path.split('.').try_fold(root, |node, segment| match node {
        Json::Object(map) => map.get(segment),
        Json::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// `==` between two JSON primitives, with numeric coercion between numbers,
/// numeric strings and booleans.
fn loose_equals(a: &Json, b: &Json) -> bool {
    match (a, b) {
        (Json::Null, Json::Null) => true,
        (Json::Null, _) | (_, Json::Null) => false,
        (Json::String(x), Json::String(y)) => x == y,
        (Json::Array(_) | Json::Object(_), _) | (_, Json::Array(_) | Json::Object(_)) => a == b,
        _ => js_number(a) == js_number(b),
    }
}

/// Evaluate one rule against every value of its field.
///
/// The check order is significant: equality runs first, a null field value
/// stops before the string operators, and a null operand stops before the
/// numeric operators.
fn rule_matches(rule: &Rule, values: &[Json]) -> bool {
    let mut matched = false;

    for current in values {
        match rule.operator {
            Operator::Equals => matched = loose_equals(current, &rule.value),
            Operator::NotEquals => matched = !loose_equals(current, &rule.value),
            _ => {}
        }

        if current.is_null() {
            break;
        }

        let current_str = js_string(current);
        let value_str = js_string(&rule.value);
        match rule.operator {
            Operator::Contains => matched = current_str.contains(&value_str),
            Operator::NotContains => matched = !current_str.contains(&value_str),
            Operator::StartsWith => matched = current_str.starts_with(&value_str),
            _ => {}
        }

        if rule.value.is_null() {
            break;
        }

        let (lhs, rhs) = (js_number(current), js_number(&rule.value));
        match rule.operator {
            Operator::GreaterThan => matched = lhs > rhs,
            Operator::GreaterThanOrEqual => matched = lhs >= rhs,
            Operator::LessThan => matched = lhs < rhs,
            Operator::LessThanOrEqual => matched = lhs <= rhs,
            _ => {}
        }

        if matched {
            break;
        }
    }

    matched
}

/// Whether the data surface belongs to `audience`.
pub fn evaluate_audience(audience: &AudienceDefinition, data: &DataSurface) -> bool {
    let config = &audience.config;
    let mut resolved: HashMap<&str, Vec<Json>> = HashMap::new();
    let mut audience_matched = config.include == Include::All;

    for group in &config.groups {
        let mut group_matched = group.include == Include::All;

        for rule in &group.rules {
            if rule.field.is_empty() {
                continue;
            }
            let values = resolved
                .entry(rule.field.as_str())
                .or_insert_with(|| data.resolve(&rule.field));
            let rule_match = rule_matches(rule, values);

            match group.include {
                Include::Any if rule_match => {
                    group_matched = true;
                    break;
                }
                Include::All if !rule_match => {
                    group_matched = false;
                    break;
                }
                _ => {}
            }
        }

        match config.include {
            Include::Any if group_matched => {
                audience_matched = true;
                break;
            }
            Include::All if !group_matched => {
                audience_matched = false;
                break;
            }
            _ => {}
        }
    }

    audience_matched
}

/// IDs of every audience the data surface belongs to, in definition order.
pub fn evaluate_audiences(audiences: &[AudienceDefinition], data: &DataSurface) -> Vec<u64> {
    audiences
        .iter()
        .filter(|audience| evaluate_audience(audience, data))
        .map(|audience| audience.id)
        .collect()
}

/// The matched audience IDs, kept sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AudienceSet {
    ids: Vec<u64>,
}

impl AudienceSet {
    pub fn ids(&self) -> &[u64] {
        &self.ids
    }

    /// Replace the set. Returns the new sorted IDs if membership changed.
    pub fn replace(&mut self, mut ids: Vec<u64>) -> Option<Vec<u64>> {
        ids.sort_unstable();
        ids.dedup();
        if ids == self.ids {
            return None;
        }
        self.ids = ids.clone();
        Some(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn audience(value: Json) -> AudienceDefinition {
        serde_json::from_value(value).unwrap()
    }

    fn surface(attributes: &[(&str, &[&str])], endpoint: Json) -> DataSurface {
        let attributes = attributes
            .iter()
            .map(|(k, v)| (k.to_string(), v.iter().map(|s| s.to_string()).collect()))
            .collect();
        DataSurface::new(
            attributes,
            BTreeMap::new(),
            serde_json::from_value(endpoint).unwrap(),
        )
    }

    fn single_rule(include: &str, rule: Json) -> AudienceDefinition {
        audience(json!({
            "id": 1,
            "config": {
                "include": include,
                "groups": [{"include": "any", "rules": [rule]}],
            }
        }))
    }

    #[test]
    fn test_equals_on_attribute() {
        let def = single_rule(
            "any",
            json!({"field": "attributes.country", "operator": "=", "value": "US", "type": "string"}),
        );

        assert!(evaluate_audience(&def, &surface(&[("country", &["US"])], json!({}))));
        assert!(!evaluate_audience(&def, &surface(&[("country", &["CA"])], json!({}))));
    }

    #[test]
    fn test_gte_reads_endpoint_metric() {
        let def = single_rule(
            "any",
            json!({"field": "metrics.pageViews", "operator": "gte", "value": 3, "type": "number"}),
        );

        let five = surface(&[], json!({"Metrics": {"pageViews": 5}}));
        let two = surface(&[], json!({"Metrics": {"pageViews": 2}}));
        assert!(evaluate_audience(&def, &five));
        assert!(!evaluate_audience(&def, &two));
    }

    #[test]
    fn test_all_with_failing_group_never_matches() {
        let def = audience(json!({
            "id": 7,
            "config": {
                "include": "all",
                "groups": [
                    {"include": "any", "rules": [
                        {"field": "attributes.country", "operator": "=", "value": "US", "type": "string"}
                    ]},
                    {"include": "all", "rules": [
                        {"field": "attributes.country", "operator": "=", "value": "nowhere", "type": "string"}
                    ]},
                ],
            }
        }));

        assert!(!evaluate_audience(&def, &surface(&[("country", &["US"])], json!({}))));
    }

    #[test]
    fn test_contains_matches_any_value() {
        let def = single_rule(
            "any",
            json!({"field": "attributes.colors", "operator": "*=", "value": "red", "type": "string"}),
        );

        assert!(evaluate_audience(&def, &surface(&[("colors", &["blue", "red"])], json!({}))));
    }

    #[test]
    fn test_starts_with_and_not_contains() {
        let prefix = single_rule(
            "any",
            json!({"field": "attributes.path", "operator": "^=", "value": "/blog", "type": "string"}),
        );
        let absent = single_rule(
            "any",
            json!({"field": "attributes.path", "operator": "!*", "value": "shop", "type": "string"}),
        );
        let data = surface(&[("path", &["/blog/post"])], json!({}));

        assert!(evaluate_audience(&prefix, &data));
        assert!(evaluate_audience(&absent, &data));
    }

    #[test]
    fn test_unknown_field_is_null() {
        let equals_null = single_rule(
            "any",
            json!({"field": "attributes.missing", "operator": "=", "value": null}),
        );
        let contains = single_rule(
            "any",
            json!({"field": "attributes.missing", "operator": "*=", "value": "null"}),
        );
        let not_equals = single_rule(
            "any",
            json!({"field": "nowhere.at.all", "operator": "!=", "value": "x"}),
        );
        let data = surface(&[], json!({}));

        assert!(evaluate_audience(&equals_null, &data));
        // Null field values stop before string operators.
        assert!(!evaluate_audience(&contains, &data));
        assert!(evaluate_audience(&not_equals, &data));
    }

    #[test]
    fn test_null_operand_skips_numeric_operators() {
        let def = single_rule(
            "any",
            json!({"field": "metrics.pageViews", "operator": "gte", "value": null}),
        );
        let data = surface(&[], json!({"Metrics": {"pageViews": 5}}));

        assert!(!evaluate_audience(&def, &data));
    }

    #[test]
    fn test_endpoint_path() {
        let def = single_rule(
            "any",
            json!({"field": "endpoint.Location.Country", "operator": "=", "value": "GB"}),
        );
        let data = surface(&[], json!({"Location": {"Country": "GB"}}));

        assert!(evaluate_audience(&def, &data));
    }

    #[test]
    fn test_numeric_string_equality() {
        let def = single_rule(
            "any",
            json!({"field": "attributes.age", "operator": "=", "value": 30, "type": "number"}),
        );

        assert!(evaluate_audience(&def, &surface(&[("age", &["30"])], json!({}))));
    }

    #[test]
    fn test_empty_field_rules_are_skipped() {
        let def = audience(json!({
            "id": 2,
            "config": {"include": "all", "groups": [
                {"include": "all", "rules": [
                    {"field": "", "operator": "=", "value": "anything"}
                ]}
            ]}
        }));

        assert!(evaluate_audience(&def, &surface(&[], json!({}))));
    }

    #[test]
    fn test_evaluation_is_independent_per_audience() {
        let us = single_rule(
            "any",
            json!({"field": "attributes.country", "operator": "=", "value": "US"}),
        );
        let mut ca = us.clone();
        ca.id = 2;
        ca.config.groups[0].rules[0].value = json!("CA");

        let data = surface(&[("country", &["US"])], json!({}));
        let forward = evaluate_audiences(&[us.clone(), ca.clone()], &data);
        let reverse = evaluate_audiences(&[ca, us], &data);

        assert_eq!(forward, vec![1]);
        assert_eq!(reverse, vec![1]);
    }

    #[test]
    fn test_audience_set_sorted_comparison() {
        let mut set = AudienceSet::default();

        assert_eq!(set.replace(vec![3, 1]), Some(vec![1, 3]));
        assert_eq!(set.replace(vec![1, 3]), None);
        assert_eq!(set.replace(vec![3, 1]), None);
        assert_eq!(set.replace(vec![]), Some(vec![]));
        assert!(set.ids().is_empty());
    }
}
