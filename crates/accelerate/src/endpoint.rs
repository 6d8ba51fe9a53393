//! Endpoint merging.
//!
//! An endpoint update is the result of layering, in order: device defaults,
//! the previously persisted endpoint, and the caller's patch. Objects merge
//! key by key; arrays are replaced by the newest non-empty array rather than
//! concatenated, so repeated merges never grow multi-valued attributes. The
//! referrer and UTM history are the two deliberate exceptions and are
//! appended to explicitly after the merge.

use crate::device::DeviceInfo;
use crate::error::Result;
use crate::page::PageContext;
use crate::types::{Demographic, Endpoint, Location};
use crate::value::{
    attribute_array, metric_value, prepare_endpoint_attributes, prepare_metrics, Attributes,
    Metrics, Value,
};
use serde_json::{json, Map, Value as Json};

/// A partial endpoint update.
#[derive(Debug, Clone, Default)]
pub struct EndpointPatch {
    attributes: Attributes,
    metrics: Metrics,
    user_attributes: Attributes,
    user_id: Option<String>,
    fields: Map<String, Json>,
}

impl EndpointPatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a patch from endpoint-shaped JSON, e.g. host supplied defaults.
    /// Non-object input yields an empty patch.
    pub fn from_json(value: Json) -> Self {
        match value {
            Json::Object(fields) => Self {
                fields,
                ..Self::default()
            },
            _ => Self::default(),
        }
    }

    /// Set an endpoint attribute.
    pub fn attribute(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Set an endpoint metric.
    pub fn metric(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metrics.insert(name.into(), value.into());
        self
    }

    pub fn user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn user_attribute(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.user_attributes.insert(name.into(), value.into());
        self
    }

    pub fn demographic(self, demographic: Demographic) -> Self {
        self.field("Demographic", serde_json::to_value(demographic).unwrap_or(Json::Null))
    }

    pub fn location(self, location: Location) -> Self {
        self.field("Location", serde_json::to_value(location).unwrap_or(Json::Null))
    }

    /// Set any other top-level endpoint field.
    pub fn field(mut self, key: impl Into<String>, value: Json) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
            && self.metrics.is_empty()
            && self.user_attributes.is_empty()
            && self.user_id.is_none()
            && self.fields.is_empty()
    }

    /// Resolve deferred values and render the patch as endpoint JSON.
    pub async fn resolve(&self) -> Result<Json> {
        let mut resolved = Json::Object(self.fields.clone());

        let mut typed = Map::new();
        if !self.attributes.is_empty() {
            typed.insert(
                "Attributes".into(),
                serde_json::to_value(prepare_endpoint_attributes(&self.attributes).await?)?,
            );
        }
        if !self.metrics.is_empty() {
            typed.insert(
                "Metrics".into(),
                serde_json::to_value(prepare_metrics(&self.metrics).await?)?,
            );
        }
        let mut user = Map::new();
        if let Some(user_id) = &self.user_id {
            user.insert("UserId".into(), Json::String(user_id.clone()));
        }
        if !self.user_attributes.is_empty() {
            user.insert(
                "UserAttributes".into(),
                serde_json::to_value(prepare_endpoint_attributes(&self.user_attributes).await?)?,
            );
        }
        if !user.is_empty() {
            typed.insert("User".into(), Json::Object(user));
        }

        deep_merge(&mut resolved, &Json::Object(typed));
        Ok(resolved)
    }
}

/// Merge `source` into `target`. Later values win; arrays are replaced by
/// the last non-empty array.
pub fn deep_merge(target: &mut Json, source: &Json) {
    match (target, source) {
        (Json::Object(target), Json::Object(source)) => {
            for (key, value) in source {
                match target.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        target.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (target, Json::Array(items)) if items.is_empty() && !target.is_null() => {}
        (target, source) => *target = source.clone(),
    }
}

/// Normalize the attribute and metric maps of endpoint JSON in place.
fn sanitize(endpoint: &mut Json) {
    let Some(object) = endpoint.as_object_mut() else {
        return;
    };
    if let Some(attributes) = object.get_mut("Attributes") {
        sanitize_attributes(attributes);
    }
    match object.get_mut("Metrics") {
        Some(Json::Object(metrics)) => {
            let cleaned: Map<String, Json> = metrics
                .iter()
                .filter_map(|(name, value)| metric_value(value).map(|v| (name.clone(), json!(v))))
                .collect();
            *metrics = cleaned;
        }
        Some(other) => *other = json!({}),
        None => {}
    }
    if let Some(Json::Object(user)) = object.get_mut("User") {
        if let Some(attributes) = user.get_mut("UserAttributes") {
            sanitize_attributes(attributes);
        }
    }
}

fn sanitize_attributes(attributes: &mut Json) {
    match attributes {
        Json::Object(map) => {
            for value in map.values_mut() {
                *value = json!(attribute_array(value));
            }
        }
        other => *other = json!({}),
    }
}

/// Device and locale defaults that seed every merge.
pub fn endpoint_defaults(page: &PageContext, device: &DeviceInfo, app_version: &str) -> Json {
    let mut demographic = Map::new();
    let mut put = |key: &str, value: Option<&str>| {
        if let Some(value) = value {
            demographic.insert(key.into(), json!(value));
        }
    };
    put("Locale", page.locale_str());
    put("Timezone", page.timezone_str());
    put("AppVersion", Some(app_version).filter(|v| !v.is_empty()));
    put("Make", device.browser.as_deref());
    put("Model", device.browser.as_deref());
    put("ModelVersion", device.browser_version.as_deref());
    put("Platform", device.os.as_deref());
    put("PlatformVersion", device.os_version.as_deref());

    let mut attributes = Map::new();
    if let Some(vendor) = &device.vendor {
        attributes.insert("DeviceMake".into(), json!([vendor]));
    }
    if let Some(model) = &device.model {
        attributes.insert("DeviceModel".into(), json!([model]));
    }
    if !page.user_agent_str().is_empty() {
        attributes.insert("DeviceType".into(), json!([device.device_type]));
    }

    json!({
        "Demographic": demographic,
        "Attributes": attributes,
    })
}

/// Per-merge facts that do not come from the endpoint itself.
#[derive(Debug, Clone, Copy)]
pub struct MergeContext<'a> {
    /// Browser session identifier.
    pub session_id: &'a str,
    pub page_session: &'a str,
    pub page: &'a PageContext,
    /// Whether full (non-anonymous) statistics consent was granted.
    pub full_consent: bool,
}

/// Layer `defaults`, `prior` and `patch`, then apply counters, referrer and
/// UTM history and consent redaction.
pub fn merge_endpoint(
    defaults: Json,
    prior: Option<Json>,
    patch: &Json,
    context: MergeContext<'_>,
) -> Result<Endpoint> {
    let mut merged = defaults;
    if let Some(prior @ Json::Object(_)) = prior {
        deep_merge(&mut merged, &prior);
    }
    deep_merge(&mut merged, patch);
    sanitize(&mut merged);

    let mut endpoint: Endpoint = serde_json::from_value(merged)?;
    update_counters(&mut endpoint, context.session_id, context.page_session);
    track_referer(&mut endpoint, context.page);
    track_utm(&mut endpoint, context.page);

    if !context.full_consent {
        endpoint.user = None;
    }

    Ok(endpoint)
}

fn update_counters(endpoint: &mut Endpoint, session_id: &str, page_session: &str) {
    let last_session = endpoint.attribute("lastSession").map(String::from);
    let last_page_session = endpoint.attribute("lastPageSession").map(String::from);

    let Some(last_session) = last_session else {
        endpoint
            .attributes
            .insert("lastSession".into(), vec![session_id.to_string()]);
        endpoint
            .attributes
            .insert("lastPageSession".into(), vec![page_session.to_string()]);
        endpoint.metrics.insert("sessions".into(), 1.0);
        endpoint.metrics.insert("pageViews".into(), 1.0);
        return;
    };

    if last_session != session_id {
        endpoint
            .attributes
            .insert("lastSession".into(), vec![session_id.to_string()]);
        *endpoint.metrics.entry("sessions".into()).or_insert(0.0) += 1.0;
    }
    if last_page_session.as_deref() != Some(page_session) {
        endpoint
            .attributes
            .insert("lastPageSession".into(), vec![page_session.to_string()]);
        *endpoint.metrics.entry("pageViews".into()).or_insert(0.0) += 1.0;
    }
}

fn push_distinct(endpoint: &mut Endpoint, key: &str, value: &str) {
    let values = endpoint.attributes.entry(key.to_string()).or_default();
    if !values.iter().any(|v| v == value) {
        values.push(value.to_string());
    }
}

fn track_referer(endpoint: &mut Endpoint, page: &PageContext) {
    if !page.has_external_referrer() {
        return;
    }
    let Some(referrer) = page.referrer_str() else {
        return;
    };
    endpoint
        .attributes
        .entry("initialReferer".into())
        .or_insert_with(|| vec![referrer.to_string()]);
    push_distinct(endpoint, "referer", referrer);
}

fn track_utm(endpoint: &mut Endpoint, page: &PageContext) {
    for (param, value) in page.query_pairs() {
        if !param.starts_with("utm_") {
            continue;
        }
        endpoint
            .attributes
            .entry(format!("initial_{}", param))
            .or_insert_with(|| vec![value.clone()]);
        push_distinct(endpoint, &param, &value);
    }
}
