//! Client configuration.

use crate::audience::AudienceDefinition;
use crate::consent::{read_consent_cookies, ConsentGate};
use crate::endpoint::EndpointPatch;
use crate::notify::{Callback, Notification, NotificationKind, PendingListeners};
use crate::page::PageContext;
use crate::storage::{MemoryStorage, Storage};
use crate::signing::Credentials;
use crate::value::{Attributes, Metrics, Value};
use std::sync::Arc;
use std::time::Duration;

/// Default region.
pub const DEFAULT_REGION: &str = "us-east-1";

/// Default debounce window between the last `record` and the flush.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(5);

/// Default request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default consent cookie prefix.
pub const DEFAULT_CONSENT_COOKIE_PREFIX: &str = "wp_consent";

/// How batches reach the ingest API.
#[derive(Debug, Clone)]
pub enum Delivery {
    /// Unauthenticated fire-and-forget POST to a collector URL.
    Beacon { url: String },
    /// SigV4 signed `PutEvents` request.
    Signed {
        api_host: String,
        credentials: Credentials,
    },
}

/// Key/value stores used by the client.
#[derive(Clone)]
pub(crate) struct Stores {
    /// Durable per-profile store.
    pub(crate) local: Arc<dyn Storage>,
    /// Per-browser-session store.
    pub(crate) session: Arc<dyn Storage>,
}

impl std::fmt::Debug for Stores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stores").finish_non_exhaustive()
    }
}

/// Analytics client configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub(crate) application_id: String,
    pub(crate) region: String,
    pub(crate) delivery: Delivery,
    pub(crate) debounce: Duration,
    pub(crate) timeout: Duration,
    pub(crate) app_package_name: String,
    pub(crate) app_title: String,
    pub(crate) app_version: String,
    pub(crate) consent_cookie_prefix: Option<String>,
    pub(crate) consent_force_allowed: Vec<String>,
    pub(crate) audiences: Vec<AudienceDefinition>,
    pub(crate) default_endpoint: EndpointPatch,
    pub(crate) exclude_bots: bool,
    pub(crate) page: PageContext,
    pub(crate) attributes: Attributes,
    pub(crate) metrics: Metrics,
    pub(crate) listeners: PendingListeners,
    pub(crate) stores: Stores,
}

impl Config {
    pub fn application_id(&self) -> &str {
        &self.application_id
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn delivery(&self) -> &Delivery {
        &self.delivery
    }

    /// Get the debounce window.
    pub fn debounce(&self) -> Duration {
        self.debounce
    }

    /// Get the request timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn app_package_name(&self) -> &str {
        &self.app_package_name
    }

    pub fn app_title(&self) -> &str {
        &self.app_title
    }

    pub fn app_version(&self) -> &str {
        &self.app_version
    }

    pub fn audiences(&self) -> &[AudienceDefinition] {
        &self.audiences
    }

    pub fn exclude_bots(&self) -> bool {
        self.exclude_bots
    }

    pub fn page(&self) -> &PageContext {
        &self.page
    }

    /// Consent gate in its initial state, read from the page cookies.
    pub(crate) fn consent_gate(&self) -> ConsentGate {
        match &self.consent_cookie_prefix {
            Some(prefix) => ConsentGate::new(read_consent_cookies(
                self.page.cookie_str(),
                prefix,
                &self.consent_force_allowed,
            )),
            None => ConsentGate::disabled(),
        }
    }
}

/// Builder for the analytics client.
pub struct AnalyticsBuilder {
    application_id: String,
    region: Option<String>,
    beacon_url: Option<String>,
    api_host: Option<String>,
    credentials: Option<Credentials>,
    debounce: Option<Duration>,
    timeout: Option<Duration>,
    app_package_name: Option<String>,
    app_title: Option<String>,
    app_version: Option<String>,
    consent_cookie_prefix: Option<String>,
    consent_force_allowed: Vec<String>,
    audiences: Vec<AudienceDefinition>,
    default_endpoint: EndpointPatch,
    exclude_bots: bool,
    page: PageContext,
    attributes: Attributes,
    metrics: Metrics,
    listeners: PendingListeners,
    storage: Option<Arc<dyn Storage>>,
    session_storage: Option<Arc<dyn Storage>>,
}

impl AnalyticsBuilder {
    /// Create a new builder for the given application ID.
    pub fn new(application_id: impl Into<String>) -> Self {
        Self {
            application_id: application_id.into(),
            region: None,
            beacon_url: None,
            api_host: None,
            credentials: None,
            debounce: None,
            timeout: None,
            app_package_name: None,
            app_title: None,
            app_version: None,
            consent_cookie_prefix: None,
            consent_force_allowed: Vec::new(),
            audiences: Vec::new(),
            default_endpoint: EndpointPatch::default(),
            exclude_bots: false,
            page: PageContext::default(),
            attributes: Attributes::new(),
            metrics: Metrics::new(),
            listeners: PendingListeners::default(),
            storage: None,
            session_storage: None,
        }
    }

    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Deliver batches as beacons to `url`.
    pub fn beacon_url(mut self, url: impl Into<String>) -> Self {
        self.beacon_url = Some(url.into());
        self
    }

    /// Deliver batches as signed requests with `credentials`.
    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Override the signed API host (defaults to the regional endpoint).
    pub fn api_host(mut self, host: impl Into<String>) -> Self {
        self.api_host = Some(host.into());
        self
    }

    /// Set the debounce window.
    pub fn debounce(mut self, debounce: Duration) -> Self {
        self.debounce = Some(debounce);
        self
    }

    /// Set the request timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn app_package_name(mut self, name: impl Into<String>) -> Self {
        self.app_package_name = Some(name.into());
        self
    }

    pub fn app_title(mut self, title: impl Into<String>) -> Self {
        self.app_title = Some(title.into());
        self
    }

    pub fn app_version(mut self, version: impl Into<String>) -> Self {
        self.app_version = Some(version.into());
        self
    }

    /// Require consent, read from cookies named `<prefix>_<category>`.
    pub fn consent_cookie_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.consent_cookie_prefix = Some(prefix.into());
        self
    }

    /// Require consent using the default cookie prefix.
    pub fn require_consent(self) -> Self {
        self.consent_cookie_prefix(DEFAULT_CONSENT_COOKIE_PREFIX)
    }

    /// Treat `category` as granted regardless of cookies.
    pub fn force_allow_consent(mut self, category: impl Into<String>) -> Self {
        self.consent_force_allowed.push(category.into());
        self
    }

    pub fn audiences(mut self, audiences: Vec<AudienceDefinition>) -> Self {
        self.audiences = audiences;
        self
    }

    /// Endpoint data merged when tracking starts.
    pub fn default_endpoint(mut self, patch: EndpointPatch) -> Self {
        self.default_endpoint = patch;
        self
    }

    /// Drop events from bot user agents.
    pub fn exclude_bots(mut self, exclude: bool) -> Self {
        self.exclude_bots = exclude;
        self
    }

    pub fn page(mut self, page: PageContext) -> Self {
        self.page = page;
        self
    }

    /// Register a custom attribute recorded on every event.
    pub fn attribute(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Register a custom metric recorded on every event.
    pub fn metric(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metrics.insert(name.into(), value.into());
        self
    }

    /// Subscribe before the client starts, to observe `Loaded` and `Ready`.
    pub fn on<F>(mut self, kind: NotificationKind, callback: F) -> Self
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        let callback: Callback = Arc::new(callback);
        self.listeners.0.push((kind, callback));
        self
    }

    /// Durable store for the endpoint, identity and test variants.
    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Store scoped to the browser session, holding the session ID.
    pub fn session_storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.session_storage = Some(storage);
        self
    }

    /// Build the configuration.
    pub(crate) fn build_config(self) -> Result<Config, crate::Error> {
        if self.application_id.is_empty() {
            return Err(crate::Error::Config("application_id cannot be empty".into()));
        }
        if self.debounce == Some(Duration::ZERO) {
            return Err(crate::Error::Config("debounce must be greater than zero".into()));
        }

        let region = self.region.unwrap_or_else(|| DEFAULT_REGION.into());
        let delivery = match (self.credentials, self.beacon_url) {
            (Some(credentials), _) => Delivery::Signed {
                api_host: self
                    .api_host
                    .unwrap_or_else(|| format!("https://pinpoint.{}.amazonaws.com", region)),
                credentials,
            },
            (None, Some(url)) => Delivery::Beacon { url },
            (None, None) => {
                return Err(crate::Error::Config(
                    "either beacon_url or credentials must be set".into(),
                ))
            }
        };

        Ok(Config {
            application_id: self.application_id,
            region,
            delivery,
            debounce: self.debounce.unwrap_or(DEFAULT_DEBOUNCE),
            timeout: self.timeout.unwrap_or(DEFAULT_TIMEOUT),
            app_package_name: self.app_package_name.unwrap_or_default(),
            app_title: self.app_title.unwrap_or_default(),
            app_version: self.app_version.unwrap_or_default(),
            consent_cookie_prefix: self.consent_cookie_prefix,
            consent_force_allowed: self.consent_force_allowed,
            audiences: self.audiences,
            default_endpoint: self.default_endpoint,
            exclude_bots: self.exclude_bots,
            page: self.page,
            attributes: self.attributes,
            metrics: self.metrics,
            listeners: self.listeners,
            stores: Stores {
                local: self
                    .storage
                    .unwrap_or_else(|| Arc::new(MemoryStorage::new())),
                session: self
                    .session_storage
                    .unwrap_or_else(|| Arc::new(MemoryStorage::new())),
            },
        })
    }
}
