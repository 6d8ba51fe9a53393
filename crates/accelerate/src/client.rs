//! Analytics client implementation.

use crate::audience::{evaluate_audiences, AudienceSet, DataSurface};
use crate::config::{AnalyticsBuilder, Config};
use crate::consent::{ConsentFlags, ConsentGate, ConsentState};
use crate::device::{is_bot, parse_user_agent, DeviceInfo};
use crate::endpoint::{endpoint_defaults, merge_endpoint, EndpointPatch, MergeContext};
use crate::experiments::{TestVariants, Variant};
use crate::notify::{Notification, NotificationKind, Notifier, Subscription};
use crate::page::ReadyState;
use crate::queue::{into_event_map, EventQueue};
use crate::session::{timestamp, ScrollPosition, SessionTracker, Transition, Visibility};
use crate::storage::{endpoint_key, Repository, SESSION_ID_KEY, USER_ID_KEY};
use crate::transport::HttpTransport;
use crate::types::{BatchItem, Endpoint, Event, EventsBatch, RecordedEvent};
use crate::value::{
    prepare_endpoint_attributes, prepare_event_attributes, prepare_metrics, Attributes, Metrics,
    Value,
};
use crate::Error;
use chrono::{DateTime, Datelike, Local, Timelike, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::Value as Json;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Event recorded when the page is first viewed.
pub const PAGE_VIEW_EVENT: &str = "pageView";

/// Event recorded when a foreground sub-session starts.
pub const SESSION_START_EVENT: &str = "_session.start";

/// Event recorded when the page goes to the background.
pub const SESSION_STOP_EVENT: &str = "_session.stop";

/// Analytics client.
///
/// Cheap to clone; every clone shares the same queue, endpoint and session
/// state.
///
/// # Example
///
/// ```rust,no_run
/// use accelerate::{Analytics, PageContext};
///
/// #[tokio::main]
/// async fn main() -> Result<(), accelerate::Error> {
///     let analytics = Analytics::builder("app-id")
///         .beacon_url("https://example.com/wp-json/accelerate/v1/collect")
///         .page(PageContext::new("https://example.com/blog/?utm_source=news"))
///         .build()
///         .await?;
///
///     analytics.record("click")
///         .attribute("button", "subscribe")
///         .send()
///         .await?;
///
///     analytics.shutdown().await?;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Analytics {
    inner: Arc<Inner>,
}

struct Inner {
    config: Config,
    transport: HttpTransport,
    repository: Repository,
    user_id: String,
    session_id: String,
    device: DeviceInfo,
    is_bot: bool,
    queue: EventQueue,
    session: Mutex<SessionTracker>,
    consent: Mutex<ConsentGate>,
    audiences: Mutex<AudienceSet>,
    attributes: RwLock<Attributes>,
    metrics: RwLock<Metrics>,
    notifier: Notifier,
    test_variants: TestVariants,
    is_ready: AtomicBool,
    is_shutdown: AtomicBool,
    dom_ready: AtomicBool,
    initial_events_sent: AtomicBool,
    flush_generation: AtomicU64,
    flush_handle: Mutex<Option<(u64, JoinHandle<()>)>>,
}

impl Analytics {
    /// Create a new builder with the given application ID.
    pub fn builder(application_id: impl Into<String>) -> AnalyticsBuilder {
        AnalyticsBuilder::new(application_id)
    }

    /// Create a new client from config and start tracking if consent allows.
    pub(crate) async fn from_config(config: Config) -> Result<Self, Error> {
        let transport = HttpTransport::new(&config)?;

        let repository = Repository::new(config.stores.local.clone());
        let session_repository = Repository::new(config.stores.session.clone());

        let user_id = load_or_create_id(&repository, USER_ID_KEY)?;
        let session_id = load_or_create_id(&session_repository, SESSION_ID_KEY)?;

        let user_agent = config.page.user_agent_str();
        let device = parse_user_agent(user_agent);
        let bot = is_bot(user_agent);
        let consent = config.consent_gate();
        let session = SessionTracker::new(config.page.visibility, Utc::now());
        let dom_ready = config.page.ready_state != ReadyState::Loading;

        let client = Self {
            inner: Arc::new(Inner {
                attributes: RwLock::new(config.attributes.clone()),
                metrics: RwLock::new(config.metrics.clone()),
                transport,
                test_variants: TestVariants::new(repository.clone()),
                repository,
                user_id,
                session_id,
                device,
                is_bot: bot,
                queue: EventQueue::new(),
                session: Mutex::new(session),
                consent: Mutex::new(consent),
                audiences: Mutex::new(AudienceSet::default()),
                notifier: Notifier::new(),
                is_ready: AtomicBool::new(false),
                is_shutdown: AtomicBool::new(false),
                dom_ready: AtomicBool::new(dom_ready),
                initial_events_sent: AtomicBool::new(false),
                flush_generation: AtomicU64::new(0),
                flush_handle: Mutex::new(None),
                config,
            }),
        };

        for (kind, callback) in client.inner.config.listeners.0.iter().cloned() {
            client.inner.notifier.attach(kind, callback);
        }

        debug!(user_id = %client.inner.user_id, bot, "client loaded");
        client.inner.notifier.dispatch(Notification::Loaded);

        let active = client.inner.consent.lock().is_active();
        if active {
            client.activate().await?;
        } else {
            info!("waiting for statistics consent");
        }

        Ok(client)
    }

    /// Get the client configuration.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Get the number of pending events.
    pub async fn pending_event_count(&self) -> usize {
        self.inner.queue.len().await
    }

    /// Whether consent was resolved and tracking has started.
    pub fn is_ready(&self) -> bool {
        self.inner.is_ready.load(Ordering::SeqCst)
    }

    /// Persistent visitor identifier.
    pub fn user_id(&self) -> &str {
        &self.inner.user_id
    }

    /// Browser session identifier.
    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    /// Identifier of this page view, stable for the life of the client.
    pub fn page_session(&self) -> String {
        self.inner.session.lock().page_session().to_string()
    }

    /// Parsed user agent.
    pub fn device(&self) -> &DeviceInfo {
        &self.inner.device
    }

    /// Whether tracking is still waiting for consent.
    pub fn consent_state(&self) -> ConsentState {
        self.inner.consent.lock().state()
    }

    /// The persisted endpoint, or an empty one before the first merge.
    pub fn endpoint(&self) -> Endpoint {
        self.inner
            .repository
            .get(&endpoint_key(&self.inner.user_id))
            .unwrap_or_default()
    }

    /// Currently matched audience IDs, sorted.
    pub fn audiences(&self) -> Vec<u64> {
        self.inner.audiences.lock().ids().to_vec()
    }

    // ============================================
    // NOTIFICATIONS
    // ============================================

    /// Subscribe to notifications of `kind`.
    pub fn on<F>(&self, kind: NotificationKind, callback: F) -> Subscription
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.inner.notifier.on(kind, callback)
    }

    /// Remove a subscription.
    pub fn off(&self, subscription: Subscription) -> bool {
        self.inner.notifier.off(subscription)
    }

    // ============================================
    // RECORD
    // ============================================

    /// Record an event.
    ///
    /// The event is queued and sent after the debounce window unless
    /// [`RecordBuilder::immediate`] is used.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// # use accelerate::{Analytics, EndpointPatch};
    /// # async fn example(analytics: &Analytics) -> Result<(), accelerate::Error> {
    /// analytics.record("signup")
    ///     .attribute("plan", "pro")
    ///     .metric("price", 49.0)
    ///     .endpoint(EndpointPatch::new().user_attribute("plan", "pro"))
    ///     .send()
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn record(&self, event_type: impl Into<String>) -> RecordBuilder<'_> {
        RecordBuilder {
            client: self,
            event_type: event_type.into(),
            attributes: Attributes::new(),
            metrics: Metrics::new(),
            endpoint: None,
            immediate: false,
            session_stop: None,
        }
    }

    /// Register an attribute recorded on every subsequent event.
    pub fn register_attribute(&self, name: impl Into<String>, value: impl Into<Value>) {
        self.inner.attributes.write().insert(name.into(), value.into());
    }

    /// Register a metric recorded on every subsequent event.
    pub fn register_metric(&self, name: impl Into<String>, value: impl Into<Value>) {
        self.inner.metrics.write().insert(name.into(), value.into());
    }

    // ============================================
    // ENDPOINT
    // ============================================

    /// Merge `patch` into the persisted endpoint and re-run audience matching.
    #[instrument(skip_all)]
    pub async fn merge_endpoint_data(&self, patch: EndpointPatch) -> Result<Endpoint, Error> {
        let resolved = patch.resolve().await?;

        let key = endpoint_key(&self.inner.user_id);
        // Typed read so a mistyped stored field is dropped rather than fatal.
        let prior = self
            .inner
            .repository
            .get::<Endpoint>(&key)
            .map(serde_json::to_value)
            .transpose()?;
        let defaults = endpoint_defaults(
            &self.inner.config.page,
            &self.inner.device,
            self.inner.config.app_version(),
        );
        let page_session = self.page_session();
        let full_consent = self.inner.consent.lock().has_full_consent();

        let endpoint = merge_endpoint(
            defaults,
            prior,
            &resolved,
            MergeContext {
                session_id: &self.inner.session_id,
                page_session: &page_session,
                page: &self.inner.config.page,
                full_consent,
            },
        )?;

        self.inner.repository.set(&key, &endpoint)?;
        debug!(
            sessions = endpoint.metric("sessions").unwrap_or_default(),
            page_views = endpoint.metric("pageViews").unwrap_or_default(),
            "endpoint updated"
        );
        self.inner
            .notifier
            .dispatch(Notification::UpdateEndpoint(endpoint.clone()));

        self.update_audiences().await?;

        Ok(endpoint)
    }

    /// Same as [`Analytics::merge_endpoint_data`].
    pub async fn update_endpoint(&self, patch: EndpointPatch) -> Result<Endpoint, Error> {
        self.merge_endpoint_data(patch).await
    }

    // ============================================
    // AUDIENCES
    // ============================================

    /// Evaluate the configured audiences against current data.
    pub async fn update_audiences(&self) -> Result<(), Error> {
        let data = self.data_surface().await?;
        let ids = evaluate_audiences(self.inner.config.audiences(), &data);
        self.apply_audiences(ids);
        Ok(())
    }

    /// Force the matched audience set.
    pub fn override_audiences(&self, ids: Vec<u64>) {
        self.apply_audiences(ids);
    }

    fn apply_audiences(&self, ids: Vec<u64>) {
        let changed = self.inner.audiences.lock().replace(ids);
        if let Some(ids) = changed {
            debug!(audiences = ?ids, "audiences changed");
            self.inner
                .notifier
                .dispatch(Notification::UpdateAudiences(ids));
        }
    }

    async fn data_surface(&self) -> Result<DataSurface, Error> {
        let registered_attributes = self.inner.attributes.read().clone();
        let registered_metrics = self.inner.metrics.read().clone();

        let mut attributes: BTreeMap<String, Vec<String>> = self
            .builtin_attributes()
            .into_iter()
            .filter(|(_, value)| !value.is_empty())
            .map(|(name, value)| (name, vec![value]))
            .collect();
        attributes.extend(prepare_endpoint_attributes(&registered_attributes).await?);

        let mut metrics = self.builtin_metrics(Utc::now());
        metrics.extend(prepare_metrics(&registered_metrics).await?);

        Ok(DataSurface::new(attributes, metrics, self.endpoint()))
    }

    // ============================================
    // EXPERIMENTS
    // ============================================

    /// Stored variant for an A/B test.
    pub fn test_variant(&self, test_id: &str) -> Option<Variant> {
        self.inner.test_variants.get(test_id)
    }

    /// Persist the variant assigned for an A/B test.
    pub fn set_test_variant(&self, test_id: impl Into<String>, variant: Variant) -> Result<(), Error> {
        self.inner.test_variants.set(test_id, variant)
    }

    // ============================================
    // PAGE SIGNALS
    // ============================================

    /// Report a page visibility change.
    ///
    /// Hiding the page sends `_session.stop` right away. Showing it again
    /// starts a new sub-session and queues `_session.start`.
    pub async fn set_visibility(&self, visibility: Visibility) -> Result<(), Error> {
        let transition = self.inner.session.lock().set_visibility(visibility, Utc::now());
        if !self.is_ready() {
            return Ok(());
        }

        match transition {
            Transition::Stopped {
                duration_ms,
                stopped_at,
            } => {
                let mut builder = self.record(SESSION_STOP_EVENT).immediate();
                builder.session_stop = Some((duration_ms, stopped_at));
                builder.send().await
            }
            Transition::Started => self.record(SESSION_START_EVENT).send().await,
            Transition::Unchanged => Ok(()),
        }
    }

    /// Report the page's scroll position.
    pub fn scrolled(&self, position: ScrollPosition) {
        self.inner.session.lock().scrolled(position);
    }

    /// Report that the document finished loading.
    pub async fn dom_ready(&self) -> Result<(), Error> {
        self.inner.dom_ready.store(true, Ordering::SeqCst);
        if self.is_ready() {
            self.send_initial_events().await?;
        }
        Ok(())
    }

    /// Report a consent change from the host's consent manager.
    pub async fn consent_changed(&self, flags: ConsentFlags) -> Result<(), Error> {
        let activated = self.inner.consent.lock().update(flags);
        if activated {
            info!("statistics consent granted");
            self.activate().await?;
        }
        Ok(())
    }

    // ============================================
    // LIFECYCLE
    // ============================================

    /// Send queued events now, optionally merging `patch` into the endpoint
    /// first.
    ///
    /// Before consent is resolved the flush is rescheduled instead.
    #[instrument(skip(self, patch))]
    pub async fn flush_events(&self, patch: Option<EndpointPatch>) -> Result<(), Error> {
        self.cancel_scheduled_flush();
        self.flush_now(patch).await
    }

    /// Shutdown the client gracefully.
    ///
    /// Stops the debounce timer and flushes remaining events.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<(), Error> {
        if self.inner.is_shutdown.swap(true, Ordering::SeqCst) {
            return Ok(()); // Already shutdown
        }

        info!("shutting down client");

        self.cancel_scheduled_flush();

        if self.is_ready() {
            self.flush_now(None).await?;
        }

        Ok(())
    }

    // ============================================
    // INTERNAL
    // ============================================

    fn ensure_not_shutdown(&self) -> Result<(), Error> {
        if self.inner.is_shutdown.load(Ordering::SeqCst) {
            return Err(Error::Shutdown);
        }
        Ok(())
    }

    async fn activate(&self) -> Result<(), Error> {
        if self.is_ready() {
            return Ok(());
        }

        self.merge_endpoint_data(self.inner.config.default_endpoint.clone())
            .await?;

        if self.inner.is_ready.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(user_id = %self.inner.user_id, "tracking started");
        self.inner.notifier.dispatch(Notification::Ready);

        if self.inner.dom_ready.load(Ordering::SeqCst) {
            self.send_initial_events().await?;
        }
        Ok(())
    }

    async fn send_initial_events(&self) -> Result<(), Error> {
        if self.inner.initial_events_sent.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.record(PAGE_VIEW_EVENT).send().await?;

        let visible = self.inner.session.lock().visibility() == Visibility::Visible;
        if visible {
            self.record(SESSION_START_EVENT).send().await?;
        }
        Ok(())
    }

    fn builtin_attributes(&self) -> BTreeMap<String, String> {
        let mut attributes = self.inner.config.page.attributes();
        let session = self.inner.session.lock();
        attributes.insert("pageSession".into(), session.page_session().to_string());
        attributes.insert("subSessionId".into(), session.sub_session_id().to_string());
        attributes
    }

    fn builtin_metrics(&self, now: DateTime<Utc>) -> BTreeMap<String, f64> {
        let mut metrics = self.inner.session.lock().metrics(now);
        let local = now.with_timezone(&Local);
        metrics.insert("hour".into(), f64::from(local.hour()));
        metrics.insert("day".into(), f64::from(local.weekday().num_days_from_sunday()));
        metrics.insert("month".into(), f64::from(local.month()));
        metrics.insert("year".into(), f64::from(local.year()));
        metrics
    }

    async fn record_event(&self, builder: RecordBuilder<'_>) -> Result<(), Error> {
        self.ensure_not_shutdown()?;

        if self.inner.config.exclude_bots() && self.inner.is_bot {
            debug!(event_type = %builder.event_type, "ignoring event from bot");
            return Ok(());
        }

        let now = Utc::now();

        let mut attributes = self.builtin_attributes();
        let registered_attributes = self.inner.attributes.read().clone();
        attributes.extend(prepare_event_attributes(&registered_attributes).await?);
        attributes.extend(prepare_event_attributes(&builder.attributes).await?);

        let mut metrics = self.builtin_metrics(now);
        let registered_metrics = self.inner.metrics.read().clone();
        metrics.extend(prepare_metrics(&registered_metrics).await?);
        metrics.extend(prepare_metrics(&builder.metrics).await?);

        if let Some(patch) = builder.endpoint {
            self.merge_endpoint_data(patch).await?;
        }

        let mut session = self.inner.session.lock().event_session();
        if let Some((duration_ms, stopped_at)) = builder.session_stop {
            session.duration = Some(duration_ms);
            session.stop_timestamp = Some(timestamp(stopped_at));
        }

        let config = &self.inner.config;
        let recorded = RecordedEvent {
            id: Uuid::new_v4().to_string(),
            event: Event {
                event_type: builder.event_type,
                timestamp: timestamp(now),
                app_package_name: config.app_package_name().to_string(),
                app_title: config.app_title().to_string(),
                app_version_code: config.app_version().to_string(),
                attributes,
                metrics,
                session,
            },
        };

        debug!(event_type = %recorded.event.event_type, event_id = %recorded.id, "event recorded");
        self.inner.queue.enqueue(recorded.clone()).await;
        self.inner.notifier.dispatch(Notification::Record(recorded));

        if builder.immediate {
            return self.flush_events(None).await;
        }

        self.schedule_flush(None);
        Ok(())
    }

    async fn flush_now(&self, patch: Option<EndpointPatch>) -> Result<(), Error> {
        if !self.is_ready() {
            if patch.is_some() || !self.inner.queue.is_empty().await {
                debug!("not ready, rescheduling flush");
                self.schedule_flush(patch);
            }
            return Ok(());
        }

        let has_patch = patch.is_some();
        if let Some(patch) = patch {
            self.merge_endpoint_data(patch).await?;
        }

        let events = self.inner.queue.drain().await;
        if events.is_empty() && !has_patch {
            return Ok(());
        }

        info!(event_count = events.len(), "flushing events");

        let batch = EventsBatch::new(
            self.inner.user_id.clone(),
            BatchItem {
                endpoint: self.endpoint(),
                events: into_event_map(events),
            },
        );

        if self.inner.transport.is_beacon() {
            let client = self.clone();
            tokio::spawn(async move {
                if let Err(e) = client.inner.transport.send(&batch).await {
                    debug!(error = %e, "beacon failed");
                }
            });
            return Ok(());
        }

        if let Err(e) = self.inner.transport.send(&batch).await {
            error!(error = %e, event_count = batch.event_count(), "flush failed, events dropped");
            return Err(e);
        }

        Ok(())
    }

    /// (Re)start the debounce timer.
    fn schedule_flush(&self, patch: Option<EndpointPatch>) {
        let generation = self.inner.flush_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let client = self.clone();
        let debounce = self.inner.config.debounce();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            client.take_scheduled_flush(generation);
            if let Err(e) = client.flush_now(patch).await {
                warn!(error = %e, "scheduled flush failed");
            }
        });

        let previous = self.inner.flush_handle.lock().replace((generation, handle));
        if let Some((_, previous)) = previous {
            previous.abort();
        }
    }

    /// Forget the timer's handle once it fires so it cannot abort itself.
    fn take_scheduled_flush(&self, generation: u64) {
        let mut slot = self.inner.flush_handle.lock();
        if matches!(&*slot, Some((current, _)) if *current == generation) {
            slot.take();
        }
    }

    fn cancel_scheduled_flush(&self) {
        let pending = self.inner.flush_handle.lock().take();
        if let Some((_, handle)) = pending {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for Analytics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Analytics")
            .field("application_id", &self.inner.config.application_id())
            .field("user_id", &self.inner.user_id)
            .field("ready", &self.is_ready())
            .finish_non_exhaustive()
    }
}

fn load_or_create_id(repository: &Repository, key: &str) -> Result<String, Error> {
    if let Some(id) = repository.get::<String>(key).filter(|id| !id.is_empty()) {
        return Ok(id);
    }
    let id = Uuid::new_v4().to_string();
    repository.set(key, &id)?;
    Ok(id)
}

// ============================================
// SENDABLE WRAPPERS
// ============================================

/// Event builder returned by [`Analytics::record`].
pub struct RecordBuilder<'a> {
    client: &'a Analytics,
    event_type: String,
    attributes: Attributes,
    metrics: Metrics,
    endpoint: Option<EndpointPatch>,
    immediate: bool,
    session_stop: Option<(u64, DateTime<Utc>)>,
}

impl<'a> RecordBuilder<'a> {
    /// Add an attribute to this event.
    pub fn attribute(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Add a metric to this event.
    pub fn metric(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metrics.insert(name.into(), value.into());
        self
    }

    /// Merge endpoint data before the event is queued.
    pub fn endpoint(mut self, patch: EndpointPatch) -> Self {
        self.endpoint = Some(patch);
        self
    }

    /// Flush right away instead of waiting for the debounce window.
    pub fn immediate(mut self) -> Self {
        self.immediate = true;
        self
    }

    /// Queue the event.
    pub async fn send(self) -> Result<(), Error> {
        let client = self.client;
        client.record_event(self).await
    }
}

impl AnalyticsBuilder {
    /// Build the client.
    ///
    /// Fires `Loaded` and, when consent already allows tracking, merges the
    /// default endpoint and fires `Ready` before returning.
    pub async fn build(self) -> Result<Analytics, Error> {
        let config = self.build_config()?;
        Analytics::from_config(config).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::PageContext;
    use crate::storage::{MemoryStorage, Storage};
    use crate::value::BoxError;
    use std::time::Duration;

    fn builder() -> AnalyticsBuilder {
        Analytics::builder("app-1")
            .beacon_url("http://127.0.0.1:9/collect")
            .page(PageContext::new("https://example.com/blog/post?utm_source=news").title("Post"))
            .debounce(Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_build_activates_without_consent_integration() {
        let analytics = builder().build().await.unwrap();

        assert!(analytics.is_ready());
        assert_eq!(analytics.consent_state(), ConsentState::Active);
        // pageView and _session.start
        assert_eq!(analytics.pending_event_count().await, 2);

        let endpoint = analytics.endpoint();
        assert_eq!(endpoint.metric("sessions"), Some(1.0));
        assert_eq!(endpoint.metric("pageViews"), Some(1.0));
        assert_eq!(endpoint.attribute("initial_utm_source"), Some("news"));
    }

    #[tokio::test]
    async fn test_identity_persists_across_clients() {
        let local: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let session: Arc<dyn Storage> = Arc::new(MemoryStorage::new());

        let first = builder()
            .storage(local.clone())
            .session_storage(session.clone())
            .build()
            .await
            .unwrap();
        let second = builder()
            .storage(local.clone())
            .session_storage(session)
            .build()
            .await
            .unwrap();
        let new_session = builder()
            .storage(local)
            .build()
            .await
            .unwrap();

        assert_eq!(first.user_id(), second.user_id());
        assert_eq!(first.session_id(), second.session_id());
        assert_ne!(first.page_session(), second.page_session());
        assert_eq!(first.user_id(), new_session.user_id());
        assert_ne!(first.session_id(), new_session.session_id());

        let endpoint = new_session.endpoint();
        assert_eq!(endpoint.metric("sessions"), Some(2.0));
        assert_eq!(endpoint.metric("pageViews"), Some(3.0));
    }

    #[tokio::test]
    async fn test_lifecycle_notifications_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (loaded, ready) = (seen.clone(), seen.clone());

        builder()
            .on(NotificationKind::Loaded, move |n| loaded.lock().push(n.kind()))
            .on(NotificationKind::Ready, move |n| ready.lock().push(n.kind()))
            .build()
            .await
            .unwrap();

        assert_eq!(
            *seen.lock(),
            vec![NotificationKind::Loaded, NotificationKind::Ready]
        );
    }

    #[tokio::test]
    async fn test_blocked_until_consent() {
        let analytics = builder().require_consent().build().await.unwrap();

        assert!(!analytics.is_ready());
        assert_eq!(analytics.pending_event_count().await, 0);
        assert!(analytics.endpoint().attributes.is_empty());

        analytics
            .consent_changed(ConsentFlags {
                statistics: false,
                statistics_anonymous: true,
            })
            .await
            .unwrap();

        assert!(analytics.is_ready());
        assert_eq!(analytics.pending_event_count().await, 2);
    }

    #[tokio::test]
    async fn test_user_redacted_without_full_consent() {
        let analytics = builder()
            .require_consent()
            .force_allow_consent("statistics-anonymous")
            .build()
            .await
            .unwrap();

        let endpoint = analytics
            .merge_endpoint_data(EndpointPatch::new().user_id("u-1"))
            .await
            .unwrap();

        assert!(endpoint.user.is_none());
    }

    #[tokio::test]
    async fn test_full_consent_granted_after_activation_keeps_user() {
        let analytics = builder().require_consent().build().await.unwrap();
        let anonymous = ConsentFlags {
            statistics: false,
            statistics_anonymous: true,
        };

        analytics.consent_changed(anonymous).await.unwrap();
        let endpoint = analytics
            .merge_endpoint_data(EndpointPatch::new().user_id("u-1"))
            .await
            .unwrap();
        assert!(endpoint.user.is_none());

        analytics.consent_changed(ConsentFlags::all()).await.unwrap();
        let endpoint = analytics
            .merge_endpoint_data(EndpointPatch::new().user_id("u-1"))
            .await
            .unwrap();
        assert_eq!(endpoint.user.unwrap().user_id.as_deref(), Some("u-1"));

        // Withdrawing full consent redacts again; tracking stays on.
        analytics.consent_changed(anonymous).await.unwrap();
        let endpoint = analytics
            .merge_endpoint_data(EndpointPatch::new().user_id("u-1"))
            .await
            .unwrap();
        assert!(endpoint.user.is_none());
        assert!(analytics.is_ready());
    }

    #[tokio::test]
    async fn test_mistyped_stored_endpoint_is_discarded() {
        let local = Arc::new(MemoryStorage::new());
        local.set_item(USER_ID_KEY, "\"u1\"".into());
        local.set_item(
            &endpoint_key("u1"),
            r#"{"Demographic":{"AppVersion":2},"Location":{"Latitude":"51.5"},"Metrics":{"sessions":4}}"#.into(),
        );

        let analytics = builder().storage(local).build().await.unwrap();

        assert_eq!(analytics.user_id(), "u1");
        let endpoint = analytics.endpoint();
        assert_eq!(endpoint.metric("sessions"), Some(1.0));
        assert!(endpoint.location.latitude.is_none());
    }

    #[tokio::test]
    async fn test_initial_events_wait_for_dom_ready() {
        let analytics = builder()
            .page(PageContext::new("https://example.com/").ready_state(ReadyState::Loading))
            .build()
            .await
            .unwrap();

        assert!(analytics.is_ready());
        assert_eq!(analytics.pending_event_count().await, 0);

        analytics.dom_ready().await.unwrap();
        analytics.dom_ready().await.unwrap();
        assert_eq!(analytics.pending_event_count().await, 2);
    }

    #[tokio::test]
    async fn test_bot_events_ignored() {
        let analytics = builder()
            .page(PageContext::new("https://example.com/").user_agent("Googlebot/2.1"))
            .exclude_bots(true)
            .build()
            .await
            .unwrap();

        analytics.record("click").send().await.unwrap();
        assert_eq!(analytics.pending_event_count().await, 0);
    }

    #[tokio::test]
    async fn test_record_after_shutdown_fails() {
        let analytics = builder()
            .page(PageContext::new("https://example.com/").ready_state(ReadyState::Loading))
            .build()
            .await
            .unwrap();

        analytics.shutdown().await.unwrap();
        let result = analytics.record("click").send().await;

        assert!(matches!(result, Err(Error::Shutdown)));
    }

    #[tokio::test]
    async fn test_event_carries_builtin_and_registered_values() {
        let analytics = builder()
            .page(
                PageContext::new("https://example.com/blog/post?x=1#top")
                    .title("Post")
                    .ready_state(ReadyState::Loading),
            )
            .attribute("author", "ana")
            .build()
            .await
            .unwrap();
        analytics.register_metric("wordCount", 1200);

        let recorded = Arc::new(Mutex::new(Vec::new()));
        let sink = recorded.clone();
        analytics.on(NotificationKind::Record, move |n| {
            if let Notification::Record(event) = n {
                sink.lock().push(event.clone());
            }
        });

        analytics
            .record("click")
            .attribute("author", "bo")
            .metric("position", 2)
            .send()
            .await
            .unwrap();

        let events = recorded.lock();
        let event = &events[0].event;
        assert_eq!(event.event_type, "click");
        assert_eq!(event.attributes["author"], "bo");
        assert_eq!(event.attributes["path"], "/blog/post");
        assert_eq!(event.attributes["search"], "?x=1");
        assert_eq!(event.attributes["hash"], "#top");
        assert_eq!(event.attributes["title"], "Post");
        assert_eq!(event.attributes["pageSession"], analytics.page_session());
        assert_eq!(event.attributes["subSessionId"], event.session.id);
        assert_eq!(event.metrics["wordCount"], 1200.0);
        assert_eq!(event.metrics["position"], 2.0);
        assert!(event.metrics.contains_key("elapsed"));
        assert!(event.metrics.contains_key("year"));
    }

    #[tokio::test]
    async fn test_failing_resolver_propagates() {
        let analytics = builder().build().await.unwrap();

        let result = analytics
            .record("click")
            .attribute(
                "broken",
                Value::deferred(|| async { Err::<Json, BoxError>("lookup failed".into()) }),
            )
            .send()
            .await;

        assert!(matches!(result, Err(Error::Resolve { name, .. }) if name == "broken"));
    }

    #[tokio::test]
    async fn test_override_audiences_notifies_on_change_only() {
        let analytics = builder().build().await.unwrap();
        let updates = Arc::new(Mutex::new(Vec::new()));
        let sink = updates.clone();
        analytics.on(NotificationKind::UpdateAudiences, move |n| {
            if let Notification::UpdateAudiences(ids) = n {
                sink.lock().push(ids.clone());
            }
        });

        analytics.override_audiences(vec![3, 1]);
        analytics.override_audiences(vec![1, 3]);
        analytics.override_audiences(vec![]);

        assert_eq!(*updates.lock(), vec![vec![1, 3], vec![]]);
        assert!(analytics.audiences().is_empty());
    }

    #[tokio::test]
    async fn test_test_variants_persist() {
        let analytics = builder().build().await.unwrap();

        analytics.set_test_variant("title_7", Variant::Index(2)).unwrap();
        assert_eq!(analytics.test_variant("title_7"), Some(Variant::Index(2)));
        assert_eq!(analytics.test_variant("title_8"), None);
    }
}
