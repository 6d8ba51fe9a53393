//! Client-side analytics and audience segmentation.
//!
//! Records page events, keeps a persisted visitor profile (the endpoint)
//! and evaluates audience rules against it, delivering batched events to a
//! Pinpoint-compatible ingest API.
//!
//! # Example
//!
//! ```rust,ignore
//! use accelerate::{Analytics, EndpointPatch, NotificationKind, PageContext};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), accelerate::Error> {
//!     let analytics = Analytics::builder("app-id")
//!         .beacon_url("https://example.com/wp-json/accelerate/v1/collect")
//!         .page(PageContext::new("https://example.com/pricing").title("Pricing"))
//!         .on(NotificationKind::UpdateAudiences, |n| println!("{:?}", n))
//!         .build()
//!         .await?;
//!
//!     analytics.record("cta")
//!         .attribute("label", "Start trial")
//!         .endpoint(EndpointPatch::new().attribute("plan", "trial"))
//!         .send()
//!         .await?;
//!
//!     analytics.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod audience;
mod client;
mod config;
mod consent;
mod device;
mod endpoint;
mod error;
mod experiments;
mod notify;
mod page;
mod queue;
mod session;
mod signing;
mod storage;
mod transport;
pub mod types;
mod value;

pub use audience::{AudienceDefinition, DataSurface};
pub use client::{
    Analytics, RecordBuilder, PAGE_VIEW_EVENT, SESSION_START_EVENT, SESSION_STOP_EVENT,
};
pub use config::{
    AnalyticsBuilder, Config, Delivery, DEFAULT_CONSENT_COOKIE_PREFIX, DEFAULT_DEBOUNCE,
    DEFAULT_REGION, DEFAULT_TIMEOUT,
};
pub use consent::{ConsentFlags, ConsentState};
pub use device::DeviceInfo;
pub use endpoint::{deep_merge, EndpointPatch};
pub use error::{Error, Result};
pub use experiments::Variant;
pub use notify::{Notification, NotificationKind, Subscription};
pub use page::{PageContext, ReadyState};
pub use session::{ScrollPosition, Visibility};
pub use signing::Credentials;
pub use storage::{MemoryStorage, Storage};
pub use types::{Demographic, Endpoint, Event, Location, RecordedEvent, User};
pub use value::{BoxError, Value};
