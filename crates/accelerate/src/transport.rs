//! HTTP transport for delivering event batches.

use crate::config::{Config, Delivery};
use crate::signing::{self, Credentials, SigningRequest};
use crate::types::{BeaconPayload, EventsBatch, PutEventsResponse};
use crate::Error;
use chrono::Utc;
use tracing::{debug, warn};

/// Service name used in the signing scope.
const SIGNING_SERVICE: &str = "mobiletargeting";

#[derive(Debug)]
enum Target {
    Beacon {
        url: String,
    },
    Signed {
        url: String,
        host: String,
        path: String,
        credentials: Credentials,
    },
}

/// HTTP transport for the ingest API.
#[derive(Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
    target: Target,
    application_id: String,
    region: String,
}

impl HttpTransport {
    /// Create a new HTTP transport.
    pub fn new(config: &Config) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;

        let target = match config.delivery() {
            Delivery::Beacon { url } => {
                url::Url::parse(url)
                    .map_err(|e| Error::Config(format!("invalid beacon_url {}: {}", url, e)))?;
                Target::Beacon { url: url.clone() }
            }
            Delivery::Signed {
                api_host,
                credentials,
            } => {
                let base = url::Url::parse(api_host)
                    .map_err(|e| Error::Config(format!("invalid api_host {}: {}", api_host, e)))?;
                let host = match (base.host_str(), base.port()) {
                    (Some(host), Some(port)) => format!("{}:{}", host, port),
                    (Some(host), None) => host.to_string(),
                    (None, _) => return Err(Error::Config(format!("api_host {} has no host", api_host))),
                };
                let path = format!("/v1/apps/{}/events", config.application_id());
                Target::Signed {
                    url: format!("{}{}", api_host.trim_end_matches('/'), path),
                    host,
                    path,
                    credentials: credentials.clone(),
                }
            }
        };

        Ok(Self {
            client,
            target,
            application_id: config.application_id().to_string(),
            region: config.region().to_string(),
        })
    }

    /// Beacon delivery never reports failures to the caller.
    pub fn is_beacon(&self) -> bool {
        matches!(self.target, Target::Beacon { .. })
    }

    /// Send a batch to the ingest API.
    pub async fn send(&self, batch: &EventsBatch) -> Result<(), Error> {
        match &self.target {
            Target::Beacon { url } => self.send_beacon(url, batch).await,
            Target::Signed {
                url,
                host,
                path,
                credentials,
            } => self.send_signed(url, host, path, credentials, batch).await,
        }
    }

    async fn send_beacon(&self, url: &str, batch: &EventsBatch) -> Result<(), Error> {
        debug!(
            endpoint = %url,
            event_count = batch.event_count(),
            "sending beacon"
        );

        let payload = BeaconPayload {
            application_id: &self.application_id,
            region: &self.region,
            events: batch,
        };

        let response = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .json(&payload)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_else(|_| "Unknown error".into());
            return Err(Error::Transport {
                status: status.as_u16(),
                body,
            });
        }

        Ok(())
    }

    async fn send_signed(
        &self,
        url: &str,
        host: &str,
        path: &str,
        credentials: &Credentials,
        batch: &EventsBatch,
    ) -> Result<(), Error> {
        debug!(
            endpoint = %url,
            event_count = batch.event_count(),
            "sending events"
        );

        let body = serde_json::to_vec(batch)?;
        let headers = signing::sign(
            credentials,
            &SigningRequest {
                host,
                path,
                body: &body,
                region: &self.region,
                service: SIGNING_SERVICE,
            },
            Utc::now(),
        );

        let mut request = self.client.post(url).body(body);
        for (name, value) in headers {
            request = request.header(name, value);
        }
        let response = request.send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_else(|_| "Unknown error".into());
            warn!(status = %status, body = %body, "API request failed");
            return Err(Error::Transport {
                status: status.as_u16(),
                body,
            });
        }

        let result = response.json::<PutEventsResponse>().await?;

        for (user_id, item) in &result.results {
            for (event_id, status) in &item.events_item_response {
                if !(200..300).contains(&status.status_code) {
                    warn!(
                        user_id = %user_id,
                        event_id = %event_id,
                        status = status.status_code,
                        message = status.message.as_deref().unwrap_or(""),
                        "event rejected"
                    );
                }
            }
            if let Some(status) = &item.endpoint_item_response {
                if !(200..300).contains(&status.status_code) {
                    warn!(
                        user_id = %user_id,
                        status = status.status_code,
                        message = status.message.as_deref().unwrap_or(""),
                        "endpoint update rejected"
                    );
                }
            }
        }

        debug!("events sent successfully");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AnalyticsBuilder;

    #[test]
    fn test_signed_endpoint_construction() {
        let config = AnalyticsBuilder::new("app-123")
            .credentials(Credentials::new("AKID", "secret"))
            .api_host("https://example.com:8443/")
            .build_config()
            .unwrap();

        let transport = HttpTransport::new(&config).unwrap();

        assert!(!transport.is_beacon());
        match &transport.target {
            Target::Signed { url, host, path, .. } => {
                assert_eq!(url, "https://example.com:8443/v1/apps/app-123/events");
                assert_eq!(host, "example.com:8443");
                assert_eq!(path, "/v1/apps/app-123/events");
            }
            Target::Beacon { .. } => panic!("expected signed target"),
        }
    }

    #[test]
    fn test_default_regional_host() {
        let config = AnalyticsBuilder::new("app-123")
            .region("eu-central-1")
            .credentials(Credentials::new("AKID", "secret"))
            .build_config()
            .unwrap();

        let transport = HttpTransport::new(&config).unwrap();

        match &transport.target {
            Target::Signed { host, .. } => assert_eq!(host, "pinpoint.eu-central-1.amazonaws.com"),
            Target::Beacon { .. } => panic!("expected signed target"),
        }
    }

    #[test]
    fn test_invalid_beacon_url_rejected() {
        let config = AnalyticsBuilder::new("app-123")
            .beacon_url("not a url")
            .build_config()
            .unwrap();

        assert!(matches!(HttpTransport::new(&config), Err(Error::Config(_))));
    }
}
