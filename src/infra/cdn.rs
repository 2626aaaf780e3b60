//! HTTP client for the CDN control plane.
//!
//! Submits one invalidation per batch and reports the control plane's
//! lifecycle status back without waiting for completion. The caller
//! reference travels with the request so retried submissions are treated as
//! no-ops upstream.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use url::Url;

use crate::application::purge::{
    CdnClient, CdnError, InvalidationBatch, InvalidationReceipt, InvalidationStatus,
};
use crate::config::CdnSettings;

use super::error::InfraError;

const REGION_HEADER: &str = "x-refolo-region";

pub struct HttpCdnClient {
    client: reqwest::Client,
    endpoint: Url,
    distribution_id: String,
    region: Option<String>,
}

impl HttpCdnClient {
    /// Build a client when the settings name a distribution; `Ok(None)`
    /// means purging is disabled for this deployment, which the purge
    /// consumer degrades around instead of crashing.
    pub fn from_settings(settings: &CdnSettings) -> Result<Option<Self>, InfraError> {
        let Some(distribution_id) = settings.distribution_id.clone() else {
            return Ok(None);
        };
        let Some(endpoint) = settings.endpoint.clone() else {
            return Err(InfraError::configuration(
                "cdn.distribution_id is set but cdn.endpoint is missing",
            ));
        };

        let client = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .build()
            .map_err(|err| InfraError::http_client(err.to_string()))?;

        Ok(Some(Self {
            client,
            endpoint,
            distribution_id,
            region: settings.region.clone(),
        }))
    }

    fn invalidations_url(&self) -> Result<Url, CdnError> {
        self.endpoint
            .join(&format!(
                "distributions/{}/invalidations",
                self.distribution_id
            ))
            .map_err(|err| CdnError::Rejected {
                message: format!("invalid control-plane endpoint: {err}"),
            })
    }
}

#[derive(Debug, Deserialize)]
struct InvalidationResponse {
    #[serde(default)]
    id: String,
    #[serde(default)]
    status: String,
}

fn parse_status(raw: &str) -> InvalidationStatus {
    match raw {
        "completed" => InvalidationStatus::Completed,
        "in_progress" => InvalidationStatus::InProgress,
        _ => InvalidationStatus::Pending,
    }
}

#[async_trait]
impl CdnClient for HttpCdnClient {
    async fn create_invalidation(
        &self,
        batch: &InvalidationBatch,
    ) -> Result<InvalidationReceipt, CdnError> {
        let url = self.invalidations_url()?;
        let paths: Vec<&str> = batch.paths.iter().map(String::as_str).collect();

        let mut request = self.client.post(url).json(&json!({
            "caller_reference": batch.caller_reference,
            "paths": paths,
        }));
        if let Some(region) = &self.region {
            request = request.header(REGION_HEADER, region);
        }

        let response = request
            .send()
            .await
            .map_err(|err| CdnError::Transport(err.to_string()))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(CdnError::Throttled);
        }
        if status.is_server_error() {
            return Err(CdnError::Unavailable {
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(CdnError::Rejected {
                message: format!("control plane answered {status}: {message}"),
            });
        }

        let body: InvalidationResponse = response
            .json()
            .await
            .map_err(|err| CdnError::Transport(err.to_string()))?;

        Ok(InvalidationReceipt {
            id: body.id,
            status: parse_status(&body.status),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn settings(distribution_id: Option<&str>, endpoint: Option<&str>) -> CdnSettings {
        CdnSettings {
            endpoint: endpoint.map(|e| Url::parse(e).expect("valid url")),
            distribution_id: distribution_id.map(String::from),
            region: Some("eu-west-1".to_string()),
            request_timeout: Duration::from_secs(5),
            fragment_suffix: "frag".to_string(),
            data_prefix: "_data".to_string(),
            failure_mode: crate::config::PurgeFailureMode::WholeBatch,
        }
    }

    #[test]
    fn missing_distribution_disables_the_client() {
        let client = HttpCdnClient::from_settings(&settings(None, Some("https://cdn.example/v1/")))
            .expect("settings are valid");
        assert!(client.is_none());
    }

    #[test]
    fn distribution_without_endpoint_is_a_configuration_error() {
        assert!(HttpCdnClient::from_settings(&settings(Some("D123"), None)).is_err());
    }

    #[test]
    fn invalidation_url_is_distribution_scoped() {
        let client = HttpCdnClient::from_settings(&settings(
            Some("D123"),
            Some("https://cdn.example/v1/"),
        ))
        .expect("valid settings")
        .expect("client enabled");
        let url = client.invalidations_url().expect("url joins");
        assert_eq!(
            url.as_str(),
            "https://cdn.example/v1/distributions/D123/invalidations"
        );
    }

    #[test]
    fn statuses_map_conservatively() {
        assert_eq!(parse_status("completed"), InvalidationStatus::Completed);
        assert_eq!(parse_status("in_progress"), InvalidationStatus::InProgress);
        assert_eq!(parse_status("pending"), InvalidationStatus::Pending);
        assert_eq!(parse_status("anything-else"), InvalidationStatus::Pending);
    }
}
