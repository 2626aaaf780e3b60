//! HTTP artifact renderer.
//!
//! Regenerates an artifact by requesting the logical path from the origin
//! host with a revalidation header. The origin renders and re-stores the
//! artifact itself; all this client needs back is a success status.

use async_trait::async_trait;
use reqwest::StatusCode;
use url::Url;

use crate::application::regen::{ArtifactRenderer, RegeneratedArtifact, RenderError};
use crate::config::RegenerationSettings;

use super::error::InfraError;

const REVALIDATE_HEADER: &str = "x-refolo-revalidate";

pub struct HttpRenderer {
    client: reqwest::Client,
    origin_scheme: String,
}

impl HttpRenderer {
    pub fn new(settings: &RegenerationSettings) -> Result<Self, InfraError> {
        let client = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .build()
            .map_err(|err| InfraError::http_client(err.to_string()))?;
        Ok(Self {
            client,
            origin_scheme: settings.origin_scheme.clone(),
        })
    }

    fn origin_url(&self, host: &str, path: &str) -> Result<Url, RenderError> {
        let base = Url::parse(&format!("{}://{host}", self.origin_scheme)).map_err(|err| {
            RenderError::Rejected {
                reason: format!("invalid origin host `{host}`: {err}"),
            }
        })?;
        base.join(path).map_err(|err| RenderError::Rejected {
            reason: format!("invalid path `{path}`: {err}"),
        })
    }
}

#[async_trait]
impl ArtifactRenderer for HttpRenderer {
    async fn regenerate(
        &self,
        host: &str,
        path: &str,
    ) -> Result<RegeneratedArtifact, RenderError> {
        let url = self.origin_url(host, path)?;

        let response = self
            .client
            .get(url)
            .header(REVALIDATE_HEADER, "1")
            .send()
            .await
            .map_err(|err| RenderError::Transport(err.to_string()))?;

        let status = response.status();
        if status.is_success() {
            let bytes = response
                .bytes()
                .await
                .map_err(|err| RenderError::Transport(err.to_string()))?;
            return Ok(RegeneratedArtifact {
                status: status.as_u16(),
                bytes: bytes.len() as u64,
            });
        }

        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(RenderError::OriginUnavailable {
                status: status.as_u16(),
            });
        }

        Err(RenderError::Rejected {
            reason: format!("origin answered {status} for `{path}`"),
        })
    }
}
