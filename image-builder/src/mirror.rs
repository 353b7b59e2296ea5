//! Package source configuration.

use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{ProvisionError, ProvisionResult};

/// Location of the installer config file inside the environment
pub const MIRROR_CONFIG_PATH: &str = "/etc/pip.conf";

/// Variable the installer reads to locate its config file
pub const MIRROR_CONFIG_VAR: &str = "PIP_CONFIG_FILE";

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Alternate network location packages are fetched from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorConfig {
    url: String,
}

impl MirrorConfig {
    pub fn new(url: &str) -> ProvisionResult<Self> {
        let parsed = Url::parse(url).map_err(|e| {
            ProvisionError::InvalidConfig(format!("mirror url '{}' is invalid: {}", url, e))
        })?;

        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ProvisionError::InvalidConfig(format!(
                "mirror url '{}' must use http or https",
                url
            )));
        }
        if parsed.host_str().is_none_or(str::is_empty) {
            return Err(ProvisionError::InvalidConfig(format!(
                "mirror url '{}' has no host",
                url
            )));
        }

        Ok(Self {
            url: url.to_string(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Host part of the URL
    pub fn host(&self) -> String {
        Url::parse(&self.url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_default()
    }

    /// Installer config file contents that redirect every fetch to this mirror
    pub fn render_config(&self) -> String {
        format!("[global]\nindex-url = {}\n", self.url)
    }

    /// Shell command that points the installer at this mirror
    pub fn config_command(&self, installer: &str) -> String {
        format!("{} config set global.index-url {}", installer, self.url)
    }

    /// Check the mirror answers HTTP requests
    pub async fn probe(&self) -> ProvisionResult<()> {
        self.probe_with_timeout(PROBE_TIMEOUT).await
    }

    pub async fn probe_with_timeout(&self, timeout: Duration) -> ProvisionResult<()> {
        let unreachable = |reason: String| ProvisionError::MirrorUnreachable {
            url: self.url.clone(),
            reason,
            exit_code: None,
        };

        debug!("Probing mirror {}", self.url);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| unreachable(e.to_string()))?;

        let response = client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| unreachable(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() || status == reqwest::StatusCode::FORBIDDEN {
            return Err(unreachable(format!("mirror answered with status {}", status)));
        }

        info!("Mirror {} reachable ({})", self.url, status);
        Ok(())
    }
}
