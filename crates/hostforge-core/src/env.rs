//! Host identity discovery from a cloud instance-metadata endpoint.
//!
//! The provider is optional: when it is disabled or unreachable, identity
//! degrades to loopback defaults and provisioning continues.

use crate::error::{HostforgeError, Result};
use crate::runlog::RunLog;
use crate::settings::MetadataSettings;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const LOCALHOST: &str = "127.0.0.1";
pub const UNKNOWN_INSTANCE: &str = "local";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostIdentity {
    pub public_address: String,
    pub instance_id: String,
    /// Provider-assigned DNS name, when the provider exposes one.
    pub public_hostname: Option<String>,
    /// True when no provider answered and the values are defaults.
    pub degraded: bool,
}

impl HostIdentity {
    pub fn localhost() -> Self {
        Self {
            public_address: LOCALHOST.to_string(),
            instance_id: UNKNOWN_INSTANCE.to_string(),
            public_hostname: None,
            degraded: true,
        }
    }
}

pub trait MetadataProvider: Send + Sync {
    fn public_address(&self) -> Result<String>;
    fn instance_id(&self) -> Result<String>;
    fn public_hostname(&self) -> Result<Option<String>> {
        Ok(None)
    }
}

// ---------------------------------------------------------------------------
// Ec2Metadata (IMDSv2)
// ---------------------------------------------------------------------------

/// EC2-style instance metadata over HTTP, using a session token (IMDSv2).
pub struct Ec2Metadata {
    client: reqwest::blocking::Client,
    endpoint: String,
}

impl Ec2Metadata {
    pub fn new(settings: &MetadataSettings) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_millis(settings.timeout_ms))
            .connect_timeout(Duration::from_millis(settings.timeout_ms))
            .build()
            .map_err(|e| HostforgeError::Http(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: settings.endpoint.trim_end_matches('/').to_string(),
        })
    }

    fn token(&self) -> Result<String> {
        let resp = self
            .client
            .put(format!("{}/latest/api/token", self.endpoint))
            .header("X-aws-ec2-metadata-token-ttl-seconds", "300")
            .send()
            .map_err(|e| HostforgeError::Http(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(HostforgeError::Http(format!(
                "HTTP {} from metadata token endpoint",
                resp.status()
            )));
        }
        resp.text().map_err(|e| HostforgeError::Http(e.to_string()))
    }

    fn get(&self, item: &str) -> Result<Option<String>> {
        let token = self.token()?;
        let resp = self
            .client
            .get(format!("{}/latest/meta-data/{item}", self.endpoint))
            .header("X-aws-ec2-metadata-token", token)
            .send()
            .map_err(|e| HostforgeError::Http(e.to_string()))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(HostforgeError::Http(format!(
                "HTTP {} from metadata item {item}",
                resp.status()
            )));
        }
        let body = resp
            .text()
            .map_err(|e| HostforgeError::Http(e.to_string()))?;
        let body = body.trim();
        Ok((!body.is_empty()).then(|| body.to_string()))
    }

    fn require(&self, item: &str) -> Result<String> {
        self.get(item)?
            .ok_or_else(|| HostforgeError::Http(format!("metadata item {item} not present")))
    }
}

impl MetadataProvider for Ec2Metadata {
    fn public_address(&self) -> Result<String> {
        self.require("public-ipv4")
    }

    fn instance_id(&self) -> Result<String> {
        self.require("instance-id")
    }

    fn public_hostname(&self) -> Result<Option<String>> {
        self.get("public-hostname")
    }
}

// ---------------------------------------------------------------------------
// StaticMetadata
// ---------------------------------------------------------------------------

/// Fixed identity, for hosts without a metadata service or for tests.
pub struct StaticMetadata {
    pub identity: HostIdentity,
}

impl MetadataProvider for StaticMetadata {
    fn public_address(&self) -> Result<String> {
        Ok(self.identity.public_address.clone())
    }

    fn instance_id(&self) -> Result<String> {
        Ok(self.identity.instance_id.clone())
    }

    fn public_hostname(&self) -> Result<Option<String>> {
        Ok(self.identity.public_hostname.clone())
    }
}

// ---------------------------------------------------------------------------
// resolve
// ---------------------------------------------------------------------------

/// Query `provider` (if any) and degrade to localhost defaults on failure.
pub fn resolve(provider: Option<&dyn MetadataProvider>, log: &RunLog) -> HostIdentity {
    let Some(provider) = provider else {
        log.info("environment", "no metadata provider; using localhost identity");
        return HostIdentity::localhost();
    };

    let public_address = match provider.public_address() {
        Ok(addr) => addr,
        Err(e) => {
            log.warn(
                "environment",
                format!("metadata provider unavailable ({e}); using localhost identity"),
            );
            return HostIdentity::localhost();
        }
    };
    let instance_id = provider.instance_id().unwrap_or_else(|e| {
        log.warn("environment", format!("instance id unavailable: {e}"));
        UNKNOWN_INSTANCE.to_string()
    });
    let public_hostname = provider.public_hostname().unwrap_or(None);

    log.info(
        "environment",
        format!("public address {public_address}, instance {instance_id}"),
    );
    HostIdentity {
        public_address,
        instance_id,
        public_hostname,
        degraded: false,
    }
}
