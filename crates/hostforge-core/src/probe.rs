//! HTTP status probing for health checks and validation.

use crate::error::{HostforgeError, Result};
use std::time::Duration;

pub trait HttpProbe: Send + Sync {
    /// GET `url` and return the response status code.
    fn status(&self, url: &str) -> Result<u16>;
}

pub struct ReqwestProbe {
    client: reqwest::blocking::Client,
}

impl ReqwestProbe {
    /// `accept_invalid_certs` lets the public HTTPS check reach a host that
    /// is still on its self-signed certificate.
    pub fn new(timeout: Duration, accept_invalid_certs: bool) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(accept_invalid_certs)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| HostforgeError::Http(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

impl HttpProbe for ReqwestProbe {
    fn status(&self, url: &str) -> Result<u16> {
        let resp = self
            .client
            .get(url)
            .send()
            .map_err(|e| HostforgeError::Http(format!("{url}: {e}")))?;
        Ok(resp.status().as_u16())
    }
}

/// 2xx and 3xx count as a live endpoint.
pub fn is_healthy_status(code: u16) -> bool {
    (200..400).contains(&code)
}
