//! Host identification for single-mode messages and node reports.
//!
//! # Overview
//!
//! - Hostname and OS label are read locally.
//! - The approximate location is looked up from the public IP address through
//!   two free HTTP services: ipify for the address and ipapi for the place.
//!   Lookups are best effort; any failure just leaves the location unset.

use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::ServerConfig;

/// Public IP address service.
const IPIFY_URL: &str = "https://api.ipify.org";

/// IP geolocation service.
const IPAPI_BASE: &str = "https://ipapi.co";

const LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration value meaning "detect at runtime".
const AUTO: &str = "auto";

/// How this host presents itself in messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInfo {
    pub name: String,
    pub location: Option<String>,
    pub identifier: String,
    pub description: String,

    /// e.g. "Linux 6.1.0".
    pub os_label: String,
}

impl HostInfo {
    /// Resolve `auto` values in `server` against the local machine.
    pub async fn resolve(server: &ServerConfig, geo: &GeoClient) -> Self {
        let hostname = hostname();
        let pick = |value: &str| {
            if value == AUTO {
                hostname.clone()
            } else {
                value.to_string()
            }
        };

        let location = if server.location == AUTO {
            geo.locate().await
        } else {
            Some(server.location.clone())
        };

        Self {
            name: pick(&server.name),
            location,
            identifier: pick(&server.identifier),
            description: server.description.clone(),
            os_label: os_label(),
        }
    }
}

/// Local hostname, or "unknown".
pub fn hostname() -> String {
    ["/proc/sys/kernel/hostname", "/etc/hostname"]
        .iter()
        .find_map(|path| read_trimmed(path))
        .or_else(|| std::env::var("HOSTNAME").ok().filter(|h| !h.is_empty()))
        .unwrap_or_else(|| "unknown".to_string())
}

/// OS name and kernel release, e.g. "Linux 6.1.0".
pub fn os_label() -> String {
    let name = match std::env::consts::OS {
        "linux" => "Linux",
        "macos" => "Darwin",
        "windows" => "Windows",
        "freebsd" => "FreeBSD",
        other => other,
    };

    match read_trimmed("/proc/sys/kernel/osrelease") {
        Some(release) => format!("{name} {release}"),
        None => name.to_string(),
    }
}

fn read_trimmed(path: &str) -> Option<String> {
    std::fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

#[derive(Debug, Deserialize)]
struct IpapiResponse {
    city: Option<String>,
    country_name: Option<String>,
}

/// Client for public IP geolocation.
#[derive(Clone)]
pub struct GeoClient {
    client: reqwest::Client,
    ipify_url: String,
    ipapi_base: String,
}

impl GeoClient {
    pub fn new() -> anyhow::Result<Self> {
        Self::with_base_urls(IPIFY_URL, IPAPI_BASE)
    }

    /// Create a client with custom service URLs (for testing).
    pub fn with_base_urls(ipify_url: &str, ipapi_base: &str) -> anyhow::Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().timeout(LOOKUP_TIMEOUT).build()?,
            ipify_url: ipify_url.to_string(),
            ipapi_base: ipapi_base.trim_end_matches('/').to_string(),
        })
    }

    pub async fn public_ip(&self) -> anyhow::Result<String> {
        let ip = self
            .client
            .get(&self.ipify_url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(ip.trim().to_string())
    }

    /// "City, Country", just "Country", or `None` when neither is known.
    pub async fn location_of(&self, ip: &str) -> anyhow::Result<Option<String>> {
        let url = format!("{}/{}/json/", self.ipapi_base, urlencoding::encode(ip));
        let data = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json::<IpapiResponse>()
            .await?;

        let city = data.city.filter(|c| !c.is_empty());
        let country = data.country_name.filter(|c| !c.is_empty());
        Ok(match (city, country) {
            (Some(city), Some(country)) => Some(format!("{city}, {country}")),
            (None, Some(country)) => Some(country),
            _ => None,
        })
    }

    /// Location of this host's public IP, if it can be found.
    pub async fn locate(&self) -> Option<String> {
        let lookup = async {
            let ip = self.public_ip().await?;
            debug!(%ip, "Resolved public IP");
            self.location_of(&ip).await
        };

        match lookup.await {
            Ok(location) => location,
            Err(e) => {
                warn!(error = %e, "Failed to look up host location");
                None
            }
        }
    }
}
