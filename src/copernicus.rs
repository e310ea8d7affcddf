//! Copernicus Data Space Ecosystem: identity, OData catalogue and download
//! services.
mod catalog;
mod identity;
mod provider;

pub use provider::Provider;

use crate::error::{DemError, Result};
use serde::{Deserialize, Serialize};
use url::Url;

pub const IDENTITY_URL: &str =
    "https://identity.dataspace.copernicus.eu/auth/realms/CDSE/protocol/openid-connect/token";
pub const CATALOG_URL: &str = "https://catalogue.dataspace.copernicus.eu/odata/v1";
pub const DOWNLOAD_URL: &str = "https://zipper.dataspace.copernicus.eu/odata/v1";
pub const CLIENT_ID: &str = "cdse-public";

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct Endpoints {
    /// OpenID Connect token endpoint
    pub identity: String,
    /// OData root used for product search
    pub catalog: String,
    /// OData root serving `Products(<id>)/$value`
    pub download: String,
    pub client_id: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            identity: IDENTITY_URL.to_string(),
            catalog: CATALOG_URL.to_string(),
            download: DOWNLOAD_URL.to_string(),
            client_id: CLIENT_ID.to_string(),
        }
    }
}

impl Endpoints {
    /// All endpoints below one base URL. Handy for local mirrors and tests.
    pub fn with_base(base: &str) -> Self {
        let base = base.trim_end_matches('/');
        Self {
            identity: format!("{base}/token"),
            catalog: format!("{base}/odata/v1"),
            download: format!("{base}/odata/v1"),
            client_id: CLIENT_ID.to_string(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("identity", &self.identity),
            ("catalog", &self.catalog),
            ("download", &self.download),
        ] {
            let url = Url::parse(value)
                .map_err(|e| DemError::Config(format!("{name} endpoint '{value}': {e}")))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(DemError::Config(format!(
                    "{name} endpoint '{value}' must use http or https"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_endpoints_are_valid() {
        assert!(Endpoints::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_endpoints_are_rejected() {
        let endpoints = Endpoints {
            catalog: "not a url".to_string(),
            ..Endpoints::default()
        };
        assert!(matches!(endpoints.validate(), Err(DemError::Config(_))));

        let endpoints = Endpoints {
            download: "ftp://example.org/odata".to_string(),
            ..Endpoints::default()
        };
        assert!(matches!(endpoints.validate(), Err(DemError::Config(_))));
    }
}
