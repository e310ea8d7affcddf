use super::Endpoints;
use crate::error::{DemError, Result};
use crate::remote::{ArchiveFetch, ProductDescriptor};
use futures_util::StreamExt;
use reqwest::Client;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::debug;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP access to the data space. Cloning is cheap: clones share one
/// connection pool.
#[derive(Clone, Debug)]
pub struct Provider {
    pub(super) client: Client,
    pub(super) endpoints: Endpoints,
}

impl Provider {
    pub fn new(endpoints: Endpoints, timeout: Duration) -> Result<Self> {
        endpoints.validate()?;
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(CONNECT_TIMEOUT)
            .user_agent(concat!("cdse-dem/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| DemError::Config(format!("HTTP client: {e}")))?;
        Ok(Self { client, endpoints })
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }
}

impl ArchiveFetch for Provider {
    async fn fetch(&self, product: &ProductDescriptor, bearer: &str, dest: &Path) -> Result<u64> {
        let response = self
            .client
            .get(&product.download_url)
            .bearer_auth(bearer)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(DemError::from_status(
                status,
                &format!("Download of {}", product.name),
            ));
        }

        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();
        let mut written = 0_u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        debug!("Downloaded {} ({written} bytes)", product.name);
        Ok(written)
    }
}
