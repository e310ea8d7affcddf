//! The remote operations the downloader depends on. The Copernicus data
//! space implementation lives in [`crate::copernicus`]; tests substitute
//! in-memory fakes.
use crate::dem::DemTileRef;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// A token as issued by the identity endpoint.
#[derive(Debug, Clone)]
pub struct Grant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChecksumAlgorithm {
    Md5,
    Blake3,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checksum {
    pub algorithm: ChecksumAlgorithm,
    /// Lower-case hex digest
    pub value: String,
}

/// What the catalog knows about the archive for one DEM cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductDescriptor {
    pub id: String,
    pub name: String,
    pub download_url: String,
    pub checksums: Vec<Checksum>,
    pub size: Option<u64>,
}

pub trait IdentityService {
    async fn request_token(&self, identity: &str, secret: &str) -> Result<Grant>;

    async fn refresh_token(&self, refresh_token: &str) -> Result<Grant>;
}

pub trait CatalogSearch {
    /// Fails with `NotFound` when the catalog has no product for the cell.
    async fn search(&self, tile: &DemTileRef, bearer: &str) -> Result<ProductDescriptor>;
}

pub trait ArchiveFetch {
    /// Streams the product archive to `dest`, returning the bytes written.
    async fn fetch(&self, product: &ProductDescriptor, bearer: &str, dest: &Path) -> Result<u64>;
}
