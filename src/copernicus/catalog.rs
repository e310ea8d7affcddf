use super::Provider;
use crate::dem::{DemCell, DemTileRef};
use crate::error::{DemError, Result};
use crate::remote::{CatalogSearch, Checksum, ChecksumAlgorithm, ProductDescriptor};
use serde::Deserialize;
use tracing::{debug, warn};

const MAX_ITEMS: &str = "10";

/// The search area is shrunk by this much (degrees) on every side so that
/// neighbouring cells sharing an edge do not answer the query.
const CELL_INSET_DEG: f64 = 0.01;

#[derive(Deserialize, Debug)]
struct ODataResponse {
    value: Vec<ODataProduct>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "PascalCase")]
struct ODataProduct {
    id: String,
    name: String,
    #[serde(default)]
    content_length: Option<u64>,
    #[serde(default)]
    checksum: Vec<ODataChecksum>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "PascalCase")]
struct ODataChecksum {
    value: Option<String>,
    algorithm: Option<String>,
}

impl ODataProduct {
    fn into_descriptor(self, download_root: &str) -> ProductDescriptor {
        let checksums = self
            .checksum
            .into_iter()
            .filter_map(|c| {
                let value = c.value?.to_ascii_lowercase();
                let algorithm = match c.algorithm?.to_ascii_uppercase().as_str() {
                    "MD5" => ChecksumAlgorithm::Md5,
                    "BLAKE3" => ChecksumAlgorithm::Blake3,
                    other => {
                        debug!("Ignoring unsupported {other} checksum of {}", self.name);
                        return None;
                    }
                };
                Some(Checksum { algorithm, value })
            })
            .collect();

        ProductDescriptor {
            download_url: format!(
                "{}/Products({})/$value",
                download_root.trim_end_matches('/'),
                self.id
            ),
            id: self.id,
            name: self.name,
            checksums,
            size: self.content_length,
        }
    }
}

/// OData `$filter` selecting the product for one DEM cell.
fn search_filter(tile: &DemTileRef) -> String {
    let b = tile.cell.bounds();
    let (w, s, e, n) = (
        b.min_lon + CELL_INSET_DEG,
        b.min_lat + CELL_INSET_DEG,
        b.max_lon - CELL_INSET_DEG,
        b.max_lat - CELL_INSET_DEG,
    );
    format!(
        "Collection/Name eq '{collection}' \
         and Attributes/OData.CSC.StringAttribute/any(att:att/Name eq 'productType' \
         and att/OData.CSC.StringAttribute/Value eq '{product_type}') \
         and OData.CSC.Intersects(area=geography'SRID=4326;POLYGON(({w} {s},{e} {s},{e} {n},{w} {n},{w} {s}))')",
        collection = tile.product.collection,
        product_type = tile.product.product_type(),
    )
}

/// Prefers the product named after the cell; falls back to the first hit.
fn select_product(products: Vec<ODataProduct>, cell: &DemCell) -> Option<ODataProduct> {
    let token = cell.product_token();
    if products.len() > 1 {
        debug!("{} products answer cell {cell}", products.len());
    }
    let position = match products.iter().position(|p| p.name.contains(&token)) {
        Some(position) => position,
        None => {
            if let Some(first) = products.first() {
                warn!("No product named after cell {cell}, using {}", first.name);
            }
            0
        }
    };
    products.into_iter().nth(position)
}

impl CatalogSearch for Provider {
    async fn search(&self, tile: &DemTileRef, bearer: &str) -> Result<ProductDescriptor> {
        let url = format!("{}/Products", self.endpoints.catalog.trim_end_matches('/'));
        let filter = search_filter(tile);
        let response = self
            .client
            .get(url)
            .query(&[("$filter", filter.as_str()), ("$top", MAX_ITEMS)])
            .bearer_auth(bearer)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(DemError::from_status(
                status,
                &format!("Catalog search for {tile}"),
            ));
        }

        let body: ODataResponse = response.json().await?;
        match select_product(body.value, &tile.cell) {
            Some(product) => Ok(product.into_descriptor(&self.endpoints.download)),
            None => {
                warn!("No DEM available for {tile}");
                Err(DemError::NotFound(tile.to_string()))
            }
        }
    }
}
