//! MGRS tile -> overlapping Copernicus DEM cells.
use crate::dem::{DemCell, DemProduct, DemTileRef};
use crate::error::{DemError, Result};
use crate::tile_index::{self, TileIndex};
use crate::work_list::WorkItem;
use std::collections::HashSet;
use tracing::{debug, info};

pub struct TileResolver<'a> {
    index: &'a TileIndex,
    product: DemProduct,
}

impl<'a> TileResolver<'a> {
    pub fn new(index: &'a TileIndex, product: DemProduct) -> Self {
        Self { index, product }
    }

    /// DEM cells overlapping the tile footprint, sorted by cell.
    pub fn resolve(&self, item: &WorkItem) -> Result<Vec<DemTileRef>> {
        let footprint = self
            .index
            .get(&item.tile_id)
            .ok_or_else(|| DemError::UnknownTile(item.tile_id.clone()))?;

        let footprint = if footprint.spans_antimeridian() {
            debug!("Tile {} crosses the antimeridian", item.tile_id);
            footprint.unwrap_antimeridian()
        } else {
            footprint.clone()
        };

        // Bounding box prefilter: only cells touching the footprint's extent
        // go through the polygon test.
        let bbox = footprint.bounding_box();
        let lat_range = (bbox.min_lat.floor() as i32).max(-90)..(bbox.max_lat.ceil() as i32).min(90);
        let lon_range = bbox.min_lon.floor() as i32..bbox.max_lon.ceil() as i32;

        let mut cells: Vec<DemCell> = lat_range
            .flat_map(|lat| lon_range.clone().map(move |lon| DemCell::new(lat, lon)))
            .filter(|cell| tile_index::overlaps(&footprint, &cell.polygon()))
            .map(|cell| DemCell::new(cell.lat, normalise_lon(cell.lon)))
            .collect();
        cells.sort();
        cells.dedup();

        info!(
            "Tile {} overlaps {} DEM cell(s): {}",
            item.tile_id,
            cells.len(),
            cells
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        );

        Ok(cells
            .into_iter()
            .map(|cell| DemTileRef {
                cell,
                product: self.product.clone(),
            })
            .collect())
    }

    /// Resolves every work item, keeping each item's cell order and dropping
    /// cells an earlier item already produced.
    pub fn resolve_batch(&self, items: &[WorkItem]) -> Result<Vec<DemTileRef>> {
        let mut seen = HashSet::new();
        let mut batch = Vec::new();
        for item in items {
            for tile in self.resolve(item)? {
                if seen.insert(tile.clone()) {
                    batch.push(tile);
                } else {
                    debug!("{tile} already scheduled by an adjacent tile");
                }
            }
        }
        Ok(batch)
    }
}

/// Maps unwrapped longitudes back into [-180, 180).
fn normalise_lon(lon: i32) -> i32 {
    (lon + 180).rem_euclid(360) - 180
}
