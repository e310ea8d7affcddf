//! Sentinel-2 tiling grid lookup, loaded from the ESA tiling KML.
use crate::error::{DemError, Result};
use crate::geometry::Polygon;
use roxmltree::Node;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

/// File name of the reference tiling grid distributed with Sen2Cor.
pub const DEFAULT_KML_FILE: &str =
    "S2A_OPER_GIP_TILPAR_MPC__20151209T095117_V20150622T000000_21000101T000000_B00.kml";

/// Immutable MGRS tile id -> footprint map.
#[derive(Debug, Clone, Default)]
pub struct TileIndex {
    tiles: HashMap<String, Polygon>,
}

impl TileIndex {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| DemError::IndexUnavailable(format!("{}: {e}", path.display())))?;
        let index = Self::parse(&content)?;
        info!("Loaded {} tiles from {}", index.len(), path.display());
        Ok(index)
    }

    pub fn parse(kml: &str) -> Result<Self> {
        let doc = roxmltree::Document::parse(kml)
            .map_err(|e| DemError::IndexUnavailable(format!("malformed KML: {e}")))?;

        let mut tiles = HashMap::new();
        for placemark in doc.descendants().filter(|n| n.has_tag_name("Placemark")) {
            let Some(name) = extract_name(placemark) else {
                continue;
            };
            match extract_wkt(placemark).or_else(|| extract_coordinates(placemark)) {
                Some(polygon) if polygon.area() > 0.0 => {
                    tiles.insert(name, polygon);
                }
                _ => warn!("Tile {name} has no usable footprint, skipping"),
            }
        }

        if tiles.is_empty() {
            return Err(DemError::IndexUnavailable(
                "no tile footprints found in KML".to_string(),
            ));
        }
        Ok(Self { tiles })
    }

    /// Builds an index from known footprints, bypassing the KML.
    pub fn from_tiles<I, S>(tiles: I) -> Self
    where
        I: IntoIterator<Item = (S, Polygon)>,
        S: Into<String>,
    {
        Self {
            tiles: tiles.into_iter().map(|(id, p)| (id.into(), p)).collect(),
        }
    }

    pub fn get(&self, tile_id: &str) -> Option<&Polygon> {
        self.tiles.get(tile_id)
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }
}

/// Planar overlap with non-empty area. `candidate` must be convex, which DEM
/// grid cells always are.
pub fn overlaps(tile: &Polygon, candidate: &Polygon) -> bool {
    tile.overlaps(candidate)
}

fn extract_name(placemark: Node) -> Option<String> {
    let name = placemark
        .children()
        .find(|n| n.has_tag_name("name"))?
        .text()?
        .trim();
    (!name.is_empty()).then(|| name.to_string())
}

/// The placemark description is an HTML table; the footprint sits in the
/// cell following the `LL_WKT` header.
fn extract_wkt(placemark: Node) -> Option<Polygon> {
    let description = placemark
        .children()
        .find(|n| n.has_tag_name("description"))?
        .text()?;
    let after_header = description.split("LL_WKT").nth(1)?;
    let start = after_header.find("POLYGON")?;
    let wkt = after_header[start..].split("</").next()?;
    Polygon::from_wkt(wkt)
}

fn extract_coordinates(placemark: Node) -> Option<Polygon> {
    let coordinates = placemark
        .descendants()
        .find(|n| n.has_tag_name("coordinates"))?
        .text()?;
    Polygon::from_kml_coordinates(coordinates)
}
