//! Copernicus DEM grid cells and product variants.
use crate::error::DemError;
use crate::geometry::{BoundingBox, Polygon};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const DEFAULT_COLLECTION: &str = "COP-DEM";

/// One 1°x1° cell of the Copernicus DEM grid, keyed by its south-west corner.
///
/// Ordering is latitude first, then longitude, which is the order cells are
/// resolved and downloaded in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DemCell {
    pub lat: i32,
    pub lon: i32,
}

impl DemCell {
    pub fn new(lat: i32, lon: i32) -> Self {
        Self { lat, lon }
    }

    pub fn bounds(&self) -> BoundingBox {
        BoundingBox {
            min_lon: f64::from(self.lon),
            min_lat: f64::from(self.lat),
            max_lon: f64::from(self.lon) + 1.0,
            max_lat: f64::from(self.lat) + 1.0,
        }
    }

    pub fn polygon(&self) -> Polygon {
        Polygon::rectangle(&self.bounds())
    }

    /// The token Copernicus DEM product names carry, e.g. `N45_00_E008_00`.
    pub fn product_token(&self) -> String {
        let (ns, ew) = self.hemispheres();
        format!(
            "{ns}{:02}_00_{ew}{:03}_00",
            self.lat.unsigned_abs(),
            self.lon.unsigned_abs()
        )
    }

    fn hemispheres(&self) -> (char, char) {
        (
            if self.lat >= 0 { 'N' } else { 'S' },
            if self.lon >= 0 { 'E' } else { 'W' },
        )
    }
}

impl fmt::Display for DemCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (ns, ew) = self.hemispheres();
        write!(
            f,
            "{ns}{:02}{ew}{:03}",
            self.lat.unsigned_abs(),
            self.lon.unsigned_abs()
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Resolution {
    #[serde(rename = "30")]
    R30,
    #[serde(rename = "90")]
    R90,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::R30 => "30",
            Self::R90 => "90",
        }
    }
}

impl FromStr for Resolution {
    type Err = DemError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "30" => Ok(Self::R30),
            "90" => Ok(Self::R90),
            other => Err(DemError::Config(format!(
                "resolution must be 30 or 90, got '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ElevationModel {
    #[serde(rename = "DGED")]
    Dged,
    #[serde(rename = "DTED")]
    Dted,
}

impl ElevationModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dged => "DGED",
            Self::Dted => "DTED",
        }
    }

    /// Prefix of the catalog `productType` attribute.
    fn product_prefix(&self) -> &'static str {
        match self {
            Self::Dged => "DGE",
            Self::Dted => "DTE",
        }
    }
}

impl FromStr for ElevationModel {
    type Err = DemError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DGED" => Ok(Self::Dged),
            "DTED" => Ok(Self::Dted),
            other => Err(DemError::Config(format!(
                "elevation model must be DGED or DTED, got '{other}'"
            ))),
        }
    }
}

/// Which flavour of the DEM to retrieve.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DemProduct {
    pub collection: String,
    pub resolution: Resolution,
    pub elevation_model: ElevationModel,
}

impl Default for DemProduct {
    fn default() -> Self {
        Self {
            collection: DEFAULT_COLLECTION.to_string(),
            resolution: Resolution::R90,
            elevation_model: ElevationModel::Dged,
        }
    }
}

impl DemProduct {
    /// Catalog `productType`, e.g. `DGE_90`.
    pub fn product_type(&self) -> String {
        format!(
            "{}_{}",
            self.elevation_model.product_prefix(),
            self.resolution.as_str()
        )
    }

    /// `<root>/<collection>/<resolution>/<model>`
    pub fn directory(&self, output_root: &Path) -> PathBuf {
        output_root
            .join(&self.collection)
            .join(self.resolution.as_str())
            .join(self.elevation_model.as_str())
    }
}

impl fmt::Display for DemProduct {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}",
            self.collection,
            self.resolution.as_str(),
            self.elevation_model.as_str()
        )
    }
}

/// A DEM cell in a particular product flavour: the unit of download.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DemTileRef {
    pub cell: DemCell,
    pub product: DemProduct,
}

impl fmt::Display for DemTileRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.cell, self.product)
    }
}
