//! Record of the tiles already extracted into a model directory.
//!
//! Each `<collection>/<resolution>/<model>` directory carries a
//! `.dem_inventory.json` mapping the DEM cell id to the product it came from
//! and the digests of the files extracted from it. A tile counts as present
//! only when every recorded file is still on disk with the recorded digest.
use crate::archive::{blake3_file, ExtractedFile};
use crate::dem::DemCell;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const INVENTORY_FILE: &str = ".dem_inventory.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryEntry {
    pub product_id: String,
    pub product_name: String,
    pub files: Vec<ExtractedFile>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Inventory {
    tiles: BTreeMap<String, InventoryEntry>,
}

impl Inventory {
    /// A missing inventory is an empty one. An unreadable inventory is
    /// ignored, which only costs a re-download.
    pub fn load(dir: &Path) -> Self {
        let path = dir.join(INVENTORY_FILE);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(_) => return Self::default(),
        };
        match serde_json::from_str(&content) {
            Ok(inventory) => inventory,
            Err(e) => {
                warn!("Ignoring unreadable inventory {}: {e}", path.display());
                Self::default()
            }
        }
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        let path = dir.join(INVENTORY_FILE);
        let temp = dir.join(format!("{INVENTORY_FILE}.tmp"));
        fs::write(&temp, content)?;
        fs::rename(temp, path)?;
        Ok(())
    }

    pub fn get(&self, cell: &DemCell) -> Option<&InventoryEntry> {
        self.tiles.get(&cell.to_string())
    }

    pub fn record(&mut self, cell: &DemCell, entry: InventoryEntry) {
        self.tiles.insert(cell.to_string(), entry);
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    /// Path of the first extracted file when the tile is fully present in
    /// `dir` and matches its recorded digests.
    pub fn intact(&self, cell: &DemCell, dir: &Path) -> Option<PathBuf> {
        let entry = self.get(cell)?;
        if entry.files.is_empty() {
            return None;
        }
        for file in &entry.files {
            let path = dir.join(&file.name);
            let size = fs::metadata(&path).ok()?.len();
            if size != file.size {
                debug!("{} changed size since extraction", path.display());
                return None;
            }
            match blake3_file(&path) {
                Ok(digest) if digest == file.blake3 => {}
                _ => {
                    debug!("{} changed content since extraction", path.display());
                    return None;
                }
            }
        }
        Some(dir.join(&entry.files[0].name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry_for(dir: &Path, name: &str, content: &[u8]) -> InventoryEntry {
        fs::write(dir.join(name), content).unwrap();
        InventoryEntry {
            product_id: "abc".to_string(),
            product_name: "Copernicus_DSM_30_N45_00_E008_00".to_string(),
            files: vec![ExtractedFile {
                name: name.to_string(),
                size: content.len() as u64,
                blake3: blake3::hash(content).to_hex().to_string(),
            }],
        }
    }

    #[test]
    fn test_missing_inventory_is_empty() {
        let dir = tempdir().unwrap();
        assert!(Inventory::load(dir.path()).is_empty());
    }

    #[test]
    fn test_malformed_inventory_is_empty() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(INVENTORY_FILE), "{ not json").unwrap();
        assert!(Inventory::load(dir.path()).is_empty());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let cell = DemCell::new(45, 8);
        let mut inventory = Inventory::default();
        inventory.record(&cell, entry_for(dir.path(), "a_DEM.tif", b"elevation"));
        inventory.save(dir.path()).unwrap();

        let loaded = Inventory::load(dir.path());
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.get(&cell).unwrap().product_id, "abc");
        assert!(!dir.path().join(format!("{INVENTORY_FILE}.tmp")).exists());
    }

    #[test]
    fn test_intact_detects_tampering() {
        let dir = tempdir().unwrap();
        let cell = DemCell::new(45, 8);
        let mut inventory = Inventory::default();
        inventory.record(&cell, entry_for(dir.path(), "a_DEM.tif", b"elevation"));

        assert_eq!(
            inventory.intact(&cell, dir.path()),
            Some(dir.path().join("a_DEM.tif"))
        );
        assert_eq!(inventory.intact(&DemCell::new(46, 8), dir.path()), None);

        fs::write(dir.path().join("a_DEM.tif"), b"elevatioN").unwrap();
        assert_eq!(inventory.intact(&cell, dir.path()), None);

        fs::remove_file(dir.path().join("a_DEM.tif")).unwrap();
        assert_eq!(inventory.intact(&cell, dir.path()), None);
    }
}
