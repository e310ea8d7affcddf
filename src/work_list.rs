//! MGRS work items, given either as bare tile ids or as SAFE product names.
use crate::error::{DemError, Result};
use regex::Regex;
use std::fs;
use std::path::Path;
use std::sync::LazyLock;

/// UTM zone 01-60, latitude band C-X and the 100 km square letters
/// (I and O are never used).
static MGRS_TILE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(0[1-9]|[1-5][0-9]|60)[C-HJ-NP-X][A-HJ-NP-Z][A-HJ-NP-V]$")
        .expect("Regex pattern should always compile")
});

/// Position of the `T<tile>` field in
/// `MMM_MSIXXX_YYYYMMDDTHHMMSS_Nxxyy_ROOO_Txxxxx_<discriminator>.SAFE`.
const SAFE_TILE_FIELD: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub raw: String,
    pub tile_id: String,
}

impl WorkItem {
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        let tile_id = if trimmed.contains("SAFE") {
            tile_from_safe(trimmed)
        } else {
            Some(trimmed.to_ascii_uppercase())
        };

        match tile_id {
            Some(tile_id) if MGRS_TILE.is_match(&tile_id) => Ok(Self {
                raw: trimmed.to_string(),
                tile_id,
            }),
            _ => Err(DemError::MalformedWorkList {
                line: 1,
                entry: trimmed.to_string(),
            }),
        }
    }
}

fn tile_from_safe(name: &str) -> Option<String> {
    // Accept full paths and a trailing separator.
    let file_name = name
        .trim_end_matches(['/', '\\'])
        .rsplit(['/', '\\'])
        .next()?;
    let field = file_name.split('_').nth(SAFE_TILE_FIELD)?;
    Some(field.strip_prefix('T')?.to_string())
}

/// Parses a work list: one tile id or SAFE name per line. Blank lines and
/// anything after `#` are ignored.
pub fn parse_work_list(content: &str) -> Result<Vec<WorkItem>> {
    content
        .lines()
        .enumerate()
        .filter_map(|(index, line)| {
            let entry = line.split('#').next().unwrap_or_default().trim();
            (!entry.is_empty()).then_some((index + 1, entry))
        })
        .map(|(line, entry)| {
            WorkItem::parse(entry).map_err(|_| DemError::MalformedWorkList {
                line,
                entry: entry.to_string(),
            })
        })
        .collect()
}

pub fn read_work_list<P: AsRef<Path>>(path: P) -> Result<Vec<WorkItem>> {
    let content = fs::read_to_string(path)?;
    parse_work_list(&content)
}
