//! Verification and extraction of downloaded product archives.
use crate::error::{DemError, Result};
use crate::remote::{ChecksumAlgorithm, ProductDescriptor};
use md5::{Digest, Md5};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::Path;
use std::sync::LazyLock;
use tracing::{debug, warn};
use zip::ZipArchive;

/// Archive members worth keeping: the elevation raster itself.
static DEM_MEMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"DEM\.(tif|dt1|dt2)$").unwrap());

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedFile {
    pub name: String,
    pub size: u64,
    /// Lower-case hex BLAKE3 digest
    pub blake3: String,
}

fn hash_reader(mut reader: impl Read, mut update: impl FnMut(&[u8])) -> io::Result<u64> {
    let mut buffer = [0_u8; 64 * 1024];
    let mut total = 0_u64;
    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            return Ok(total);
        }
        update(&buffer[..n]);
        total += n as u64;
    }
}

pub fn md5_file(path: &Path) -> Result<String> {
    let mut hasher = Md5::new();
    hash_reader(File::open(path)?, |chunk| hasher.update(chunk))?;
    Ok(hex::encode(hasher.finalize()))
}

pub fn blake3_file(path: &Path) -> Result<String> {
    let mut hasher = blake3::Hasher::new();
    hash_reader(File::open(path)?, |chunk| {
        hasher.update(chunk);
    })?;
    Ok(hasher.finalize().to_hex().to_string())
}

/// Checks the downloaded archive against the size and checksums the
/// catalog published for it.
pub fn verify_archive(path: &Path, product: &ProductDescriptor) -> Result<()> {
    let actual_size = fs::metadata(path)?.len();
    if let Some(expected) = product.size {
        if expected != actual_size {
            return Err(DemError::Integrity(format!(
                "{}: expected {expected} bytes, got {actual_size}",
                product.name
            )));
        }
    }

    if product.checksums.is_empty() {
        warn!("No checksum published for {}, size check only", product.name);
    }

    for checksum in &product.checksums {
        let actual = match checksum.algorithm {
            ChecksumAlgorithm::Md5 => md5_file(path)?,
            ChecksumAlgorithm::Blake3 => blake3_file(path)?,
        };
        if actual != checksum.value {
            return Err(DemError::Integrity(format!(
                "{}: {:?} mismatch, expected {} got {actual}",
                product.name, checksum.algorithm, checksum.value
            )));
        }
        debug!("{:?} of {} verified", checksum.algorithm, product.name);
    }
    Ok(())
}

/// Extracts the DEM rasters of `archive` into `dest_dir`, dropping the
/// directory structure of the archive. Members are unpacked into a staging
/// directory inside `dest_dir` and moved into place only once every one of
/// them has been read in full, so a failed extraction leaves `dest_dir`
/// untouched.
pub fn extract_dem(archive: &Path, dest_dir: &Path) -> Result<Vec<ExtractedFile>> {
    let file = File::open(archive)?;
    let mut zip = ZipArchive::new(file)
        .map_err(|e| DemError::Extract(format!("{}: {e}", archive.display())))?;

    fs::create_dir_all(dest_dir)?;
    let staging = tempfile::Builder::new()
        .prefix(".extract-")
        .tempdir_in(dest_dir)?;
    let mut extracted = Vec::new();

    for i in 0..zip.len() {
        let mut member = zip
            .by_index(i)
            .map_err(|e| DemError::Extract(format!("{}: {e}", archive.display())))?;
        if member.is_dir() {
            continue;
        }
        let Some(name) = member
            .enclosed_name()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        else {
            warn!("Skipping unsafe archive member {}", member.name());
            continue;
        };
        if !DEM_MEMBER.is_match(&name) {
            continue;
        }

        let mut hasher = blake3::Hasher::new();
        let size = {
            let mut out = File::create(staging.path().join(&name))?;
            let mut tee = TeeReader {
                inner: &mut member,
                hasher: &mut hasher,
            };
            io::copy(&mut tee, &mut out)
                .map_err(|e| DemError::Extract(format!("{name}: {e}")))?
        };

        extracted.push(ExtractedFile {
            name,
            size,
            blake3: hasher.finalize().to_hex().to_string(),
        });
    }

    if extracted.is_empty() {
        return Err(DemError::Extract(format!(
            "{} holds no DEM raster",
            archive.display()
        )));
    }

    for file in &extracted {
        let target = dest_dir.join(&file.name);
        fs::rename(staging.path().join(&file.name), &target)?;
        debug!("Extracted {} ({} bytes)", target.display(), file.size);
    }
    Ok(extracted)
}

struct TeeReader<'a, R> {
    inner: &'a mut R,
    hasher: &'a mut blake3::Hasher,
}

impl<R: Read> Read for TeeReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}
