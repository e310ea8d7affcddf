//! Run configuration: TOML file, legacy `configuration.xml`, or the
//! built-in template.
use crate::copernicus::Endpoints;
use crate::dem::{DemProduct, ElevationModel, Resolution};
use crate::download_plan::PipelineConfig;
use crate::error::{DemError, Result};
use crate::retry::RetryConfig;
use crate::tile_index::DEFAULT_KML_FILE;
use crate::token::TokenPolicy;
use roxmltree::Node;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Placeholder used by `configuration.xml` for "keep the built-in value".
const XML_DEFAULT: &str = "DEFAULT";

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Default)]
#[serde(default)]
pub struct Settings {
    pub dem: DemProduct,
    pub paths: Paths,
    pub endpoints: Endpoints,
    pub session: Session,
    pub download: Download,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct Paths {
    /// Sentinel-2 tiling grid KML
    pub tile_index: PathBuf,
    pub work_list: PathBuf,
    pub output: PathBuf,
    /// Credential store; the user configuration directory when unset
    pub credentials: Option<PathBuf>,
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            tile_index: PathBuf::from(DEFAULT_KML_FILE),
            work_list: PathBuf::from("input_tiles.txt"),
            output: PathBuf::from("Output_dir"),
            credentials: None,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct Session {
    pub validity_window_secs: u64,
    pub max_refresh: u32,
    pub session_ceiling_secs: u64,
}

impl Default for Session {
    fn default() -> Self {
        let policy = TokenPolicy::default();
        Self {
            validity_window_secs: policy.validity_window.as_secs(),
            max_refresh: policy.max_refresh,
            session_ceiling_secs: policy.session_ceiling.as_secs(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct Download {
    pub concurrency: usize,
    pub retry_attempts: u32,
    pub retry_initial_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub timeout_secs: u64,
    pub scratch_dir: Option<PathBuf>,
}

impl Default for Download {
    fn default() -> Self {
        Self {
            concurrency: 1,
            retry_attempts: 3,
            retry_initial_delay_ms: 500,
            retry_max_delay_ms: 30_000,
            timeout_secs: 600,
            scratch_dir: None,
        }
    }
}

impl Settings {
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let settings: Self =
            toml::from_str(&content).map_err(|e| DemError::Config(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reads `path` as XML when it has an `.xml` extension, as TOML otherwise.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let is_xml = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("xml"));
        if is_xml {
            Self::from_xml(path)
        } else {
            Self::read(path)
        }
    }

    /// Like [`Settings::load`], but a missing TOML file is created from the
    /// built-in template first.
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let is_xml = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("xml"));
        if is_xml || path.exists() {
            return Self::load(path);
        }
        let settings = Self::from_template(&settings_toml())?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        settings.write(path)?;
        info!("Wrote default settings to {}", path.display());
        Ok(settings)
    }

    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| DemError::Config(e.to_string()))?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn from_template(table: &toml::Table) -> Result<Self> {
        let settings: Self =
            toml::from_str(&table.to_string()).map_err(|e| DemError::Config(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_xml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::parse_xml(&content)
    }

    /// Reads the `DEM_Option` block of a legacy configuration file. The
    /// product is taken as a whole: if any of collection, resolution or
    /// model is `DEFAULT`, all three keep their built-in values.
    pub fn parse_xml(content: &str) -> Result<Self> {
        let doc = roxmltree::Document::parse(content)
            .map_err(|e| DemError::Config(format!("configuration XML: {e}")))?;
        let option = doc
            .descendants()
            .find(|n| n.has_tag_name("DEM_Option"))
            .ok_or_else(|| DemError::Config("Unable to locate 'DEM_Option' tag".to_string()))?;

        let mut settings = Self::default();

        let resolution = extract_value(option, "Resolution");
        let collection = extract_value(option, "Collection");
        let model = extract_value(option, "Elevation_Model");
        match (resolution, collection, model) {
            (Some(resolution), Some(collection), Some(model)) => {
                settings.dem = DemProduct {
                    collection,
                    resolution: resolution.parse::<Resolution>()?,
                    elevation_model: model.parse::<ElevationModel>()?,
                };
            }
            _ => warn!("Incomplete DEM selection in configuration, using {}", settings.dem),
        }

        match extract_value(option, "Tiles_Input_File") {
            Some(path) => settings.paths.work_list = PathBuf::from(path),
            None => warn!(
                "Using the default work list {}",
                settings.paths.work_list.display()
            ),
        }
        match extract_value(option, "DEM_Output_Directory") {
            Some(path) => settings.paths.output = PathBuf::from(path),
            None => warn!(
                "Using the default output directory {}",
                settings.paths.output.display()
            ),
        }

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        self.endpoints.validate()?;
        if self.session.validity_window_secs == 0 {
            return Err(DemError::Config(
                "session.validity_window_secs must be positive".to_string(),
            ));
        }
        if self.session.session_ceiling_secs < self.session.validity_window_secs {
            return Err(DemError::Config(
                "session.session_ceiling_secs is shorter than the validity window".to_string(),
            ));
        }
        if self.download.concurrency == 0 {
            return Err(DemError::Config(
                "download.concurrency must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn token_policy(&self) -> TokenPolicy {
        TokenPolicy {
            validity_window: Duration::from_secs(self.session.validity_window_secs),
            max_refresh: self.session.max_refresh,
            session_ceiling: Duration::from_secs(self.session.session_ceiling_secs),
        }
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.download.retry_attempts.max(1),
            initial_delay: Duration::from_millis(self.download.retry_initial_delay_ms),
            max_delay: Duration::from_millis(self.download.retry_max_delay_ms),
            ..RetryConfig::default()
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            concurrency: self.download.concurrency,
            retry: self.retry_config(),
            scratch_dir: self.download.scratch_dir.clone(),
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.download.timeout_secs)
    }
}

/// Text of the `name` child, or `None` when absent, empty or `DEFAULT`.
fn extract_value(option: Node, name: &str) -> Option<String> {
    let text = option
        .children()
        .find(|n| n.has_tag_name(name))?
        .text()?
        .trim();
    (!text.is_empty() && text != XML_DEFAULT).then(|| text.to_string())
}

pub fn settings_toml() -> toml::Table {
    toml::toml! {
        [dem]
        collection = "COP-DEM"
        resolution = "90"
        elevation_model = "DGED"

        [paths]
        tile_index = "S2A_OPER_GIP_TILPAR_MPC__20151209T095117_V20150622T000000_21000101T000000_B00.kml"
        work_list = "input_tiles.txt"
        output = "Output_dir"

        [endpoints]
        identity = "https://identity.dataspace.copernicus.eu/auth/realms/CDSE/protocol/openid-connect/token"
        catalog = "https://catalogue.dataspace.copernicus.eu/odata/v1"
        download = "https://zipper.dataspace.copernicus.eu/odata/v1"
        client_id = "cdse-public"

        [session]
        validity_window_secs = 600
        max_refresh = 5
        session_ceiling_secs = 3600

        [download]
        concurrency = 1
        retry_attempts = 3
        retry_initial_delay_ms = 500
        retry_max_delay_ms = 30000
        timeout_secs = 600
    }
}
