use crate::constants;
use crate::error::{PipelineError, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

pub const DEFAULT_CONFIG_PATH: &str = "moneyplot.toml";

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub paths: PathsConfig,
    pub http: HttpConfig,
    pub dvf: DvfConfig,
    pub clean: CleanConfig,
    pub dpe: DpeConfig,
    pub insee: InseeConfig,
    pub ecb: EcbConfig,
    pub enrich: EnrichConfig,
    pub load: LoadConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub data_root: PathBuf,
    pub raw_dvf_dir: Option<PathBuf>,
    pub processed_dir: Option<PathBuf>,
    pub db_path: Option<PathBuf>,
    pub log_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("data"),
            raw_dvf_dir: None,
            processed_dir: None,
            db_path: None,
            log_dir: PathBuf::from("logs"),
        }
    }
}

impl PathsConfig {
    pub fn raw_dvf_dir(&self) -> PathBuf {
        self.raw_dvf_dir
            .clone()
            .unwrap_or_else(|| self.data_root.join("raw").join("dvf"))
    }

    pub fn processed_dir(&self) -> PathBuf {
        self.processed_dir
            .clone()
            .unwrap_or_else(|| self.data_root.join("processed"))
    }

    pub fn canonical_artifact(&self) -> PathBuf {
        self.processed_dir().join(constants::CANONICAL_ARTIFACT_NAME)
    }

    pub fn db_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| self.data_root.join("moneyplot.sqlite"))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub timeout_secs: u64,
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 120,
            user_agent: format!("moneyplot/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DvfConfig {
    pub base_url: String,
    pub years: Vec<String>,
    /// Empty means every department in the catalogue
    pub departments: Vec<String>,
    pub concurrency: usize,
}

impl Default for DvfConfig {
    fn default() -> Self {
        Self {
            base_url: constants::DVF_BASE_URL.to_string(),
            years: constants::DVF_YEARS.iter().map(|y| y.to_string()).collect(),
            departments: Vec::new(),
            concurrency: 4,
        }
    }
}

impl DvfConfig {
    pub fn selected_departments(&self) -> Vec<String> {
        if self.departments.is_empty() {
            constants::DVF_DEPARTMENTS.clone()
        } else {
            self.departments.clone()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CleanConfig {
    pub max_price: f64,
    pub nature: String,
    pub property_types: Vec<String>,
}

impl Default for CleanConfig {
    fn default() -> Self {
        Self {
            max_price: constants::DEFAULT_MAX_PRICE,
            nature: constants::NATURE_VENTE.to_string(),
            property_types: vec![
                constants::TYPE_MAISON.to_string(),
                constants::TYPE_APPARTEMENT.to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DpeConfig {
    pub api_url: String,
    pub page_size: usize,
    pub max_offset: usize,
    pub communes: Vec<String>,
    pub departments: Vec<String>,
}

impl Default for DpeConfig {
    fn default() -> Self {
        Self {
            api_url: constants::ADEME_DPE_URL.to_string(),
            page_size: constants::DPE_PAGE_SIZE,
            max_offset: constants::DPE_DEPARTMENT_MAX_OFFSET,
            communes: Vec::new(),
            departments: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeriesLabel {
    pub type_bien: String,
    pub zone: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InseeConfig {
    pub api_url: String,
    pub series: BTreeMap<String, SeriesLabel>,
}

impl Default for InseeConfig {
    fn default() -> Self {
        let series = constants::INSEE_SERIES
            .iter()
            .map(|(id, type_bien, zone)| {
                (
                    id.to_string(),
                    SeriesLabel {
                        type_bien: type_bien.to_string(),
                        zone: zone.to_string(),
                    },
                )
            })
            .collect();
        Self {
            api_url: constants::INSEE_BDM_URL.to_string(),
            series,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EcbConfig {
    pub api_url: String,
    pub series_key: String,
}

impl Default for EcbConfig {
    fn default() -> Self {
        Self {
            api_url: constants::ECB_MIR_URL.to_string(),
            series_key: constants::ECB_SERIES_KEY.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EnrichConfig {
    pub surface_tolerance: f64,
}

impl Default for EnrichConfig {
    fn default() -> Self {
        Self {
            surface_tolerance: constants::DEFAULT_SURFACE_TOLERANCE,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct LoadConfig {
    /// Replace a populated table with an empty artifact instead of keeping it
    pub allow_empty_replace: bool,
}

impl Config {
    /// Load from `MONEYPLOT_CONFIG` or `moneyplot.toml`, falling back to defaults
    /// when the file does not exist, then apply env overrides.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        dotenv::dotenv().ok();

        let path = explicit
            .map(Path::to_path_buf)
            .or_else(|| std::env::var("MONEYPLOT_CONFIG").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

        let mut config = if path.exists() {
            let content = fs::read_to_string(&path).map_err(|e| {
                PipelineError::Config(format!(
                    "Failed to read config file '{}': {}",
                    path.display(),
                    e
                ))
            })?;
            info!("Loaded configuration from {}", path.display());
            Self::from_toml(&content)?
        } else if explicit.is_some() {
            return Err(PipelineError::Config(format!(
                "Config file '{}' does not exist",
                path.display()
            )));
        } else {
            Config::default()
        };

        if let Ok(root) = std::env::var("MONEYPLOT_DATA_ROOT") {
            config.paths.data_root = PathBuf::from(root);
        }
        if let Ok(db) = std::env::var("MONEYPLOT_DB_PATH") {
            config.paths.db_path = Some(PathBuf::from(db));
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// A config rooted at `data_root` with every other value defaulted
    pub fn with_data_root(data_root: impl Into<PathBuf>) -> Self {
        let mut config = Config::default();
        config.paths.data_root = data_root.into();
        config
    }

    pub fn validate(&self) -> Result<()> {
        if self.dpe.page_size == 0 {
            return Err(PipelineError::Config("dpe.page_size must be > 0".into()));
        }
        if self.clean.max_price <= 0.0 {
            return Err(PipelineError::Config("clean.max_price must be > 0".into()));
        }
        if self.enrich.surface_tolerance <= 0.0 {
            return Err(PipelineError::Config(
                "enrich.surface_tolerance must be > 0".into(),
            ));
        }
        if self.dvf.concurrency == 0 {
            return Err(PipelineError::Config("dvf.concurrency must be > 0".into()));
        }
        Ok(())
    }
}
