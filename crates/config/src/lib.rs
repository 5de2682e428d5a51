//! Layered configuration.
//!
//! Sources, later ones winning:
//!
//! 1. the defaults compiled into this crate,
//! 2. `wold.toml`, `wold.yaml` or `wold.json` in the user's config directory,
//! 3. an explicit file given on the command line,
//! 4. `WOLD_` environment variables, with `__` separating nested keys
//!    (`WOLD_LOGGING__LEVEL=debug`, `WOLD_ASSETS_ROOT=/srv/assets`).

pub mod error;

use crate::error::{ErrorKind, Result};
use directories::ProjectDirs;
use exn::ResultExt;
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_ASSETS_ROOT: &str = "assets";
pub const DEFAULT_LOG_LEVEL: &str = "info";
pub const DEFAULT_LOG_MAX_SIZE: u64 = 1024 * 1024;
pub const DEFAULT_LOG_BACKUPS: u32 = 5;
pub const DEFAULT_LOADER_CAPACITY: usize = 128;
pub const DEFAULT_LOD_RATIOS: [f32; 3] = [0.5, 0.25, 0.1];
pub const DEFAULT_MIPMAP_LEVELS: u32 = 4;
pub const DEFAULT_JPEG_QUALITY: u8 = 85;
pub const DEFAULT_HASH_BLOCK_SIZE: usize = 4096;

const ENV_PREFIX: &str = "WOLD_";
const FILE_STEM: &str = "wold";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Directory every artifact path is relative to.
    pub assets_root: PathBuf,
    pub logging: LoggingConfig,
    pub loader: LoaderConfig,
    pub pipeline: PipelineConfig,
    pub hashing: HashingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            assets_root: PathBuf::from(DEFAULT_ASSETS_ROOT),
            logging: LoggingConfig::default(),
            loader: LoaderConfig::default(),
            pipeline: PipelineConfig::default(),
            hashing: HashingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `tracing` filter directive for the application log.
    pub level: String,
    pub max_size: u64,
    pub backup_count: u32,
    pub compress_backups: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: DEFAULT_LOG_LEVEL.to_string(),
            max_size: DEFAULT_LOG_MAX_SIZE,
            backup_count: DEFAULT_LOG_BACKUPS,
            compress_backups: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoaderConfig {
    /// Maximum number of decoded resources kept in memory.
    pub capacity: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self { capacity: DEFAULT_LOADER_CAPACITY }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub lod_ratios: Vec<f32>,
    pub mipmap_levels: u32,
    pub jpeg_quality: u8,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            lod_ratios: DEFAULT_LOD_RATIOS.to_vec(),
            mipmap_levels: DEFAULT_MIPMAP_LEVELS,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashingConfig {
    /// Read size when streaming a file through SHA-256.
    pub block_size: usize,
}

impl Default for HashingConfig {
    fn default() -> Self {
        Self { block_size: DEFAULT_HASH_BLOCK_SIZE }
    }
}

impl Config {
    /// The user's config directory, if the platform has one.
    pub fn user_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "wold").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Every source layered in order, with the user directory looked up from
    /// the platform.
    pub fn figment(explicit: Option<&Path>) -> Figment {
        Self::figment_from(Self::user_dir().as_deref(), explicit)
    }

    pub fn figment_from(user_dir: Option<&Path>, explicit: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(dir) = user_dir {
            figment = figment
                .merge(Toml::file(dir.join(format!("{FILE_STEM}.toml"))))
                .merge(Yaml::file(dir.join(format!("{FILE_STEM}.yaml"))))
                .merge(Json::file(dir.join(format!("{FILE_STEM}.json"))));
        }
        if let Some(path) = explicit {
            figment = match path.extension().and_then(|e| e.to_str()) {
                Some("yaml" | "yml") => figment.merge(Yaml::file_exact(path)),
                Some("json") => figment.merge(Json::file_exact(path)),
                _ => figment.merge(Toml::file_exact(path)),
            };
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Load and validate the configuration.
    ///
    /// # Errors
    /// [`Load`](ErrorKind::Load) when a source is unreadable or malformed
    /// (a missing explicit file included), [`Invalid`](ErrorKind::Invalid)
    /// when a value is out of range.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        Self::from_figment(&Self::figment(explicit))
    }

    pub fn from_figment(figment: &Figment) -> Result<Self> {
        let config: Config = figment.extract().or_raise(|| ErrorKind::Load)?;
        config.validate()?;
        tracing::debug!(assets_root = %config.assets_root.display(), "configuration loaded");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| -> Result<()> { exn::bail!(ErrorKind::Invalid(reason)) };
        if self.assets_root.as_os_str().is_empty() {
            return invalid("assets_root is empty".to_string());
        }
        if self.loader.capacity == 0 {
            return invalid("loader.capacity must be at least 1".to_string());
        }
        if self.hashing.block_size == 0 {
            return invalid("hashing.block_size must be at least 1".to_string());
        }
        if let Some(ratio) = self.pipeline.lod_ratios.iter().find(|r| !(**r > 0.0 && **r <= 1.0)) {
            return invalid(format!("pipeline.lod_ratios contains {ratio}, expected (0, 1]"));
        }
        if !(1..=100).contains(&self.pipeline.jpeg_quality) {
            return invalid(format!("pipeline.jpeg_quality {} is outside 1..=100", self.pipeline.jpeg_quality));
        }
        if self.logging.level.trim().is_empty() {
            return invalid("logging.level is empty".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;
    use rstest::rstest;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::from_figment(&Config::figment_from(None, None)).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.pipeline.lod_ratios, [0.5, 0.25, 0.1]);
    }

    #[test]
    fn test_layering() {
        Jail::expect_with(|jail| {
            jail.create_dir("user")?;
            jail.create_file("user/wold.toml", "assets_root = \"/srv/user\"\n[loader]\ncapacity = 8\n")?;
            jail.create_file("explicit.yaml", "loader:\n  capacity: 16\npipeline:\n  jpeg_quality: 70\n")?;
            jail.set_env("WOLD_LOGGING__LEVEL", "debug");

            let figment = Config::figment_from(Some(Path::new("user")), Some(Path::new("explicit.yaml")));
            let config = Config::from_figment(&figment).unwrap();
            assert_eq!(config.assets_root, PathBuf::from("/srv/user"));
            assert_eq!(config.loader.capacity, 16);
            assert_eq!(config.pipeline.jpeg_quality, 70);
            assert_eq!(config.logging.level, "debug");
            assert_eq!(config.hashing.block_size, DEFAULT_HASH_BLOCK_SIZE);
            Ok(())
        });
    }

    #[test]
    fn test_missing_explicit_file() {
        Jail::expect_with(|_| {
            let err = Config::from_figment(&Config::figment_from(None, Some(Path::new("nope.toml")))).unwrap_err();
            assert!(matches!(&*err, ErrorKind::Load));
            Ok(())
        });
    }

    #[rstest]
    #[case("WOLD_LOADER__CAPACITY", "0")]
    #[case("WOLD_PIPELINE__JPEG_QUALITY", "0")]
    #[case("WOLD_HASHING__BLOCK_SIZE", "0")]
    fn test_out_of_range(#[case] key: &str, #[case] value: &str) {
        Jail::expect_with(|jail| {
            jail.set_env(key, value);
            let err = Config::from_figment(&Config::figment_from(None, None)).unwrap_err();
            assert!(matches!(&*err, ErrorKind::Invalid(_)));
            Ok(())
        });
    }

    #[test]
    fn test_bad_lod_ratio() {
        let mut config = Config::default();
        config.pipeline.lod_ratios.push(1.5);
        assert!(config.validate().is_err());
    }
}
