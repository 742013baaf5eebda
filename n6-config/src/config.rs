use std::collections::BTreeMap;
use std::env;
use std::error::Error;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use n6_aggregator::AggregatorConfig;
use n6_log::{LogConfig, LogLevel};
use n6_statsd::MetricsConfig;
use serde::{Deserialize, Serialize};

/// Basename of the config file inside the config folder.
const CONFIG_FILE_NAME: &str = "config.yml";

/// Environment variable overriding [`AggregatorConfig::dbpath`].
pub const DBPATH_ENV: &str = "N6_AGGREGATOR_DBPATH";

/// Environment variable overriding the log level.
pub const LOG_LEVEL_ENV: &str = "N6_LOG_LEVEL";

/// Defines the source of a config error.
#[derive(Debug)]
enum ConfigErrorSource {
    /// An error occurring independently.
    None,
    /// An error originating from a configuration file.
    File(PathBuf),
    /// An error originating in a field override.
    FieldOverride(&'static str),
}

/// Indicates config related errors.
#[derive(Debug)]
pub struct ConfigError {
    source: ConfigErrorSource,
    kind: ConfigErrorKind,
    cause: Option<Box<dyn Error + Send + Sync + 'static>>,
}

impl ConfigError {
    fn new(kind: ConfigErrorKind) -> Self {
        Self {
            source: ConfigErrorSource::None,
            kind,
            cause: None,
        }
    }

    fn wrap<E>(cause: E, kind: ConfigErrorKind) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self {
            cause: Some(Box::new(cause)),
            ..Self::new(kind)
        }
    }

    fn for_field<E>(cause: E, field: &'static str) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self::wrap(cause, ConfigErrorKind::InvalidValue).field(field)
    }

    fn file(mut self, path: impl AsRef<Path>) -> Self {
        self.source = ConfigErrorSource::File(path.as_ref().to_path_buf());
        self
    }

    fn field(mut self, name: &'static str) -> Self {
        self.source = ConfigErrorSource::FieldOverride(name);
        self
    }

    /// Returns the error kind of the error.
    pub fn kind(&self) -> ConfigErrorKind {
        self.kind
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            ConfigErrorSource::None => write!(f, "{}", self.kind),
            ConfigErrorSource::File(file_name) => {
                write!(f, "{} (file {})", self.kind, file_name.display())
            }
            ConfigErrorSource::FieldOverride(name) => write!(f, "{} (field {name})", self.kind),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.cause.as_deref().map(|cause| cause as &(dyn Error + 'static))
    }
}

/// Indicates config related errors.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, thiserror::Error)]
pub enum ConfigErrorKind {
    /// Failed to open the file.
    #[error("could not open config file")]
    CouldNotOpenFile,
    /// Parsing YAML failed.
    #[error("could not parse yaml config file")]
    BadYaml,
    /// Invalid config value.
    #[error("invalid config value")]
    InvalidValue,
}

/// An invalid value that has no error type of its own.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct ValidationError(&'static str);

/// Configuration overrides from environment variables.
#[derive(Debug, Default)]
pub struct OverridableConfig {
    /// Path of the index file, see [`AggregatorConfig::dbpath`].
    pub dbpath: Option<String>,
    /// The log level.
    pub log_level: Option<String>,
}

impl OverridableConfig {
    /// Reads the overrides from [`DBPATH_ENV`] and [`LOG_LEVEL_ENV`].
    pub fn from_env() -> Self {
        Self {
            dbpath: env::var(DBPATH_ENV).ok(),
            log_level: env::var(LOG_LEVEL_ENV).ok(),
        }
    }
}

/// Controls reporting of internal metrics.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Metrics {
    /// Host and port of the statsd server.
    ///
    /// Metrics are not reported if this is not set.
    pub statsd: Option<String>,
    /// Prefix which is prepended to all metric names.
    pub prefix: String,
    /// Tags that are added to all metrics.
    pub default_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            statsd: None,
            prefix: "n6".to_owned(),
            default_tags: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default)]
struct ConfigValues {
    logging: LogConfig,
    metrics: Metrics,
    aggregator: AggregatorConfig,
}

impl ConfigValues {
    fn load(path: &Path) -> Result<Self, ConfigError> {
        let f = fs::File::open(path)
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::CouldNotOpenFile).file(path))?;

        serde_yaml::from_reader(io::BufReader::new(f))
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::BadYaml).file(path))
    }
}

/// Config struct.
#[derive(Debug)]
pub struct Config {
    values: ConfigValues,
    path: PathBuf,
}

impl Config {
    /// Loads the config from the `config.yml` file in the given config folder.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        let path = env::current_dir()
            .map(|x| x.join(path.as_ref()))
            .unwrap_or_else(|_| path.as_ref().to_path_buf());

        let file = path.join(CONFIG_FILE_NAME);
        let mut config = Config {
            values: ConfigValues::load(&file)?,
            path,
        };

        config.resolve_paths();
        config.validate().map_err(|e| e.file(&file))?;
        Ok(config)
    }

    /// Applies overrides to the loaded config.
    pub fn apply_override(
        &mut self,
        overrides: OverridableConfig,
    ) -> Result<&mut Self, ConfigError> {
        if let Some(dbpath) = overrides.dbpath {
            self.values.aggregator.dbpath = PathBuf::from(dbpath);
            self.resolve_paths();
            self.validate().map_err(|e| e.field("dbpath"))?;
        }

        if let Some(level) = overrides.log_level {
            self.values.logging.level = level
                .parse::<LogLevel>()
                .map_err(|err| ConfigError::for_field(err, "log_level"))?;
        }

        Ok(self)
    }

    /// The config folder this config was loaded from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the logging configuration.
    pub fn logging(&self) -> &LogConfig {
        &self.values.logging
    }

    /// Returns the configuration of the statsd client, if metrics are enabled.
    pub fn metrics_config(&self) -> Option<MetricsConfig> {
        let metrics = &self.values.metrics;
        let host = metrics.statsd.clone()?;

        Some(MetricsConfig {
            prefix: metrics.prefix.clone(),
            host,
            default_tags: metrics.default_tags.clone(),
        })
    }

    /// Returns the aggregator configuration.
    pub fn aggregator(&self) -> &AggregatorConfig {
        &self.values.aggregator
    }

    fn resolve_paths(&mut self) {
        let dbpath = &mut self.values.aggregator.dbpath;
        if dbpath.is_relative() && !dbpath.as_os_str().is_empty() {
            *dbpath = self.path.join(&*dbpath);
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let dbpath = &self.values.aggregator.dbpath;

        if dbpath.as_os_str().is_empty() {
            return Err(ConfigError::wrap(
                ValidationError("aggregator.dbpath is not set"),
                ConfigErrorKind::InvalidValue,
            ));
        }

        if dbpath.file_name().is_none() {
            return Err(ConfigError::wrap(
                ValidationError("aggregator.dbpath does not name a file"),
                ConfigErrorKind::InvalidValue,
            ));
        }

        Ok(())
    }
}
