use serde::Deserialize;
use serde_json::Value;
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::{debug, warn};

use crate::template::{TemplateError, TemplateVars};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config directory does not exist: {0}")]
    MissingDir(PathBuf),
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("service `{name}` has invalid params: {source}")]
    InvalidParams {
        name: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("service `{name}` has an out-of-range session timeout: {secs}s")]
    InvalidTimeout { name: String, secs: f64 },
    #[error("service `{name}`: {source}")]
    Template {
        name: String,
        #[source]
        source: TemplateError,
    },
}

fn read(path: &Path) -> Result<String, ConfigError> {
    fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// String-valued table built from the scalar entries of a YAML/JSON map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScalarTable(BTreeMap<String, String>);

impl ScalarTable {
    pub fn from_pairs<K: Into<String>, V: Into<String>>(pairs: impl IntoIterator<Item = (K, V)>) -> Self {
        Self(pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }

    /// Keep strings, numbers and booleans; skip everything else.
    pub fn from_yaml(value: serde_yaml::Value) -> Self {
        let serde_yaml::Value::Mapping(map) = value else {
            return Self::default();
        };
        let mut out = BTreeMap::new();
        for (k, v) in map {
            let Some(key) = k.as_str() else { continue };
            let value = match v {
                serde_yaml::Value::String(s) => s,
                serde_yaml::Value::Number(n) => n.to_string(),
                serde_yaml::Value::Bool(b) => b.to_string(),
                _ => continue,
            };
            out.insert(key.to_string(), value);
        }
        Self(out)
    }

    /// Load a YAML or JSON map from `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = read(path)?;
        let value: serde_yaml::Value = serde_yaml::from_str(&raw).map_err(|source| ConfigError::Yaml {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::from_yaml(value))
    }

    pub fn load_optional(path: Option<&Path>) -> Result<Self, ConfigError> {
        path.map(Self::load).transpose().map(Option::unwrap_or_default)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Child process speaking over stdin/stdout.
    #[default]
    Stdio,
    /// Addressable endpoint.
    #[serde(alias = "sse", alias = "http", alias = "streamable_http")]
    Network,
}

/// On-disk shape of one service specification.
#[derive(Debug, Deserialize)]
pub struct ServiceSpecFile {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: TransportKind,
    #[serde(default)]
    pub params: Value,
    #[serde(default = "default_true")]
    pub cache_tools_list: bool,
    #[serde(default)]
    pub client_session_timeout_seconds: Option<f64>,
}

fn default_true() -> bool {
    true
}

fn stringify_map<'de, D>(de: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = BTreeMap::<String, Value>::deserialize(de)?;
    Ok(raw
        .into_iter()
        .map(|(k, v)| {
            let v = match v {
                Value::String(s) => s,
                other => other.to_string(),
            };
            (k, v)
        })
        .collect())
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct StdioParams {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, deserialize_with = "stringify_map")]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct NetworkParams {
    pub url: String,
    #[serde(default, deserialize_with = "stringify_map")]
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServiceParams {
    Stdio(StdioParams),
    Network(NetworkParams),
}

/// A capability service with every placeholder resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceSpec {
    pub name: String,
    pub params: ServiceParams,
    pub cache_tools_list: bool,
    pub session_timeout: Option<Duration>,
}

impl ServiceSpec {
    pub fn kind(&self) -> TransportKind {
        match self.params {
            ServiceParams::Stdio(_) => TransportKind::Stdio,
            ServiceParams::Network(_) => TransportKind::Network,
        }
    }

    pub fn from_file(
        file: ServiceSpecFile,
        default_name: &str,
        vars: &TemplateVars,
    ) -> Result<Self, ConfigError> {
        let name = file.name.unwrap_or_else(|| default_name.to_string());
        let params = vars
            .resolve_value(file.params)
            .map_err(|source| ConfigError::Template {
                name: name.clone(),
                source,
            })?;
        let invalid = |source| ConfigError::InvalidParams {
            name: name.clone(),
            source,
        };
        let params = match file.kind {
            TransportKind::Stdio => ServiceParams::Stdio(serde_json::from_value(params).map_err(invalid)?),
            TransportKind::Network => ServiceParams::Network(serde_json::from_value(params).map_err(invalid)?),
        };
        let session_timeout = match file.client_session_timeout_seconds {
            Some(secs) if secs.is_finite() && secs > 0.0 => Some(
                Duration::try_from_secs_f64(secs)
                    .map_err(|_| ConfigError::InvalidTimeout { name: name.clone(), secs })?,
            ),
            _ => None,
        };

        Ok(Self {
            name,
            params,
            cache_tools_list: file.cache_tools_list,
            session_timeout,
        })
    }

    pub fn load(path: &Path, vars: &TemplateVars) -> Result<Self, ConfigError> {
        let raw = read(path)?;
        let file: ServiceSpecFile = serde_yaml::from_str(&raw).map_err(|source| ConfigError::Yaml {
            path: path.to_path_buf(),
            source,
        })?;
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();
        Self::from_file(file, &stem, vars)
    }
}

/// Load every `*.yaml` / `*.yml` spec in `dir`. A file that fails to load
/// is logged and skipped; a missing directory is an error.
pub fn load_service_specs(
    dir: &Path,
    vars: &TemplateVars,
) -> Result<BTreeMap<String, ServiceSpec>, ConfigError> {
    if !dir.is_dir() {
        return Err(ConfigError::MissingDir(dir.to_path_buf()));
    }
    let entries = fs::read_dir(dir).map_err(|source| ConfigError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| {
            matches!(
                p.extension().and_then(|e| e.to_str()),
                Some("yaml") | Some("yml")
            )
        })
        .collect();
    paths.sort();

    let mut specs = BTreeMap::new();
    for path in paths {
        match ServiceSpec::load(&path, vars) {
            Ok(spec) => {
                debug!(service = %spec.name, kind = ?spec.kind(), "loaded service spec");
                specs.insert(spec.name.clone(), spec);
            }
            Err(e) => warn!(path = %path.display(), error = %e, "failed to load service spec"),
        }
    }
    Ok(specs)
}

#[derive(Debug, Deserialize)]
struct ConflictFile {
    #[serde(default)]
    conflict_groups: Option<Vec<Vec<String>>>,
}

/// Read `{"conflict_groups": [[name, ...], ...]}`. A missing file means no groups.
pub fn load_conflict_groups(path: &Path) -> Result<Vec<Vec<String>>, ConfigError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = read(path)?;
    let file: ConflictFile = serde_json::from_str(&raw).map_err(|source| ConfigError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(file.conflict_groups.unwrap_or_default())
}
