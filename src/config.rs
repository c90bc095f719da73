use indexmap::IndexMap;
use serde::Deserialize;
use std::fs;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::GatewayError;

pub const DEFAULT_LISTEN_PORT: u16 = 4000;

/// The gateway's YAML configuration. Subgraphs are registered in the order
/// they appear in the file.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct GatewayConfig {
    #[serde(default)]
    pub listen: Option<SocketAddr>,
    #[serde(default = "default_graphql_path")]
    pub graphql_path: String,
    #[serde(default = "default_timeout_ms")]
    pub subgraph_timeout_ms: u64,
    pub subgraphs: IndexMap<String, SubgraphConfig>,
    /// Directory schema files are resolved against.
    #[serde(skip)]
    base_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct SubgraphConfig {
    pub routing_url: String,
    /// Without a schema file the SDL is fetched from the subgraph itself.
    #[serde(default)]
    pub schema: Option<SchemaConfig>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct SchemaConfig {
    pub file: String,
}

fn default_graphql_path() -> String {
    "/graphql".to_string()
}

fn default_timeout_ms() -> u64 {
    30_000
}

impl GatewayConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, GatewayError> {
        let path = path.as_ref();
        tracing::debug!(path = %path.display(), "loading gateway config");

        let contents = fs::read_to_string(path).map_err(|source| GatewayError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new(""));
        Self::from_yaml(&contents, base_dir)
    }

    pub fn from_yaml(contents: &str, base_dir: impl Into<PathBuf>) -> Result<Self, GatewayError> {
        let mut config: GatewayConfig =
            serde_yaml::from_str(contents).map_err(|e| GatewayError::Config(e.to_string()))?;
        if !config.graphql_path.starts_with('/') {
            return Err(GatewayError::Config(format!(
                "graphql_path `{}` must start with `/`",
                config.graphql_path
            )));
        }
        config.base_dir = base_dir.into();
        Ok(config)
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen
            .unwrap_or_else(|| SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_LISTEN_PORT)))
    }

    pub fn subgraph_timeout(&self) -> Duration {
        Duration::from_millis(self.subgraph_timeout_ms)
    }

    pub fn timeout_for(&self, subgraph: &str) -> Duration {
        self.subgraphs
            .get(subgraph)
            .and_then(|config| config.timeout_ms)
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.subgraph_timeout())
    }

    /// Absolute location of a subgraph's schema file, if it has one.
    pub fn schema_path(&self, subgraph: &SubgraphConfig) -> Option<PathBuf> {
        subgraph
            .schema
            .as_ref()
            .map(|schema| self.base_dir.join(&schema.file))
    }
}
