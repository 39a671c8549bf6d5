use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

use crate::cache::GenerationId;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Scope of the cache; requests to any other origin are passed through
  pub origin: Url,
  /// Paths under this prefix are served network-first
  #[serde(default = "default_api_prefix")]
  pub api_prefix: String,
  #[serde(default)]
  pub cache: CacheConfig,
  /// Paths installed into the static generation at boot
  #[serde(default = "default_manifest")]
  pub manifest: Vec<String>,
  #[serde(default)]
  pub network: NetworkConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Database path (defaults to the user data directory)
  pub path: Option<PathBuf>,
  #[serde(rename = "static", default = "default_static_generation")]
  pub static_generation: GenerationConfig,
  #[serde(rename = "runtime", default = "default_runtime_generation")]
  pub runtime_generation: GenerationConfig,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      path: None,
      static_generation: default_static_generation(),
      runtime_generation: default_runtime_generation(),
    }
  }
}

/// Name and version label of a generation; bump the version to roll it over.
#[derive(Debug, Clone, Deserialize)]
pub struct GenerationConfig {
  pub name: String,
  pub version: String,
}

impl GenerationConfig {
  pub fn id(&self) -> GenerationId {
    GenerationId::new(&self.name, &self.version)
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NetworkConfig {
  /// Per-request timeout; unset means no limit beyond the transport's own
  pub timeout_secs: Option<u64>,
  pub user_agent: Option<String>,
}

fn default_api_prefix() -> String {
  "/api/".to_string()
}

fn default_manifest() -> Vec<String> {
  ["/", "/manifest.json", "/icon-192.png", "/icon-512.png"]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_static_generation() -> GenerationConfig {
  GenerationConfig {
    name: "app-static".to_string(),
    version: "v1".to_string(),
  }
}

fn default_runtime_generation() -> GenerationConfig {
  GenerationConfig {
    name: "app-runtime".to_string(),
    version: "v1".to_string(),
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./shellcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/shellcache/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/shellcache/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("shellcache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("shellcache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Invalid config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    let config: Config =
      serde_yaml::from_str(contents).map_err(|e| eyre!("Failed to parse config: {}", e))?;
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    if !self.api_prefix.starts_with('/') {
      return Err(eyre!("api_prefix must start with '/': {}", self.api_prefix));
    }

    if let Some(path) = self.manifest.iter().find(|p| !p.starts_with('/')) {
      return Err(eyre!("Manifest paths must start with '/': {}", path));
    }

    for generation in [&self.cache.static_generation, &self.cache.runtime_generation] {
      if generation.name.trim().is_empty() || generation.version.trim().is_empty() {
        return Err(eyre!("Generation name and version must not be empty"));
      }
    }

    let static_name = self.cache.static_generation.id().storage_name();
    if static_name == self.cache.runtime_generation.id().storage_name() {
      return Err(eyre!(
        "Static and runtime generations must have different names: {}",
        static_name
      ));
    }

    Ok(())
  }

  /// Resolve a URL given on the command line against the origin.
  pub fn resolve(&self, url: &str) -> Result<Url> {
    self
      .origin
      .join(url)
      .map_err(|e| eyre!("Invalid URL {}: {}", url, e))
  }
}
