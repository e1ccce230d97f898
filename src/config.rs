use crate::error::{CodectxError, Result};
use config::{Config, Environment, File};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Name of the project-local hidden directory holding persisted state.
pub const DEFAULT_DIR_NAME: &str = ".codectx";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CodectxConfig {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub embedding: EmbeddingConfig,

    #[serde(default)]
    pub retrieval: RetrievalConfig,

    #[serde(default)]
    pub indexer: IndexerConfig,

    #[serde(default)]
    pub context: ContextConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackendKind {
    #[default]
    Sqlite,
    Vector,
}

impl StorageBackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageBackendKind::Sqlite => "sqlite",
            StorageBackendKind::Vector => "vector",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackendKind,
    #[serde(default = "default_dir_name")]
    pub dir_name: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingProviderKind {
    #[default]
    Hashed,
    Ollama,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default)]
    pub provider: EmbeddingProviderKind,
    #[serde(default = "default_dimension")]
    pub dimension: usize,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

/// Search cutoffs are cosine distances, `1 - similarity`, in `[0, 2]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    #[serde(default = "default_relevant_distance")]
    pub max_relevant_distance: f32,
    #[serde(default = "default_similar_code_distance")]
    pub max_similar_code_distance: f32,
    #[serde(default = "default_relevant_distance")]
    pub max_semantic_distance: f32,
    #[serde(default = "default_true")]
    pub quality_filter: bool,
    #[serde(default = "default_max_semantic_score")]
    pub max_semantic_score: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexerConfig {
    #[serde(default = "default_true")]
    pub use_language_server: bool,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "default_max_files")]
    pub max_files: usize,
    /// Glob patterns, relative to the project root, excluded from indexing.
    #[serde(default)]
    pub exclude: Vec<String>,
    /// Language name -> command line of its language server.
    #[serde(default = "default_servers")]
    pub servers: HashMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    #[serde(default = "default_change_history")]
    pub change_history: usize,
    #[serde(default = "default_tree_depth")]
    pub tree_depth: usize,
    #[serde(default = "default_readme_lines")]
    pub readme_lines: usize,
}

fn default_true() -> bool {
    true
}

fn default_dir_name() -> String {
    DEFAULT_DIR_NAME.to_string()
}

fn default_dimension() -> usize {
    384
}

fn default_base_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_model() -> String {
    "all-minilm".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    2
}

fn default_relevant_distance() -> f32 {
    0.75
}

fn default_similar_code_distance() -> f32 {
    0.6
}

fn default_max_semantic_score() -> f32 {
    10.0
}

fn default_request_timeout_ms() -> u64 {
    2000
}

fn default_handshake_timeout_ms() -> u64 {
    5000
}

fn default_max_files() -> usize {
    10_000
}

fn default_change_history() -> usize {
    50
}

fn default_tree_depth() -> usize {
    3
}

fn default_readme_lines() -> usize {
    15
}

fn default_servers() -> HashMap<String, Vec<String>> {
    let ts = vec![
        "typescript-language-server".to_string(),
        "--stdio".to_string(),
    ];
    HashMap::from([
        ("python".to_string(), vec!["pylsp".to_string()]),
        ("javascript".to_string(), ts.clone()),
        ("typescript".to_string(), ts),
        ("go".to_string(), vec!["gopls".to_string()]),
        ("rust".to_string(), vec!["rust-analyzer".to_string()]),
        ("nim".to_string(), vec!["nimlsp".to_string()]),
    ])
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackendKind::default(),
            dir_name: default_dir_name(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProviderKind::default(),
            dimension: default_dimension(),
            base_url: default_base_url(),
            model: default_model(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            max_relevant_distance: default_relevant_distance(),
            max_similar_code_distance: default_similar_code_distance(),
            max_semantic_distance: default_relevant_distance(),
            quality_filter: true,
            max_semantic_score: default_max_semantic_score(),
        }
    }
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            use_language_server: true,
            request_timeout_ms: default_request_timeout_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            max_files: default_max_files(),
            exclude: Vec::new(),
            servers: default_servers(),
        }
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            change_history: default_change_history(),
            tree_depth: default_tree_depth(),
            readme_lines: default_readme_lines(),
        }
    }
}

impl CodectxConfig {
    /// Persisted state directory for a project root.
    pub fn data_dir(&self, project_root: &Path) -> PathBuf {
        project_root.join(&self.storage.dir_name)
    }

    /// Configuration suited to tests and offline use: no language servers, hashed embeddings.
    pub fn offline() -> Self {
        let mut config = Self::default();
        config.indexer.use_language_server = false;
        config.embedding.provider = EmbeddingProviderKind::Hashed;
        config
    }
}

pub struct ConfigManager {
    config: CodectxConfig,
    project_config_path: PathBuf,
}

impl ConfigManager {
    /// Load layered configuration for a project: defaults, user file, project file, environment.
    ///
    /// The project file lives in the state directory, so it follows `storage.dir_name`
    /// when the user file or the environment renames that directory.
    pub fn new(project_root: &Path) -> Result<Self> {
        let (config, project_config_path) =
            Self::resolve(project_root, Self::user_config_path().as_deref())?;

        Ok(Self {
            config,
            project_config_path,
        })
    }

    fn resolve(project_root: &Path, user_path: Option<&Path>) -> Result<(CodectxConfig, PathBuf)> {
        let default_path = project_root.join(DEFAULT_DIR_NAME).join("config.toml");
        let config = Self::load_layers(user_path, &default_path)?;
        if config.storage.dir_name == DEFAULT_DIR_NAME {
            return Ok((config, default_path));
        }

        let project_path = config.data_dir(project_root).join("config.toml");
        debug!(path = %project_path.display(), "Using project config from renamed state directory");
        let config = Self::load_layers(user_path, &project_path)?;
        Ok((config, project_path))
    }

    pub fn load(project_root: &Path) -> Result<CodectxConfig> {
        Ok(Self::new(project_root)?.config)
    }

    pub fn save(&self) -> Result<()> {
        let toml = toml::to_string_pretty(&self.config).map_err(|e| {
            CodectxError::Configuration(format!("Failed to serialize config: {}", e))
        })?;

        if let Some(parent) = self.project_config_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.project_config_path, toml)
            .map_err(|e| CodectxError::Configuration(format!("Failed to write config: {}", e)))?;

        Ok(())
    }

    pub fn get(&self) -> &CodectxConfig {
        &self.config
    }

    pub fn get_mut(&mut self) -> &mut CodectxConfig {
        &mut self.config
    }

    pub fn project_config_path(&self) -> &Path {
        &self.project_config_path
    }

    fn user_config_path() -> Option<PathBuf> {
        ProjectDirs::from("dev", "codectx", "codectx")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    fn load_layers(user_path: Option<&Path>, project_path: &Path) -> Result<CodectxConfig> {
        let defaults = Config::try_from(&CodectxConfig::default())
            .map_err(|e| CodectxError::Configuration(format!("Failed to seed defaults: {}", e)))?;

        let mut builder = Config::builder().add_source(defaults);
        if let Some(user_path) = user_path {
            builder = builder.add_source(File::from(user_path.to_path_buf()).required(false));
        }

        let s = builder
            .add_source(File::from(project_path.to_path_buf()).required(false))
            .add_source(
                Environment::with_prefix("CODECTX")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .map_err(|e| CodectxError::Configuration(format!("Failed to build config: {}", e)))?;

        let config: CodectxConfig = s.try_deserialize().map_err(|e| {
            CodectxError::Configuration(format!("Failed to deserialize config: {}", e))
        })?;

        Ok(config)
    }
}
