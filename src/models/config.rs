//! Configuration models for refund-audit.
//!
//! Every tunable of a run lives here. All sections have defaults, so an empty
//! file is a valid configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

/// Top-level configuration for refund-audit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Classification service endpoint
    #[serde(default)]
    pub service: ServiceConfig,

    /// Default parameters for new tasks
    #[serde(default)]
    pub task: TaskDefaults,

    /// Where task state and artifacts live
    #[serde(default)]
    pub storage: StorageConfig,

    /// Column-name candidates used to locate fields in the row source
    #[serde(default)]
    pub columns: ColumnConfig,
}

/// Classification service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// API key (can also be set via the env var named in `api_key_env`)
    #[serde(default)]
    pub api_key: Option<String>,

    /// Environment variable name for the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Base URL of the OpenAI-compatible endpoint
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_api_key_env() -> String {
    "DASHSCOPE_API_KEY".to_string()
}

fn default_base_url() -> String {
    "https://dashscope.aliyuncs.com/compatible-mode/v1".to_string()
}

fn default_timeout() -> u64 {
    120
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_key_env: default_api_key_env(),
            base_url: default_base_url(),
            timeout_secs: default_timeout(),
        }
    }
}

/// Defaults applied to a task when the operator does not override them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDefaults {
    /// Model used by the classification service
    #[serde(default = "default_model_name")]
    pub model_name: String,

    /// Maximum evidence references sent per row
    #[serde(default = "default_max_evidence")]
    pub max_evidence_items_per_row: usize,

    /// Minimum seconds between two service calls of one task
    #[serde(default = "default_min_interval")]
    pub min_interval_sec: f64,

    /// Retries after the first attempt for retryable failures
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base of the exponential backoff, in seconds
    #[serde(default = "default_backoff_base")]
    pub backoff_base_sec: f64,

    /// Upper bound of a single backoff sleep, in seconds
    #[serde(default = "default_backoff_cap")]
    pub backoff_cap_sec: f64,

    /// Maximum rows a task processes
    #[serde(default = "default_max_rows")]
    pub max_rows: usize,

    /// Persist the working rows every N processed rows
    #[serde(default = "default_checkpoint_every")]
    pub checkpoint_every: usize,
}

fn default_model_name() -> String {
    "qwen3-vl-flash".to_string()
}

fn default_max_evidence() -> usize {
    4
}

fn default_min_interval() -> f64 {
    0.8
}

fn default_max_retries() -> u32 {
    4
}

fn default_backoff_base() -> f64 {
    1.0
}

fn default_backoff_cap() -> f64 {
    60.0
}

fn default_max_rows() -> usize {
    300
}

fn default_checkpoint_every() -> usize {
    10
}

impl Default for TaskDefaults {
    fn default() -> Self {
        Self {
            model_name: default_model_name(),
            max_evidence_items_per_row: default_max_evidence(),
            min_interval_sec: default_min_interval(),
            max_retries: default_max_retries(),
            backoff_base_sec: default_backoff_base(),
            backoff_cap_sec: default_backoff_cap(),
            max_rows: default_max_rows(),
            checkpoint_every: default_checkpoint_every(),
        }
    }
}

/// Storage layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root data directory
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl StorageConfig {
    /// Directory holding task records, row sets and runtime logs.
    pub fn task_dir(&self) -> PathBuf {
        self.data_dir.join("tasks")
    }

    /// Directory holding exported artifacts.
    pub fn artifact_dir(&self) -> PathBuf {
        self.data_dir.join("artifacts")
    }
}

/// Candidate column names, tried in order, then keyword fallback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnConfig {
    #[serde(default = "default_amount_columns")]
    pub amount: Vec<String>,

    #[serde(default = "default_evidence_columns")]
    pub evidence: Vec<String>,

    #[serde(default = "default_id_columns")]
    pub id: Vec<String>,

    #[serde(default = "default_id_keywords")]
    pub id_keywords: Vec<String>,

    #[serde(default = "default_order_columns")]
    pub order_no: Vec<String>,

    #[serde(default = "default_order_keywords")]
    pub order_no_keywords: Vec<String>,

    #[serde(default = "default_logistics_columns")]
    pub logistics_no: Vec<String>,

    #[serde(default = "default_logistics_keywords")]
    pub logistics_no_keywords: Vec<String>,
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|s| s.to_string()).collect()
}

fn default_amount_columns() -> Vec<String> {
    strings(&[
        "*寄回快递实付金额",
        "寄回快递实付金额",
        "*寄回运费金额",
        "寄回运费金额",
        "退回运费金额",
        "*退回运费金额",
        "amount",
    ])
}

fn default_evidence_columns() -> Vec<String> {
    strings(&[
        "*商品瑕疵+金额截图",
        "商品瑕疵+金额截图",
        "寄回运费截图",
        "运费截图",
        "截图",
        "图片URL",
        "图片链接",
        "evidence",
    ])
}

fn default_id_columns() -> Vec<String> {
    strings(&["ID", "id", "*ID", "旺旺ID", "*旺旺ID", "用户ID", "买家ID", "会员ID"])
}

fn default_id_keywords() -> Vec<String> {
    strings(&["id", "旺旺"])
}

fn default_order_columns() -> Vec<String> {
    strings(&[
        "订单号",
        "*订单号",
        "订单编号",
        "主订单号",
        "子订单号",
        "多笔订单号",
        "订单号（多笔订单分开提交）",
        "*订单号（多笔订单分开提交）",
        "order_no",
    ])
}

fn default_order_keywords() -> Vec<String> {
    strings(&["订单", "单号", "order"])
}

fn default_logistics_columns() -> Vec<String> {
    strings(&[
        "*寄回换货快递单号",
        "寄回换货快递单号",
        "*退回物流单号",
        "退回物流单号",
        "寄回物流单号",
        "快递单号",
        "logistics_no",
    ])
}

fn default_logistics_keywords() -> Vec<String> {
    strings(&["物流", "快递", "运单", "logistics"])
}

impl Default for ColumnConfig {
    fn default() -> Self {
        Self {
            amount: default_amount_columns(),
            evidence: default_evidence_columns(),
            id: default_id_columns(),
            id_keywords: default_id_keywords(),
            order_no: default_order_columns(),
            order_no_keywords: default_order_keywords(),
            logistics_no: default_logistics_columns(),
            logistics_no_keywords: default_logistics_keywords(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_owned(),
            source: e,
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_owned(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load the file if it exists, otherwise fall back to defaults.
    pub fn from_file_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Check value ranges that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let task = &self.task;
        if task.model_name.trim().is_empty() {
            return Err(ConfigError::Invalid("task.model_name must not be empty".into()));
        }
        if task.min_interval_sec < 0.0 || !task.min_interval_sec.is_finite() {
            return Err(ConfigError::Invalid("task.min_interval_sec must be >= 0".into()));
        }
        if task.backoff_base_sec < 0.0 || !task.backoff_base_sec.is_finite() {
            return Err(ConfigError::Invalid("task.backoff_base_sec must be >= 0".into()));
        }
        if task.max_evidence_items_per_row == 0 {
            return Err(ConfigError::Invalid(
                "task.max_evidence_items_per_row must be at least 1".into(),
            ));
        }
        if task.checkpoint_every == 0 {
            return Err(ConfigError::Invalid("task.checkpoint_every must be at least 1".into()));
        }
        Ok(())
    }

    /// Resolve the API key: explicit value first, then config, then environment.
    pub fn resolve_api_key(&self, explicit: Option<&str>) -> Result<String, ConfigError> {
        if let Some(key) = explicit.map(str::trim).filter(|k| !k.is_empty()) {
            return Ok(key.to_string());
        }

        if let Some(key) = &self.service.api_key {
            let key = expand_env_vars(key);
            if !key.trim().is_empty() {
                return Ok(key.trim().to_string());
            }
        }

        std::env::var(&self.service.api_key_env)
            .ok()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .ok_or_else(|| ConfigError::MissingApiKey {
                env_var: self.service.api_key_env.clone(),
            })
    }
}

static ENV_VAR: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"\$\{([^}]+)\}").expect("valid env var pattern"));

/// Expand environment variables in a string.
///
/// Supports ${VAR_NAME} syntax.
/// If the variable is not set, the placeholder is left unchanged.
pub fn expand_env_vars(s: &str) -> String {
    let mut result = s.to_string();

    for cap in ENV_VAR.captures_iter(s) {
        let var_name = &cap[1];
        if let Ok(value) = std::env::var(var_name) {
            result = result.replace(&cap[0], &value);
        }
    }

    result
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Missing API key: pass --api-key, set {env_var}, or set service.api_key in config")]
    MissingApiKey { env_var: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.task.max_rows, 300);
        assert_eq!(config.task.max_retries, 4);
        assert_eq!(config.task.checkpoint_every, 10);
        assert_eq!(config.service.api_key_env, "DASHSCOPE_API_KEY");
        assert!(config.columns.amount.contains(&"寄回运费金额".to_string()));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_override() {
        let config: Config = toml::from_str(
            r#"
            [task]
            min_interval_sec = 0.25
            max_rows = 50

            [storage]
            data_dir = "/tmp/audit"
            "#,
        )
        .unwrap();
        assert_eq!(config.task.min_interval_sec, 0.25);
        assert_eq!(config.task.max_rows, 50);
        assert_eq!(config.task.model_name, "qwen3-vl-flash");
        assert_eq!(config.storage.task_dir(), PathBuf::from("/tmp/audit/tasks"));
    }

    #[test]
    fn test_validate_rejects_zero_checkpoint_cadence() {
        let mut config = Config::default();
        config.task.checkpoint_every = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_explicit_api_key_wins() {
        let mut config = Config::default();
        config.service.api_key = Some("from-config".into());
        assert_eq!(config.resolve_api_key(Some("  cli-key ")).unwrap(), "cli-key");
        assert_eq!(config.resolve_api_key(Some("   ")).unwrap(), "from-config");
    }

    #[test]
    fn test_missing_api_key() {
        let mut config = Config::default();
        config.service.api_key_env = "REFUND_AUDIT_TEST_UNSET_KEY_VAR".into();
        assert!(matches!(
            config.resolve_api_key(None),
            Err(ConfigError::MissingApiKey { .. })
        ));
    }
}
