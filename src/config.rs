//! 配置模块，负责加载JSON配置文件
//!
//! 每个字段都有默认值，配置文件缺失字段（或没有配置文件）时仍可使用。
//! API 密钥也可以从环境变量读取。

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// 覆盖配置文件中 API key 的环境变量
pub const API_KEY_ENV: &str = "NL_DISPATCHER_API_KEY";

/// 配置错误
#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "configuration error: {}", self.message)
    }
}

impl std::error::Error for ConfigError {}

impl ConfigError {
    pub fn new(message: String) -> Self {
        Self { message }
    }
}

/// LLM 调用参数，每次调用时显式传入网关
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    pub model: String,
    /// OpenAI 兼容接口的根地址
    pub base_url: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub timeout_secs: u64,
    pub temperature: f32,
    pub max_tokens: u32,
    /// SQL 生成使用更低的温度
    pub sql_temperature: f32,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            timeout_secs: 30,
            temperature: 0.2,
            max_tokens: 500,
            sql_temperature: 0.1,
        }
    }
}

impl LlmSettings {
    /// 非空的 API key
    pub fn credential(&self) -> Option<&str> {
        self.api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
    }
}

/// 执行器的数量上限
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorLimits {
    /// 结果中展示的记录数上限
    pub display_limit: usize,
    /// 按 id 批量读取记录时的批大小
    pub id_batch_size: usize,
    /// 原始 SQL 最多返回的行数
    pub raw_row_limit: usize,
}

impl Default for ExecutorLimits {
    fn default() -> Self {
        Self {
            display_limit: 50,
            id_batch_size: 500,
            raw_row_limit: 1000,
        }
    }
}

/// 搜索配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub llm: LlmSettings,
    /// 用户可见的类别到实体类型的映射，按顺序选第一个可用的
    pub categories: BTreeMap<String, Vec<String>>,
    pub executor: ExecutorLimits,
    /// 是否启用 SQL 回退
    pub sql_fallback: bool,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            llm: LlmSettings::default(),
            categories: default_categories(),
            executor: ExecutorLimits::default(),
            sql_fallback: true,
        }
    }
}

fn default_categories() -> BTreeMap<String, Vec<String>> {
    let table: [(&str, &[&str]); 15] = [
        ("customers", &["contact", "client"]),
        ("suppliers", &["contact"]),
        ("partners", &["contact"]),
        ("invoices", &["invoice"]),
        ("bills", &["invoice"]),
        ("documents", &["invoice"]),
        ("products", &["product", "product_variant"]),
        ("inventory", &["stock_move", "product"]),
        ("orders", &["sale_order", "purchase_order"]),
        ("sales", &["sale_order"]),
        ("purchases", &["purchase_order"]),
        ("crm", &["lead"]),
        ("opportunities", &["lead"]),
        ("tasks", &["task"]),
        ("projects", &["task"]),
    ];
    table
        .iter()
        .map(|(label, entities)| {
            (
                label.to_string(),
                entities.iter().map(|e| e.to_string()).collect(),
            )
        })
        .collect()
}

impl SearchConfig {
    /// 从JSON文件加载配置
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();

        // 检查文件是否存在
        if !path_ref.exists() {
            return Err(ConfigError::new(format!(
                "config file not found: {}",
                path_ref.display()
            )));
        }

        let content = fs::read_to_string(path_ref).map_err(|e| {
            ConfigError::new(format!("cannot read {}: {}", path_ref.display(), e))
        })?;

        Self::from_json_str(&content)
            .map_err(|e| ConfigError::new(format!("{} ({})", e.message, path_ref.display())))
    }

    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(content)
            .map_err(|e| ConfigError::new(format!("invalid JSON configuration: {}", e)))
    }

    /// 用环境变量覆盖 API key
    pub fn apply_env(mut self) -> Self {
        if let Ok(key) = std::env::var(API_KEY_ENV) {
            if !key.trim().is_empty() {
                self.llm.api_key = Some(key);
            }
        }
        self
    }

    /// 类别对应的实体类型列表
    pub fn entities_for(&self, category: &str) -> Option<&[String]> {
        self.categories.get(category).map(Vec::as_slice)
    }
}
