//! 应用配置模块
//!
//! config.json 固定放在平台配置目录下，数据目录（数据库、日志、锁）
//! 默认与之相同，可通过 data_path 指到别处。各节按需读写，互不覆盖。

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// 配置目录，config.json 所在位置
pub fn config_dir() -> PathBuf {
    crate::dirs::config_dir()
        .map(|p| p.join("synckeeper"))
        .unwrap_or_else(|| PathBuf::from(".synckeeper"))
}

/// 数据目录：默认等于配置目录，config.json 里的 data_path 可以覆盖
pub fn data_dir() -> PathBuf {
    let default_dir = config_dir();
    DataConfig::load(&default_dir)
        .data_path
        .map(PathBuf::from)
        .filter(|p| p.is_dir())
        .unwrap_or(default_dir)
}

/// 读取 config.json 中的某一节
pub fn read_config_section<T: DeserializeOwned>(config_dir: &Path, section: &str) -> Option<T> {
    let content = fs::read_to_string(config_dir.join("config.json")).ok()?;
    let config: serde_json::Value = serde_json::from_str(&content).ok()?;
    serde_json::from_value(config.get(section)?.clone()).ok()
}

/// 写回 config.json 中的某一节，其余内容原样保留
pub fn write_config_section<T: Serialize>(
    config_dir: &Path,
    section: &str,
    value: &T,
) -> io::Result<()> {
    fs::create_dir_all(config_dir)?;
    let config_file = config_dir.join("config.json");

    let mut config: serde_json::Value = if config_file.exists() {
        let content = fs::read_to_string(&config_file)?;
        serde_json::from_str(&content).unwrap_or_else(|_| serde_json::json!({}))
    } else {
        serde_json::json!({})
    };

    config[section] =
        serde_json::to_value(value).map_err(|e| io::Error::other(e.to_string()))?;

    fs::write(&config_file, serde_json::to_string_pretty(&config)?)
}

/// 数据目录配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataConfig {
    /// 自定义数据目录（数据库、日志、锁文件的存放处）
    #[serde(default)]
    pub data_path: Option<String>,
}

impl DataConfig {
    pub fn load(config_dir: &Path) -> Self {
        read_config_section(config_dir, "data").unwrap_or_default()
    }

    pub fn save(&self, config_dir: &Path) -> io::Result<()> {
        write_config_section(config_dir, "data", self)
    }
}
