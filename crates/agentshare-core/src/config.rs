//! 应用配置和持久化
//!
//! 提供监听端口、存储目录、压缩级别等设置的存储和读取。

use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// 文件完整性校验使用的哈希算法
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    #[default]
    Sha512,
    Sha256,
}

impl HashAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            HashAlgorithm::Sha512 => "sha512",
            HashAlgorithm::Sha256 => "sha256",
        }
    }
}

/// 应用设置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// 设备名称
    pub device_name: String,
    /// 用户名称
    pub user_name: String,
    /// 监听地址
    pub bind_address: String,
    /// 监听端口（0 表示由系统分配）
    pub port: u16,
    /// 持久化目录（device.json / user.json / settings.json）
    pub storage_dir: PathBuf,
    /// gzip 压缩级别，0 表示不压缩
    pub compression: u32,
    pub hash_algorithm: HashAlgorithm,
    /// 详细日志模式
    pub verbose: bool,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            device_name: get_default_device_name(),
            user_name: get_default_device_name(),
            bind_address: "0.0.0.0".to_string(),
            port: 0,
            storage_dir: dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("agentshare"),
            compression: 0,
            hash_algorithm: HashAlgorithm::Sha512,
            verbose: false,
        }
    }
}

impl AppSettings {
    /// 获取配置文件路径
    fn config_path() -> PathBuf {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("agentshare");
        config_dir.join("settings.toml")
    }

    /// 加载设置（如果文件不存在则使用默认值）
    pub fn load() -> Self {
        let path = Self::config_path();
        if path.exists() {
            match fs::read_to_string(&path) {
                Ok(content) => match Self::from_toml(&content) {
                    Ok(settings) => {
                        debug!("Loaded settings from {:?}", path);
                        return settings;
                    }
                    Err(e) => {
                        log::warn!("Failed to parse settings: {}, using defaults", e);
                    }
                },
                Err(e) => {
                    log::warn!("Failed to read settings file: {}, using defaults", e);
                }
            }
        }
        Self::default()
    }

    /// 从 TOML 文本解析，缺失字段取默认值，压缩级别限制在 0..=9
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        let mut settings: Self = toml::from_str(content)?;
        settings.compression = settings.compression.min(9);
        Ok(settings)
    }

    /// 保存设置
    pub fn save(&self) -> anyhow::Result<()> {
        let path = Self::config_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(&path, content)?;
        debug!("Saved settings to {:?}", path);
        Ok(())
    }

    /// 文件传输是否压缩
    pub fn compress(&self) -> bool {
        self.compression > 0
    }
}

/// 获取默认设备名称（主机名）
pub fn get_default_device_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "agentshare".to_string())
}
