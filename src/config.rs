use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::acmi::geo::GeoPoint;
use crate::acmi::writer::{UpdateEncoding, WriterOptions};
use crate::logging::{parse_log_level, LogConfig, LogOutput};
use crate::simulation::FlightPattern;

/// 設定メタデータ
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConfigMeta {
    pub name: String,
    pub description: String,
}

impl Default for ConfigMeta {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            description: "acmi-bridge 既定設定".to_string(),
        }
    }
}

/// ACMI書き出し設定
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WriterConfig {
    pub encoding: UpdateEncoding,
    pub object_id_base: u64,
    pub title: Option<String>,
    pub author: String,
}

impl Default for WriterConfig {
    fn default() -> Self {
        let options = WriterOptions::default();
        Self {
            encoding: options.encoding,
            object_id_base: options.object_id_base,
            title: options.title,
            author: options.author,
        }
    }
}

/// 取り込み設定
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ImportConfig {
    pub run_name: String,
    pub agent_prefix: String,
    /// バッチ取り込み時のファイル名パターン
    pub pattern: String,
    /// バッチ取り込みの並列数
    pub workers: usize,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            run_name: "imported".to_string(),
            agent_prefix: "acmi".to_string(),
            pattern: "*.txt.acmi".to_string(),
            workers: 4,
        }
    }
}

/// ログ設定
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub output: LogOutput,
    pub dir: String,
    pub file_prefix: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        let defaults = LogConfig::default();
        Self {
            level: "info".to_string(),
            output: defaults.output,
            dir: defaults.log_dir,
            file_prefix: defaults.file_prefix,
        }
    }
}

/// デモ軌跡生成設定
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DemoConfig {
    pub dt_s: f64,
    pub t_max_s: f64,
    pub agents: usize,
    pub pattern: FlightPattern,
    pub seed: u64,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            dt_s: 0.1,
            t_max_s: 30.0,
            agents: 2,
            pattern: FlightPattern::Circular,
            seed: 0,
        }
    }
}

/// 完全なツール設定（すべてのセクションは省略可能）
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ToolConfig {
    pub meta: ConfigMeta,
    /// 固定の基準点（省略時は書き出しでは Edwards AFB、取り込みではファイルから決定）
    pub reference: Option<GeoPoint>,
    pub writer: WriterConfig,
    pub import: ImportConfig,
    pub logging: LoggingConfig,
    pub demo: DemoConfig,
}

impl ToolConfig {
    /// YAMLファイルから設定を読み込み
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        // ファイル存在チェック
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }

        let contents =
            fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        let config: ToolConfig = serde_yaml::from_str(&contents)
            .map_err(|e| ConfigError::Parse(path.to_path_buf(), e))?;

        config.validate()?;
        Ok(config)
    }

    /// 設定の基本的な検証
    pub fn validate(&self) -> Result<(), ConfigError> {
        // 時間設定の検証
        if self.demo.dt_s <= 0.0 {
            return Err(ConfigError::Validation("demo.dt_s must be positive".to_string()));
        }
        if self.demo.t_max_s <= 0.0 {
            return Err(ConfigError::Validation("demo.t_max_s must be positive".to_string()));
        }
        if self.demo.agents == 0 {
            return Err(ConfigError::Validation("demo.agents must be at least 1".to_string()));
        }

        if self.import.workers == 0 {
            return Err(ConfigError::Validation("import.workers must be at least 1".to_string()));
        }
        if self.import.run_name.trim().is_empty() {
            return Err(ConfigError::Validation("import.run_name must not be empty".to_string()));
        }
        glob::Pattern::new(&self.import.pattern).map_err(|e| {
            let message = format!("import.pattern '{}' is invalid: {}", self.import.pattern, e);
            ConfigError::Validation(message)
        })?;

        // オブジェクトID 0 はグローバルオブジェクト
        if self.writer.object_id_base == 0 {
            let message = "writer.object_id_base must be at least 1".to_string();
            return Err(ConfigError::Validation(message));
        }

        // 基準点の検証
        if let Some(reference) = &self.reference {
            if !reference.is_plausible() {
                return Err(ConfigError::Validation(format!(
                    "reference point ({}, {}, {}) is out of range",
                    reference.lat, reference.lon, reference.alt
                )));
            }
        }

        let level = self.logging.level.to_lowercase();
        if !["trace", "debug", "info", "warn", "error"].contains(&level.as_str()) {
            let message = format!("unknown logging.level '{}'", self.logging.level);
            return Err(ConfigError::Validation(message));
        }

        Ok(())
    }

    /// 書き出しオプションを構築
    pub fn writer_options(&self) -> WriterOptions {
        WriterOptions {
            reference_point: self.reference,
            encoding: self.writer.encoding,
            object_id_base: self.writer.object_id_base,
            title: self.writer.title.clone(),
            author: self.writer.author.clone(),
            reference_time: None,
        }
    }

    /// ログ設定を構築
    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            level: parse_log_level(&self.logging.level),
            output: self.logging.output,
            log_dir: self.logging.dir.clone(),
            file_prefix: self.logging.file_prefix.clone(),
        }
    }

    /// 設定の概要を表示
    pub fn print_summary(&self) {
        println!("=== 設定情報 ===");
        println!("名前: {}", self.meta.name);
        println!("説明: {}", self.meta.description);
        println!();

        println!("=== 座標・書き出し ===");
        match &self.reference {
            Some(r) => println!("基準点: ({:.4}, {:.4}, {:.0}m)", r.lat, r.lon, r.alt),
            None => println!("基準点: 自動（書き出し時は Edwards AFB）"),
        }
        println!("更新形式: {:?}", self.writer.encoding);
        println!("オブジェクトID開始値: {:#x}", self.writer.object_id_base);
        println!();

        println!("=== 取り込み ===");
        println!("ラン名: {}", self.import.run_name);
        println!("エージェント接頭辞: {}", self.import.agent_prefix);
        println!("ファイルパターン: {}", self.import.pattern);
        println!("並列数: {}", self.import.workers);
        println!();

        println!("=== デモ ===");
        println!("時間刻み: {:.3}秒", self.demo.dt_s);
        println!("最大時間: {:.1}秒", self.demo.t_max_s);
        println!("エージェント数: {} ({:?})", self.demo.agents, self.demo.pattern);
    }
}

/// 設定読み込みエラー
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("設定ファイルが見つかりません: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("ファイル読み込みエラー {}: {}", .0.display(), .1)]
    Io(PathBuf, #[source] std::io::Error),

    #[error("YAML解析エラー {}: {}", .0.display(), .1)]
    Parse(PathBuf, #[source] serde_yaml::Error),

    #[error("設定検証エラー: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_yaml_uses_defaults() {
        let config: ToolConfig = serde_yaml::from_str("{}").unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.import.agent_prefix, "acmi");
        assert_eq!(config.import.workers, 4);
        assert_eq!(config.writer.encoding, UpdateEncoding::Full);
        assert_eq!(config.writer.object_id_base, 0x100);
        assert_eq!(config.logging.output, LogOutput::Console);
        assert!(config.reference.is_none());
    }

    #[test]
    fn test_full_yaml() {
        let yaml = r#"
meta:
  name: training-run
  description: PPO evaluation
reference: { lat: 47.5, lon: 8.5, alt: 400.0 }
writer:
  encoding: delta
  object_id_base: 4096
  author: lab
import:
  run_name: eval
  pattern: "*.acmi"
  workers: 2
logging:
  level: debug
  output: both
demo:
  dt_s: 0.05
  t_max_s: 10.0
  agents: 3
  pattern: straight
"#;
        let config: ToolConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.meta.name, "training-run");
        assert_eq!(config.reference, Some(GeoPoint::new(47.5, 8.5, 400.0)));
        assert_eq!(config.import.agent_prefix, "acmi");
        assert_eq!(config.demo.pattern, FlightPattern::Straight);

        let options = config.writer_options();
        assert_eq!(options.encoding, UpdateEncoding::Delta);
        assert_eq!(options.object_id_base, 4096);
        assert_eq!(options.reference_point, config.reference);
        assert_eq!(config.log_config().level, tracing::Level::DEBUG);
    }

    #[test]
    fn test_validation_errors() {
        let mut config = ToolConfig::default();
        config.demo.dt_s = 0.0;
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));

        let mut config = ToolConfig::default();
        config.import.workers = 0;
        assert!(config.validate().is_err());

        let mut config = ToolConfig::default();
        config.reference = Some(GeoPoint::new(120.0, 0.0, 0.0));
        assert!(config.validate().is_err());

        let mut config = ToolConfig::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_object_id_base_is_rejected() {
        let config: ToolConfig = serde_yaml::from_str("writer:\n  object_id_base: 0\n").unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("object_id_base"));

        let config: ToolConfig = serde_yaml::from_str("writer:\n  object_id_base: 1\n").unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            ToolConfig::from_file(dir.path().join("missing.yaml")),
            Err(ConfigError::FileNotFound(_))
        ));

        let path = dir.path().join("broken.yaml");
        fs::write(&path, "import: [unclosed").unwrap();
        assert!(matches!(ToolConfig::from_file(&path), Err(ConfigError::Parse(..))));

        let path = dir.path().join("ok.yaml");
        fs::write(&path, "import:\n  run_name: nightly\n").unwrap();
        assert_eq!(ToolConfig::from_file(&path).unwrap().import.run_name, "nightly");
    }
}
