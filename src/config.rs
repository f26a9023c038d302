//! # 路径配置
//!
//! 数据目录优先级: 1. CLI 参数 `--data-dir`  2. 环境变量 `RULE_OVERLAY_HOME`
//! 3. 默认配置路径 `~/.config/rule-overlay`

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// 指定数据目录的环境变量
pub const DATA_DIR_ENV: &str = "RULE_OVERLAY_HOME";

/// 应用使用的文件路径
#[derive(Debug, Clone)]
pub struct AppPaths {
    /// 数据目录
    pub data_dir: PathBuf,
    /// 覆写存储文件
    pub overlays_file: PathBuf,
    /// 自定义模板文件
    pub templates_file: PathBuf,
}

impl AppPaths {
    /// 按优先级确定数据目录
    pub fn resolve(cli_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match cli_dir {
            Some(dir) => dir,
            None => match env::var_os(DATA_DIR_ENV) {
                Some(dir) if !dir.is_empty() => PathBuf::from(dir),
                _ => {
                    let home = env::var("HOME").context("Failed to get HOME directory")?;
                    PathBuf::from(home).join(".config").join("rule-overlay")
                }
            },
        };
        Ok(Self::in_dir(data_dir))
    }

    /// 在指定目录下布局文件
    pub fn in_dir<P: AsRef<Path>>(dir: P) -> Self {
        let data_dir = dir.as_ref().to_path_buf();
        Self {
            overlays_file: data_dir.join("overlays.json"),
            templates_file: data_dir.join("templates.yaml"),
            data_dir,
        }
    }

    /// 确保数据目录存在
    pub fn ensure_dir(&self) -> Result<()> {
        if !self.data_dir.exists() {
            fs::create_dir_all(&self.data_dir).with_context(|| {
                format!("Failed to create data dir {}", self.data_dir.display())
            })?;
            log::debug!("Created data dir {}", self.data_dir.display());
        }
        Ok(())
    }
}

// ========================================
// 测试模块
// ========================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_dir_wins() {
        let paths = AppPaths::resolve(Some(PathBuf::from("/tmp/ro"))).unwrap();
        assert_eq!(paths.data_dir, PathBuf::from("/tmp/ro"));
        assert_eq!(paths.overlays_file, PathBuf::from("/tmp/ro/overlays.json"));
        assert_eq!(paths.templates_file, PathBuf::from("/tmp/ro/templates.yaml"));
    }

    #[test]
    fn test_ensure_dir() {
        let dir = tempfile::tempdir().unwrap();
        let paths = AppPaths::in_dir(dir.path().join("a").join("b"));
        paths.ensure_dir().unwrap();
        assert!(paths.data_dir.is_dir());
    }
}
