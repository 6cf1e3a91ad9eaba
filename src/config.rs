// 文件: config.rs
// 作用: 运行时配置（JSON），所有字段都有默认值
// 查找顺序: --config 参数 > SURFACE_COMMIT_CONFIG 环境变量 >
//   $XDG_CONFIG_HOME/surface-commit/config.json

use std::env;
use std::path::{Path, PathBuf};

use anyhow::Context;
use directories::ProjectDirs;
use serde::Deserialize;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    pub damage: DamageConfig,
    pub debug: DebugConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct DamageConfig {
    /// 表面损伤映射到缓冲区前的外扩量（表面单位），覆盖采样滤波的边缘
    pub surface_outset: f64,
    /// 缓冲区损伤的外扩量（像素）
    pub buffer_outset: i32,
}

impl Default for DamageConfig {
    fn default() -> Self {
        Self {
            surface_outset: 1.,
            buffer_outset: 1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct DebugConfig {
    /// 共享内存缓冲区总是完整重新导入
    pub disable_partial_upload: bool,
    /// 每次提交生效时输出一行 debug 日志
    pub log_commits: bool,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let _span = trace_span!("load_config").entered();

        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("error reading {path:?}"))?;
        let config = Self::parse(&contents).context("error parsing config")?;
        debug!("loaded config from {path:?}");
        Ok(config)
    }

    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let config: Config = serde_json::from_str(text)?;
        if config.damage.surface_outset < 0. || config.damage.buffer_outset < 0 {
            anyhow::bail!("damage outsets must not be negative");
        }
        Ok(config)
    }

    /// 加载配置；默认路径不存在时返回默认配置
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        if let Some(path) = cli_path.or_else(env_config_path) {
            return Self::load(&path);
        }

        match default_config_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => {
                debug!("no config file, using defaults");
                Ok(Self::default())
            }
        }
    }
}

fn env_config_path() -> Option<PathBuf> {
    env::var_os("SURFACE_COMMIT_CONFIG")
        .filter(|x| !x.is_empty())
        .map(PathBuf::from)
}

pub fn default_config_path() -> Option<PathBuf> {
    let Some(dirs) = ProjectDirs::from("", "", "surface-commit") else {
        warn!("error retrieving home directory");
        return None;
    };

    let mut path = dirs.config_dir().to_owned();
    path.push("config.json");
    Some(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::parse("{}").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.damage.surface_outset, 1.);
        assert_eq!(config.damage.buffer_outset, 1);
        assert!(!config.debug.disable_partial_upload);
    }

    #[test]
    fn partial_sections() {
        let config = Config::parse(
            r#"{ "damage": { "buffer-outset": 2 }, "debug": { "log-commits": true } }"#,
        )
        .unwrap();
        assert_eq!(config.damage.surface_outset, 1.);
        assert_eq!(config.damage.buffer_outset, 2);
        assert!(config.debug.log_commits);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(Config::parse(r#"{ "damage": { "surface-outset": -1.0 } }"#).is_err());
        assert!(Config::parse(r#"{ "dmg": {} }"#).is_err());
    }
}
