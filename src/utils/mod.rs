//! 实用工具模块：几何计算与进程级辅助函数。
//!
//! - `region`：整数矩形区域的并/交/差与外扩
//! - `id`：单调递增ID

use std::path::{Path, PathBuf};

use anyhow::Context;
use directories::UserDirs;
use git_version::git_version;

pub mod id;
pub mod region;

/// 版本字符串，包含 git 提交信息
pub fn version() -> String {
    if let Some(v) = option_env!("SURFACE_COMMIT_BUILD_VERSION_STRING") {
        return String::from(v);
    }

    const MAJOR: &str = env!("CARGO_PKG_VERSION_MAJOR");
    const MINOR: &str = env!("CARGO_PKG_VERSION_MINOR");
    const PATCH: &str = env!("CARGO_PKG_VERSION_PATCH");

    let commit = option_env!("SURFACE_COMMIT_BUILD_COMMIT")
        .unwrap_or(git_version!(fallback = "unknown commit"));

    if PATCH == "0" {
        format!("{MAJOR}.{MINOR} ({commit})")
    } else {
        format!("{MAJOR}.{MINOR}.{PATCH} ({commit})")
    }
}

/// 展开路径开头的 `~`
///
/// 不以 `~` 开头时返回 `Ok(None)`。
pub fn expand_home(path: &Path) -> anyhow::Result<Option<PathBuf>> {
    if let Ok(rest) = path.strip_prefix("~") {
        let dirs = UserDirs::new().context("error retrieving home directory")?;
        Ok(Some([dirs.home_dir(), rest].iter().collect()))
    } else {
        Ok(None)
    }
}
