/// cli.rs - 命令行接口定义
/// 使用 clap 派生宏定义子命令与参数

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::utils::version;

#[derive(Parser)]
#[command(author, version = version(), about, long_about = None)]
#[command(subcommand_value_name = "SUBCOMMAND")]
#[command(subcommand_help_heading = "Subcommands")]
pub struct Cli {
    #[command(subcommand)]
    pub subcommand: Sub,
}

#[derive(Subcommand)]
pub enum Sub {
    /// 回放一个 JSON 提交脚本，逐行打印合成器事件
    Replay {
        /// 脚本路径
        script: PathBuf,

        /// 配置文件路径（默认：`$XDG_CONFIG_HOME/surface-commit/config.json`）
        ///
        /// 也可通过 `SURFACE_COMMIT_CONFIG` 环境变量设置。
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// 验证配置文件
    Validate {
        /// 配置文件路径（规则同上）
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}
