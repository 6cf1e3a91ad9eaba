/// lib.rs - 表面提交流水线的库根模块

/// 启用 tracing 宏的全局引入，用于日志和追踪
#[macro_use]
extern crate tracing;

/// 客户端缓冲区：shm、dmabuf、单像素，以及导入与损伤换算
pub mod buffer;

/// 命令行参数解析
pub mod cli;

/// 表面、双缓冲状态与提交流水线
pub mod compositor;

/// 配置文件
pub mod config;

/// 协议错误
pub mod error;

/// 脚本回放
pub mod replay;

/// 表面角色接口
pub mod role;

/// 子表面角色与提交传播
pub mod subsurface;

/// 显式同步时间线
pub mod sync;

/// 纹理与分配器
pub mod texture;

/// 工具函数集
pub mod utils;

/// 条件编译：测试专用模块
#[cfg(test)]
mod tests;
