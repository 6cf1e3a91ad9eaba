//! 显式同步：时间线对象与栅栏点。
//!
//! 时间线由客户端可见的协议对象共享持有（`Rc<dyn Timeline>`），表面只在有
//! 未决的点时持有一份引用。等待回调可能在其他执行上下文触发，因此只允许
//! 捕获 `Send` 的内容（通常是一个 calloop 通道的发送端）。

use std::fmt;
use std::rc::Rc;

use thiserror::Error;

use crate::utils::id::typed_id;

mod soft;

pub use soft::SoftTimeline;

typed_id! {
    pub struct TimelineId;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceStatus {
    /// 该点的栅栏已经存在，可以直接导入缓冲区
    Materialized,
    /// 尚未到达
    Pending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FenceError {
    #[error("timeline is lost")]
    Lost,
    #[error("too many outstanding waits")]
    TooManyWaits,
}

/// 导出的同步文件（某个点在导出时刻的快照）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncFile {
    pub timeline: TimelineId,
    pub point: u64,
    pub signaled: bool,
}

pub type FenceCallback = Box<dyn FnOnce() + Send>;

pub trait Timeline: fmt::Debug {
    fn id(&self) -> TimelineId;

    fn probe(&self, point: u64) -> Result<FenceStatus, FenceError>;

    /// 注册异步等待，点到达时调用 `callback`；丢弃返回的句柄即取消
    fn wait_async(&self, point: u64, callback: FenceCallback) -> Result<FenceWaitHandle, FenceError>;

    fn export_sync_file(&self, point: u64) -> Result<SyncFile, FenceError>;

    /// 由合成器调用，通知客户端该点之前的缓冲区可以复用
    fn signal(&self, point: u64);
}

/// 一个时间线上的目标点
#[derive(Clone)]
pub struct TimelinePoint {
    pub timeline: Rc<dyn Timeline>,
    pub point: u64,
}

impl TimelinePoint {
    pub fn new(timeline: Rc<dyn Timeline>, point: u64) -> Self {
        Self { timeline, point }
    }

    pub fn same_timeline(&self, other: &TimelinePoint) -> bool {
        self.timeline.id() == other.timeline.id()
    }

    pub fn signal(&self) {
        trace!(timeline = ?self.timeline.id(), point = self.point, "signaling release point");
        self.timeline.signal(self.point);
    }
}

impl fmt::Debug for TimelinePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimelinePoint")
            .field("timeline", &self.timeline.id())
            .field("point", &self.point)
            .finish()
    }
}

impl PartialEq for TimelinePoint {
    fn eq(&self, other: &Self) -> bool {
        self.same_timeline(other) && self.point == other.point
    }
}

/// 异步等待句柄，丢弃时取消等待
pub struct FenceWaitHandle {
    cancel: Option<Box<dyn FnOnce()>>,
}

impl FenceWaitHandle {
    pub fn new(cancel: impl FnOnce() + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// 已完成的等待：丢弃时什么也不做
    pub fn completed() -> Self {
        Self { cancel: None }
    }
}

impl Drop for FenceWaitHandle {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for FenceWaitHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FenceWaitHandle")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}
