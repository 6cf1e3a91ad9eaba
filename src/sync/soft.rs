// 文件: sync/soft.rs
// 作用: 进程内的软件时间线，实现 Timeline 接口
// 应用场景: 回放工具与测试；语义与 DRM syncobj 时间线一致：
//   值单调递增，等待 "点 <= 当前值" 的回调在 signal 时触发

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use super::{
    FenceCallback, FenceError, FenceStatus, FenceWaitHandle, SyncFile, Timeline, TimelineId,
};

struct Waiter {
    id: u64,
    point: u64,
    callback: FenceCallback,
}

struct Inner {
    value: u64,
    next_waiter: u64,
    waiters: Vec<Waiter>,
    waiter_limit: Option<usize>,
    lost: bool,
}

pub struct SoftTimeline {
    id: TimelineId,
    inner: Rc<RefCell<Inner>>,
}

impl SoftTimeline {
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            id: TimelineId::next(),
            inner: Rc::new(RefCell::new(Inner {
                value: 0,
                next_waiter: 0,
                waiters: Vec::new(),
                waiter_limit: None,
                lost: false,
            })),
        })
    }

    /// 最多允许 `limit` 个同时存在的等待，超出时注册失败
    pub fn with_waiter_limit(limit: usize) -> Rc<Self> {
        let timeline = Self::new();
        timeline.inner.borrow_mut().waiter_limit = Some(limit);
        timeline
    }

    pub fn value(&self) -> u64 {
        self.inner.borrow().value
    }

    pub fn waiter_count(&self) -> usize {
        self.inner.borrow().waiters.len()
    }

    /// 模拟设备丢失：之后的探测与等待都会失败
    pub fn set_lost(&self) {
        self.inner.borrow_mut().lost = true;
    }
}

impl std::fmt::Debug for SoftTimeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("SoftTimeline")
            .field("id", &self.id)
            .field("value", &inner.value)
            .field("waiters", &inner.waiters.len())
            .finish()
    }
}

impl Timeline for SoftTimeline {
    fn id(&self) -> TimelineId {
        self.id
    }

    fn probe(&self, point: u64) -> Result<FenceStatus, FenceError> {
        let inner = self.inner.borrow();
        if inner.lost {
            return Err(FenceError::Lost);
        }
        if inner.value >= point {
            Ok(FenceStatus::Materialized)
        } else {
            Ok(FenceStatus::Pending)
        }
    }

    fn wait_async(&self, point: u64, callback: FenceCallback) -> Result<FenceWaitHandle, FenceError> {
        let mut inner = self.inner.borrow_mut();
        if inner.lost {
            return Err(FenceError::Lost);
        }
        if inner.value >= point {
            drop(inner);
            callback();
            return Ok(FenceWaitHandle::completed());
        }
        if inner
            .waiter_limit
            .is_some_and(|limit| inner.waiters.len() >= limit)
        {
            return Err(FenceError::TooManyWaits);
        }

        let id = inner.next_waiter;
        inner.next_waiter += 1;
        inner.waiters.push(Waiter {
            id,
            point,
            callback,
        });

        let weak: Weak<RefCell<Inner>> = Rc::downgrade(&self.inner);
        Ok(FenceWaitHandle::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.borrow_mut().waiters.retain(|w| w.id != id);
            }
        }))
    }

    fn export_sync_file(&self, point: u64) -> Result<SyncFile, FenceError> {
        let inner = self.inner.borrow();
        if inner.lost {
            return Err(FenceError::Lost);
        }
        Ok(SyncFile {
            timeline: self.id,
            point,
            signaled: inner.value >= point,
        })
    }

    fn signal(&self, point: u64) {
        let ready = {
            let mut inner = self.inner.borrow_mut();
            if point <= inner.value {
                return;
            }
            inner.value = point;

            let (ready, waiting) = std::mem::take(&mut inner.waiters)
                .into_iter()
                .partition::<Vec<_>, _>(|w| w.point <= point);
            inner.waiters = waiting;
            ready
        };

        // 回调可能重新进入时间线（注册新的等待），借用已经释放
        for waiter in ready {
            (waiter.callback)();
        }
    }
}
