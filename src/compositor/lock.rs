// 文件: compositor/lock.rs
// 作用: 提交锁令牌。持有期间对应的提交不会生效
// 释放方式:
//   - Compositor::unlock(lock)：立即解锁并应用可以生效的状态
//   - 直接丢弃：把解锁请求放进队列，在下一个合成器入口处理
//     （Drop 里拿不到 &mut Compositor）

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::{Rc, Weak};

use super::SurfaceId;

pub(crate) type UnlockQueue = Rc<RefCell<VecDeque<(SurfaceId, u64)>>>;

#[must_use = "dropping the lock releases it"]
pub struct CommitLock {
    surface: SurfaceId,
    commit_id: u64,
    queue: Weak<RefCell<VecDeque<(SurfaceId, u64)>>>,
    armed: bool,
}

impl CommitLock {
    pub(crate) fn new(surface: SurfaceId, commit_id: u64, queue: &UnlockQueue) -> Self {
        Self {
            surface,
            commit_id,
            queue: Rc::downgrade(queue),
            armed: true,
        }
    }

    pub fn surface(&self) -> SurfaceId {
        self.surface
    }

    pub fn commit_id(&self) -> u64 {
        self.commit_id
    }

    /// 取出目标并解除 Drop 行为，由调用方负责解锁
    pub(crate) fn disarm(mut self) -> (SurfaceId, u64) {
        self.armed = false;
        (self.surface, self.commit_id)
    }
}

impl Drop for CommitLock {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // 合成器已经不在了就什么也不做
        if let Some(queue) = self.queue.upgrade() {
            queue.borrow_mut().push_back((self.surface, self.commit_id));
        }
    }
}

impl fmt::Debug for CommitLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommitLock")
            .field("surface", &self.surface)
            .field("commit_id", &self.commit_id)
            .finish()
    }
}
