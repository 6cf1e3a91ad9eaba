//! 表面提交流水线。
//!
//! `Compositor` 拥有所有表面，处理客户端请求（写入 Pending），在提交时
//! 决定立即生效还是放进 Cached 队列，并把生效后的变化通知给渲染层
//! （`CompositorHandler`）。
//!
//! 所有入口都在同一个线程上运行。唯一的异步边界是显式同步的栅栏等待：
//! 等待回调通过 calloop 通道发回 `FenceSignaled`，由事件循环交给
//! `Compositor::fence_signaled` 处理。

use std::cell::RefCell;
use std::collections::VecDeque;
use std::mem;
use std::rc::Rc;
use std::time::Duration;

use calloop::channel::{self, Channel, Sender};

use crate::config::Config;
use crate::error::ProtocolError;
use crate::role::{RoleError, SurfaceRole};
use crate::texture::TextureAllocator;

mod commit;
mod lock;
mod requests;
mod state;
mod surface;

pub use lock::CommitLock;
pub use state::{
    CallbackId, ConstraintMode, ContentType, CurrentState, FeedbackId, PointerConstraintState,
    PresentationHint, SurfaceChanges, SurfaceState, TextureOrigin, ViewportState, VIEWPORT_UNSET,
};
pub use surface::{ClientId, OutputId, SurfaceId};

use lock::UnlockQueue;
pub(crate) use surface::SurfaceMap;
use surface::Surface;

/// 子表面相对邻居的放置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Above(SurfaceId),
    Below(SurfaceId),
}

/// 获取点已经到达
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FenceSignaled {
    pub surface: SurfaceId,
    pub commit_id: u64,
}

/// 渲染层、协议层对合成器的回调
pub trait CompositorHandler {
    /// 每次提交生效后调用一次
    fn surface_changed(&mut self, surface: SurfaceId, changes: SurfaceChanges);

    fn subsurface_placed(&mut self, surface: SurfaceId, placement: Placement) {
        let _ = (surface, placement);
    }

    fn frame_done(&mut self, callback: CallbackId, time: Duration) {
        let _ = (callback, time);
    }

    fn feedback_presented(&mut self, feedback: FeedbackId, time: Duration) {
        let _ = (feedback, time);
    }

    fn feedback_discarded(&mut self, feedback: FeedbackId) {
        let _ = feedback;
    }

    fn surface_destroyed(&mut self, surface: SurfaceId) {
        let _ = surface;
    }

    /// 随后该客户端会被断开
    fn protocol_error(&mut self, client: ClientId, surface: SurfaceId, error: ProtocolError);

    fn out_of_memory(&mut self, client: ClientId);
}

pub struct Compositor {
    pub(crate) surfaces: SurfaceMap,
    pub(crate) handler: Box<dyn CompositorHandler>,
    allocator: Box<dyn TextureAllocator>,
    config: Config,
    unlocks: UnlockQueue,
    fence_sender: Sender<FenceSignaled>,
}

impl Compositor {
    /// 返回的通道需要插入事件循环，收到的消息交给 `fence_signaled`
    pub fn new(
        handler: Box<dyn CompositorHandler>,
        allocator: Box<dyn TextureAllocator>,
        config: Config,
    ) -> (Self, Channel<FenceSignaled>) {
        let (fence_sender, fence_channel) = channel::channel();
        let compositor = Self {
            surfaces: SurfaceMap::default(),
            handler,
            allocator,
            config,
            unlocks: Rc::new(RefCell::new(VecDeque::new())),
            fence_sender,
        };
        (compositor, fence_channel)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn create_surface(&mut self, client: ClientId) -> SurfaceId {
        let id = self.surfaces.insert(Surface::new(client));
        debug!(surface = ?id, client = client.get(), "created surface");
        id
    }

    pub fn is_alive(&self, surface: SurfaceId) -> bool {
        self.surfaces.contains(surface)
    }

    pub fn surfaces(&self) -> Vec<SurfaceId> {
        self.surfaces.ids().collect()
    }

    pub fn client(&self, surface: SurfaceId) -> Option<ClientId> {
        self.surfaces.get(surface).map(|s| s.client)
    }

    pub fn current(&self, surface: SurfaceId) -> Option<&CurrentState> {
        self.surfaces.get(surface).map(|s| &s.current)
    }

    pub fn pending(&self, surface: SurfaceId) -> Option<&SurfaceState> {
        self.surfaces.get(surface).map(|s| &s.pending)
    }

    /// 等待生效的提交数
    pub fn cached_count(&self, surface: SurfaceId) -> usize {
        self.surfaces.get(surface).map_or(0, |s| s.cached.len())
    }

    pub fn destroy_surface(&mut self, id: SurfaceId) {
        let Some(mut surface) = self.surfaces.remove(id) else {
            return;
        };
        debug!(surface = ?id, "destroying surface");

        if let Some(mut role) = surface.role.take() {
            role.destroyed(self, id);
        }

        // 表面已经不存在，等待中的锁无需再解
        for wait in surface.fence_waits.drain(..) {
            let _ = wait.lock.disarm();
        }

        let mut children = surface.current.subsurfaces_above.clone();
        children.extend(&surface.current.subsurfaces_below);
        children.extend(&surface.pending.subsurfaces_above);
        children.extend(&surface.pending.subsurfaces_below);
        children.sort();
        children.dedup();
        self.orphan_subsurfaces(children);

        if let Some(buffer) = surface.current.buffer.take() {
            buffer.release();
            if let Some(point) = surface.current.release_point.take() {
                point.signal();
            }
        }

        let feedbacks = surface
            .current
            .feedbacks
            .drain(..)
            .chain(surface.cached.iter_mut().flat_map(|s| s.feedbacks.drain(..)))
            .chain(surface.pending.feedbacks.drain(..))
            .collect::<Vec<_>>();
        for feedback in feedbacks {
            self.handler.feedback_discarded(feedback);
        }

        self.handler.surface_destroyed(id);
    }

    /// 断开客户端：销毁它的所有表面
    pub fn disconnect_client(&mut self, client: ClientId) {
        let ids = self
            .surfaces
            .ids()
            .filter(|id| self.surfaces.get(*id).is_some_and(|s| s.client == client))
            .collect::<Vec<_>>();
        if ids.is_empty() {
            return;
        }

        debug!(client = client.get(), surfaces = ids.len(), "disconnecting client");
        for id in ids {
            self.destroy_surface(id);
        }
    }

    pub(crate) fn post_error(&mut self, surface: SurfaceId, error: ProtocolError) {
        let Some(client) = self.client(surface) else {
            return;
        };
        warn!(?surface, code = error.code(), "protocol error: {error}");
        self.handler.protocol_error(client, surface, error);
        self.disconnect_client(client);
    }

    pub(crate) fn post_out_of_memory(&mut self, surface: SurfaceId) {
        let Some(client) = self.client(surface) else {
            return;
        };
        warn!(?surface, "out of memory");
        self.handler.out_of_memory(client);
        self.disconnect_client(client);
    }

    pub fn set_role(
        &mut self,
        surface: SurfaceId,
        role: Box<dyn SurfaceRole>,
    ) -> Result<(), RoleError> {
        let s = self.surfaces.get_mut(surface).ok_or(RoleError::DeadSurface)?;
        if let Some(existing) = &s.role {
            return Err(RoleError::AlreadyHasRole(existing.name()));
        }

        trace!(?surface, role = role.name(), "setting role");
        s.role = Some(role);
        s.role_epoch += 1;
        Ok(())
    }

    /// 回到"无角色"状态；调用 cleared 而不是 destroyed 钩子
    pub fn clear_role(&mut self, surface: SurfaceId) -> Option<Box<dyn SurfaceRole>> {
        let s = self.surfaces.get_mut(surface)?;
        let mut role = s.role.take()?;
        s.role_epoch += 1;

        trace!(?surface, role = role.name(), "clearing role");
        role.cleared(self, surface);
        self.dispatch_unlocks();
        Some(role)
    }

    pub fn role_name(&self, surface: SurfaceId) -> Option<&'static str> {
        self.surfaces.get(surface)?.role.as_ref().map(|r| r.name())
    }

    pub fn role<T: SurfaceRole>(&self, surface: SurfaceId) -> Option<&T> {
        self.surfaces.get(surface)?.role.as_deref()?.downcast_ref()
    }

    pub fn role_mut<T: SurfaceRole>(&mut self, surface: SurfaceId) -> Option<&mut T> {
        self.surfaces.get_mut(surface)?.role.as_deref_mut()?.downcast_mut()
    }

    /// 把角色取出来调用钩子，之后在角色未被替换时放回
    pub(crate) fn with_role<T>(
        &mut self,
        surface: SurfaceId,
        f: impl FnOnce(&mut dyn SurfaceRole, &mut Compositor) -> T,
    ) -> Option<T> {
        let s = self.surfaces.get_mut(surface)?;
        let epoch = s.role_epoch;
        let mut role = s.role.take()?;
        s.in_role_hook = true;

        let rv = f(role.as_mut(), self);

        let Some(s) = self.surfaces.get_mut(surface) else {
            // 表面在钩子里被销毁了
            role.destroyed(self, surface);
            return Some(rv);
        };
        s.in_role_hook = false;
        if s.role_epoch == epoch && s.role.is_none() {
            s.role = Some(role);
        } else {
            trace!(?surface, "role was replaced during its hook");
        }

        // 钩子里解锁的提交要等角色放回之后才能应用，否则会漏掉它的 apply_commit
        if mem::take(&mut s.drain_deferred) {
            self.drain_cached(surface);
        }
        Some(rv)
    }

    /// 锁住下一次提交
    pub fn lock(&mut self, surface: SurfaceId) -> Option<CommitLock> {
        let s = self.surfaces.get_mut(surface)?;
        s.pending.lock_count += 1;
        trace!(
            ?surface,
            commit = s.pending.commit_id,
            locks = s.pending.lock_count,
            "locking commit"
        );
        Some(CommitLock::new(surface, s.pending.commit_id, &self.unlocks))
    }

    pub fn unlock(&mut self, lock: CommitLock) {
        let (surface, commit_id) = lock.disarm();
        self.unlock_commit(surface, commit_id);
        self.dispatch_unlocks();
    }

    /// 处理被直接丢弃的锁
    pub fn dispatch_unlocks(&mut self) {
        loop {
            let next = self.unlocks.borrow_mut().pop_front();
            let Some((surface, commit_id)) = next else {
                break;
            };
            self.unlock_commit(surface, commit_id);
        }
    }

    pub fn output_enter(&mut self, surface: SurfaceId, output: OutputId) {
        if let Some(s) = self.surfaces.get_mut(surface) {
            s.outputs.insert(output);
        }
    }

    pub fn output_leave(&mut self, surface: SurfaceId, output: OutputId) {
        if let Some(s) = self.surfaces.get_mut(surface) {
            s.outputs.remove(&output);
        }
    }

    pub fn outputs(&self, surface: SurfaceId) -> Vec<OutputId> {
        let Some(s) = self.surfaces.get(surface) else {
            return Vec::new();
        };
        let mut outputs = s.outputs.iter().copied().collect::<Vec<_>>();
        outputs.sort();
        outputs
    }

    pub fn send_frame_callbacks(&mut self, surface: SurfaceId, time: Duration) {
        let Some(s) = self.surfaces.get_mut(surface) else {
            return;
        };
        for callback in std::mem::take(&mut s.current.frame_callbacks) {
            self.handler.frame_done(callback, time);
        }
    }

    /// 当前内容已经显示出来
    pub fn presented(&mut self, surface: SurfaceId, time: Duration) {
        let Some(s) = self.surfaces.get_mut(surface) else {
            return;
        };
        s.current.last_presented = Some(time);
        for feedback in std::mem::take(&mut s.current.feedbacks) {
            self.handler.feedback_presented(feedback, time);
        }
    }
}
