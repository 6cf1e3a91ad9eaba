//! 表面角色（子表面、顶层窗口、光标……）的钩子。
//!
//! 钩子运行时角色对象暂时从表面中取出，因此可以拿到 `&mut Compositor`
//! 并调用任意合成器操作，包括锁定自身的提交或销毁表面。钩子返回后
//! 必须重新检查表面是否存活。

use std::any::Any;

use thiserror::Error;

use crate::compositor::{Compositor, SurfaceId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RoleError {
    #[error("surface already has the {0} role")]
    AlreadyHasRole(&'static str),
    #[error("surface is dead")]
    DeadSurface,
    #[error("surface cannot be its own ancestor")]
    BadParent,
    #[error("surface is not a sibling or the parent")]
    BadSibling,
}

pub trait SurfaceRole: Any {
    fn name(&self) -> &'static str;

    /// 提交进入流水线之前（可在这里锁住本次提交）
    fn cache_commit(&mut self, compositor: &mut Compositor, surface: SurfaceId) {
        let _ = (compositor, surface);
    }

    /// 新状态已经成为 Current 之后
    fn apply_commit(&mut self, compositor: &mut Compositor, surface: SurfaceId) {
        let _ = (compositor, surface);
    }

    /// 父表面的提交已经生效
    fn parent_committed(&mut self, compositor: &mut Compositor, surface: SurfaceId) {
        let _ = (compositor, surface);
    }

    /// 角色被 `clear_role` 清除，表面仍然存活
    fn cleared(&mut self, compositor: &mut Compositor, surface: SurfaceId) {
        let _ = (compositor, surface);
    }

    /// 表面已从表中移除，`surface` 不再存活
    fn destroyed(&mut self, compositor: &mut Compositor, surface: SurfaceId) {
        let _ = (compositor, surface);
    }

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl dyn SurfaceRole {
    pub fn downcast_ref<T: SurfaceRole>(&self) -> Option<&T> {
        self.as_any().downcast_ref()
    }

    pub fn downcast_mut<T: SurfaceRole>(&mut self) -> Option<&mut T> {
        self.as_any_mut().downcast_mut()
    }
}
