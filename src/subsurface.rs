//! 子表面（wl_subsurface）：子表面角色、父表面上的堆叠顺序，以及把
//! 父表面的提交传播给子表面。
//!
//! 父表面的 Pending 中保存两个有序列表：在父表面之上的 `above`（下标越大
//! 越靠上）和之下的 `below`（下标越大越靠近父表面）。父表面提交时把它们
//! 提升为 Current，并对相对邻居发生变化的子表面发出放置通知。

use std::any::Any;
use std::collections::HashSet;

use smithay::utils::{Logical, Point};

use crate::compositor::{CommitLock, Compositor, Placement, SurfaceId, SurfaceState};
use crate::role::{RoleError, SurfaceRole};

pub struct Subsurface {
    parent: SurfaceId,
    sync: bool,
    pending_position: Point<i32, Logical>,
    position: Point<i32, Logical>,
    /// 同步模式下被锁住、等待父表面提交的子表面提交
    locks: Vec<CommitLock>,
}

impl Subsurface {
    fn new(parent: SurfaceId) -> Self {
        Self {
            parent,
            // 新建的子表面默认是同步的
            sync: true,
            pending_position: Point::from((0, 0)),
            position: Point::from((0, 0)),
            locks: Vec::new(),
        }
    }

    pub fn parent(&self) -> SurfaceId {
        self.parent
    }

    pub fn is_sync(&self) -> bool {
        self.sync
    }

    pub fn position(&self) -> Point<i32, Logical> {
        self.position
    }

    pub fn held_locks(&self) -> usize {
        self.locks.len()
    }
}

impl SurfaceRole for Subsurface {
    fn name(&self) -> &'static str {
        "wl_subsurface"
    }

    fn cache_commit(&mut self, compositor: &mut Compositor, surface: SurfaceId) {
        // 父表面已销毁时没有人会再放行
        if !compositor.is_alive(self.parent) {
            return;
        }
        if !(self.sync || compositor.is_effectively_sync(self.parent)) {
            return;
        }
        if let Some(lock) = compositor.lock(surface) {
            trace!(?surface, commit = lock.commit_id(), "gating commit on parent");
            self.locks.push(lock);
        }
    }

    fn parent_committed(&mut self, compositor: &mut Compositor, surface: SurfaceId) {
        if self.position != self.pending_position {
            trace!(?surface, position = ?self.pending_position, "moving subsurface");
            self.position = self.pending_position;
        }

        for lock in self.locks.drain(..) {
            compositor.unlock(lock);
        }
    }

    fn cleared(&mut self, compositor: &mut Compositor, surface: SurfaceId) {
        debug!(?surface, parent = ?self.parent, "subsurface role cleared");
        compositor.remove_subsurface(self.parent, surface);
        for lock in self.locks.drain(..) {
            compositor.unlock(lock);
        }
    }

    fn destroyed(&mut self, compositor: &mut Compositor, surface: SurfaceId) {
        compositor.remove_subsurface(self.parent, surface);
        // 表面已经不在了，锁直接作废
        for lock in self.locks.drain(..) {
            let _ = lock.disarm();
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl Compositor {
    /// wl_subcompositor.get_subsurface
    pub fn create_subsurface(
        &mut self,
        surface: SurfaceId,
        parent: SurfaceId,
    ) -> Result<(), RoleError> {
        if !self.is_alive(parent) {
            return Err(RoleError::DeadSurface);
        }
        if surface == parent || self.is_ancestor(surface, parent) {
            return Err(RoleError::BadParent);
        }

        self.set_role(surface, Box::new(Subsurface::new(parent)))?;

        if let Some(state) = self.pending_lists(parent) {
            state.subsurfaces_above.push(surface);
        }
        self.bump_children_generation(parent);
        debug!(?surface, ?parent, "created subsurface");
        Ok(())
    }

    pub fn subsurface(&self, surface: SurfaceId) -> Option<&Subsurface> {
        self.role::<Subsurface>(surface)
    }

    /// 自身或任一祖先处于同步模式
    pub fn is_effectively_sync(&self, surface: SurfaceId) -> bool {
        let mut seen = HashSet::new();
        let mut next = Some(surface);
        while let Some(id) = next {
            if !seen.insert(id) {
                break;
            }
            let Some(sub) = self.subsurface(id) else {
                return false;
            };
            if sub.sync {
                return true;
            }
            next = Some(sub.parent);
        }
        false
    }

    fn is_ancestor(&self, ancestor: SurfaceId, surface: SurfaceId) -> bool {
        let mut seen = HashSet::new();
        let mut next = self.subsurface(surface).map(|s| s.parent);
        while let Some(id) = next {
            if id == ancestor {
                return true;
            }
            if !seen.insert(id) {
                break;
            }
            next = self.subsurface(id).map(|s| s.parent);
        }
        false
    }

    pub fn set_subsurface_position(&mut self, surface: SurfaceId, position: Point<i32, Logical>) {
        if let Some(sub) = self.role_mut::<Subsurface>(surface) {
            sub.pending_position = position;
        }
    }

    pub fn set_subsurface_sync(&mut self, surface: SurfaceId, sync: bool) {
        let Some(sub) = self.role_mut::<Subsurface>(surface) else {
            return;
        };
        sub.sync = sync;
        if sync || self.is_effectively_sync(surface) {
            return;
        }

        // 切换到非同步：已锁住的提交立即放行
        let locks = self
            .role_mut::<Subsurface>(surface)
            .map(|sub| std::mem::take(&mut sub.locks))
            .unwrap_or_default();
        for lock in locks {
            self.unlock(lock);
        }
    }

    /// wl_subsurface.place_above
    pub fn place_above(&mut self, surface: SurfaceId, sibling: SurfaceId) -> Result<(), RoleError> {
        self.place(surface, sibling, true)
    }

    /// wl_subsurface.place_below
    pub fn place_below(&mut self, surface: SurfaceId, sibling: SurfaceId) -> Result<(), RoleError> {
        self.place(surface, sibling, false)
    }

    fn place(&mut self, surface: SurfaceId, sibling: SurfaceId, above: bool) -> Result<(), RoleError> {
        let parent = self.subsurface(surface).ok_or(RoleError::DeadSurface)?.parent;
        let sibling_ok = sibling == parent
            || (sibling != surface && self.subsurface(sibling).is_some_and(|s| s.parent == parent));
        if !sibling_ok {
            return Err(RoleError::BadSibling);
        }

        let state = self.pending_lists(parent).ok_or(RoleError::DeadSurface)?;
        state.subsurfaces_above.retain(|id| *id != surface);
        state.subsurfaces_below.retain(|id| *id != surface);

        if sibling == parent {
            if above {
                state.subsurfaces_above.insert(0, surface);
            } else {
                state.subsurfaces_below.push(surface);
            }
        } else if let Some(idx) = state.subsurfaces_above.iter().position(|id| *id == sibling) {
            let idx = if above { idx + 1 } else { idx };
            state.subsurfaces_above.insert(idx, surface);
        } else if let Some(idx) = state.subsurfaces_below.iter().position(|id| *id == sibling) {
            let idx = if above { idx + 1 } else { idx };
            state.subsurfaces_below.insert(idx, surface);
        } else {
            // 兄弟还没有进入父表面的列表
            state.subsurfaces_above.push(surface);
        }

        self.bump_children_generation(parent);
        Ok(())
    }

    fn pending_lists(&mut self, parent: SurfaceId) -> Option<&mut SurfaceState> {
        self.surfaces.get_mut(parent).map(|s| &mut s.pending)
    }

    fn bump_children_generation(&mut self, parent: SurfaceId) {
        if let Some(s) = self.surfaces.get_mut(parent) {
            s.children_generation += 1;
        }
    }

    /// 父表面销毁后，子表面等待中的提交全部放行
    pub(crate) fn orphan_subsurfaces(&mut self, children: Vec<SurfaceId>) {
        for child in children {
            let locks = self
                .role_mut::<Subsurface>(child)
                .map(|sub| std::mem::take(&mut sub.locks))
                .unwrap_or_default();
            for lock in locks {
                self.unlock(lock);
            }
        }
    }

    /// 子表面销毁或失去角色时从父表面的所有列表中移除
    pub(crate) fn remove_subsurface(&mut self, parent: SurfaceId, surface: SurfaceId) {
        let Some(s) = self.surfaces.get_mut(parent) else {
            return;
        };
        let lists = [
            &mut s.pending.subsurfaces_above,
            &mut s.pending.subsurfaces_below,
            &mut s.current.subsurfaces_above,
            &mut s.current.subsurfaces_below,
        ];
        for list in lists {
            list.retain(|id| *id != surface);
        }
        for state in s.cached.iter_mut() {
            state.subsurfaces_above.retain(|id| *id != surface);
            state.subsurfaces_below.retain(|id| *id != surface);
        }
        s.children_generation += 1;
    }

    /// 把 `state` 中的子表面顺序提升为 Current，对邻居变化的子表面发出放置通知
    pub(crate) fn apply_subsurfaces_order(&mut self, parent: SurfaceId, state: &SurfaceState) {
        let alive = |id: &&SurfaceId| self.surfaces.contains(**id);
        let above = state.subsurfaces_above.iter().filter(alive).copied().collect::<Vec<_>>();
        let below = state.subsurfaces_below.iter().filter(alive).copied().collect::<Vec<_>>();

        let Some(s) = self.surfaces.get_mut(parent) else {
            return;
        };
        let old_above = std::mem::replace(&mut s.current.subsurfaces_above, above.clone());
        let old_below = std::mem::replace(&mut s.current.subsurfaces_below, below.clone());
        if old_above != above || old_below != below {
            s.children_generation += 1;
        }

        // 先处理上方（从父表面往上），再处理下方（从父表面往下），
        // 这样每个通知引用的邻居都已经放好了
        let mut placements = Vec::new();
        for (i, child) in above.iter().enumerate() {
            let neighbor = if i == 0 { parent } else { above[i - 1] };
            if above_neighbor(&old_above, *child, parent) != Some(neighbor) {
                placements.push((*child, Placement::Above(neighbor)));
            }
        }
        for (i, child) in below.iter().enumerate().rev() {
            let neighbor = below.get(i + 1).copied().unwrap_or(parent);
            if below_neighbor(&old_below, *child, parent) != Some(neighbor) {
                placements.push((*child, Placement::Below(neighbor)));
            }
        }

        for (child, placement) in placements {
            debug!(?child, ?placement, "subsurface placement changed");
            self.handler.subsurface_placed(child, placement);
        }
    }

    /// 依次通知子表面父表面已提交；返回父表面是否仍然存活
    pub(crate) fn notify_commit_to_subsurfaces(&mut self, parent: SurfaceId) -> bool {
        let mut visited = HashSet::new();

        for above in [false, true] {
            'restart: loop {
                let Some(s) = self.surfaces.get(parent) else {
                    return false;
                };
                let generation = s.children_generation;
                let list = if above {
                    &s.current.subsurfaces_above
                } else {
                    &s.current.subsurfaces_below
                };
                let pending = list
                    .iter()
                    .copied()
                    .filter(|id| !visited.contains(id))
                    .collect::<Vec<_>>();

                for child in pending {
                    visited.insert(child);
                    self.with_role(child, |role, compositor| {
                        role.parent_committed(compositor, child)
                    });

                    let Some(s) = self.surfaces.get(parent) else {
                        return false;
                    };
                    if s.children_generation != generation {
                        trace!(?parent, "child list changed, restarting propagation");
                        continue 'restart;
                    }
                }
                break;
            }
        }

        true
    }
}

// 在旧列表中，child 上方列表里的邻居（不在列表中则为 None）
fn above_neighbor(list: &[SurfaceId], child: SurfaceId, parent: SurfaceId) -> Option<SurfaceId> {
    let idx = list.iter().position(|id| *id == child)?;
    Some(if idx == 0 { parent } else { list[idx - 1] })
}

fn below_neighbor(list: &[SurfaceId], child: SurfaceId, parent: SurfaceId) -> Option<SurfaceId> {
    let idx = list.iter().position(|id| *id == child)?;
    Some(list.get(idx + 1).copied().unwrap_or(parent))
}
