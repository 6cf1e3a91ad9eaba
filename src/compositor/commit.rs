//! 提交处理：检查显式同步、调用角色钩子、按锁决定立即生效还是入队，
//! 以及把一个状态提升为 Current。
//!
//! 任何可能销毁表面的步骤（协议错误、角色钩子、子表面传播）之后都
//! 重新查表；查不到就停止，不再碰这个表面。

use std::mem;

use smithay::utils::Logical;

use super::state::{ConstraintMode, CurrentState, PresentationHint, SurfaceChanges, SurfaceState};
use super::surface::FenceWait;
use super::{Compositor, FenceSignaled, SurfaceId};
use crate::buffer::import::{
    buffer_to_texture, check_buffer, clear_dimensions, update_damage, update_dimensions,
    ImportOutcome,
};
use crate::error::{ProtocolError, SyncError};
use crate::sync::FenceStatus;
use crate::utils::region::Region;

/// 校验新状态并在 Current 的副本上算出几何信息，不产生任何副作用
fn prepare(
    current: &CurrentState,
    state: &SurfaceState,
) -> Result<(CurrentState, SurfaceChanges), ProtocolError> {
    let mut next = current.clone();
    let mut changes = SurfaceChanges::empty();

    if state.scale != current.scale {
        changes |= SurfaceChanges::BUFFER_SCALE;
    }
    if state.transform != current.transform {
        changes |= SurfaceChanges::BUFFER_TRANSFORM;
    }
    let viewport_changed = state.viewport != current.viewport;

    next.scale = state.scale;
    next.transform = state.transform;
    next.viewport = state.viewport;

    let buffer = if state.attached {
        if state.buffer.is_some() != current.buffer.is_some() {
            changes |= SurfaceChanges::MAPPING;
        }
        state.buffer.as_ref()
    } else {
        current.buffer.as_ref()
    };

    match buffer {
        Some(buffer) => {
            let raw = check_buffer(buffer)?;
            let geometry_changed = viewport_changed
                || changes.intersects(SurfaceChanges::BUFFER_SCALE | SurfaceChanges::BUFFER_TRANSFORM);
            if state.attached || geometry_changed {
                changes |= update_dimensions(&mut next, raw)?;
            }
        }
        None => changes |= clear_dimensions(&mut next),
    }

    Ok((next, changes))
}

/// 裁剪到表面边界；`None` 为整个表面
fn clip_region(region: Option<&Region<Logical>>, next: &CurrentState) -> Region<Logical> {
    match region {
        Some(region) => region.intersect_rect(next.bounds()),
        None if next.size.w > 0 && next.size.h > 0 => Region::from_rect(next.bounds()),
        None => Region::new(),
    }
}

impl Compositor {
    /// wl_surface.commit
    pub fn handle_commit(&mut self, surface: SurfaceId) {
        let _span = trace_span!("handle_commit", ?surface).entered();

        let Some(s) = self.surfaces.get_mut(surface) else {
            return;
        };
        if let Some(buffer) = &s.pending.buffer {
            buffer.set_surface(surface);
        }

        if !self.check_timelines(surface) {
            return;
        }

        self.with_role(surface, |role, compositor| role.cache_commit(compositor, surface));

        if !self.drain_cached(surface) {
            return;
        }

        let Some(s) = self.surfaces.get_mut(surface) else {
            return;
        };
        let state = s.pending.take_commit();
        if !s.cached.is_empty() || state.lock_count != 0 {
            debug!(
                commit = state.commit_id,
                locks = state.lock_count,
                queued = s.cached.len(),
                "deferring commit"
            );
            s.cached.push_back(state);
        } else {
            self.apply_commit(surface, state);
        }

        self.dispatch_unlocks();
    }

    /// 显式同步检查；返回 false 时提交已经终止（协议错误或内存不足）
    fn check_timelines(&mut self, surface: SurfaceId) -> bool {
        let Some(s) = self.surfaces.get_mut(surface) else {
            return false;
        };
        let pending = &mut s.pending;

        if !s.explicit_sync {
            if pending.acquire_point.take().is_some() | pending.release_point.take().is_some() {
                trace!("clearing stale timeline points");
            }
            return true;
        }

        let fresh_buffer = if pending.attached {
            pending.buffer.clone()
        } else {
            None
        };

        let error = match &fresh_buffer {
            Some(buffer) if !buffer.is_dmabuf() => Some(SyncError::UnsupportedBuffer),
            Some(_) => match (&pending.acquire_point, &pending.release_point) {
                (None, _) => Some(SyncError::NoAcquirePoint),
                (_, None) => Some(SyncError::NoReleasePoint),
                (Some(acquire), Some(release))
                    if acquire.same_timeline(release) && acquire.point >= release.point =>
                {
                    Some(SyncError::ConflictingPoints)
                }
                _ => None,
            },
            None if pending.acquire_point.is_some() || pending.release_point.is_some() => {
                Some(SyncError::NoBuffer)
            }
            None => None,
        };
        if let Some(error) = error {
            self.post_error(surface, error.into());
            return false;
        }

        let Some(acquire) = fresh_buffer.and(pending.acquire_point.clone()) else {
            return true;
        };

        match acquire.timeline.probe(acquire.point) {
            Ok(FenceStatus::Materialized) => true,
            Ok(FenceStatus::Pending) => {
                let Some(lock) = self.lock(surface) else {
                    return false;
                };
                let commit_id = lock.commit_id();
                trace!(commit = commit_id, point = acquire.point, "waiting for acquire point");

                let sender = self.fence_sender.clone();
                let callback = Box::new(move || {
                    let msg = FenceSignaled {
                        surface,
                        commit_id,
                    };
                    if let Err(err) = sender.send(msg) {
                        warn!("error sending fence signal: {err:?}");
                    }
                });

                match acquire.timeline.wait_async(acquire.point, callback) {
                    Ok(handle) => {
                        if let Some(s) = self.surfaces.get_mut(surface) {
                            s.fence_waits.push(FenceWait {
                                commit_id,
                                lock,
                                _handle: handle,
                            });
                        }
                        true
                    }
                    Err(err) => {
                        warn!("error registering acquire point wait: {err}");
                        drop(lock);
                        self.post_out_of_memory(surface);
                        false
                    }
                }
            }
            Err(err) => {
                warn!("error probing acquire point: {err}");
                self.post_out_of_memory(surface);
                false
            }
        }
    }

    /// 由事件循环在收到栅栏消息时调用
    pub fn fence_signaled(&mut self, signal: FenceSignaled) {
        let _span = trace_span!("fence_signaled", surface = ?signal.surface, commit = signal.commit_id)
            .entered();

        let Some(s) = self.surfaces.get_mut(signal.surface) else {
            trace!("surface is gone");
            return;
        };
        let Some(pos) = s
            .fence_waits
            .iter()
            .position(|w| w.commit_id == signal.commit_id)
        else {
            return;
        };

        let FenceWait { lock, .. } = s.fence_waits.remove(pos);
        self.unlock(lock);
    }

    pub(crate) fn unlock_commit(&mut self, surface: SurfaceId, commit_id: u64) {
        let Some(s) = self.surfaces.get_mut(surface) else {
            trace!(?surface, commit = commit_id, "ignoring unlock for a dead surface");
            return;
        };
        let Some(state) = s.state_mut(commit_id) else {
            warn!(?surface, commit = commit_id, "ignoring unlock for an unknown commit");
            return;
        };

        assert!(
            state.lock_count > 0,
            "commit {commit_id} of {surface:?} unlocked more times than it was locked"
        );
        state.lock_count -= 1;
        trace!(?surface, commit = commit_id, locks = state.lock_count, "unlocked commit");

        self.drain_cached(surface);
    }

    /// 按顺序应用队首已解锁的状态；返回表面是否仍然存活
    pub(crate) fn drain_cached(&mut self, surface: SurfaceId) -> bool {
        let Some(s) = self.surfaces.get_mut(surface) else {
            return false;
        };
        if s.draining {
            return true;
        }
        if s.in_role_hook {
            trace!(?surface, "deferring drain until the role hook returns");
            s.drain_deferred = true;
            return true;
        }
        s.draining = true;

        loop {
            let Some(s) = self.surfaces.get_mut(surface) else {
                return false;
            };
            if !s.cached.front().is_some_and(|state| state.lock_count == 0) {
                s.draining = false;
                return true;
            }
            let Some(state) = s.cached.pop_front() else {
                s.draining = false;
                return true;
            };
            if !self.apply_commit(surface, state) {
                return false;
            }
        }
    }

    /// 把 `state` 提升为 Current；返回表面是否仍然存活
    pub(crate) fn apply_commit(&mut self, surface: SurfaceId, mut state: SurfaceState) -> bool {
        let _span = trace_span!("apply_commit", ?surface, commit = state.commit_id).entered();

        let Some(s) = self.surfaces.get_mut(surface) else {
            return false;
        };
        let (mut next, mut changes) = match prepare(&s.current, &state) {
            Ok(prepared) => prepared,
            Err(err) => {
                self.post_error(surface, err);
                return false;
            }
        };

        // 旧的呈现反馈被新内容取代
        let superseded = mem::take(&mut s.current.feedbacks);
        next.feedbacks = mem::take(&mut state.feedbacks);
        for feedback in superseded {
            self.handler.feedback_discarded(feedback);
        }

        self.apply_subsurfaces_order(surface, &state);
        if !self.notify_commit_to_subsurfaces(surface) {
            return false;
        }

        let Some(s) = self.surfaces.get_mut(surface) else {
            return false;
        };
        let current = &s.current;

        if state.attached {
            let replaced = current.buffer.as_ref().filter(|old| {
                old.is_dmabuf() && !state.buffer.as_ref().is_some_and(|new| new.ptr_eq(old))
            });
            if let Some(old) = replaced {
                old.release();
            }
            // 上一次提交的内容已被取代
            if let Some(point) = &current.release_point {
                point.signal();
            }
            next.buffer = state.buffer.clone();
            next.release_point = state.release_point.take();
        }

        next.frame_callbacks.append(&mut state.frame_callbacks);
        next.damage.clear();
        next.buffer_damage.clear();

        match (&next.buffer.clone(), state.attached) {
            (Some(buffer), true) => {
                let outcome = buffer_to_texture(
                    &mut next,
                    &state,
                    buffer,
                    changes,
                    self.allocator.as_mut(),
                    &self.config,
                );
                if outcome == ImportOutcome::Failed {
                    error!(?surface, "error importing buffer");
                }
            }
            (Some(_), false) if changes.intersects(SurfaceChanges::GEOMETRY) => {
                update_damage(&mut next, &state, true, &self.config);
            }
            _ => (),
        }

        changes |= update_regions(&mut next, &state, current, changes);

        if state.content_type != current.content_type {
            changes |= SurfaceChanges::CONTENT_TYPE;
        }
        next.content_type = state.content_type;

        next.vsync = state.presentation_hint != PresentationHint::Async;
        if next.vsync != current.vsync {
            changes |= SurfaceChanges::VSYNC;
        }

        // 子表面列表以表中为准，传播过程中可能有子表面被销毁
        next.subsurfaces_above = mem::take(&mut s.current.subsurfaces_above);
        next.subsurfaces_below = mem::take(&mut s.current.subsurfaces_below);
        next.commit_id = state.commit_id;
        s.current = next;

        if self.config.debug.log_commits {
            debug!(?surface, commit = state.commit_id, changes = %changes.names(), "applied commit");
        }

        self.with_role(surface, |role, compositor| role.apply_commit(compositor, surface));
        if !self.surfaces.contains(surface) {
            return false;
        }

        self.handler.surface_changed(surface, changes);
        true
    }
}

/// 重新计算区域与指针约束；只有尺寸或对应区域变化时才重新裁剪
fn update_regions(
    next: &mut CurrentState,
    state: &SurfaceState,
    current: &CurrentState,
    changes: SurfaceChanges,
) -> SurfaceChanges {
    let mut rv = SurfaceChanges::empty();
    let size_changed = changes.contains(SurfaceChanges::SIZE);

    if size_changed || state.input_region != current.input_region_raw {
        next.input_region_raw = state.input_region.clone();
        next.input_region = clip_region(state.input_region.as_ref(), next);
        if next.input_region != current.input_region {
            rv |= SurfaceChanges::INPUT_REGION;
        }
    }

    if size_changed || state.opaque_region != current.opaque_region_raw {
        next.opaque_region_raw = state.opaque_region.clone();
        next.opaque_region = state.opaque_region.intersect_rect(next.bounds());
        if next.opaque_region != current.opaque_region {
            rv |= SurfaceChanges::OPAQUE_REGION;
        }
    }

    if size_changed || state.invisible_region != current.invisible_region_raw {
        next.invisible_region_raw = state.invisible_region.clone();
        next.invisible_region = state.invisible_region.intersect_rect(next.bounds());
        if next.invisible_region != current.invisible_region {
            rv |= SurfaceChanges::INVISIBLE_REGION;
        }
    }

    let constraint = &state.pointer_constraint;
    if constraint.mode != current.pointer_constraint.mode {
        rv |= SurfaceChanges::POINTER_CONSTRAINT_MODE;
    }
    next.pointer_constraint.mode = constraint.mode;
    next.pointer_constraint.region = constraint.region.clone();

    let constraint_region = if constraint.mode == ConstraintMode::None {
        Region::new()
    } else {
        clip_region(constraint.region.as_ref(), next).intersect(&next.input_region)
    };
    if constraint_region != current.constraint_region {
        rv |= SurfaceChanges::POINTER_CONSTRAINT_REGION;
    }
    next.constraint_region = constraint_region;

    let hint = if constraint.mode == ConstraintMode::None {
        None
    } else {
        constraint.cursor_hint
    };
    if hint != current.pointer_constraint.cursor_hint {
        rv |= SurfaceChanges::LOCKED_POINTER_HINT;
    }
    next.pointer_constraint.cursor_hint = hint;

    rv
}
