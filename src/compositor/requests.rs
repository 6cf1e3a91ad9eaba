//! 客户端请求：只修改 Pending，提交时才生效。

use smithay::utils::{Buffer, Logical, Point, Rectangle, Transform};

use super::state::{
    CallbackId, ConstraintMode, ContentType, FeedbackId, PresentationHint, SurfaceState,
    ViewportState,
};
use super::{Compositor, SurfaceId};
use crate::buffer::BufferRef;
use crate::error::SurfaceError;
use crate::sync::TimelinePoint;
use crate::utils::region::Region;

/// wl_output.transform 的线上取值
fn transform_from_wire(value: u32) -> Option<Transform> {
    Some(match value {
        0 => Transform::Normal,
        1 => Transform::_90,
        2 => Transform::_180,
        3 => Transform::_270,
        4 => Transform::Flipped,
        5 => Transform::Flipped90,
        6 => Transform::Flipped180,
        7 => Transform::Flipped270,
        _ => return None,
    })
}

impl Compositor {
    fn pending_mut(&mut self, surface: SurfaceId) -> Option<&mut SurfaceState> {
        self.surfaces.get_mut(surface).map(|s| &mut s.pending)
    }

    /// wl_surface.attach；`None` 取消映射
    pub fn attach(&mut self, surface: SurfaceId, buffer: Option<BufferRef>) {
        let Some(pending) = self.pending_mut(surface) else {
            return;
        };
        if let Some(buffer) = &buffer {
            buffer.mark_attached();
        }
        pending.buffer = buffer;
        pending.attached = true;
    }

    pub fn damage(&mut self, surface: SurfaceId, rect: Rectangle<i32, Logical>) {
        if let Some(pending) = self.pending_mut(surface) {
            pending.damage.add_rect(rect);
        }
    }

    pub fn damage_buffer(&mut self, surface: SurfaceId, rect: Rectangle<i32, Buffer>) {
        if let Some(pending) = self.pending_mut(surface) {
            pending.buffer_damage.add_rect(rect);
        }
    }

    pub fn set_buffer_scale(&mut self, surface: SurfaceId, scale: i32) {
        if scale < 1 {
            self.post_error(surface, SurfaceError::InvalidScale.into());
            return;
        }
        if let Some(pending) = self.pending_mut(surface) {
            pending.scale = scale;
        }
    }

    pub fn set_buffer_transform(&mut self, surface: SurfaceId, transform: Transform) {
        if let Some(pending) = self.pending_mut(surface) {
            pending.transform = transform;
        }
    }

    pub fn set_buffer_transform_wire(&mut self, surface: SurfaceId, value: u32) {
        match transform_from_wire(value) {
            Some(transform) => self.set_buffer_transform(surface, transform),
            None => self.post_error(surface, SurfaceError::InvalidTransform.into()),
        }
    }

    /// `None` 为无限大的输入区域
    pub fn set_input_region(&mut self, surface: SurfaceId, region: Option<Region<Logical>>) {
        if let Some(pending) = self.pending_mut(surface) {
            pending.input_region = region;
        }
    }

    pub fn set_opaque_region(&mut self, surface: SurfaceId, region: Option<Region<Logical>>) {
        if let Some(pending) = self.pending_mut(surface) {
            pending.opaque_region = region.unwrap_or_default();
        }
    }

    pub fn set_invisible_region(&mut self, surface: SurfaceId, region: Option<Region<Logical>>) {
        if let Some(pending) = self.pending_mut(surface) {
            pending.invisible_region = region.unwrap_or_default();
        }
    }

    pub fn frame(&mut self, surface: SurfaceId) -> Option<CallbackId> {
        let pending = self.pending_mut(surface)?;
        let callback = CallbackId::next();
        pending.frame_callbacks.push(callback);
        Some(callback)
    }

    pub fn presentation_feedback(&mut self, surface: SurfaceId) -> Option<FeedbackId> {
        let pending = self.pending_mut(surface)?;
        let feedback = FeedbackId::next();
        pending.feedbacks.push(feedback);
        Some(feedback)
    }

    /// wp_viewporter.get_viewport
    pub fn set_viewport(&mut self, surface: SurfaceId) {
        if let Some(pending) = self.pending_mut(surface) {
            pending.viewport.get_or_insert_with(ViewportState::default);
        }
    }

    /// 任一分量为 -1 表示取消源矩形
    pub fn set_viewport_source(&mut self, surface: SurfaceId, x: f64, y: f64, w: f64, h: f64) {
        if let Some(pending) = self.pending_mut(surface) {
            let viewport = pending.viewport.get_or_insert_with(ViewportState::default);
            viewport.source = [x, y, w, h];
        }
    }

    pub fn set_viewport_destination(&mut self, surface: SurfaceId, w: i32, h: i32) {
        if let Some(pending) = self.pending_mut(surface) {
            let viewport = pending.viewport.get_or_insert_with(ViewportState::default);
            viewport.destination = (w, h);
        }
    }

    pub fn destroy_viewport(&mut self, surface: SurfaceId) {
        if let Some(pending) = self.pending_mut(surface) {
            pending.viewport = None;
        }
    }

    pub fn set_content_type(&mut self, surface: SurfaceId, content_type: ContentType) {
        if let Some(pending) = self.pending_mut(surface) {
            pending.content_type = content_type;
        }
    }

    pub fn set_tearing_hint(&mut self, surface: SurfaceId, hint: PresentationHint) {
        if let Some(pending) = self.pending_mut(surface) {
            pending.presentation_hint = hint;
        }
    }

    /// 创建（或用 `ConstraintMode::None` 销毁）指针约束；`region` 为 None 时约束整个表面
    pub fn set_pointer_constraint(
        &mut self,
        surface: SurfaceId,
        mode: ConstraintMode,
        region: Option<Region<Logical>>,
    ) {
        if let Some(pending) = self.pending_mut(surface) {
            pending.pointer_constraint.mode = mode;
            pending.pointer_constraint.region = region;
        }
    }

    pub fn set_locked_pointer_hint(&mut self, surface: SurfaceId, position: Point<f64, Logical>) {
        if let Some(pending) = self.pending_mut(surface) {
            pending.pointer_constraint.cursor_hint = Some(position);
        }
    }

    /// 创建或销毁表面的显式同步对象
    pub fn set_explicit_sync(&mut self, surface: SurfaceId, enabled: bool) {
        if let Some(s) = self.surfaces.get_mut(surface) {
            s.explicit_sync = enabled;
        }
    }

    pub fn set_acquire_point(&mut self, surface: SurfaceId, point: TimelinePoint) {
        if let Some(pending) = self.pending_mut(surface) {
            pending.acquire_point = Some(point);
        }
    }

    pub fn set_release_point(&mut self, surface: SurfaceId, point: TimelinePoint) {
        if let Some(pending) = self.pending_mut(surface) {
            pending.release_point = Some(point);
        }
    }
}
