//! 缓冲区导入适配器：把提交的缓冲区变成可渲染的纹理。
//!
//! 这里的函数都作用在暂存的 `CurrentState` 副本上，调用方在校验全部
//! 通过后才把它发布为表面的 Current。

use smithay::utils::{Buffer, Logical, Point, Rectangle, Size};

use super::{BufferContent, BufferRef};
use crate::compositor::{CurrentState, SurfaceChanges, SurfaceState, TextureOrigin};
use crate::config::Config;
use crate::error::{ProtocolError, ViewportError};
use crate::texture::TextureAllocator;

use super::damage::DamageMapping;

/// 缓冲区分类；未知类型是协议错误
pub(crate) fn check_buffer(buffer: &BufferRef) -> Result<Size<i32, Buffer>, ProtocolError> {
    buffer.dimensions().ok_or(ProtocolError::UnknownBuffer)
}

/// 由缓冲区原始尺寸、缩放、变换和视口计算表面尺寸与源矩形
pub(crate) fn update_dimensions(
    next: &mut CurrentState,
    raw: Size<i32, Buffer>,
) -> Result<SurfaceChanges, ProtocolError> {
    let mut changes = SurfaceChanges::empty();

    let oriented = next.transform.transform_size(raw);
    let scale = f64::from(next.scale.max(1));
    let full_w = f64::from(oriented.w) / scale;
    let full_h = f64::from(oriented.h) / scale;
    let full_src = Rectangle::new(Point::from((0., 0.)), Size::from((full_w, full_h)));
    let full_size: Size<i32, Logical> = Size::from((full_w.round() as i32, full_h.round() as i32));

    let (src, size, dst) = match &next.viewport {
        None => (full_src, full_size, None),
        Some(viewport) => {
            let src = if viewport.source_unset() {
                full_src
            } else {
                let [x, y, w, h] = viewport.source;
                if x < 0. || y < 0. || w <= 0. || h <= 0. {
                    return Err(ViewportError::BadValue.into());
                }
                if x + w > full_w || y + h > full_h {
                    return Err(ViewportError::OutOfBuffer.into());
                }
                Rectangle::new(Point::from((x, y)), Size::from((w, h)))
            };

            if !viewport.destination_unset() {
                let (w, h) = viewport.destination;
                if w <= 0 || h <= 0 {
                    return Err(ViewportError::BadValue.into());
                }
                let dst = Size::from((w, h));
                (src, dst, Some(dst))
            } else if !viewport.source_unset() {
                if src.size.w.fract() != 0. || src.size.h.fract() != 0. {
                    return Err(ViewportError::BadSize.into());
                }
                let size = Size::from((src.size.w as i32, src.size.h as i32));
                (src, size, None)
            } else {
                (src, full_size, None)
            }
        }
    };

    if oriented != next.buffer_size {
        changes |= SurfaceChanges::BUFFER_SIZE;
    }
    if size != next.size {
        changes |= SurfaceChanges::SIZE;
    }
    if src != next.src_rect {
        changes |= SurfaceChanges::SRC_RECT;
    }

    next.buffer_size = oriented;
    next.size = size;
    next.src_rect = src;
    next.dst_size = dst;

    Ok(changes)
}

/// 取消映射后清空几何信息
pub(crate) fn clear_dimensions(next: &mut CurrentState) -> SurfaceChanges {
    let empty = CurrentState::default();
    let mut changes = SurfaceChanges::empty();
    if next.buffer_size != empty.buffer_size {
        changes |= SurfaceChanges::BUFFER_SIZE;
    }
    if next.size != empty.size {
        changes |= SurfaceChanges::SIZE;
    }
    if next.src_rect != empty.src_rect {
        changes |= SurfaceChanges::SRC_RECT;
    }

    next.buffer_size = empty.buffer_size;
    next.size = empty.size;
    next.src_rect = empty.src_rect;
    next.dst_size = None;
    next.texture = None;
    next.texture_origin = None;
    changes
}

/// 计算本次提交的损伤：全量，或把客户端的两种损伤互相映射后取并集
pub(crate) fn update_damage(
    next: &mut CurrentState,
    state: &SurfaceState,
    full: bool,
    config: &Config,
) {
    let mapping = DamageMapping::from_current(next);

    if full {
        next.damage = mapping.full_surface();
        next.buffer_damage = mapping.full_buffer();
        return;
    }

    let outset = config.damage.surface_outset;
    let mut buffer_damage = mapping.surface_to_buffer(&state.damage, outset);
    buffer_damage.union(&mapping.outset_buffer_damage(
        &state.buffer_damage,
        config.damage.buffer_outset,
    ));

    let mut damage = mapping.buffer_to_surface(&buffer_damage);
    damage.union(&state.damage.intersect_rect(next.bounds()));

    next.damage = damage;
    next.buffer_damage = buffer_damage;
}

/// 导入结果：是否产生了新的内容
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ImportOutcome {
    Imported,
    /// 没有损伤，跳过了上传
    Skipped,
    Failed,
}

/// 按缓冲区类型导入纹理并计算损伤；`geometry` 为本次提交的几何变化
pub(crate) fn buffer_to_texture(
    next: &mut CurrentState,
    state: &SurfaceState,
    buffer: &BufferRef,
    geometry: SurfaceChanges,
    allocator: &mut dyn TextureAllocator,
    config: &Config,
) -> ImportOutcome {
    let geometry_changed = geometry.intersects(SurfaceChanges::GEOMETRY);

    match buffer.content() {
        BufferContent::Shm(shm) => {
            let outcome = import_shm(next, state, buffer, geometry_changed, allocator, config);
            if outcome == ImportOutcome::Failed {
                warn!(buffer = ?buffer.id(), format = ?shm.format, "error importing shm buffer");
                drop_texture(next, state, config);
            }
            buffer.release();
            outcome
        }
        BufferContent::Dmabuf(dmabuf) => {
            let full = next.texture.is_none() || geometry_changed;

            if let Some(point) = &state.acquire_point {
                match point.timeline.export_sync_file(point.point) {
                    Ok(fence) => dmabuf.texture.add_acquire_fence(fence),
                    Err(err) => warn!("error exporting acquire fence: {err}"),
                }
            }

            next.texture = Some(dmabuf.texture.clone());
            next.texture_origin = Some(TextureOrigin::Dmabuf);
            update_damage(next, state, full, config);
            ImportOutcome::Imported
        }
        BufferContent::SinglePixel(pixel) => {
            let full = next.texture.is_none() || geometry_changed;

            let outcome = match pixel.texture(allocator) {
                Some(texture) => {
                    next.texture = Some(texture);
                    next.texture_origin = Some(TextureOrigin::SinglePixel);
                    update_damage(next, state, full, config);
                    ImportOutcome::Imported
                }
                None => {
                    warn!(buffer = ?buffer.id(), "error creating single-pixel texture");
                    drop_texture(next, state, config);
                    ImportOutcome::Failed
                }
            };
            buffer.release();
            outcome
        }
        // 在校验阶段已经拒绝
        BufferContent::Unknown(_) => ImportOutcome::Failed,
    }
}

// 旧纹理不再对应当前的缓冲区和尺寸，不能继续显示
fn drop_texture(next: &mut CurrentState, state: &SurfaceState, config: &Config) {
    next.texture = None;
    next.texture_origin = None;
    update_damage(next, state, true, config);
}

fn import_shm(
    next: &mut CurrentState,
    state: &SurfaceState,
    buffer: &BufferRef,
    geometry_changed: bool,
    allocator: &mut dyn TextureAllocator,
    config: &Config,
) -> ImportOutcome {
    let BufferContent::Shm(shm) = buffer.content() else {
        return ImportOutcome::Failed;
    };
    if !allocator.supports_format(shm.format) {
        return ImportOutcome::Failed;
    }
    let Some(access) = buffer.shm_access() else {
        return ImportOutcome::Failed;
    };

    let reusable = next.texture_origin == Some(TextureOrigin::Shm)
        && next.texture.as_ref().is_some_and(|t| t.size() == shm.size);
    let full_upload = !reusable || geometry_changed || config.debug.disable_partial_upload;

    if full_upload {
        let Some(texture) =
            allocator.import_pixels(shm.format, access.pixels(), shm.stride, shm.size)
        else {
            return ImportOutcome::Failed;
        };
        next.texture = Some(texture);
        next.texture_origin = Some(TextureOrigin::Shm);
        update_damage(next, state, true, config);
        return ImportOutcome::Imported;
    }

    if !state.has_damage() {
        trace!(buffer = ?buffer.id(), "no damage, skipping upload");
        next.damage.clear();
        next.buffer_damage.clear();
        return ImportOutcome::Skipped;
    }

    update_damage(next, state, false, config);
    let Some(texture) = &next.texture else {
        return ImportOutcome::Failed;
    };
    if !allocator.write_region(texture, &next.buffer_damage, access.pixels(), shm.stride) {
        return ImportOutcome::Failed;
    }
    ImportOutcome::Imported
}
