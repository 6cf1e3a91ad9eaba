//! 双缓冲的表面状态：Pending（客户端正在修改）、Cached（已提交但被锁住）
//! 和 Current（已生效，渲染层可见）。
//!
//! Pending 里的缩放、变换、区域、视口、指针约束、内容类型是"粘性"的：
//! 提交后保留，直到客户端再次修改；缓冲区、损伤、帧回调、呈现反馈和
//! 时间线点只属于一次提交，提交后清空。

use std::time::Duration;

use bitflags::bitflags;
use serde::Deserialize;
use smithay::utils::{Buffer, Logical, Point, Rectangle, Size, Transform};

use super::SurfaceId;
use crate::buffer::BufferRef;
use crate::sync::TimelinePoint;
use crate::texture::TextureRef;
use crate::utils::id::typed_id;
use crate::utils::region::Region;

bitflags! {
    /// 一次提交生效后通知渲染层的变化集合
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SurfaceChanges: u32 {
        const MAPPING = 1 << 0;
        const BUFFER_TRANSFORM = 1 << 1;
        const BUFFER_SCALE = 1 << 2;
        const BUFFER_SIZE = 1 << 3;
        const SIZE = 1 << 4;
        const SRC_RECT = 1 << 5;
        const INPUT_REGION = 1 << 6;
        const INVISIBLE_REGION = 1 << 7;
        const OPAQUE_REGION = 1 << 8;
        const POINTER_CONSTRAINT_MODE = 1 << 9;
        const POINTER_CONSTRAINT_REGION = 1 << 10;
        const LOCKED_POINTER_HINT = 1 << 11;
        const VSYNC = 1 << 12;
        const CONTENT_TYPE = 1 << 13;
    }
}

impl SurfaceChanges {
    /// 影响尺寸/变换、需要全量损伤的变化
    pub const GEOMETRY: SurfaceChanges = SurfaceChanges::BUFFER_TRANSFORM
        .union(SurfaceChanges::BUFFER_SCALE)
        .union(SurfaceChanges::BUFFER_SIZE)
        .union(SurfaceChanges::SIZE)
        .union(SurfaceChanges::SRC_RECT);

    /// 以 "SIZE,SRC_RECT" 形式输出，空集输出 "-"
    pub fn names(self) -> String {
        if self.is_empty() {
            return String::from("-");
        }
        self.iter_names()
            .map(|(name, _)| name)
            .collect::<Vec<_>>()
            .join(",")
    }
}

typed_id! {
    /// wl_surface.frame 回调
    pub struct CallbackId;
}

typed_id! {
    /// wp_presentation_feedback 令牌
    pub struct FeedbackId;
}

/// wp_viewport 中的"未设置"取值
pub const VIEWPORT_UNSET: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewportState {
    /// 源矩形 [x, y, w, h]，表面坐标（wl_fixed 精度）
    pub source: [f64; 4],
    /// 目标尺寸
    pub destination: (i32, i32),
}

impl Default for ViewportState {
    fn default() -> Self {
        let unset = f64::from(VIEWPORT_UNSET);
        Self {
            source: [unset; 4],
            destination: (VIEWPORT_UNSET, VIEWPORT_UNSET),
        }
    }
}

impl ViewportState {
    /// 任一分量为哨兵值即视为未设置
    pub fn source_unset(&self) -> bool {
        let unset = f64::from(VIEWPORT_UNSET);
        self.source.iter().any(|v| *v == unset)
    }

    pub fn destination_unset(&self) -> bool {
        self.destination == (VIEWPORT_UNSET, VIEWPORT_UNSET)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConstraintMode {
    #[default]
    None,
    Locked,
    Confined,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PointerConstraintState {
    pub mode: ConstraintMode,
    /// None 表示整个表面
    pub region: Option<Region<Logical>>,
    /// 锁定指针解锁时的光标位置提示
    pub cursor_hint: Option<Point<f64, Logical>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContentType {
    #[default]
    None,
    Photo,
    Video,
    Game,
}

/// wp_tearing_control 提示
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PresentationHint {
    #[default]
    Vsync,
    Async,
}

/// 当前纹理的来源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureOrigin {
    /// 由我们上传、可做局部更新
    Shm,
    Dmabuf,
    SinglePixel,
}

#[derive(Debug, Clone)]
pub struct SurfaceState {
    pub(crate) buffer: Option<BufferRef>,
    /// 本轮是否调用过 attach（buffer 为 None 时表示取消映射）
    pub(crate) attached: bool,
    pub(crate) damage: Region<Logical>,
    pub(crate) buffer_damage: Region<Buffer>,
    pub(crate) scale: i32,
    pub(crate) transform: Transform,
    /// None 表示无限大的输入区域
    pub(crate) input_region: Option<Region<Logical>>,
    pub(crate) opaque_region: Region<Logical>,
    pub(crate) invisible_region: Region<Logical>,
    pub(crate) viewport: Option<ViewportState>,
    pub(crate) pointer_constraint: PointerConstraintState,
    pub(crate) content_type: ContentType,
    pub(crate) presentation_hint: PresentationHint,
    pub(crate) frame_callbacks: Vec<CallbackId>,
    pub(crate) feedbacks: Vec<FeedbackId>,
    pub(crate) acquire_point: Option<TimelinePoint>,
    pub(crate) release_point: Option<TimelinePoint>,
    pub(crate) subsurfaces_above: Vec<SurfaceId>,
    pub(crate) subsurfaces_below: Vec<SurfaceId>,
    pub(crate) commit_id: u64,
    pub(crate) lock_count: u32,
}

impl Default for SurfaceState {
    fn default() -> Self {
        Self {
            buffer: None,
            attached: false,
            damage: Region::new(),
            buffer_damage: Region::new(),
            scale: 1,
            transform: Transform::Normal,
            input_region: None,
            opaque_region: Region::new(),
            invisible_region: Region::new(),
            viewport: None,
            pointer_constraint: PointerConstraintState::default(),
            content_type: ContentType::None,
            presentation_hint: PresentationHint::Vsync,
            frame_callbacks: Vec::new(),
            feedbacks: Vec::new(),
            acquire_point: None,
            release_point: None,
            subsurfaces_above: Vec::new(),
            subsurfaces_below: Vec::new(),
            commit_id: 1,
            lock_count: 0,
        }
    }
}

impl SurfaceState {
    pub fn commit_id(&self) -> u64 {
        self.commit_id
    }

    pub fn lock_count(&self) -> u32 {
        self.lock_count
    }

    pub fn buffer(&self) -> Option<&BufferRef> {
        self.buffer.as_ref()
    }

    pub fn has_damage(&self) -> bool {
        !self.damage.is_empty() || !self.buffer_damage.is_empty()
    }

    pub fn subsurfaces_above(&self) -> &[SurfaceId] {
        &self.subsurfaces_above
    }

    pub fn subsurfaces_below(&self) -> &[SurfaceId] {
        &self.subsurfaces_below
    }

    /// 把 Pending 拍成一个快照交给提交流水线，自身清空单次提交字段并递增提交ID
    pub(crate) fn take_commit(&mut self) -> SurfaceState {
        let snapshot = self.clone();

        self.buffer = None;
        self.attached = false;
        self.damage.clear();
        self.buffer_damage.clear();
        self.frame_callbacks.clear();
        self.feedbacks.clear();
        self.acquire_point = None;
        self.release_point = None;
        self.lock_count = 0;
        self.commit_id += 1;

        snapshot
    }
}

/// 已生效的状态，以及由它推导出的几何信息
#[derive(Debug, Clone)]
pub struct CurrentState {
    pub(crate) buffer: Option<BufferRef>,
    pub(crate) texture: Option<TextureRef>,
    pub(crate) texture_origin: Option<TextureOrigin>,
    pub(crate) scale: i32,
    pub(crate) transform: Transform,
    pub(crate) viewport: Option<ViewportState>,
    /// 按变换定向后的缓冲区尺寸（90° 类变换时宽高互换）
    pub(crate) buffer_size: Size<i32, Buffer>,
    pub(crate) size: Size<i32, Logical>,
    pub(crate) src_rect: Rectangle<f64, Logical>,
    pub(crate) dst_size: Option<Size<i32, Logical>>,
    pub(crate) damage: Region<Logical>,
    pub(crate) buffer_damage: Region<Buffer>,
    pub(crate) input_region_raw: Option<Region<Logical>>,
    pub(crate) input_region: Region<Logical>,
    pub(crate) opaque_region_raw: Region<Logical>,
    pub(crate) opaque_region: Region<Logical>,
    pub(crate) invisible_region_raw: Region<Logical>,
    pub(crate) invisible_region: Region<Logical>,
    pub(crate) pointer_constraint: PointerConstraintState,
    pub(crate) constraint_region: Region<Logical>,
    pub(crate) content_type: ContentType,
    pub(crate) vsync: bool,
    pub(crate) frame_callbacks: Vec<CallbackId>,
    pub(crate) feedbacks: Vec<FeedbackId>,
    pub(crate) release_point: Option<TimelinePoint>,
    pub(crate) subsurfaces_above: Vec<SurfaceId>,
    pub(crate) subsurfaces_below: Vec<SurfaceId>,
    pub(crate) commit_id: u64,
    pub(crate) last_presented: Option<Duration>,
}

impl Default for CurrentState {
    fn default() -> Self {
        Self {
            buffer: None,
            texture: None,
            texture_origin: None,
            scale: 1,
            transform: Transform::Normal,
            viewport: None,
            buffer_size: Size::from((0, 0)),
            size: Size::from((0, 0)),
            src_rect: Rectangle::new(Point::from((0., 0.)), Size::from((0., 0.))),
            dst_size: None,
            damage: Region::new(),
            buffer_damage: Region::new(),
            input_region_raw: None,
            input_region: Region::new(),
            opaque_region_raw: Region::new(),
            opaque_region: Region::new(),
            invisible_region_raw: Region::new(),
            invisible_region: Region::new(),
            pointer_constraint: PointerConstraintState::default(),
            constraint_region: Region::new(),
            content_type: ContentType::None,
            vsync: true,
            frame_callbacks: Vec::new(),
            feedbacks: Vec::new(),
            release_point: None,
            subsurfaces_above: Vec::new(),
            subsurfaces_below: Vec::new(),
            commit_id: 0,
            last_presented: None,
        }
    }
}

impl CurrentState {
    pub fn is_mapped(&self) -> bool {
        self.buffer.is_some()
    }

    pub fn buffer(&self) -> Option<&BufferRef> {
        self.buffer.as_ref()
    }

    pub fn texture(&self) -> Option<&TextureRef> {
        self.texture.as_ref()
    }

    pub fn texture_origin(&self) -> Option<TextureOrigin> {
        self.texture_origin
    }

    pub fn size(&self) -> Size<i32, Logical> {
        self.size
    }

    pub fn buffer_size(&self) -> Size<i32, Buffer> {
        self.buffer_size
    }

    pub fn src_rect(&self) -> Rectangle<f64, Logical> {
        self.src_rect
    }

    pub fn dst_size(&self) -> Option<Size<i32, Logical>> {
        self.dst_size
    }

    pub fn scale(&self) -> i32 {
        self.scale
    }

    pub fn transform(&self) -> Transform {
        self.transform
    }

    pub fn damage(&self) -> &Region<Logical> {
        &self.damage
    }

    pub fn buffer_damage(&self) -> &Region<Buffer> {
        &self.buffer_damage
    }

    pub fn has_damage(&self) -> bool {
        !self.damage.is_empty() || !self.buffer_damage.is_empty()
    }

    pub fn input_region(&self) -> &Region<Logical> {
        &self.input_region
    }

    pub fn opaque_region(&self) -> &Region<Logical> {
        &self.opaque_region
    }

    pub fn invisible_region(&self) -> &Region<Logical> {
        &self.invisible_region
    }

    pub fn pointer_constraint_mode(&self) -> ConstraintMode {
        self.pointer_constraint.mode
    }

    pub fn constraint_region(&self) -> &Region<Logical> {
        &self.constraint_region
    }

    pub fn locked_pointer_hint(&self) -> Option<Point<f64, Logical>> {
        self.pointer_constraint.cursor_hint
    }

    pub fn content_type(&self) -> ContentType {
        self.content_type
    }

    pub fn vsync(&self) -> bool {
        self.vsync
    }

    pub fn frame_callbacks(&self) -> &[CallbackId] {
        &self.frame_callbacks
    }

    pub fn feedbacks(&self) -> &[FeedbackId] {
        &self.feedbacks
    }

    pub fn subsurfaces_above(&self) -> &[SurfaceId] {
        &self.subsurfaces_above
    }

    pub fn subsurfaces_below(&self) -> &[SurfaceId] {
        &self.subsurfaces_below
    }

    /// 最近一次生效的提交ID，0 表示尚未提交过
    pub fn commit_id(&self) -> u64 {
        self.commit_id
    }

    pub fn last_presented(&self) -> Option<Duration> {
        self.last_presented
    }

    /// 表面空间的边界矩形
    pub fn bounds(&self) -> Rectangle<i32, Logical> {
        Rectangle::new(Point::from((0, 0)), self.size)
    }
}
