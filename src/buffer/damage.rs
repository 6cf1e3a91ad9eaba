//! 表面空间与缓冲区空间之间的损伤映射。
//!
//! 表面 → 缓冲区：先外扩（表面单位），再做视口的逆变换（缩放到源矩形并
//! 平移），乘以缓冲区缩放，最后在定向后的缓冲区内应用 `transform`。
//! 缓冲区 → 表面按相反的顺序，变换使用 `transform.invert()`。
//! 两个方向的结果都向外取整并裁剪到目标边界。

use smithay::utils::{Buffer, Logical, Point, Rectangle, Size, Transform};

use crate::compositor::CurrentState;
use crate::utils::region::{intersection, round_out, Region};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DamageMapping {
    /// 纹理的原始像素尺寸（未变换）
    pub raw_size: Size<i32, Buffer>,
    pub transform: Transform,
    pub scale: i32,
    /// 视口源矩形，表面坐标
    pub src: Rectangle<f64, Logical>,
    /// 表面尺寸
    pub size: Size<i32, Logical>,
}

impl DamageMapping {
    pub fn from_current(current: &CurrentState) -> Self {
        Self {
            raw_size: current.transform.transform_size(current.buffer_size),
            transform: current.transform,
            scale: current.scale,
            src: current.src_rect,
            size: current.size,
        }
    }

    fn oriented_size(&self) -> Size<i32, Buffer> {
        self.transform.transform_size(self.raw_size)
    }

    fn raw_bounds(&self) -> Rectangle<i32, Buffer> {
        Rectangle::new(Point::from((0, 0)), self.raw_size)
    }

    // 表面坐标 → 源矩形坐标的比例
    fn viewport_ratio(&self) -> Option<(f64, f64)> {
        if self.size.w <= 0 || self.size.h <= 0 {
            return None;
        }
        Some((
            self.src.size.w / f64::from(self.size.w),
            self.src.size.h / f64::from(self.size.h),
        ))
    }

    pub fn surface_to_buffer(&self, damage: &Region<Logical>, outset: f64) -> Region<Buffer> {
        let Some((rx, ry)) = self.viewport_ratio() else {
            return Region::new();
        };
        let scale = f64::from(self.scale);
        let oriented = self.oriented_size();
        let oriented_bounds = Rectangle::new(Point::from((0, 0)), oriented);

        damage.map_rects(|rect| {
            let x = (f64::from(rect.loc.x) - outset) * rx + self.src.loc.x;
            let y = (f64::from(rect.loc.y) - outset) * ry + self.src.loc.y;
            let w = (f64::from(rect.size.w) + 2. * outset) * rx;
            let h = (f64::from(rect.size.h) + 2. * outset) * ry;

            if w <= 0. || h <= 0. {
                return None;
            }

            let rect = Rectangle::<f64, Buffer>::new(
                Point::from((x * scale, y * scale)),
                Size::from((w * scale, h * scale)),
            );
            let rect = intersection(round_out(rect)?, oriented_bounds)?;
            Some(self.transform.transform_rect_in(rect, &oriented))
        })
    }

    pub fn buffer_to_surface(&self, damage: &Region<Buffer>) -> Region<Logical> {
        let Some((rx, ry)) = self.viewport_ratio() else {
            return Region::new();
        };
        let scale = f64::from(self.scale);
        let bounds = Rectangle::new(Point::from((0, 0)), self.size);
        let inverse = self.transform.invert();

        damage.map_rects(|rect| {
            let rect = inverse.transform_rect_in(rect, &self.raw_size);

            let x = (f64::from(rect.loc.x) / scale - self.src.loc.x) / rx;
            let y = (f64::from(rect.loc.y) / scale - self.src.loc.y) / ry;
            let w = f64::from(rect.size.w) / scale / rx;
            let h = f64::from(rect.size.h) / scale / ry;

            let rect = Rectangle::<f64, Logical>::new(Point::from((x, y)), Size::from((w, h)));
            intersection(round_out(rect)?, bounds)
        })
    }

    /// 外扩缓冲区损伤并裁剪到缓冲区边界
    pub fn outset_buffer_damage(&self, damage: &Region<Buffer>, outset: i32) -> Region<Buffer> {
        damage.expand(outset).intersect_rect(self.raw_bounds())
    }

    pub fn full_buffer(&self) -> Region<Buffer> {
        Region::from_rect(self.raw_bounds())
    }

    pub fn full_surface(&self) -> Region<Logical> {
        Region::from_rect(Rectangle::new(Point::from((0, 0)), self.size))
    }
}
