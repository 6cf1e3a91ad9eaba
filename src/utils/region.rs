//! 区域（Region）：由互不重叠的整数矩形组成的集合。
//!
//! 表面的输入区域、不透明区域、损伤区域都用它表示。坐标空间由 `Kind`
//! 参数区分（`Logical` 为表面空间，`Buffer` 为缓冲区空间），矩形运算全部交给
//! smithay 的 `Rectangle<N, Kind>`，这里只维护集合本身。
//!
//! 内部不变量：`rects` 中的矩形两两不相交且面积非零。

use std::fmt;

use smithay::utils::{Point, Rectangle, Size};

pub struct Region<Kind> {
    rects: Vec<Rectangle<i32, Kind>>,
}

fn is_valid<Kind>(rect: &Rectangle<i32, Kind>) -> bool {
    rect.size.w > 0 && rect.size.h > 0
}

/// 两个矩形的交集，只相接或不相交时返回 None
pub fn intersection<Kind>(
    a: Rectangle<i32, Kind>,
    b: Rectangle<i32, Kind>,
) -> Option<Rectangle<i32, Kind>> {
    a.intersection(b).filter(is_valid)
}

/// 浮点矩形向外取整，退化时返回 None
pub fn round_out<Kind>(rect: Rectangle<f64, Kind>) -> Option<Rectangle<i32, Kind>> {
    Some(rect.to_i32_up()).filter(is_valid)
}

impl<Kind> Region<Kind> {
    pub fn new() -> Self {
        Self { rects: Vec::new() }
    }

    pub fn from_rect(rect: Rectangle<i32, Kind>) -> Self {
        let mut region = Self::new();
        region.add_rect(rect);
        region
    }

    pub fn from_rects(rects: impl IntoIterator<Item = Rectangle<i32, Kind>>) -> Self {
        let mut region = Self::new();
        for rect in rects {
            region.add_rect(rect);
        }
        region
    }

    pub fn is_empty(&self) -> bool {
        self.rects.is_empty()
    }

    pub fn rects(&self) -> &[Rectangle<i32, Kind>] {
        &self.rects
    }

    pub fn clear(&mut self) {
        self.rects.clear();
    }

    /// 像素总面积
    pub fn area(&self) -> i64 {
        self.rects
            .iter()
            .map(|r| i64::from(r.size.w) * i64::from(r.size.h))
            .sum()
    }

    /// 包围盒
    pub fn extents(&self) -> Option<Rectangle<i32, Kind>> {
        self.rects.iter().copied().reduce(|a, b| a.merge(b))
    }

    pub fn contains_point(&self, point: Point<i32, Kind>) -> bool {
        self.rects.iter().any(|r| r.contains(point))
    }

    /// 并入一个矩形，只保留尚未覆盖的部分
    pub fn add_rect(&mut self, rect: Rectangle<i32, Kind>) {
        if !is_valid(&rect) {
            return;
        }

        let pieces = Rectangle::subtract_rects_many([rect], self.rects.iter().copied());
        self.rects.extend(pieces.into_iter().filter(is_valid));
    }

    pub fn union(&mut self, other: &Region<Kind>) {
        for rect in &other.rects {
            self.add_rect(*rect);
        }
    }

    pub fn subtract_rect(&mut self, rect: Rectangle<i32, Kind>) {
        self.rects = self
            .rects
            .iter()
            .flat_map(|r| r.subtract_rect(rect))
            .filter(is_valid)
            .collect();
    }

    pub fn intersect_rect(&self, rect: Rectangle<i32, Kind>) -> Region<Kind> {
        Region {
            rects: self
                .rects
                .iter()
                .filter_map(|r| intersection(*r, rect))
                .collect(),
        }
    }

    pub fn intersect(&self, other: &Region<Kind>) -> Region<Kind> {
        // 双方各自不相交，两两求交的结果也不相交
        let rects = self
            .rects
            .iter()
            .flat_map(|a| other.rects.iter().filter_map(|b| intersection(*a, *b)))
            .collect();
        Region { rects }
    }

    /// 每个矩形向四周外扩 `amount`
    pub fn expand(&self, amount: i32) -> Region<Kind> {
        Region::from_rects(self.rects.iter().filter_map(|r| {
            let (w, h) = (r.size.w + 2 * amount, r.size.h + 2 * amount);
            (w > 0 && h > 0).then(|| {
                Rectangle::new(
                    r.loc - Point::from((amount, amount)),
                    Size::from((w, h)),
                )
            })
        }))
    }

    /// 逐矩形映射到另一个坐标空间
    pub fn map_rects<Other>(
        &self,
        f: impl Fn(Rectangle<i32, Kind>) -> Option<Rectangle<i32, Other>>,
    ) -> Region<Other> {
        Region::from_rects(self.rects.iter().filter_map(|r| f(*r)))
    }

    /// 判断 `self` 是否完全覆盖 `other`
    pub fn covers(&self, other: &Region<Kind>) -> bool {
        self.intersect(other).area() == other.area()
    }
}

impl<Kind> Default for Region<Kind> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Kind> Clone for Region<Kind> {
    fn clone(&self) -> Self {
        Self {
            rects: self.rects.clone(),
        }
    }
}

/// 按覆盖范围比较，而不是按矩形列表比较
impl<Kind> PartialEq for Region<Kind> {
    fn eq(&self, other: &Self) -> bool {
        self.area() == other.area() && self.covers(other)
    }
}

impl<Kind> fmt::Debug for Region<Kind> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(
                self.rects
                    .iter()
                    .map(|r| (r.loc.x, r.loc.y, r.size.w, r.size.h)),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use smithay::utils::Logical;

    use super::*;

    fn rect(x: i32, y: i32, w: i32, h: i32) -> Rectangle<i32, Logical> {
        Rectangle::new(Point::from((x, y)), Size::from((w, h)))
    }

    #[test]
    fn touching_rects_do_not_intersect() {
        assert_eq!(intersection(rect(0, 0, 4, 4), rect(4, 0, 4, 4)), None);
        assert_eq!(intersection(rect(0, 0, 4, 4), rect(2, 2, 4, 4)), Some(rect(2, 2, 2, 2)));
    }

    #[test]
    fn union_does_not_double_count() {
        let mut region = Region::from_rect(rect(0, 0, 10, 10));
        region.add_rect(rect(5, 5, 10, 10));
        assert_eq!(region.area(), 100 + 100 - 25);

        // 完全覆盖的矩形不会增加任何内容
        region.add_rect(rect(1, 1, 2, 2));
        assert_eq!(region.area(), 175);
    }

    #[test]
    fn rects_stay_disjoint() {
        let region = Region::from_rects([rect(0, 0, 4, 4), rect(2, 2, 4, 4), rect(1, 3, 6, 1)]);
        let rects = region.rects();
        for (i, a) in rects.iter().enumerate() {
            for b in &rects[i + 1..] {
                assert!(intersection(*a, *b).is_none(), "{a:?} overlaps {b:?}");
            }
        }
    }

    #[test]
    fn intersect_and_subtract() {
        let a = Region::from_rect(rect(0, 0, 10, 10));
        let b = Region::from_rect(rect(5, 0, 10, 5));
        assert_eq!(a.intersect(&b), Region::from_rect(rect(5, 0, 5, 5)));

        let mut c = a.clone();
        c.subtract_rect(rect(2, 2, 6, 6));
        assert_eq!(c.area(), 100 - 36);
        assert!(!c.contains_point(Point::from((4, 4))));
        assert!(c.contains_point(Point::from((0, 0))));
    }

    #[test]
    fn equality_is_by_coverage() {
        let split = Region::from_rects([rect(0, 0, 5, 10), rect(5, 0, 5, 10)]);
        let whole = Region::from_rect(rect(0, 0, 10, 10));
        assert_eq!(split, whole);
        assert_ne!(split, Region::from_rect(rect(0, 0, 10, 9)));
    }

    #[test]
    fn expand_and_round_out() {
        let region = Region::from_rect(rect(2, 2, 1, 1));
        assert_eq!(region.expand(1), Region::from_rect(rect(1, 1, 3, 3)));
        assert!(region.expand(-1).is_empty());

        let float = Rectangle::<f64, Logical>::new(Point::from((1.5, 1.5)), Size::from((1.5, 1.5)));
        assert_eq!(round_out(float), Some(rect(1, 1, 2, 2)));
        let thin = Rectangle::<f64, Logical>::new(Point::from((1., 1.)), Size::from((0., 2.)));
        assert_eq!(round_out(thin), None);
    }

    #[test]
    fn extents() {
        let region = Region::from_rects([rect(0, 0, 2, 2), rect(8, 8, 2, 2)]);
        assert_eq!(region.extents(), Some(rect(0, 0, 10, 10)));
        assert_eq!(Region::<Logical>::new().extents(), None);
    }

    #[test]
    fn degenerate_rects_are_ignored() {
        let mut region = Region::new();
        region.add_rect(rect(0, 0, 0, 10));
        region.add_rect(rect(5, 5, 10, 0));
        assert!(region.is_empty());
    }
}
