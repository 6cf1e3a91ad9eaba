use approx::assert_abs_diff_eq;
use proptest::prelude::*;
use smithay::utils::{Buffer, Logical, Point, Rectangle, Size};

use super::Fixture;
use crate::buffer::{BufferRef, ShmFormat};
use crate::compositor::{SurfaceChanges, TextureOrigin};
use crate::config::Config;
use crate::error::{ProtocolError, ViewportError};
use crate::replay::Event;
use crate::texture::AllocatorOp;
use crate::utils::region::Region;

fn rect<Kind>(x: i32, y: i32, w: i32, h: i32) -> Rectangle<i32, Kind> {
    Rectangle::new(Point::from((x, y)), Size::from((w, h)))
}

#[test]
fn partial_damage_uploads_partially() {
    let mut f = Fixture::new();
    let s = f.surface();
    let buffer = f.shm_buffer(100, 100);
    f.commit_buffer(s, &buffer);
    f.allocator.borrow_mut().take_ops();

    f.compositor.attach(s, Some(buffer.clone()));
    f.compositor.damage(s, rect(10, 10, 5, 5));
    f.compositor.handle_commit(s);

    let current = f.compositor.current(s).unwrap();
    let damage = current.damage();
    assert!(damage.covers(&Region::from_rect(rect(10, 10, 5, 5))));
    assert!(damage.area() < 100 * 100);

    let ops = f.allocator.borrow_mut().take_ops();
    assert_eq!(ops.len(), 1);
    let AllocatorOp::Write { area, .. } = ops[0] else {
        panic!("expected a partial write, got {ops:?}");
    };
    assert!(area >= 25 && area < 100 * 100);
}

#[test]
fn empty_damage_does_not_grow() {
    let mut f = Fixture::new();
    let s = f.surface();
    let buffer = f.shm_buffer(32, 32);
    f.commit_buffer(s, &buffer);
    assert_eq!(f.compositor.current(s).unwrap().damage().area(), 32 * 32);
    f.allocator.borrow_mut().take_ops();

    // 重新附加同一个缓冲区但不提交损伤：不上传，也没有损伤
    f.compositor.attach(s, Some(buffer.clone()));
    f.compositor.handle_commit(s);
    let current = f.compositor.current(s).unwrap();
    assert!(!current.has_damage());
    assert!(current.buffer_damage().is_empty());
    assert!(f.allocator.borrow().ops().is_empty());

    // 不附加的提交同样没有损伤
    f.compositor.handle_commit(s);
    assert!(!f.compositor.current(s).unwrap().has_damage());
}

#[test]
fn disabled_partial_upload_reimports() {
    let mut config = Config::default();
    config.debug.disable_partial_upload = true;
    let mut f = Fixture::with_config(config);
    let s = f.surface();
    let buffer = f.shm_buffer(16, 16);
    f.commit_buffer(s, &buffer);

    f.compositor.attach(s, Some(buffer.clone()));
    f.compositor.damage_buffer(s, rect(0, 0, 2, 2));
    f.compositor.handle_commit(s);

    let ops = f.allocator.borrow().ops().to_vec();
    assert_eq!(ops.len(), 2);
    assert!(ops
        .iter()
        .all(|op| matches!(op, AllocatorOp::Import { size: (16, 16), .. })));
    assert_eq!(f.compositor.current(s).unwrap().damage().area(), 16 * 16);
}

#[test]
fn surface_damage_is_scaled_into_buffer() {
    let mut f = Fixture::new();
    let s = f.surface();
    let buffer = f.shm_buffer(64, 64);
    f.compositor.set_buffer_scale(s, 2);
    f.commit_buffer(s, &buffer);

    f.compositor.attach(s, Some(buffer.clone()));
    f.compositor.damage(s, rect(4, 4, 2, 2));
    f.compositor.handle_commit(s);

    let current = f.compositor.current(s).unwrap();
    let expected: Region<Buffer> = Region::from_rect(rect(8, 8, 4, 4));
    assert!(current.buffer_damage().covers(&expected));
    assert!(current.damage().covers(&Region::from_rect(rect(4, 4, 2, 2))));
    assert!(current.damage().area() < 32 * 32);
}

#[test]
fn geometry_change_damages_everything() {
    let mut f = Fixture::new();
    let s = f.surface();
    let buffer = f.shm_buffer(40, 20);
    f.commit_buffer(s, &buffer);

    // 只改变换，不重新附加
    f.compositor.set_buffer_transform_wire(s, 1);
    f.compositor.handle_commit(s);

    let current = f.compositor.current(s).unwrap();
    assert_eq!(current.size(), Size::from((20, 40)));
    assert_eq!(current.damage().area(), 20 * 40);
    let changes = f.changes(s);
    assert!(changes[1].contains(SurfaceChanges::BUFFER_TRANSFORM | SurfaceChanges::SIZE));
}

#[test]
fn failed_import_drops_stale_texture() {
    let mut f = Fixture::new();
    f.allocator.borrow_mut().reject_format(ShmFormat::Rgb565);
    let s = f.surface();
    let buffer = f.shm_buffer(16, 16);
    f.commit_buffer(s, &buffer);
    assert_eq!(
        f.compositor.current(s).unwrap().texture_origin(),
        Some(TextureOrigin::Shm)
    );

    // 尺寸不同且导入失败：不能留着 16x16 的旧纹理
    let bad = BufferRef::new_shm(Size::from((32, 32)), ShmFormat::Rgb565);
    f.commit_buffer(s, &bad);

    let current = f.compositor.current(s).unwrap();
    assert!(current.is_mapped());
    assert!(current.texture().is_none());
    assert_eq!(current.texture_origin(), None);
    assert_eq!(current.buffer_size(), Size::from((32, 32)));
    assert_eq!(current.damage().area(), 32 * 32);
    assert!(bad.is_released());

    // 之后成功的导入重新创建纹理
    let good = f.shm_buffer(32, 32);
    f.commit_buffer(s, &good);
    assert!(f.compositor.current(s).unwrap().texture().is_some());
}

#[test]
fn single_pixel_buffer() {
    let mut f = Fixture::new();
    let s = f.surface();
    let pixel = BufferRef::new_single_pixel([u32::MAX, 0, 0, u32::MAX]);
    f.recorder.watch_buffer(&pixel);

    f.commit_buffer(s, &pixel);
    let current = f.compositor.current(s).unwrap();
    assert_eq!(current.size(), Size::from((1, 1)));
    assert_eq!(current.buffer_size(), Size::from((1, 1)));
    assert_eq!(current.texture_origin(), Some(TextureOrigin::SinglePixel));
    assert!(current.has_damage());
    assert!(pixel.is_released());
    let changes = f.changes(s);
    assert_eq!(changes.len(), 1);
    assert!(changes[0].contains(
        SurfaceChanges::MAPPING | SurfaceChanges::BUFFER_SIZE | SurfaceChanges::SIZE
    ));

    // 常见用法：用视口把一个像素拉伸成整块纯色
    f.compositor.set_viewport_destination(s, 200, 100);
    f.commit_buffer(s, &pixel);
    let current = f.compositor.current(s).unwrap();
    assert_eq!(current.size(), Size::from((200, 100)));
    assert_eq!(current.dst_size(), Some(Size::from((200, 100))));
    assert_eq!(current.damage().area(), 200 * 100);
    assert_eq!(current.buffer_size(), Size::from((1, 1)));
    assert!(pixel.is_released());
    let changes = f.changes(s);
    assert!(changes[0].contains(SurfaceChanges::SIZE));
    assert!(!changes[0].contains(SurfaceChanges::BUFFER_SIZE));

    // 纹理只创建一次
    let imports = f
        .allocator
        .borrow()
        .ops()
        .iter()
        .filter(|op| matches!(op, AllocatorOp::Import { size: (1, 1), .. }))
        .count();
    assert_eq!(imports, 1);
}

#[test]
fn viewport_source_and_destination() {
    let mut f = Fixture::new();
    let s = f.surface();
    let buffer = f.shm_buffer(100, 80);
    f.compositor.set_buffer_scale(s, 2);

    f.compositor.set_viewport_source(s, 10., 10., 20., 16.);
    f.commit_buffer(s, &buffer);
    let current = f.compositor.current(s).unwrap();
    assert_eq!(current.size(), Size::from((20, 16)));
    let src = current.src_rect();
    assert_abs_diff_eq!(src.loc.x, 10.);
    assert_abs_diff_eq!(src.loc.y, 10.);
    assert_abs_diff_eq!(src.size.w, 20.);
    assert_abs_diff_eq!(src.size.h, 16.);

    f.compositor.set_viewport_destination(s, 30, 30);
    f.compositor.handle_commit(s);
    let current = f.compositor.current(s).unwrap();
    assert_eq!(current.size(), Size::from((30, 30)));
    assert_eq!(current.dst_size(), Some(Size::from((30, 30))));

    f.compositor.destroy_viewport(s);
    f.compositor.handle_commit(s);
    let current = f.compositor.current(s).unwrap();
    assert_eq!(current.size(), Size::from((50, 40)));
    assert_abs_diff_eq!(current.src_rect().size.w, 50.);
    assert_abs_diff_eq!(current.src_rect().size.h, 40.);
}

#[test]
fn fractional_source_without_destination_is_rejected() {
    let mut f = Fixture::new();
    let s = f.surface();
    let buffer = f.shm_buffer(20, 20);
    f.commit_buffer(s, &buffer);
    f.events();

    f.compositor.set_viewport_source(s, 0., 0., 10.5, 10.);
    f.compositor.handle_commit(s);

    let events = f.events();
    assert!(events.contains(&Event::ProtocolError(
        f.client,
        s,
        ProtocolError::Viewport(ViewportError::BadSize)
    )));
    assert!(!events.iter().any(|e| matches!(e, Event::Changed(..))));
}

#[test]
fn fractional_source_with_destination_is_fine() {
    let mut f = Fixture::new();
    let s = f.surface();
    let buffer = f.shm_buffer(20, 20);

    f.compositor.set_viewport_source(s, 0., 0., 10.5, 10.);
    f.compositor.set_viewport_destination(s, 21, 20);
    f.commit_buffer(s, &buffer);

    assert_eq!(f.compositor.current(s).unwrap().size(), Size::from((21, 20)));
}

#[test]
fn bad_viewport_values() {
    let cases: [(Option<[f64; 4]>, Option<(i32, i32)>, ViewportError); 4] = [
        (None, Some((0, 10)), ViewportError::BadValue),
        (Some([-1.5, 0., 4., 4.]), None, ViewportError::BadValue),
        (Some([0., 0., 0., 4.]), None, ViewportError::BadValue),
        (Some([0., 0., 30., 10.]), None, ViewportError::OutOfBuffer),
    ];

    for (source, destination, expected) in cases {
        let mut f = Fixture::new();
        let s = f.surface();
        let buffer = f.shm_buffer(20, 20);
        f.compositor.set_viewport(s);
        if let Some([x, y, w, h]) = source {
            f.compositor.set_viewport_source(s, x, y, w, h);
        }
        if let Some((w, h)) = destination {
            f.compositor.set_viewport_destination(s, w, h);
        }
        f.commit_buffer(s, &buffer);

        assert!(
            f.events()
                .contains(&Event::ProtocolError(f.client, s, expected.into())),
            "expected {expected:?} for {source:?} {destination:?}"
        );
    }
}

#[test]
fn regions_are_clipped_to_surface() {
    let mut f = Fixture::new();
    let s = f.surface();
    let buffer = f.shm_buffer(20, 20);

    f.compositor
        .set_opaque_region(s, Some(Region::from_rect(rect(10, 10, 50, 50))));
    f.compositor
        .set_input_region(s, Some(Region::from_rect(rect(-5, -5, 10, 10))));
    f.commit_buffer(s, &buffer);

    let current = f.compositor.current(s).unwrap();
    let opaque: Region<Logical> = Region::from_rect(rect(10, 10, 10, 10));
    let input: Region<Logical> = Region::from_rect(rect(0, 0, 5, 5));
    assert_eq!(current.opaque_region().area(), opaque.area());
    assert!(current.opaque_region().covers(&opaque));
    assert_eq!(current.input_region().area(), input.area());

    let changes = f.changes(s);
    assert!(changes[0].contains(SurfaceChanges::OPAQUE_REGION | SurfaceChanges::INPUT_REGION));
}

#[test]
fn pointer_constraint_region() {
    use crate::compositor::ConstraintMode;

    let mut f = Fixture::new();
    let s = f.surface();
    let buffer = f.shm_buffer(20, 20);
    f.commit_buffer(s, &buffer);
    f.events();

    f.compositor.set_pointer_constraint(
        s,
        ConstraintMode::Confined,
        Some(Region::from_rect(rect(15, 15, 10, 10))),
    );
    f.compositor.handle_commit(s);

    let current = f.compositor.current(s).unwrap();
    assert_eq!(current.pointer_constraint_mode(), ConstraintMode::Confined);
    assert_eq!(current.constraint_region().area(), 25);
    let changes = f.changes(s);
    assert_eq!(
        changes,
        vec![SurfaceChanges::POINTER_CONSTRAINT_MODE | SurfaceChanges::POINTER_CONSTRAINT_REGION]
    );
}

fn viewport_case() -> impl Strategy<Value = (i32, i32, i32, [i32; 4], Option<(i32, i32)>)> {
    (1..=4i32, 1..=64i32, 1..=64i32).prop_flat_map(|(scale, w, h)| {
        let (bw, bh) = (w * scale, h * scale);
        let source = (0..w, 0..h).prop_flat_map(move |(x, y)| {
            (Just(x), Just(y), 1..=w - x, 1..=h - y).prop_map(|(x, y, w, h)| [x, y, w, h])
        });
        let destination = prop::option::of((1..=128i32, 1..=128i32));
        (Just(scale), Just(bw), Just(bh), source, destination)
    })
}

proptest! {
    #[test]
    fn viewport_size_round_trip((scale, bw, bh, source, destination) in viewport_case()) {
        let mut f = Fixture::new();
        let s = f.surface();
        let buffer = f.shm_buffer(bw, bh);
        f.compositor.set_buffer_scale(s, scale);

        let [x, y, w, h] = source.map(f64::from);
        f.compositor.set_viewport_source(s, x, y, w, h);
        if let Some((dw, dh)) = destination {
            f.compositor.set_viewport_destination(s, dw, dh);
        }
        f.commit_buffer(s, &buffer);

        let expected = destination.unwrap_or((source[2], source[3]));
        prop_assert_eq!(f.compositor.current(s).unwrap().size(), Size::from(expected));

        // 去掉视口后回到缓冲区尺寸除以缩放
        f.compositor.destroy_viewport(s);
        f.compositor.handle_commit(s);
        prop_assert_eq!(
            f.compositor.current(s).unwrap().size(),
            Size::from((bw / scale, bh / scale))
        );
    }
}
