//! 纹理（可渲染图像）与图像分配器接口。
//!
//! 缓冲区导入适配器只通过 `TextureAllocator` 创建与更新图像；GPU 缓冲区
//! 自带预先导入好的纹理，不经过分配器。`MemoryAllocator` 是一个把像素
//! 复制到内存里的实现，供回放工具和测试使用。

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use smithay::utils::{Buffer, Size};

use crate::buffer::ShmFormat;
use crate::sync::SyncFile;
use crate::utils::region::Region;

pub trait Texture: fmt::Debug {
    /// 纹理像素尺寸（未变换）
    fn size(&self) -> Size<i32, Buffer>;

    /// 以隐式同步的方式添加写入依赖：渲染前必须等到该同步文件就绪
    fn add_acquire_fence(&self, fence: SyncFile) {
        let _ = fence;
    }
}

pub type TextureRef = Rc<dyn Texture>;

pub trait TextureAllocator {
    fn supports_format(&self, format: ShmFormat) -> bool;

    /// 用完整像素内容创建新纹理
    fn import_pixels(
        &mut self,
        format: ShmFormat,
        pixels: &[u8],
        stride: i32,
        size: Size<i32, Buffer>,
    ) -> Option<TextureRef>;

    /// 只把 `region` 内的像素写入已有纹理
    fn write_region(
        &mut self,
        texture: &TextureRef,
        region: &Region<Buffer>,
        pixels: &[u8],
        stride: i32,
    ) -> bool;
}

/// 共享持有的分配器（回放工具和测试需要在合成器之外查看它）
impl<A: TextureAllocator> TextureAllocator for Rc<RefCell<A>> {
    fn supports_format(&self, format: ShmFormat) -> bool {
        self.borrow().supports_format(format)
    }

    fn import_pixels(
        &mut self,
        format: ShmFormat,
        pixels: &[u8],
        stride: i32,
        size: Size<i32, Buffer>,
    ) -> Option<TextureRef> {
        self.borrow_mut().import_pixels(format, pixels, stride, size)
    }

    fn write_region(
        &mut self,
        texture: &TextureRef,
        region: &Region<Buffer>,
        pixels: &[u8],
        stride: i32,
    ) -> bool {
        self.borrow_mut().write_region(texture, region, pixels, stride)
    }
}

/// 内存纹理：以紧凑行布局保存像素副本
#[derive(Debug)]
pub struct MemoryTexture {
    id: u64,
    format: ShmFormat,
    size: Size<i32, Buffer>,
    pixels: RefCell<Vec<u8>>,
    fences: RefCell<Vec<SyncFile>>,
}

impl MemoryTexture {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn format(&self) -> ShmFormat {
        self.format
    }

    /// 读取 (x, y) 处像素的字节
    pub fn pixel(&self, x: i32, y: i32) -> Option<Vec<u8>> {
        if x < 0 || y < 0 || x >= self.size.w || y >= self.size.h {
            return None;
        }
        let bpp = self.format.bytes_per_pixel();
        let offset = (y as usize * self.size.w as usize + x as usize) * bpp;
        Some(self.pixels.borrow()[offset..offset + bpp].to_vec())
    }

    pub fn acquire_fences(&self) -> Vec<SyncFile> {
        self.fences.borrow().clone()
    }
}

impl Texture for MemoryTexture {
    fn size(&self) -> Size<i32, Buffer> {
        self.size
    }

    fn add_acquire_fence(&self, fence: SyncFile) {
        self.fences.borrow_mut().push(fence);
    }
}

/// 分配器的一次操作记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllocatorOp {
    Import { texture: u64, size: (i32, i32) },
    Write { texture: u64, area: i64 },
}

#[derive(Debug, Default)]
pub struct MemoryAllocator {
    next_id: u64,
    /// 只记录仍被外部持有的纹理，不延长它们的生命周期
    textures: Vec<Weak<MemoryTexture>>,
    ops: Vec<AllocatorOp>,
    unsupported: Vec<ShmFormat>,
}

impl MemoryAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// 让某种格式导入失败，用于测试错误路径
    pub fn reject_format(&mut self, format: ShmFormat) {
        self.unsupported.push(format);
    }

    pub fn ops(&self) -> &[AllocatorOp] {
        &self.ops
    }

    pub fn take_ops(&mut self) -> Vec<AllocatorOp> {
        std::mem::take(&mut self.ops)
    }

    pub fn texture(&self, id: u64) -> Option<Rc<MemoryTexture>> {
        self.live().find(|t| t.id == id)
    }

    /// 仍然存活的纹理数
    pub fn live_textures(&self) -> usize {
        self.live().count()
    }

    fn live(&self) -> impl Iterator<Item = Rc<MemoryTexture>> + '_ {
        self.textures.iter().filter_map(Weak::upgrade)
    }

    fn find(&self, texture: &TextureRef) -> Option<Rc<MemoryTexture>> {
        let ptr = Rc::as_ptr(texture) as *const ();
        self.live().find(|t| Rc::as_ptr(t) as *const () == ptr)
    }
}

fn copy_rows(
    dst: &mut [u8],
    dst_width: i32,
    src: &[u8],
    stride: i32,
    bpp: usize,
    (x, y, w, h): (i32, i32, i32, i32),
) -> bool {
    for row in y..y + h {
        let src_start = row as usize * stride as usize + x as usize * bpp;
        let dst_start = (row as usize * dst_width as usize + x as usize) * bpp;
        let len = w as usize * bpp;
        let (Some(src_row), Some(dst_row)) = (
            src.get(src_start..src_start + len),
            dst.get_mut(dst_start..dst_start + len),
        ) else {
            return false;
        };
        dst_row.copy_from_slice(src_row);
    }
    true
}

impl TextureAllocator for MemoryAllocator {
    fn supports_format(&self, format: ShmFormat) -> bool {
        !self.unsupported.contains(&format)
    }

    fn import_pixels(
        &mut self,
        format: ShmFormat,
        pixels: &[u8],
        stride: i32,
        size: Size<i32, Buffer>,
    ) -> Option<TextureRef> {
        if !self.supports_format(format) || size.w <= 0 || size.h <= 0 {
            return None;
        }

        let bpp = format.bytes_per_pixel();
        let mut data = vec![0; size.w as usize * size.h as usize * bpp];
        if !copy_rows(&mut data, size.w, pixels, stride, bpp, (0, 0, size.w, size.h)) {
            warn!("shm pixels are shorter than {}x{} at stride {stride}", size.w, size.h);
            return None;
        }

        self.next_id += 1;
        let texture = Rc::new(MemoryTexture {
            id: self.next_id,
            format,
            size,
            pixels: RefCell::new(data),
            fences: RefCell::new(Vec::new()),
        });
        self.ops.push(AllocatorOp::Import {
            texture: texture.id,
            size: (size.w, size.h),
        });
        self.textures.retain(|t| t.strong_count() > 0);
        self.textures.push(Rc::downgrade(&texture));
        Some(texture)
    }

    fn write_region(
        &mut self,
        texture: &TextureRef,
        region: &Region<Buffer>,
        pixels: &[u8],
        stride: i32,
    ) -> bool {
        let Some(texture) = self.find(texture) else {
            return false;
        };

        let bpp = texture.format.bytes_per_pixel();
        let mut data = texture.pixels.borrow_mut();
        for rect in region.rects() {
            let r = (rect.loc.x, rect.loc.y, rect.size.w, rect.size.h);
            if !copy_rows(&mut data, texture.size.w, pixels, stride, bpp, r) {
                return false;
            }
        }

        self.ops.push(AllocatorOp::Write {
            texture: texture.id,
            area: region.area(),
        });
        true
    }
}
