//! 客户端缓冲区（wl_buffer）。
//!
//! 三种受支持的内容：共享内存、GPU 缓冲区（dmabuf，自带预先导入的纹理）、
//! 单像素缓冲区。其余类型在应用提交时按协议错误处理。
//!
//! 缓冲区在每次附加后最多释放一次：共享内存与单像素缓冲区在导入后立即
//! 释放，GPU 缓冲区要等到被另一个缓冲区替换才释放。

use std::cell::{Cell, Ref, RefCell};
use std::fmt;
use std::rc::Rc;

use serde::Deserialize;
use smithay::utils::{Buffer, Size};

use crate::compositor::SurfaceId;
use crate::texture::{TextureAllocator, TextureRef};
use crate::utils::id::typed_id;

pub mod damage;
pub(crate) mod import;

typed_id! {
    pub struct BufferId;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ShmFormat {
    Argb8888,
    Xrgb8888,
    Abgr8888,
    Xbgr8888,
    Rgb565,
}

impl ShmFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            ShmFormat::Rgb565 => 2,
            _ => 4,
        }
    }
}

/// 共享内存池中的一块像素
pub struct ShmBuffer {
    pub size: Size<i32, Buffer>,
    pub stride: i32,
    pub format: ShmFormat,
    pool: Rc<RefCell<Vec<u8>>>,
    offset: usize,
}

impl ShmBuffer {
    /// 客户端写入像素（回放工具与测试用）
    pub fn write(&self, f: impl FnOnce(&mut [u8])) {
        let mut pool = self.pool.borrow_mut();
        let len = self.stride.max(0) as usize * self.size.h.max(0) as usize;
        let end = (self.offset + len).min(pool.len());
        f(&mut pool[self.offset.min(end)..end]);
    }
}

pub struct DmabufBuffer {
    pub size: Size<i32, Buffer>,
    pub texture: TextureRef,
}

pub struct SinglePixelBuffer {
    /// 预乘的 RGBA，每个分量为 32 位
    pub rgba: [u32; 4],
    texture: RefCell<Option<TextureRef>>,
}

impl SinglePixelBuffer {
    /// 按 ARGB8888 小端字节序的一个像素
    fn argb8888(&self) -> [u8; 4] {
        let [r, g, b, a] = self.rgba.map(|c| (c >> 24) as u8);
        [b, g, r, a]
    }

    /// 纹理只创建一次，之后重复使用
    pub(crate) fn texture(&self, allocator: &mut dyn TextureAllocator) -> Option<TextureRef> {
        if let Some(texture) = &*self.texture.borrow() {
            return Some(texture.clone());
        }

        let pixel = self.argb8888();
        let texture =
            allocator.import_pixels(ShmFormat::Argb8888, &pixel, 4, Size::from((1, 1)))?;
        *self.texture.borrow_mut() = Some(texture.clone());
        Some(texture)
    }
}

pub enum BufferContent {
    Shm(ShmBuffer),
    Dmabuf(DmabufBuffer),
    SinglePixel(SinglePixelBuffer),
    /// 不认识的缓冲区类型，附带接口名
    Unknown(String),
}

impl BufferContent {
    fn kind(&self) -> &str {
        match self {
            BufferContent::Shm(_) => "shm",
            BufferContent::Dmabuf(_) => "dmabuf",
            BufferContent::SinglePixel(_) => "single-pixel",
            BufferContent::Unknown(name) => name,
        }
    }
}

type ReleaseListener = Box<dyn FnMut(BufferId)>;

struct BufferInner {
    id: BufferId,
    content: BufferContent,
    surface: Cell<Option<SurfaceId>>,
    released: Cell<bool>,
    release_count: Cell<u32>,
    reading: Cell<bool>,
    on_release: RefCell<Option<ReleaseListener>>,
}

#[derive(Clone)]
pub struct BufferRef(Rc<BufferInner>);

/// 共享内存读取访问，丢弃时结束访问
pub struct ShmAccess<'a> {
    buffer: &'a BufferInner,
    pixels: Ref<'a, Vec<u8>>,
    range: std::ops::Range<usize>,
}

impl ShmAccess<'_> {
    pub fn pixels(&self) -> &[u8] {
        &self.pixels[self.range.clone()]
    }
}

impl Drop for ShmAccess<'_> {
    fn drop(&mut self) {
        self.buffer.reading.set(false);
    }
}

impl BufferRef {
    fn from_content(content: BufferContent) -> Self {
        Self(Rc::new(BufferInner {
            id: BufferId::next(),
            content,
            surface: Cell::new(None),
            released: Cell::new(false),
            release_count: Cell::new(0),
            reading: Cell::new(false),
            on_release: RefCell::new(None),
        }))
    }

    /// 在一个新的共享内存池里创建缓冲区，像素初始为 0
    pub fn new_shm(size: Size<i32, Buffer>, format: ShmFormat) -> Self {
        let stride = size.w.max(0) * format.bytes_per_pixel() as i32;
        let pool = Rc::new(RefCell::new(vec![0; stride as usize * size.h.max(0) as usize]));
        Self::new_shm_in_pool(pool, 0, size, stride, format)
    }

    pub fn new_shm_in_pool(
        pool: Rc<RefCell<Vec<u8>>>,
        offset: usize,
        size: Size<i32, Buffer>,
        stride: i32,
        format: ShmFormat,
    ) -> Self {
        Self::from_content(BufferContent::Shm(ShmBuffer {
            size,
            stride,
            format,
            pool,
            offset,
        }))
    }

    pub fn new_dmabuf(size: Size<i32, Buffer>, texture: TextureRef) -> Self {
        Self::from_content(BufferContent::Dmabuf(DmabufBuffer { size, texture }))
    }

    pub fn new_single_pixel(rgba: [u32; 4]) -> Self {
        Self::from_content(BufferContent::SinglePixel(SinglePixelBuffer {
            rgba,
            texture: RefCell::new(None),
        }))
    }

    pub fn new_unknown(interface: impl Into<String>) -> Self {
        Self::from_content(BufferContent::Unknown(interface.into()))
    }

    pub fn id(&self) -> BufferId {
        self.0.id
    }

    pub fn content(&self) -> &BufferContent {
        &self.0.content
    }

    pub fn is_dmabuf(&self) -> bool {
        matches!(self.0.content, BufferContent::Dmabuf(_))
    }

    pub fn ptr_eq(&self, other: &BufferRef) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// 缓冲区最后一次被提交到的表面
    pub fn surface(&self) -> Option<SurfaceId> {
        self.0.surface.get()
    }

    pub(crate) fn set_surface(&self, surface: SurfaceId) {
        self.0.surface.set(Some(surface));
    }

    /// 重新附加后可以再次释放
    pub(crate) fn mark_attached(&self) {
        self.0.released.set(false);
    }

    /// 发送 wl_buffer.release；重复调用无效
    pub fn release(&self) {
        if self.0.released.replace(true) {
            return;
        }
        self.0.release_count.set(self.0.release_count.get() + 1);
        trace!(buffer = ?self.0.id, kind = self.0.content.kind(), "releasing buffer");

        if let Some(listener) = &mut *self.0.on_release.borrow_mut() {
            listener(self.0.id);
        }
    }

    pub fn is_released(&self) -> bool {
        self.0.released.get()
    }

    pub fn release_count(&self) -> u32 {
        self.0.release_count.get()
    }

    pub fn on_release(&self, listener: impl FnMut(BufferId) + 'static) {
        *self.0.on_release.borrow_mut() = Some(Box::new(listener));
    }

    /// 是否有未结束的共享内存读取
    pub fn is_being_read(&self) -> bool {
        self.0.reading.get()
    }

    /// 开始读取共享内存像素；非共享内存缓冲区或池太小时返回 None
    pub fn shm_access(&self) -> Option<ShmAccess<'_>> {
        let BufferContent::Shm(shm) = &self.0.content else {
            return None;
        };

        let pixels = shm.pool.borrow();
        let len = shm.stride.max(0) as usize * shm.size.h.max(0) as usize;
        let range = shm.offset..shm.offset + len;
        if range.end > pixels.len() {
            warn!(buffer = ?self.0.id, "shm buffer extends past the end of its pool");
            return None;
        }

        self.0.reading.set(true);
        Some(ShmAccess {
            buffer: &self.0,
            pixels,
            range,
        })
    }

    /// 未经变换的像素尺寸；未知类型返回 None
    pub fn dimensions(&self) -> Option<Size<i32, Buffer>> {
        match &self.0.content {
            BufferContent::Shm(shm) => Some(shm.size),
            BufferContent::Dmabuf(dmabuf) => Some(dmabuf.size),
            BufferContent::SinglePixel(_) => Some(Size::from((1, 1))),
            BufferContent::Unknown(_) => None,
        }
    }
}

impl fmt::Debug for BufferRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferRef")
            .field("id", &self.0.id)
            .field("kind", &self.0.content.kind())
            .field("released", &self.0.released.get())
            .finish()
    }
}
