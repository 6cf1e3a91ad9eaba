use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use calloop::channel::Event as ChannelEvent;
use calloop::EventLoop;
use smithay::utils::{Buffer, Point, Rectangle, Size};

use crate::buffer::{BufferContent, BufferRef, ShmFormat};
use crate::compositor::{ClientId, Compositor, SurfaceChanges, SurfaceId};
use crate::config::Config;
use crate::replay::{Event, Recorder};
use crate::texture::{MemoryAllocator, TextureAllocator};

mod commit;
mod damage;

/// 测试夹具：一个合成器，外加记录事件的处理器和可以检查的内存分配器
pub struct Fixture {
    pub event_loop: EventLoop<'static, Compositor>,
    pub compositor: Compositor,
    pub recorder: Recorder,
    pub allocator: Rc<RefCell<MemoryAllocator>>,
    pub client: ClientId,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        let event_loop = EventLoop::try_new().unwrap();
        let recorder = Recorder::default();
        let allocator = Rc::new(RefCell::new(MemoryAllocator::new()));
        let (compositor, channel) = Compositor::new(
            Box::new(recorder.clone()),
            Box::new(allocator.clone()),
            config,
        );

        event_loop
            .handle()
            .insert_source(channel, |event, _, compositor: &mut Compositor| {
                if let ChannelEvent::Msg(signal) = event {
                    compositor.fence_signaled(signal);
                }
            })
            .unwrap();

        Self {
            event_loop,
            compositor,
            recorder,
            allocator,
            client: ClientId::next(),
        }
    }

    pub fn dispatch(&mut self) {
        self.event_loop
            .dispatch(Some(Duration::ZERO), &mut self.compositor)
            .unwrap();
    }

    pub fn surface(&mut self) -> SurfaceId {
        self.compositor.create_surface(self.client)
    }

    pub fn shm_buffer(&self, w: i32, h: i32) -> BufferRef {
        let buffer = BufferRef::new_shm(Size::from((w, h)), ShmFormat::Argb8888);
        if let BufferContent::Shm(shm) = buffer.content() {
            shm.write(|pixels| pixels.fill(0xff));
        }
        self.recorder.watch_buffer(&buffer);
        buffer
    }

    pub fn dmabuf(&self, w: i32, h: i32) -> BufferRef {
        let size: Size<i32, Buffer> = Size::from((w, h));
        let pixels = vec![0; (w * h * 4) as usize];
        let texture = self
            .allocator
            .borrow_mut()
            .import_pixels(ShmFormat::Argb8888, &pixels, w * 4, size)
            .unwrap();
        let buffer = BufferRef::new_dmabuf(size, texture);
        self.recorder.watch_buffer(&buffer);
        buffer
    }

    /// 附加缓冲区、整体损伤并提交
    pub fn commit_buffer(&mut self, surface: SurfaceId, buffer: &BufferRef) {
        let size = buffer.dimensions().unwrap();
        self.compositor.attach(surface, Some(buffer.clone()));
        self.compositor
            .damage_buffer(surface, Rectangle::new(Point::from((0, 0)), size));
        self.compositor.handle_commit(surface);
    }

    pub fn events(&self) -> Vec<Event> {
        self.recorder.take()
    }

    /// 取出事件中某个表面的所有变化通知
    pub fn changes(&self, surface: SurfaceId) -> Vec<SurfaceChanges> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Changed(id, changes) if id == surface => Some(changes),
                _ => None,
            })
            .collect()
    }
}
