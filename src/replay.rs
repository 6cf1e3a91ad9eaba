//! 提交脚本回放。
//!
//! 读入一个 JSON 脚本（一串请求），在内存分配器与软件时间线上驱动
//! `Compositor`，每个可观察的事件输出一行记录。栅栏信号和真实合成器
//! 一样经过 calloop 事件循环送回。

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use calloop::channel::Event as ChannelEvent;
use calloop::EventLoop;
use serde::Deserialize;
use smithay::utils::{Buffer, Logical, Point, Rectangle, Size};

use crate::buffer::{BufferContent, BufferId, BufferRef, ShmFormat};
use crate::compositor::{
    CallbackId, ClientId, CommitLock, Compositor, CompositorHandler, ConstraintMode, ContentType,
    FeedbackId, Placement, PresentationHint, SurfaceChanges, SurfaceId,
};
use crate::config::Config;
use crate::error::ProtocolError;
use crate::sync::{SoftTimeline, Timeline, TimelinePoint};
use crate::texture::{MemoryAllocator, TextureAllocator};
use crate::utils::region::Region;

/// 合成器向外发出的事件
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Changed(SurfaceId, SurfaceChanges),
    Placed(SurfaceId, Placement),
    FrameDone(CallbackId),
    Presented(FeedbackId),
    Discarded(FeedbackId),
    Destroyed(SurfaceId),
    ProtocolError(ClientId, SurfaceId, ProtocolError),
    OutOfMemory(ClientId),
    BufferReleased(BufferId),
}

/// 把事件按顺序记下来的 `CompositorHandler`
#[derive(Debug, Clone, Default)]
pub struct Recorder {
    events: Rc<RefCell<Vec<Event>>>,
}

impl Recorder {
    pub fn push(&self, event: Event) {
        self.events.borrow_mut().push(event);
    }

    pub fn take(&self) -> Vec<Event> {
        std::mem::take(&mut *self.events.borrow_mut())
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.borrow().clone()
    }

    /// 让缓冲区释放也进入事件流
    pub fn watch_buffer(&self, buffer: &BufferRef) {
        let recorder = self.clone();
        buffer.on_release(move |id| recorder.push(Event::BufferReleased(id)));
    }
}

impl CompositorHandler for Recorder {
    fn surface_changed(&mut self, surface: SurfaceId, changes: SurfaceChanges) {
        self.push(Event::Changed(surface, changes));
    }

    fn subsurface_placed(&mut self, surface: SurfaceId, placement: Placement) {
        self.push(Event::Placed(surface, placement));
    }

    fn frame_done(&mut self, callback: CallbackId, _time: Duration) {
        self.push(Event::FrameDone(callback));
    }

    fn feedback_presented(&mut self, feedback: FeedbackId, _time: Duration) {
        self.push(Event::Presented(feedback));
    }

    fn feedback_discarded(&mut self, feedback: FeedbackId) {
        self.push(Event::Discarded(feedback));
    }

    fn surface_destroyed(&mut self, surface: SurfaceId) {
        self.push(Event::Destroyed(surface));
    }

    fn protocol_error(&mut self, client: ClientId, surface: SurfaceId, error: ProtocolError) {
        self.push(Event::ProtocolError(client, surface, error));
    }

    fn out_of_memory(&mut self, client: ClientId) {
        self.push(Event::OutOfMemory(client));
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Script {
    pub steps: Vec<Step>,
}

fn default_format() -> ShmFormat {
    ShmFormat::Argb8888
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum Step {
    CreateSurface {
        name: String,
        #[serde(default)]
        client: u32,
    },
    CreateSubsurface {
        name: String,
        parent: String,
        #[serde(default)]
        client: u32,
    },
    ShmBuffer {
        name: String,
        width: i32,
        height: i32,
        #[serde(default = "default_format")]
        format: ShmFormat,
        #[serde(default)]
        fill: u8,
    },
    SinglePixel {
        name: String,
        rgba: [u32; 4],
    },
    Dmabuf {
        name: String,
        width: i32,
        height: i32,
    },
    UnknownBuffer {
        name: String,
    },
    Attach {
        surface: String,
        buffer: Option<String>,
    },
    Damage {
        surface: String,
        rect: [i32; 4],
    },
    DamageBuffer {
        surface: String,
        rect: [i32; 4],
    },
    Scale {
        surface: String,
        scale: i32,
    },
    Transform {
        surface: String,
        transform: u32,
    },
    Viewport {
        surface: String,
        source: Option<[f64; 4]>,
        destination: Option<[i32; 2]>,
    },
    DestroyViewport {
        surface: String,
    },
    InputRegion {
        surface: String,
        rects: Option<Vec<[i32; 4]>>,
    },
    OpaqueRegion {
        surface: String,
        rects: Option<Vec<[i32; 4]>>,
    },
    ContentType {
        surface: String,
        value: ContentType,
    },
    Tearing {
        surface: String,
        hint: PresentationHint,
    },
    Constraint {
        surface: String,
        mode: ConstraintMode,
        rects: Option<Vec<[i32; 4]>>,
    },
    Frame {
        surface: String,
        name: String,
    },
    Feedback {
        surface: String,
        name: String,
    },
    Present {
        surface: String,
        time: u64,
    },
    FrameDone {
        surface: String,
        time: u64,
    },
    Lock {
        surface: String,
        name: String,
    },
    Unlock {
        name: String,
    },
    /// 直接丢弃锁，解锁推迟到下一个入口
    DropLock {
        name: String,
    },
    Commit {
        surface: String,
    },
    Timeline {
        name: String,
    },
    ExplicitSync {
        surface: String,
        enabled: bool,
    },
    Acquire {
        surface: String,
        timeline: String,
        point: u64,
    },
    Release {
        surface: String,
        timeline: String,
        point: u64,
    },
    Signal {
        timeline: String,
        point: u64,
    },
    PlaceAbove {
        surface: String,
        sibling: String,
    },
    PlaceBelow {
        surface: String,
        sibling: String,
    },
    Sync {
        surface: String,
        sync: bool,
    },
    Position {
        surface: String,
        x: i32,
        y: i32,
    },
    Destroy {
        surface: String,
    },
    /// 输出表面当前状态的摘要
    Dump {
        surface: String,
    },
    Disconnect {
        client: u32,
    },
}

impl Script {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text =
            std::fs::read_to_string(path).with_context(|| format!("error reading {path:?}"))?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> anyhow::Result<Self> {
        serde_json::from_str(text).context("error parsing script")
    }
}

fn rect<Kind>([x, y, w, h]: [i32; 4]) -> Rectangle<i32, Kind> {
    Rectangle::new(Point::from((x, y)), Size::from((w, h)))
}

fn region(rects: Option<Vec<[i32; 4]>>) -> Option<Region<Logical>> {
    rects.map(|rects| Region::from_rects(rects.into_iter().map(rect)))
}

struct ReplayState {
    compositor: Compositor,
    recorder: Recorder,
    allocator: Rc<RefCell<MemoryAllocator>>,
    clients: HashMap<u32, ClientId>,
    surfaces: HashMap<String, SurfaceId>,
    surface_names: HashMap<SurfaceId, String>,
    buffers: HashMap<String, BufferRef>,
    buffer_names: HashMap<BufferId, String>,
    timelines: HashMap<String, Rc<SoftTimeline>>,
    locks: HashMap<String, CommitLock>,
    callback_names: HashMap<CallbackId, String>,
    feedback_names: HashMap<FeedbackId, String>,
    transcript: Vec<String>,
}

impl ReplayState {
    fn client(&mut self, index: u32) -> ClientId {
        *self.clients.entry(index).or_insert_with(ClientId::next)
    }

    fn client_index(&self, client: ClientId) -> u32 {
        self.clients
            .iter()
            .find_map(|(index, id)| (*id == client).then_some(*index))
            .unwrap_or(u32::MAX)
    }

    fn surface(&self, name: &str) -> anyhow::Result<SurfaceId> {
        self.surfaces
            .get(name)
            .copied()
            .ok_or_else(|| anyhow!("unknown surface {name:?}"))
    }

    fn buffer(&self, name: &str) -> anyhow::Result<BufferRef> {
        self.buffers
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow!("unknown buffer {name:?}"))
    }

    fn timeline(&self, name: &str) -> anyhow::Result<Rc<SoftTimeline>> {
        self.timelines
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow!("unknown timeline {name:?}"))
    }

    fn add_surface(&mut self, name: String, id: SurfaceId) {
        self.surface_names.insert(id, name.clone());
        self.surfaces.insert(name, id);
    }

    fn add_buffer(&mut self, name: String, buffer: BufferRef) {
        self.recorder.watch_buffer(&buffer);
        self.buffer_names.insert(buffer.id(), name.clone());
        self.buffers.insert(name, buffer);
    }

    fn timeline_point(&self, timeline: &str, point: u64) -> anyhow::Result<TimelinePoint> {
        let timeline: Rc<dyn Timeline> = self.timeline(timeline)?;
        Ok(TimelinePoint::new(timeline, point))
    }

    fn step(&mut self, step: Step) -> anyhow::Result<()> {
        match step {
            Step::CreateSurface { name, client } => {
                let client = self.client(client);
                let id = self.compositor.create_surface(client);
                self.add_surface(name, id);
            }
            Step::CreateSubsurface {
                name,
                parent,
                client,
            } => {
                let parent = self.surface(&parent)?;
                let client = self.client(client);
                let id = self.compositor.create_surface(client);
                self.compositor.create_subsurface(id, parent)?;
                self.add_surface(name, id);
            }
            Step::ShmBuffer {
                name,
                width,
                height,
                format,
                fill,
            } => {
                let buffer = BufferRef::new_shm(Size::from((width, height)), format);
                if let BufferContent::Shm(shm) = buffer.content() {
                    shm.write(|pixels| pixels.fill(fill));
                }
                self.add_buffer(name, buffer);
            }
            Step::SinglePixel { name, rgba } => {
                self.add_buffer(name, BufferRef::new_single_pixel(rgba));
            }
            Step::Dmabuf {
                name,
                width,
                height,
            } => {
                let size: Size<i32, Buffer> = Size::from((width, height));
                let pixels = vec![0; width.max(0) as usize * height.max(0) as usize * 4];
                let texture = self
                    .allocator
                    .import_pixels(ShmFormat::Argb8888, &pixels, width * 4, size)
                    .ok_or_else(|| anyhow!("error allocating dmabuf {name:?}"))?;
                self.add_buffer(name, BufferRef::new_dmabuf(size, texture));
            }
            Step::UnknownBuffer { name } => {
                self.add_buffer(name.clone(), BufferRef::new_unknown(name));
            }
            Step::Attach { surface, buffer } => {
                let surface = self.surface(&surface)?;
                let buffer = buffer.map(|name| self.buffer(&name)).transpose()?;
                self.compositor.attach(surface, buffer);
            }
            Step::Damage { surface, rect: r } => {
                let id = self.surface(&surface)?;
                self.compositor.damage(id, rect(r));
            }
            Step::DamageBuffer { surface, rect: r } => {
                let id = self.surface(&surface)?;
                self.compositor.damage_buffer(id, rect(r));
            }
            Step::Scale { surface, scale } => {
                let id = self.surface(&surface)?;
                self.compositor.set_buffer_scale(id, scale);
            }
            Step::Transform { surface, transform } => {
                let id = self.surface(&surface)?;
                self.compositor.set_buffer_transform_wire(id, transform);
            }
            Step::Viewport {
                surface,
                source,
                destination,
            } => {
                let surface = self.surface(&surface)?;
                self.compositor.set_viewport(surface);
                if let Some([x, y, w, h]) = source {
                    self.compositor.set_viewport_source(surface, x, y, w, h);
                }
                if let Some([w, h]) = destination {
                    self.compositor.set_viewport_destination(surface, w, h);
                }
            }
            Step::DestroyViewport { surface } => {
                let id = self.surface(&surface)?;
                self.compositor.destroy_viewport(id);
            }
            Step::InputRegion { surface, rects } => {
                let id = self.surface(&surface)?;
                self.compositor.set_input_region(id, region(rects));
            }
            Step::OpaqueRegion { surface, rects } => {
                let id = self.surface(&surface)?;
                self.compositor.set_opaque_region(id, region(rects));
            }
            Step::ContentType { surface, value } => {
                let id = self.surface(&surface)?;
                self.compositor.set_content_type(id, value);
            }
            Step::Tearing { surface, hint } => {
                let id = self.surface(&surface)?;
                self.compositor.set_tearing_hint(id, hint);
            }
            Step::Constraint {
                surface,
                mode,
                rects,
            } => {
                let id = self.surface(&surface)?;
                self.compositor.set_pointer_constraint(id, mode, region(rects));
            }
            Step::Frame { surface, name } => {
                let id = self.surface(&surface)?;
                if let Some(callback) = self.compositor.frame(id) {
                    self.callback_names.insert(callback, name);
                }
            }
            Step::Feedback { surface, name } => {
                let id = self.surface(&surface)?;
                if let Some(feedback) = self.compositor.presentation_feedback(id) {
                    self.feedback_names.insert(feedback, name);
                }
            }
            Step::Present { surface, time } => {
                let id = self.surface(&surface)?;
                self.compositor.presented(id, Duration::from_millis(time));
            }
            Step::FrameDone { surface, time } => {
                let id = self.surface(&surface)?;
                self.compositor.send_frame_callbacks(id, Duration::from_millis(time));
            }
            Step::Lock { surface, name } => {
                let surface = self.surface(&surface)?;
                let lock = self
                    .compositor
                    .lock(surface)
                    .ok_or_else(|| anyhow!("surface is dead"))?;
                self.locks.insert(name, lock);
            }
            Step::Unlock { name } => {
                let lock = self
                    .locks
                    .remove(&name)
                    .ok_or_else(|| anyhow!("unknown lock {name:?}"))?;
                self.compositor.unlock(lock);
            }
            Step::DropLock { name } => {
                let lock = self
                    .locks
                    .remove(&name)
                    .ok_or_else(|| anyhow!("unknown lock {name:?}"))?;
                drop(lock);
                self.compositor.dispatch_unlocks();
            }
            Step::Commit { surface } => {
                let id = self.surface(&surface)?;
                self.compositor.handle_commit(id);
                let queued = self.compositor.cached_count(id);
                if queued > 0 {
                    self.flush_events();
                    self.transcript
                        .push(format!("{surface}: commit deferred ({queued} queued)"));
                }
            }
            Step::Timeline { name } => {
                self.timelines.insert(name, SoftTimeline::new());
            }
            Step::ExplicitSync { surface, enabled } => {
                let id = self.surface(&surface)?;
                self.compositor.set_explicit_sync(id, enabled);
            }
            Step::Acquire {
                surface,
                timeline,
                point,
            } => {
                let point = self.timeline_point(&timeline, point)?;
                let surface = self.surface(&surface)?;
                self.compositor.set_acquire_point(surface, point);
            }
            Step::Release {
                surface,
                timeline,
                point,
            } => {
                let point = self.timeline_point(&timeline, point)?;
                let surface = self.surface(&surface)?;
                self.compositor.set_release_point(surface, point);
            }
            Step::Signal { timeline, point } => self.timeline(&timeline)?.signal(point),
            Step::PlaceAbove { surface, sibling } => {
                let (surface, sibling) = (self.surface(&surface)?, self.surface(&sibling)?);
                self.compositor.place_above(surface, sibling)?;
            }
            Step::PlaceBelow { surface, sibling } => {
                let (surface, sibling) = (self.surface(&surface)?, self.surface(&sibling)?);
                self.compositor.place_below(surface, sibling)?;
            }
            Step::Sync { surface, sync } => {
                let id = self.surface(&surface)?;
                self.compositor.set_subsurface_sync(id, sync);
            }
            Step::Position { surface, x, y } => {
                let id = self.surface(&surface)?;
                self.compositor.set_subsurface_position(id, Point::from((x, y)));
            }
            Step::Destroy { surface } => {
                let id = self.surface(&surface)?;
                self.compositor.destroy_surface(id);
            }
            Step::Dump { surface } => {
                let id = self.surface(&surface)?;
                self.flush_events();
                let line = match self.compositor.current(id) {
                    Some(current) => format!(
                        "{surface}: commit {} size={}x{} buffer={}x{} damage={} mapped={}",
                        current.commit_id(),
                        current.size().w,
                        current.size().h,
                        current.buffer_size().w,
                        current.buffer_size().h,
                        current.damage().area(),
                        current.is_mapped(),
                    ),
                    None => format!("{surface}: dead"),
                };
                self.transcript.push(line);
            }
            Step::Disconnect { client } => {
                let client = self.client(client);
                self.compositor.disconnect_client(client);
            }
        }
        Ok(())
    }

    fn flush_events(&mut self) {
        for event in self.recorder.take() {
            let line = self.describe(&event);
            self.transcript.push(line);
        }
    }

    fn name(&self, surface: SurfaceId) -> &str {
        self.surface_names.get(&surface).map_or("?", |s| s)
    }

    fn describe(&self, event: &Event) -> String {
        match event {
            Event::Changed(surface, changes) => {
                format!("{}: applied [{}]", self.name(*surface), changes.names())
            }
            Event::Placed(surface, placement) => {
                let (how, neighbor) = match placement {
                    Placement::Above(neighbor) => ("above", neighbor),
                    Placement::Below(neighbor) => ("below", neighbor),
                };
                format!("{}: placed {how} {}", self.name(*surface), self.name(*neighbor))
            }
            Event::FrameDone(callback) => {
                let name = self.callback_names.get(callback).map_or("?", |s| s);
                format!("frame {name} done")
            }
            Event::Presented(feedback) => {
                let name = self.feedback_names.get(feedback).map_or("?", |s| s);
                format!("feedback {name} presented")
            }
            Event::Discarded(feedback) => {
                let name = self.feedback_names.get(feedback).map_or("?", |s| s);
                format!("feedback {name} discarded")
            }
            Event::Destroyed(surface) => format!("{}: destroyed", self.name(*surface)),
            Event::ProtocolError(client, surface, error) => format!(
                "{}: protocol error {} from client {}: {error}",
                self.name(*surface),
                error.code(),
                self.client_index(*client),
            ),
            Event::OutOfMemory(client) => {
                format!("client {}: out of memory", self.client_index(*client))
            }
            Event::BufferReleased(buffer) => {
                let name = self.buffer_names.get(buffer).map_or("?", |s| s);
                format!("buffer {name} released")
            }
        }
    }
}

/// 回放脚本，返回事件记录
pub fn run(script: Script, config: Config) -> anyhow::Result<Vec<String>> {
    let _span = debug_span!("replay", steps = script.steps.len()).entered();

    let mut event_loop = EventLoop::<ReplayState>::try_new().context("error creating event loop")?;

    let recorder = Recorder::default();
    let allocator = Rc::new(RefCell::new(MemoryAllocator::new()));
    let (compositor, fence_channel) = Compositor::new(
        Box::new(recorder.clone()),
        Box::new(allocator.clone()),
        config,
    );

    event_loop
        .handle()
        .insert_source(fence_channel, |event, _, state| {
            if let ChannelEvent::Msg(signal) = event {
                state.compositor.fence_signaled(signal);
            }
        })
        .map_err(|err| anyhow!("error inserting fence channel: {}", err.error))?;

    let mut state = ReplayState {
        compositor,
        recorder,
        allocator,
        clients: HashMap::new(),
        surfaces: HashMap::new(),
        surface_names: HashMap::new(),
        buffers: HashMap::new(),
        buffer_names: HashMap::new(),
        timelines: HashMap::new(),
        locks: HashMap::new(),
        callback_names: HashMap::new(),
        feedback_names: HashMap::new(),
        transcript: Vec::new(),
    };

    for (index, step) in script.steps.into_iter().enumerate() {
        trace!(index, ?step, "replaying step");
        state
            .step(step)
            .with_context(|| format!("error in step {index}"))?;
        event_loop
            .dispatch(Some(Duration::ZERO), &mut state)
            .context("error dispatching event loop")?;
        state.compositor.dispatch_unlocks();
        state.flush_events();
    }

    if !state.locks.is_empty() {
        bail!("{} lock(s) still held at the end of the script", state.locks.len());
    }

    Ok(state.transcript)
}
