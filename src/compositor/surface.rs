//! 表面对象与按代号检查存活的表面表。
//!
//! `SurfaceId` 是 (槽位, 代号) 对。表面销毁后槽位可以复用，但代号会递增，
//! 旧的 ID 因此失效；所有入口都先查表，查不到就直接返回。

use std::collections::{HashSet, VecDeque};
use std::fmt;

use super::lock::CommitLock;
use super::state::{CurrentState, SurfaceState};
use crate::role::SurfaceRole;
use crate::sync::FenceWaitHandle;
use crate::utils::id::typed_id;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SurfaceId {
    index: u32,
    generation: u32,
}

impl fmt::Debug for SurfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SurfaceId({}v{})", self.index, self.generation)
    }
}

typed_id! {
    pub struct ClientId;
}

typed_id! {
    pub struct OutputId;
}

/// 一次等待中的获取点：丢弃时既取消等待也释放锁
pub(crate) struct FenceWait {
    pub commit_id: u64,
    pub lock: CommitLock,
    pub _handle: FenceWaitHandle,
}

pub(crate) struct Surface {
    pub client: ClientId,
    pub pending: SurfaceState,
    /// 已提交但仍被锁住的状态，按提交顺序
    pub cached: VecDeque<SurfaceState>,
    pub current: CurrentState,
    pub role: Option<Box<dyn SurfaceRole>>,
    /// 每次设置或清除角色时递增
    pub role_epoch: u64,
    /// 子表面列表（Pending 或 Current）每次变化时递增
    pub children_generation: u64,
    pub explicit_sync: bool,
    pub fence_waits: Vec<FenceWait>,
    pub outputs: HashSet<OutputId>,
    /// 正在应用 Cached 队列，防止重入
    pub draining: bool,
    /// 角色钩子正在运行（角色不在表面上）
    pub in_role_hook: bool,
    /// 钩子运行期间有提交解锁，钩子返回后再应用
    pub drain_deferred: bool,
}

impl Surface {
    pub fn new(client: ClientId) -> Self {
        Self {
            client,
            pending: SurfaceState::default(),
            cached: VecDeque::new(),
            current: CurrentState::default(),
            role: None,
            role_epoch: 0,
            children_generation: 0,
            explicit_sync: false,
            fence_waits: Vec::new(),
            outputs: HashSet::new(),
            draining: false,
            in_role_hook: false,
            drain_deferred: false,
        }
    }

    /// 按提交ID找到仍未生效的状态（Pending 或 Cached 中的一项）
    pub fn state_mut(&mut self, commit_id: u64) -> Option<&mut SurfaceState> {
        if self.pending.commit_id == commit_id {
            return Some(&mut self.pending);
        }
        self.cached.iter_mut().find(|s| s.commit_id == commit_id)
    }
}

struct Slot {
    generation: u32,
    surface: Option<Surface>,
}

#[derive(Default)]
pub(crate) struct SurfaceMap {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl SurfaceMap {
    pub fn insert(&mut self, surface: Surface) -> SurfaceId {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.surface = Some(surface);
            return SurfaceId {
                index,
                generation: slot.generation,
            };
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            surface: Some(surface),
        });
        SurfaceId {
            index,
            generation: 0,
        }
    }

    pub fn get(&self, id: SurfaceId) -> Option<&Surface> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.surface.as_ref()
    }

    pub fn get_mut(&mut self, id: SurfaceId) -> Option<&mut Surface> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.surface.as_mut()
    }

    pub fn contains(&self, id: SurfaceId) -> bool {
        self.get(id).is_some()
    }

    pub fn remove(&mut self, id: SurfaceId) -> Option<Surface> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let surface = slot.surface.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        Some(surface)
    }

    pub fn ids(&self) -> impl Iterator<Item = SurfaceId> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.surface.as_ref().map(|_| SurfaceId {
                index: index as u32,
                generation: slot.generation,
            })
        })
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.surface.is_some()).count()
    }
}
