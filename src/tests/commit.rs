use std::any::Any;
use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use proptest::prelude::*;
use smithay::utils::Size;

use super::Fixture;
use crate::compositor::{
    CommitLock, Compositor, ContentType, OutputId, PresentationHint, SurfaceChanges, SurfaceId,
};
use crate::error::{ProtocolError, SurfaceError};
use crate::replay::Event;
use crate::role::{RoleError, SurfaceRole};

#[test]
fn first_buffer_maps_surface() {
    let mut f = Fixture::new();
    let s = f.surface();
    let buffer = f.shm_buffer(64, 64);

    f.commit_buffer(s, &buffer);

    let current = f.compositor.current(s).unwrap();
    assert_eq!(current.size(), Size::from((64, 64)));
    assert!(current.has_damage());
    assert!(current.is_mapped());
    assert_eq!(current.commit_id(), 1);

    let changes = f.changes(s);
    assert_eq!(changes.len(), 1);
    assert!(changes[0].contains(
        SurfaceChanges::MAPPING | SurfaceChanges::BUFFER_SIZE | SurfaceChanges::SIZE
    ));
}

#[test]
fn locked_commit_applies_on_unlock() {
    let mut f = Fixture::new();
    let s = f.surface();
    let buffer = f.shm_buffer(64, 64);
    f.commit_buffer(s, &buffer);
    f.events();

    let lock = f.compositor.lock(s).unwrap();
    f.compositor.set_viewport_destination(s, 32, 32);
    f.compositor.handle_commit(s);

    assert_eq!(f.compositor.cached_count(s), 1);
    assert_eq!(f.compositor.current(s).unwrap().size(), Size::from((64, 64)));
    assert!(f.changes(s).is_empty());

    f.compositor.unlock(lock);

    assert_eq!(f.compositor.cached_count(s), 0);
    assert_eq!(f.compositor.current(s).unwrap().size(), Size::from((32, 32)));
    let changes = f.changes(s);
    assert_eq!(changes.len(), 1);
    assert!(changes[0].contains(SurfaceChanges::SIZE));
}

#[test]
fn dropped_lock_unlocks_on_next_dispatch() {
    let mut f = Fixture::new();
    let s = f.surface();

    let lock = f.compositor.lock(s).unwrap();
    f.compositor.set_content_type(s, ContentType::Game);
    f.compositor.handle_commit(s);
    drop(lock);

    // 丢弃只是排队
    assert_eq!(f.compositor.cached_count(s), 1);

    f.compositor.dispatch_unlocks();
    assert_eq!(f.compositor.cached_count(s), 0);
    assert_eq!(
        f.compositor.current(s).unwrap().content_type(),
        ContentType::Game
    );
}

#[test]
fn later_commits_wait_behind_locked_one() {
    let mut f = Fixture::new();
    let s = f.surface();

    let lock = f.compositor.lock(s).unwrap();
    f.compositor.set_content_type(s, ContentType::Photo);
    f.compositor.handle_commit(s);

    // 没有锁，但排在被锁住的提交后面
    f.compositor.set_content_type(s, ContentType::Video);
    f.compositor.handle_commit(s);
    assert_eq!(f.compositor.cached_count(s), 2);
    assert!(f.changes(s).is_empty());

    f.compositor.unlock(lock);
    assert_eq!(f.changes(s).len(), 2);
    let current = f.compositor.current(s).unwrap();
    assert_eq!(current.content_type(), ContentType::Video);
    assert_eq!(current.commit_id(), 2);
}

#[test]
fn every_applied_commit_notifies_once() {
    let mut f = Fixture::new();
    let s = f.surface();

    f.compositor.handle_commit(s);
    f.compositor.handle_commit(s);
    let changes = f.changes(s);
    assert_eq!(changes, vec![SurfaceChanges::empty(); 2]);
}

#[test]
fn double_buffered_state_is_sticky() {
    let mut f = Fixture::new();
    let s = f.surface();
    let buffer = f.shm_buffer(64, 64);

    f.compositor.set_buffer_scale(s, 2);
    f.commit_buffer(s, &buffer);
    assert_eq!(f.compositor.current(s).unwrap().size(), Size::from((32, 32)));

    // 缩放保留，损伤和缓冲区不保留
    f.compositor.handle_commit(s);
    let current = f.compositor.current(s).unwrap();
    assert_eq!(current.scale(), 2);
    assert_eq!(current.size(), Size::from((32, 32)));
    assert!(current.is_mapped());
    assert!(!current.has_damage());

    let pending = f.compositor.pending(s).unwrap();
    assert!(pending.buffer().is_none());
    assert!(!pending.has_damage());
}

#[test]
fn null_attach_unmaps() {
    let mut f = Fixture::new();
    let s = f.surface();
    let buffer = f.shm_buffer(16, 16);
    f.commit_buffer(s, &buffer);
    f.events();

    f.compositor.attach(s, None);
    f.compositor.handle_commit(s);

    let current = f.compositor.current(s).unwrap();
    assert!(!current.is_mapped());
    assert_eq!(current.size(), Size::from((0, 0)));
    let changes = f.changes(s);
    assert!(changes[0].contains(SurfaceChanges::MAPPING | SurfaceChanges::SIZE));
}

#[test]
fn vsync_and_content_type_changes() {
    let mut f = Fixture::new();
    let s = f.surface();

    f.compositor.set_tearing_hint(s, PresentationHint::Async);
    f.compositor.set_content_type(s, ContentType::Video);
    f.compositor.handle_commit(s);

    let changes = f.changes(s);
    assert_eq!(
        changes,
        vec![SurfaceChanges::VSYNC | SurfaceChanges::CONTENT_TYPE]
    );
    assert!(!f.compositor.current(s).unwrap().vsync());
}

#[test]
fn unknown_buffer_is_protocol_error() {
    let mut f = Fixture::new();
    let s = f.surface();

    f.compositor
        .attach(s, Some(crate::buffer::BufferRef::new_unknown("wl_drm")));
    f.compositor.handle_commit(s);

    let events = f.events();
    assert!(events.contains(&Event::ProtocolError(
        f.client,
        s,
        ProtocolError::UnknownBuffer
    )));
    assert!(events.contains(&Event::Destroyed(s)));
    assert!(!events.iter().any(|e| matches!(e, Event::Changed(..))));
    assert!(!f.compositor.is_alive(s));
}

#[test]
fn invalid_scale_and_transform() {
    let mut f = Fixture::new();
    let s = f.surface();
    f.compositor.set_buffer_scale(s, 0);
    assert!(f.events().contains(&Event::ProtocolError(
        f.client,
        s,
        SurfaceError::InvalidScale.into()
    )));

    let s = f.surface();
    f.compositor.set_buffer_transform_wire(s, 8);
    assert!(f.events().contains(&Event::ProtocolError(
        f.client,
        s,
        SurfaceError::InvalidTransform.into()
    )));
}

#[test]
fn error_leaves_other_clients_alone() {
    let mut f = Fixture::new();
    let bad = f.surface();
    let other = f
        .compositor
        .create_surface(crate::compositor::ClientId::next());

    f.compositor.set_buffer_scale(bad, -1);

    assert!(!f.compositor.is_alive(bad));
    assert!(f.compositor.is_alive(other));
}

#[test]
fn frame_callbacks_and_feedback() {
    let mut f = Fixture::new();
    let s = f.surface();

    let frame = f.compositor.frame(s).unwrap();
    let old = f.compositor.presentation_feedback(s).unwrap();
    f.compositor.handle_commit(s);

    let new = f.compositor.presentation_feedback(s).unwrap();
    f.compositor.handle_commit(s);
    assert!(f.events().contains(&Event::Discarded(old)));

    f.compositor.presented(s, Duration::from_millis(16));
    f.compositor.send_frame_callbacks(s, Duration::from_millis(16));

    let events = f.events();
    assert_eq!(
        events,
        vec![
            Event::Presented(new),
            Event::FrameDone(frame),
        ]
    );
}

#[test]
fn superseded_feedback_is_discarded() {
    let mut f = Fixture::new();
    let s = f.surface();

    let first = f.compositor.presentation_feedback(s).unwrap();
    f.compositor.handle_commit(s);
    let second = f.compositor.presentation_feedback(s).unwrap();
    f.compositor.handle_commit(s);

    let events = f.events();
    assert!(events.contains(&Event::Discarded(first)));
    assert!(!events.contains(&Event::Discarded(second)));
    assert_eq!(f.compositor.current(s).unwrap().feedbacks(), &[second]);
}

#[test]
fn destroy_discards_feedback_and_releases() {
    let mut f = Fixture::new();
    let s = f.surface();
    let buffer = f.dmabuf(8, 8);
    let feedback = f.compositor.presentation_feedback(s).unwrap();
    f.commit_buffer(s, &buffer);
    assert!(!buffer.is_released());
    f.events();

    f.compositor.destroy_surface(s);

    let events = f.events();
    assert!(events.contains(&Event::Discarded(feedback)));
    assert!(events.contains(&Event::BufferReleased(buffer.id())));
    assert_eq!(events.last(), Some(&Event::Destroyed(s)));
}

#[test]
fn replaced_dmabuf_is_released() {
    let mut f = Fixture::new();
    let s = f.surface();
    let first = f.dmabuf(8, 8);
    let second = f.dmabuf(8, 8);

    f.commit_buffer(s, &first);
    assert!(!first.is_released());

    f.commit_buffer(s, &second);
    assert!(first.is_released());
    assert!(!second.is_released());

    // 重新附加同一个缓冲区不会释放它
    f.commit_buffer(s, &second);
    assert!(!second.is_released());
}

#[test]
fn shm_buffer_is_released_after_upload() {
    let mut f = Fixture::new();
    let s = f.surface();
    let buffer = f.shm_buffer(4, 4);

    f.commit_buffer(s, &buffer);
    assert!(buffer.is_released());
    assert!(!buffer.is_being_read());
    assert_eq!(buffer.release_count(), 1);
    assert_eq!(buffer.surface(), Some(s));
}

#[test]
fn unlock_after_destroy_is_ignored() {
    let mut f = Fixture::new();
    let s = f.surface();

    let lock = f.compositor.lock(s).unwrap();
    f.compositor.handle_commit(s);
    f.compositor.destroy_surface(s);
    f.compositor.unlock(lock);

    assert!(f.changes(s).is_empty());
}

#[test]
#[should_panic(expected = "unlocked more times than it was locked")]
fn unlocking_unlocked_commit_panics() {
    let mut f = Fixture::new();
    let s = f.surface();
    let commit_id = f.compositor.pending(s).unwrap().commit_id();
    f.compositor.unlock_commit(s, commit_id);
}

#[test]
fn stale_surface_id_is_rejected() {
    let mut f = Fixture::new();
    let s = f.surface();
    f.compositor.destroy_surface(s);

    // 复用同一个槽位的新表面
    let t = f.surface();
    assert_ne!(s, t);
    assert!(!f.compositor.is_alive(s));
    assert!(f.compositor.lock(s).is_none());
    f.compositor.handle_commit(s);
    assert_eq!(f.compositor.current(t).unwrap().commit_id(), 0);
}

#[test]
fn disconnect_destroys_all_client_surfaces() {
    let mut f = Fixture::new();
    let a = f.surface();
    let b = f.surface();

    f.compositor.disconnect_client(f.client);

    assert!(!f.compositor.is_alive(a));
    assert!(!f.compositor.is_alive(b));
    assert!(f.compositor.surfaces().is_empty());
}

#[test]
fn outputs_follow_enter_and_leave() {
    let mut f = Fixture::new();
    let s = f.surface();
    let (a, b) = (OutputId::next(), OutputId::next());

    f.compositor.output_enter(s, b);
    f.compositor.output_enter(s, a);
    f.compositor.output_enter(s, a);
    assert_eq!(f.compositor.outputs(s), vec![a, b]);

    f.compositor.output_leave(s, b);
    assert_eq!(f.compositor.outputs(s), vec![a]);

    f.compositor.destroy_surface(s);
    assert!(f.compositor.outputs(s).is_empty());
}

#[derive(Default)]
struct CountingRole {
    cached: Rc<Cell<u32>>,
    applied: Rc<Cell<u32>>,
    hold: Option<CommitLock>,
    lock_next: bool,
    /// 每次提交时放开上一次的锁，再锁住这一次
    relock: bool,
    destroy_on_apply: bool,
}

impl SurfaceRole for CountingRole {
    fn name(&self) -> &'static str {
        "test_role"
    }

    fn cache_commit(&mut self, compositor: &mut Compositor, surface: SurfaceId) {
        self.cached.set(self.cached.get() + 1);
        if self.relock {
            if let Some(previous) = self.hold.take() {
                compositor.unlock(previous);
            }
        }
        if self.lock_next || self.relock {
            self.hold = compositor.lock(surface);
        }
    }

    fn apply_commit(&mut self, compositor: &mut Compositor, surface: SurfaceId) {
        self.applied.set(self.applied.get() + 1);
        if self.destroy_on_apply {
            compositor.destroy_surface(surface);
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[test]
fn role_hooks_run_around_commit() {
    let mut f = Fixture::new();
    let s = f.surface();

    let role = CountingRole::default();
    let (cached, applied) = (role.cached.clone(), role.applied.clone());
    f.compositor.set_role(s, Box::new(role)).unwrap();

    f.compositor.handle_commit(s);
    assert_eq!((cached.get(), applied.get()), (1, 1));
    assert_eq!(f.compositor.role_name(s), Some("test_role"));

    assert_eq!(
        f.compositor.set_role(s, Box::new(CountingRole::default())),
        Err(RoleError::AlreadyHasRole("test_role"))
    );
}

#[test]
fn role_can_lock_its_own_commit() {
    let mut f = Fixture::new();
    let s = f.surface();
    let role = CountingRole {
        lock_next: true,
        ..CountingRole::default()
    };
    f.compositor.set_role(s, Box::new(role)).unwrap();

    f.compositor.handle_commit(s);
    assert_eq!(f.compositor.cached_count(s), 1);

    let lock = f
        .compositor
        .role_mut::<CountingRole>(s)
        .and_then(|role| {
            role.lock_next = false;
            role.hold.take()
        })
        .unwrap();
    f.compositor.unlock(lock);
    assert_eq!(f.compositor.cached_count(s), 0);
    assert_eq!(f.changes(s).len(), 1);
}

#[test]
fn commit_unlocked_from_role_hook_runs_apply_hook() {
    let mut f = Fixture::new();
    let s = f.surface();
    let role = CountingRole {
        relock: true,
        ..CountingRole::default()
    };
    let (cached, applied) = (role.cached.clone(), role.applied.clone());
    f.compositor.set_role(s, Box::new(role)).unwrap();

    f.compositor.handle_commit(s);
    assert_eq!(f.compositor.cached_count(s), 1);
    assert_eq!(applied.get(), 0);

    // 第二次提交的 cache_commit 放开第一次提交
    f.compositor.handle_commit(s);
    assert_eq!(cached.get(), 2);
    assert_eq!(applied.get(), 1);
    assert_eq!(f.changes(s).len(), 1);
    assert_eq!(f.compositor.current(s).unwrap().commit_id(), 1);
    assert_eq!(f.compositor.cached_count(s), 1);
    assert_eq!(f.compositor.role_name(s), Some("test_role"));

    f.compositor.handle_commit(s);
    assert_eq!(applied.get(), 2);
    assert_eq!(f.compositor.current(s).unwrap().commit_id(), 2);
}

#[test]
fn surface_destroyed_by_role_hook() {
    let mut f = Fixture::new();
    let s = f.surface();
    let role = CountingRole {
        destroy_on_apply: true,
        ..CountingRole::default()
    };
    f.compositor.set_role(s, Box::new(role)).unwrap();

    f.compositor.handle_commit(s);

    let events = f.events();
    assert!(events.contains(&Event::Destroyed(s)));
    assert!(!events.iter().any(|e| matches!(e, Event::Changed(..))));
}

proptest! {
    #[test]
    fn commits_apply_in_submission_order(
        (locked, order) in prop::collection::vec(any::<bool>(), 1..8).prop_flat_map(|locked| {
            let order = (0..locked.len()).collect::<Vec<_>>();
            (Just(locked), Just(order).prop_shuffle())
        })
    ) {
        let mut f = Fixture::new();
        let s = f.surface();

        let mut locks = Vec::new();
        let mut callbacks = Vec::new();
        for &lock in &locked {
            locks.push(if lock { f.compositor.lock(s) } else { None });
            callbacks.push(f.compositor.frame(s).unwrap());
            f.compositor.handle_commit(s);
        }

        let mut unlocked = locked.iter().map(|l| !l).collect::<Vec<_>>();
        let applied_prefix =
            |unlocked: &[bool]| unlocked.iter().take_while(|u| **u).count();

        prop_assert_eq!(
            f.compositor.current(s).unwrap().frame_callbacks(),
            &callbacks[..applied_prefix(&unlocked)]
        );

        for idx in order {
            if let Some(lock) = locks[idx].take() {
                f.compositor.unlock(lock);
            }
            unlocked[idx] = true;

            // 只有前面全部解锁的提交才会生效，而且按提交顺序
            let applied = applied_prefix(&unlocked);
            prop_assert_eq!(
                f.compositor.current(s).unwrap().frame_callbacks(),
                &callbacks[..applied]
            );
            prop_assert_eq!(f.compositor.cached_count(s), locked.len() - applied);
        }

        prop_assert_eq!(f.changes(s).len(), locked.len());
    }
}
