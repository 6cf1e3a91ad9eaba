// 文件: utils/id.rs
// 作用: 单调递增的ID分配器，以及基于它的强类型ID
// 应用场景:
//   - 客户端缓冲区 (BufferId)
//   - 时间线对象 (TimelineId)
//   - 帧回调与呈现反馈令牌 (CallbackId / FeedbackId)

use std::sync::atomic::{AtomicU64, Ordering};

/// 计数器，返回唯一ID。
pub struct IdCounter {
    value: AtomicU64,
}

impl IdCounter {
    pub const fn new() -> Self {
        Self {
            // 从1开始，0留给"无效"
            value: AtomicU64::new(1),
        }
    }

    pub fn next(&self) -> u64 {
        self.value.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for IdCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// 声明一个由全局计数器分配的强类型ID
///
/// 每个类型拥有独立的静态计数器，`Type::next()` 返回新值。
macro_rules! typed_id {
    ($(#[$meta:meta])* $vis:vis struct $name:ident;) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        $vis struct $name(u64);

        impl $name {
            pub fn next() -> Self {
                static COUNTER: $crate::utils::id::IdCounter = $crate::utils::id::IdCounter::new();
                Self(COUNTER.next())
            }

            pub fn get(self) -> u64 {
                self.0
            }
        }
    };
}

pub(crate) use typed_id;
