//! 协议错误分类。
//!
//! 客户端违反协议时，合成器通过 `CompositorHandler::protocol_error` 上报，
//! 随后断开该客户端。每个变体都对应线上协议中的错误码。

use thiserror::Error;

/// wp_viewport 错误
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ViewportError {
    #[error("negative or zero values in width or height")]
    BadValue,
    #[error("destination size is not integer")]
    BadSize,
    #[error("source rectangle extends outside of the content area")]
    OutOfBuffer,
}

/// wp_linux_drm_syncobj_surface_v1 错误
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("buffer does not support explicit synchronization")]
    UnsupportedBuffer,
    #[error("no buffer was attached")]
    NoBuffer,
    #[error("no acquire timeline point was set")]
    NoAcquirePoint,
    #[error("no release timeline point was set")]
    NoReleasePoint,
    #[error("acquire and release timeline points are in conflict")]
    ConflictingPoints,
}

/// wl_surface 错误
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SurfaceError {
    #[error("buffer scale value is invalid")]
    InvalidScale,
    #[error("buffer transform value is invalid")]
    InvalidTransform,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("unknown buffer type")]
    UnknownBuffer,
    #[error("wp_viewport: {0}")]
    Viewport(#[from] ViewportError),
    #[error("wp_linux_drm_syncobj_surface_v1: {0}")]
    Sync(#[from] SyncError),
    #[error("wl_surface: {0}")]
    Surface(#[from] SurfaceError),
}

impl ViewportError {
    pub fn code(self) -> u32 {
        match self {
            ViewportError::BadValue => 0,
            ViewportError::BadSize => 1,
            ViewportError::OutOfBuffer => 2,
        }
    }
}

impl SyncError {
    pub fn code(self) -> u32 {
        match self {
            SyncError::UnsupportedBuffer => 2,
            SyncError::NoBuffer => 3,
            SyncError::NoAcquirePoint => 4,
            SyncError::NoReleasePoint => 5,
            SyncError::ConflictingPoints => 6,
        }
    }
}

impl SurfaceError {
    pub fn code(self) -> u32 {
        match self {
            SurfaceError::InvalidScale => 0,
            SurfaceError::InvalidTransform => 1,
        }
    }
}

impl ProtocolError {
    /// 对应接口上的错误码；未知缓冲区按 wl_display.invalid_object 处理
    pub fn code(self) -> u32 {
        match self {
            ProtocolError::UnknownBuffer => 0,
            ProtocolError::Viewport(err) => err.code(),
            ProtocolError::Sync(err) => err.code(),
            ProtocolError::Surface(err) => err.code(),
        }
    }
}
