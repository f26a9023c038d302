//! 引擎错误类型

use thiserror::Error;

use crate::overlay::{OverlayKind, OverlayMode, StoreError};

/// 规则合成引擎的错误
#[derive(Debug, Error)]
pub enum EngineError {
    /// 级联停用冲突覆写时写入失败，候选覆写未被启用
    #[error(
        "Failed to deactivate conflicting {kind} overlay {failed} while activating overlay {candidate} (already deactivated: {deactivated:?})"
    )]
    ConflictCascadeFailed {
        kind: OverlayKind,
        candidate: u64,
        /// 本次级联中已经停用成功的覆写
        deactivated: Vec<u64>,
        failed: u64,
        #[source]
        source: StoreError,
    },

    /// 级联期间候选覆写被改成了其他种类，候选保持停用
    #[error("Overlay {id} moved from {expected} to {found} while being activated, left disabled")]
    CandidateMoved {
        id: u64,
        expected: OverlayKind,
        found: OverlayKind,
    },

    /// DNS 覆写只能使用 REPLACE 模式
    #[error("Mode {mode} is not allowed for {kind} overlays")]
    InvalidModeForKind {
        kind: OverlayKind,
        mode: OverlayMode,
    },

    /// 预设目录中不存在该键
    #[error("Unknown preset key: {0}")]
    UnknownPresetKey(String),

    /// 覆写内容为空
    #[error("Overlay content must not be empty")]
    EmptyContent,

    /// 预设落地中途失败，`leftover` 为未能回滚的规则集覆写
    #[error("Failed to apply preset {key}{}", leftover_note(.leftover))]
    PresetApplyFailed {
        key: String,
        leftover: Option<u64>,
        #[source]
        source: Box<EngineError>,
    },

    /// 存储层错误
    #[error(transparent)]
    Store(#[from] StoreError),
}

fn leftover_note(leftover: &Option<u64>) -> String {
    match leftover {
        Some(id) => format!(" (rule-provider overlay {} was left behind)", id),
        None => String::new(),
    }
}
