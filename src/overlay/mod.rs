//! # 覆写模块
//!
//! 此模块负责：
//! 1. 定义自定义覆写记录（DNS / 分流规则 / 规则集提供者）
//! 2. 提供覆写记录的持久化存储

pub mod model;
mod store;

pub use model::{content_from_text, NewOverlay, Overlay, OverlayKind, OverlayMode, OverlayPatch};
pub use store::{JsonStore, OverlayStore, StoreError, WriteLock};
