//! # 预设模块
//!
//! 提供内置的规则集预设目录。

mod catalog;

pub use catalog::{short_url, Preset, PresetCatalog};
