//! # 规则合成与冲突处理引擎
//!
//! 此模块负责：
//! 1. 维护排他约束：每个种类最多一条已启用的 REPLACE 覆写
//! 2. 按 REPLACE / PREPEND / APPEND 语义把覆写合并进模板段
//! 3. 从规则集预设推导伴随分流规则，并与已有规则去重
//!
//! 合成和推导都是纯函数；只有排他约束的级联会写存储。

pub mod composer;
pub mod deriver;
mod error;
mod exclusivity;
pub mod groups;
mod service;

#[cfg(test)]
pub(crate) mod testing;

pub use composer::compose_document;
pub use error::EngineError;
pub use service::OverlayService;
