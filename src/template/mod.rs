//! # 模板模块
//!
//! 此模块负责：
//! 1. 定义基础模板（按输出类别 Clash / Surge 划分的段）
//! 2. 从本地 YAML 文件或内置默认值加载模板
//! 3. 把合成后的各段渲染为目标方言的配置文本

mod defaults;
pub mod dialect;
mod source;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::overlay::OverlayKind;

pub use dialect::{create_dialect, Dialect};
pub use source::{TemplateSource, TemplateStore};

/// 输出类别
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    /// Clash / Clash Meta
    #[default]
    Clash,
    /// Surge
    Surge,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Category::Clash => write!(f, "clash"),
            Category::Surge => write!(f, "surge"),
        }
    }
}

/// 模板中的各段，每段都是有序文本行
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sections {
    #[serde(default)]
    pub dns: Vec<String>,
    #[serde(default)]
    pub routing: Vec<String>,
    #[serde(default)]
    pub rule_providers: Vec<String>,
}

impl Sections {
    /// 获取覆写种类对应的段
    pub fn get(&self, kind: OverlayKind) -> &[String] {
        match kind {
            OverlayKind::Dns => &self.dns,
            OverlayKind::Routing => &self.routing,
            OverlayKind::RuleProvider => &self.rule_providers,
        }
    }

    /// 按种类逐段构建
    pub fn from_fn(mut build: impl FnMut(OverlayKind) -> Vec<String>) -> Self {
        Self {
            dns: build(OverlayKind::Dns),
            routing: build(OverlayKind::Routing),
            rule_providers: build(OverlayKind::RuleProvider),
        }
    }
}

/// 基础模板
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    /// 模板名称（唯一）
    pub name: String,
    /// 输出类别
    pub category: Category,
    /// 模板来源地址（仅记录，不会被下载）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    /// 模板中已定义的策略组名称
    #[serde(default)]
    pub proxy_groups: Vec<String>,
    /// 各段内容
    #[serde(default)]
    pub sections: Sections,
}
