//! # 覆写数据模型
//!
//! 定义自定义覆写记录（Overlay）、覆写种类和合并模式。
//!
//! 覆写内容被视为不透明的文本行序列，引擎只按行处理，不解析下游配置语法。

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::template::Category;

// ========================================
// 覆写种类
// ========================================

/// 覆写种类，决定覆写作用于模板的哪个段
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OverlayKind {
    /// DNS 段
    Dns,
    /// 分流规则段（Clash `rules` / Surge `[Rule]`）
    Routing,
    /// 规则集提供者段（Clash `rule-providers`）
    RuleProvider,
}

impl OverlayKind {
    /// 所有种类，按模板段的自然顺序
    pub const ALL: [OverlayKind; 3] = [
        OverlayKind::Dns,
        OverlayKind::Routing,
        OverlayKind::RuleProvider,
    ];

    /// 数组下标（用于按种类分配的锁等定长结构）
    pub fn index(self) -> usize {
        match self {
            OverlayKind::Dns => 0,
            OverlayKind::Routing => 1,
            OverlayKind::RuleProvider => 2,
        }
    }
}

impl fmt::Display for OverlayKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OverlayKind::Dns => write!(f, "DNS"),
            OverlayKind::Routing => write!(f, "ROUTING"),
            OverlayKind::RuleProvider => write!(f, "RULE_PROVIDER"),
        }
    }
}

// ========================================
// 合并模式
// ========================================

/// 覆写的合并模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "UPPERCASE")]
pub enum OverlayMode {
    /// 整体替换模板中的对应段
    Replace,
    /// 插入到段首
    Prepend,
    /// 追加到段尾
    Append,
}

impl OverlayMode {
    /// 该模式是否允许用于指定种类
    ///
    /// DNS 段没有部分合并的含义，只能整体替换。
    pub fn allowed_for(self, kind: OverlayKind) -> bool {
        kind != OverlayKind::Dns || self == OverlayMode::Replace
    }
}

impl fmt::Display for OverlayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OverlayMode::Replace => write!(f, "REPLACE"),
            OverlayMode::Prepend => write!(f, "PREPEND"),
            OverlayMode::Append => write!(f, "APPEND"),
        }
    }
}

// ========================================
// 覆写记录
// ========================================

/// 自定义覆写记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Overlay {
    /// 唯一 ID，由存储在创建时分配，之后不可变
    pub id: u64,
    /// 覆写种类
    pub kind: OverlayKind,
    /// 合并模式
    pub mode: OverlayMode,
    /// 显示名称
    #[serde(default)]
    pub name: String,
    /// 只参与该类别模板的合成，`None` 表示所有类别
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<Category>,
    /// 片段内容（有序文本行）
    pub content: Vec<String>,
    /// 是否参与合成
    pub enabled: bool,
    /// 创建时间
    pub created_at: DateTime<Utc>,
    /// 最后修改时间
    pub updated_at: DateTime<Utc>,
    /// 内容引用了、但目标拓扑中不存在的策略组（仅供展示）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derived_proxy_groups: Option<BTreeSet<String>>,
}

impl Overlay {
    /// 是否为已启用的 REPLACE 覆写（排他约束的对象）
    pub fn is_active_replace(&self) -> bool {
        self.enabled && self.mode == OverlayMode::Replace
    }

    /// 创建顺序的排序键，ID 单调递增用于打破时间戳相同的情况
    pub fn creation_key(&self) -> (DateTime<Utc>, u64) {
        (self.created_at, self.id)
    }

    /// 是否参与指定类别模板的合成
    pub fn applies_to(&self, category: Category) -> bool {
        self.category.map_or(true, |c| c == category)
    }
}

/// 新建覆写的输入（ID 和时间戳由存储分配）
#[derive(Debug, Clone)]
pub struct NewOverlay {
    pub kind: OverlayKind,
    pub mode: OverlayMode,
    pub name: String,
    pub category: Option<Category>,
    pub content: Vec<String>,
    pub enabled: bool,
    pub derived_proxy_groups: Option<BTreeSet<String>>,
}

impl NewOverlay {
    pub fn new(kind: OverlayKind, mode: OverlayMode, content: Vec<String>) -> Self {
        Self {
            kind,
            mode,
            name: String::new(),
            category: None,
            content,
            enabled: true,
            derived_proxy_groups: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_category(mut self, category: Option<Category>) -> Self {
        self.category = category;
        self
    }
}

/// 覆写的部分字段更新，`None` 表示保持原值
#[derive(Debug, Clone, Default)]
pub struct OverlayPatch {
    pub kind: Option<OverlayKind>,
    pub mode: Option<OverlayMode>,
    pub name: Option<String>,
    /// `Some(None)` 取消类别限制
    pub category: Option<Option<Category>>,
    pub content: Option<Vec<String>>,
    pub enabled: Option<bool>,
    pub derived_proxy_groups: Option<Option<BTreeSet<String>>>,
}

impl OverlayPatch {
    /// 是否没有任何字段需要更新
    pub fn is_empty(&self) -> bool {
        self.kind.is_none()
            && self.mode.is_none()
            && self.name.is_none()
            && self.category.is_none()
            && self.content.is_none()
            && self.enabled.is_none()
            && self.derived_proxy_groups.is_none()
    }

    /// 把补丁应用到记录上（不修改 ID 和时间戳）
    pub fn apply_to(&self, overlay: &mut Overlay) {
        if let Some(kind) = self.kind {
            overlay.kind = kind;
        }
        if let Some(mode) = self.mode {
            overlay.mode = mode;
        }
        if let Some(name) = &self.name {
            overlay.name = name.clone();
        }
        if let Some(category) = self.category {
            overlay.category = category;
        }
        if let Some(content) = &self.content {
            overlay.content = content.clone();
        }
        if let Some(enabled) = self.enabled {
            overlay.enabled = enabled;
        }
        if let Some(groups) = &self.derived_proxy_groups {
            overlay.derived_proxy_groups = groups.clone();
        }
    }
}

/// 把文本拆分为内容行
pub fn content_from_text(text: &str) -> Vec<String> {
    text.lines().map(str::to_string).collect()
}

// ========================================
// 测试模块
// ========================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dns_only_allows_replace() {
        assert!(OverlayMode::Replace.allowed_for(OverlayKind::Dns));
        assert!(!OverlayMode::Prepend.allowed_for(OverlayKind::Dns));
        assert!(!OverlayMode::Append.allowed_for(OverlayKind::Dns));
        assert!(OverlayMode::Prepend.allowed_for(OverlayKind::Routing));
        assert!(OverlayMode::Append.allowed_for(OverlayKind::RuleProvider));
    }

    #[test]
    fn test_patch_keeps_untouched_fields() {
        let now = Utc::now();
        let mut overlay = Overlay {
            id: 7,
            kind: OverlayKind::Routing,
            mode: OverlayMode::Append,
            name: "ads".to_string(),
            category: None,
            content: vec!["DOMAIN,ads.example,REJECT".to_string()],
            enabled: true,
            created_at: now,
            updated_at: now,
            derived_proxy_groups: None,
        };

        let patch = OverlayPatch {
            mode: Some(OverlayMode::Replace),
            ..Default::default()
        };
        patch.apply_to(&mut overlay);

        assert_eq!(overlay.mode, OverlayMode::Replace);
        assert_eq!(overlay.name, "ads");
        assert_eq!(overlay.content.len(), 1);
        assert!(overlay.is_active_replace());
    }

    #[test]
    fn test_category_scope() {
        let mut overlay: Overlay = serde_json::from_value(serde_json::json!({
            "id": 1,
            "kind": "RULE_PROVIDER",
            "mode": "APPEND",
            "content": ["gfw:"],
            "enabled": true,
            "created_at": "2024-01-01T00:00:00Z",
            "updated_at": "2024-01-01T00:00:00Z"
        }))
        .unwrap();

        // 旧存储文件中没有类别字段，视为所有类别
        assert_eq!(overlay.category, None);
        assert!(overlay.applies_to(Category::Clash));
        assert!(overlay.applies_to(Category::Surge));

        overlay.category = Some(Category::Clash);
        assert!(overlay.applies_to(Category::Clash));
        assert!(!overlay.applies_to(Category::Surge));
    }

    #[test]
    fn test_content_from_text() {
        assert_eq!(content_from_text("a\r\nb\n"), vec!["a", "b"]);
        assert!(content_from_text("").is_empty());
    }

    #[test]
    fn test_serde_uses_uppercase_names() {
        let json = serde_json::to_string(&OverlayKind::RuleProvider).unwrap();
        assert_eq!(json, "\"RULE_PROVIDER\"");
        let mode: OverlayMode = serde_json::from_str("\"PREPEND\"").unwrap();
        assert_eq!(mode, OverlayMode::Prepend);
    }
}
