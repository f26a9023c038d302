//! # 配置方言渲染器
//!
//! 把合成后的各段拼接为目标方言（Clash / Surge）的配置文本。
//! 段内每一行都按原样输出，具体语法正确性由模板作者负责。

use crate::overlay::OverlayKind;
use crate::preset::Preset;

use super::{Category, Sections};

/// 输出文档中的一个块：块头 + 归入该块的段
pub struct Block {
    pub header: &'static str,
    pub kinds: &'static [OverlayKind],
}

/// 方言渲染 trait
pub trait Dialect {
    /// 输出文档的块布局（顺序即输出顺序）
    fn layout(&self) -> &'static [Block];

    /// 格式化段内的单行
    fn format_line(&self, kind: OverlayKind, line: &str) -> String;

    /// 获取配置文件扩展名
    fn file_extension(&self) -> &'static str;

    /// 生成规则集提供者的条目（用于把预设落地为 RULE_PROVIDER 覆写）
    fn rule_provider_entry(&self, preset: &Preset) -> Vec<String>;

    /// 渲染完整文档，空块不输出
    fn render(&self, sections: &Sections) -> String {
        let mut blocks = Vec::new();

        for block in self.layout() {
            let lines: Vec<String> = block
                .kinds
                .iter()
                .flat_map(|&kind| {
                    sections
                        .get(kind)
                        .iter()
                        .map(move |line| self.format_line(kind, line))
                })
                .collect();

            if lines.is_empty() {
                continue;
            }

            let mut text = String::from(block.header);
            for line in lines {
                text.push('\n');
                text.push_str(&line);
            }
            blocks.push(text);
        }

        let mut document = blocks.join("\n\n");
        document.push('\n');
        document
    }
}

// ========================================
// Clash 方言
// ========================================

pub struct ClashDialect;

const CLASH_LAYOUT: &[Block] = &[
    Block {
        header: "dns:",
        kinds: &[OverlayKind::Dns],
    },
    Block {
        header: "rule-providers:",
        kinds: &[OverlayKind::RuleProvider],
    },
    Block {
        header: "rules:",
        kinds: &[OverlayKind::Routing],
    },
];

impl Dialect for ClashDialect {
    fn layout(&self) -> &'static [Block] {
        CLASH_LAYOUT
    }

    fn format_line(&self, kind: OverlayKind, line: &str) -> String {
        if line.trim().is_empty() {
            return String::new();
        }

        // 规则段是 YAML 列表，其余段是缩进两格的映射
        // Example: "DOMAIN-SUFFIX,google.com,Proxy" -> "  - DOMAIN-SUFFIX,google.com,Proxy"
        // 规则段里已经写成列表项（或带缩进）的行统一对齐到两格，否则会被折叠进上一项
        let trimmed = line.trim_start();
        if kind != OverlayKind::Routing {
            format!("  {}", line)
        } else if trimmed.starts_with('#') || trimmed.starts_with("- ") {
            format!("  {}", trimmed)
        } else {
            format!("  - {}", trimmed)
        }
    }

    fn file_extension(&self) -> &'static str {
        "yaml"
    }

    fn rule_provider_entry(&self, preset: &Preset) -> Vec<String> {
        vec![
            format!("{}:", preset.key),
            "  type: http".to_string(),
            format!("  behavior: {}", preset.behavior),
            format!("  url: \"{}\"", preset.source_url),
            format!("  path: ./ruleset/{}.yaml", preset.key),
            "  interval: 86400".to_string(),
        ]
    }
}

// ========================================
// Surge 方言
// ========================================

pub struct SurgeDialect;

const SURGE_LAYOUT: &[Block] = &[
    Block {
        header: "[General]",
        kinds: &[OverlayKind::Dns],
    },
    // Surge 没有独立的规则集段，RULE-SET 行排在其他规则之前
    Block {
        header: "[Rule]",
        kinds: &[OverlayKind::RuleProvider, OverlayKind::Routing],
    },
];

impl Dialect for SurgeDialect {
    fn layout(&self) -> &'static [Block] {
        SURGE_LAYOUT
    }

    fn format_line(&self, _kind: OverlayKind, line: &str) -> String {
        line.to_string()
    }

    fn file_extension(&self) -> &'static str {
        "conf"
    }

    fn rule_provider_entry(&self, preset: &Preset) -> Vec<String> {
        vec![format!("RULE-SET,{},{}", preset.source_url, preset.policy)]
    }
}

/// 根据输出类别创建方言渲染器
pub fn create_dialect(category: Category) -> Box<dyn Dialect> {
    match category {
        Category::Clash => Box::new(ClashDialect),
        Category::Surge => Box::new(SurgeDialect),
    }
}
