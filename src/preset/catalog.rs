//! # 预设目录
//!
//! 内置的规则集预设表，进程启动时加载一次，运行期间只读。
//! 每个预设可以附带一段"伴随规则"模板，用于在添加规则集时同时生成对应的分流规则。

use std::collections::{HashMap, HashSet};

use once_cell::sync::Lazy;
use serde::Serialize;

/// 规则集预设
#[derive(Debug, Clone, Serialize)]
pub struct Preset {
    /// 唯一键，同时作为规则集名称
    pub key: &'static str,
    /// 显示名称
    pub display_name: &'static str,
    /// 规则集地址
    pub source_url: &'static str,
    /// 规则集行为（domain / ipcidr / classical）
    pub behavior: &'static str,
    /// 默认策略
    pub policy: &'static str,
    /// 伴随规则模板，第 0 行为注释头
    #[serde(skip_serializing_if = "Option::is_none")]
    pub derived_rule_template: Option<&'static [&'static str]>,
}

// concat! 只接受字面量，基础地址用宏展开后同时供常量和 loyalsoldier_url! 使用
macro_rules! loyalsoldier_base {
    () => {
        "https://cdn.jsdelivr.net/gh/Loyalsoldier/clash-rules@release"
    };
}

const LOYALSOLDIER_BASE: &str = loyalsoldier_base!();

macro_rules! loyalsoldier_url {
    ($file:literal) => {
        concat!(loyalsoldier_base!(), "/", $file)
    };
}

static PRESETS: &[Preset] = &[
    Preset {
        key: "reject",
        display_name: "广告域名",
        source_url: loyalsoldier_url!("reject.txt"),
        behavior: "domain",
        policy: "REJECT",
        derived_rule_template: Some(&["# 广告拦截", "RULE-SET,reject,REJECT"]),
    },
    Preset {
        key: "private",
        display_name: "私有网络",
        source_url: loyalsoldier_url!("private.txt"),
        behavior: "domain",
        policy: "DIRECT",
        derived_rule_template: Some(&["# 私有网络直连", "RULE-SET,private,DIRECT"]),
    },
    Preset {
        key: "icloud",
        display_name: "iCloud 域名",
        source_url: loyalsoldier_url!("icloud.txt"),
        behavior: "domain",
        policy: "DIRECT",
        derived_rule_template: Some(&["# iCloud 直连", "RULE-SET,icloud,DIRECT"]),
    },
    Preset {
        key: "apple",
        display_name: "Apple 在华域名",
        source_url: loyalsoldier_url!("apple.txt"),
        behavior: "domain",
        policy: "DIRECT",
        derived_rule_template: Some(&["# Apple 直连", "RULE-SET,apple,DIRECT"]),
    },
    Preset {
        key: "google",
        display_name: "Google 在华域名",
        source_url: loyalsoldier_url!("google.txt"),
        behavior: "domain",
        policy: "Proxy",
        derived_rule_template: Some(&["# Google", "RULE-SET,google,Proxy"]),
    },
    Preset {
        key: "proxy",
        display_name: "代理域名",
        source_url: loyalsoldier_url!("proxy.txt"),
        behavior: "domain",
        policy: "Proxy",
        derived_rule_template: Some(&["# 代理域名", "RULE-SET,proxy,Proxy"]),
    },
    Preset {
        key: "direct",
        display_name: "直连域名",
        source_url: loyalsoldier_url!("direct.txt"),
        behavior: "domain",
        policy: "DIRECT",
        derived_rule_template: Some(&["# 直连域名", "RULE-SET,direct,DIRECT"]),
    },
    Preset {
        key: "gfw",
        display_name: "GFWList 域名",
        source_url: loyalsoldier_url!("gfw.txt"),
        behavior: "domain",
        policy: "Proxy",
        derived_rule_template: Some(&["# GFWList", "RULE-SET,gfw,Proxy"]),
    },
    Preset {
        key: "telegramcidr",
        display_name: "Telegram IP 段",
        source_url: loyalsoldier_url!("telegramcidr.txt"),
        behavior: "ipcidr",
        policy: "Proxy",
        derived_rule_template: Some(&[
            "# Telegram",
            "RULE-SET,telegramcidr,Proxy,no-resolve",
        ]),
    },
    Preset {
        key: "cncidr",
        display_name: "中国大陆 IP 段",
        source_url: loyalsoldier_url!("cncidr.txt"),
        behavior: "ipcidr",
        policy: "DIRECT",
        derived_rule_template: Some(&["# 中国大陆 IP", "RULE-SET,cncidr,DIRECT,no-resolve"]),
    },
    Preset {
        key: "lancidr",
        display_name: "局域网 IP 段",
        source_url: loyalsoldier_url!("lancidr.txt"),
        behavior: "ipcidr",
        policy: "DIRECT",
        // 基础模板通常已自带局域网规则
        derived_rule_template: None,
    },
    Preset {
        key: "applications",
        display_name: "直连应用进程",
        source_url: loyalsoldier_url!("applications.txt"),
        behavior: "classical",
        policy: "DIRECT",
        derived_rule_template: Some(&["# 直连应用", "RULE-SET,applications,DIRECT"]),
    },
];

static CATALOG: Lazy<PresetCatalog> = Lazy::new(|| PresetCatalog::new(PRESETS));

/// 预设目录（只读）
pub struct PresetCatalog {
    presets: &'static [Preset],
    by_key: HashMap<&'static str, usize>,
}

impl PresetCatalog {
    /// 从静态表构建目录
    pub fn new(presets: &'static [Preset]) -> Self {
        let by_key = presets
            .iter()
            .enumerate()
            .map(|(index, preset)| (preset.key, index))
            .collect();
        Self { presets, by_key }
    }

    /// 进程级内置目录
    pub fn global() -> &'static PresetCatalog {
        &CATALOG
    }

    /// 所有预设（按表中顺序）
    pub fn all(&self) -> &'static [Preset] {
        self.presets
    }

    /// 按键查找预设
    pub fn lookup_by_key(&self, key: &str) -> Option<&'static Preset> {
        self.by_key.get(key).map(|&index| &self.presets[index])
    }

    /// 尚未被现有模板使用的预设
    ///
    /// URL 精确匹配；名称不区分大小写，与显示名称或键任一相同即视为已使用。
    pub fn list_available<U, N>(&self, excluding_urls: U, excluding_names: N) -> Vec<&'static Preset>
    where
        U: IntoIterator,
        U::Item: AsRef<str>,
        N: IntoIterator,
        N::Item: AsRef<str>,
    {
        let urls: HashSet<String> = excluding_urls
            .into_iter()
            .map(|u| u.as_ref().trim().to_string())
            .collect();
        let names: HashSet<String> = excluding_names
            .into_iter()
            .map(|n| n.as_ref().trim().to_lowercase())
            .collect();

        self.presets
            .iter()
            .filter(|p| !urls.contains(p.source_url))
            .filter(|p| {
                !names.contains(&p.display_name.to_lowercase())
                    && !names.contains(&p.key.to_lowercase())
            })
            .collect()
    }
}

/// 规则集地址的公共前缀（用于展示时缩短 URL）
pub fn short_url(url: &str) -> &str {
    url.strip_prefix(LOYALSOLDIER_BASE)
        .map(|rest| rest.trim_start_matches('/'))
        .unwrap_or(url)
}

// ========================================
// 测试模块
// ========================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_are_unique() {
        let catalog = PresetCatalog::global();
        assert_eq!(catalog.by_key.len(), catalog.all().len());
    }

    #[test]
    fn test_lookup_by_key() {
        let catalog = PresetCatalog::global();
        let preset = catalog.lookup_by_key("gfw").unwrap();
        assert_eq!(preset.policy, "Proxy");
        assert!(preset.source_url.ends_with("/gfw.txt"));
        assert!(catalog.lookup_by_key("nope").is_none());
        assert!(catalog
            .lookup_by_key("lancidr")
            .unwrap()
            .derived_rule_template
            .is_none());
    }

    #[test]
    fn test_list_available_excludes_used_urls_and_names() {
        let catalog = PresetCatalog::global();
        let total = catalog.all().len();

        let gfw_url = catalog.lookup_by_key("gfw").unwrap().source_url;
        let available = catalog.list_available([gfw_url], ["广告域名", "TELEGRAMCIDR"]);

        assert_eq!(available.len(), total - 3);
        assert!(available
            .iter()
            .all(|p| !matches!(p.key, "gfw" | "reject" | "telegramcidr")));
    }

    #[test]
    fn test_list_available_with_nothing_used() {
        let catalog = PresetCatalog::global();
        let none: [&str; 0] = [];
        assert_eq!(
            catalog.list_available(none, none).len(),
            catalog.all().len()
        );
    }

    #[test]
    fn test_short_url() {
        assert_eq!(short_url(loyalsoldier_url!("gfw.txt")), "gfw.txt");
        assert_eq!(short_url("https://example.com/a"), "https://example.com/a");
    }

    #[test]
    fn test_preset_urls_share_base() {
        let catalog = PresetCatalog::global();
        for preset in catalog.all() {
            let file = short_url(preset.source_url);
            assert_eq!(
                preset.source_url,
                format!("{}/{}", LOYALSOLDIER_BASE, file),
                "{}",
                preset.key
            );
            assert_eq!(file, format!("{}.txt", preset.key));
        }
    }
}
