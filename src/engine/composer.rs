//! # 片段合成器
//!
//! 把基础模板的一个段与该种类的已启用覆写合并为最终段。
//!
//! ## 合并顺序
//! 结果 = [PREPEND 片段，最近创建的在最前] + [REPLACE 片段或基础段] + [APPEND 片段，按创建顺序]
//!
//! REPLACE 只替换基础段本身，同种类的 PREPEND / APPEND 仍然包裹在替换结果外面。
//! 合成是纯函数，不读写存储。

use crate::overlay::{Overlay, OverlayKind, OverlayMode};
use crate::template::Sections;

/// 合成单个段
///
/// `overlays` 可以包含其他种类或未启用的覆写，这里会自行过滤，
/// 并按创建顺序排序，结果与传入顺序无关。
pub fn compose(kind: OverlayKind, base: &[String], overlays: &[Overlay]) -> Vec<String> {
    let mut active: Vec<&Overlay> = overlays
        .iter()
        .filter(|o| o.enabled && o.kind == kind)
        .collect();
    active.sort_by_key(|o| o.creation_key());

    let of_mode = |mode: OverlayMode| active.iter().copied().filter(move |o| o.mode == mode);

    let replaces: Vec<&Overlay> = of_mode(OverlayMode::Replace).collect();
    if replaces.len() > 1 {
        // 存储中的排他约束被破坏（例如手工编辑了存储文件），取最新的一条
        log::warn!(
            "{} enabled REPLACE overlays for {}: {:?}, using the newest",
            replaces.len(),
            kind,
            replaces.iter().map(|o| o.id).collect::<Vec<_>>()
        );
    }
    let body: &[String] = replaces.last().map_or(base, |o| o.content.as_slice());

    let mut section = Vec::new();

    // 每个 PREPEND 都插在当前段首，因此后创建的排在前面
    for overlay in of_mode(OverlayMode::Prepend).collect::<Vec<_>>().into_iter().rev() {
        section.extend(overlay.content.iter().cloned());
    }

    section.extend(body.iter().cloned());

    for overlay in of_mode(OverlayMode::Append) {
        section.extend(overlay.content.iter().cloned());
    }

    log::debug!(
        "Composed {} section: {} base lines -> {} lines ({} overlays)",
        kind,
        base.len(),
        section.len(),
        active.len()
    );

    section
}

/// 合成一份基础文档的所有段
pub fn compose_document(base: &Sections, overlays: &[Overlay]) -> Sections {
    Sections::from_fn(|kind| compose(kind, base.get(kind), overlays))
}

// ========================================
// 测试模块
// ========================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn lines(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    /// 构造覆写，`seq` 同时决定 ID 和创建时间
    fn overlay(seq: u64, kind: OverlayKind, mode: OverlayMode, content: &[&str]) -> Overlay {
        let created = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(seq as i64);
        Overlay {
            id: seq,
            kind,
            mode,
            name: format!("overlay-{}", seq),
            category: None,
            content: lines(content),
            enabled: true,
            created_at: created,
            updated_at: created,
            derived_proxy_groups: None,
        }
    }

    #[test]
    fn test_no_overlays_returns_base() {
        let base = lines(&["base-1", "base-2"]);
        assert_eq!(compose(OverlayKind::Routing, &base, &[]), base);
    }

    #[test]
    fn test_prepend_ordering() {
        let base = lines(&["base"]);
        let overlays = vec![
            overlay(1, OverlayKind::Routing, OverlayMode::Prepend, &["a"]),
            overlay(2, OverlayKind::Routing, OverlayMode::Prepend, &["b"]),
        ];

        assert_eq!(
            compose(OverlayKind::Routing, &base, &overlays),
            vec!["b", "a", "base"]
        );
    }

    #[test]
    fn test_append_keeps_creation_order() {
        let base = lines(&["base"]);
        // 传入顺序与创建顺序相反
        let overlays = vec![
            overlay(2, OverlayKind::Routing, OverlayMode::Append, &["y1", "y2"]),
            overlay(1, OverlayKind::Routing, OverlayMode::Append, &["x"]),
        ];

        assert_eq!(
            compose(OverlayKind::Routing, &base, &overlays),
            vec!["base", "x", "y1", "y2"]
        );
    }

    #[test]
    fn test_replace_dominance() {
        let base = lines(&["MATCH,Proxy"]);
        let overlays = vec![
            overlay(1, OverlayKind::Routing, OverlayMode::Replace, &["r1", "r2"]),
            overlay(2, OverlayKind::Routing, OverlayMode::Append, &["a"]),
        ];

        let section = compose(OverlayKind::Routing, &base, &overlays);

        assert_eq!(section, vec!["r1", "r2", "a"]);
        assert!(!section.contains(&"MATCH,Proxy".to_string()));
    }

    #[test]
    fn test_replace_is_wrapped_by_prepend_and_append() {
        let base = lines(&["base"]);
        let overlays = vec![
            overlay(1, OverlayKind::Dns, OverlayMode::Replace, &["enable: false"]),
            overlay(2, OverlayKind::Routing, OverlayMode::Prepend, &["p"]),
            overlay(3, OverlayKind::Routing, OverlayMode::Replace, &["r"]),
            overlay(4, OverlayKind::Routing, OverlayMode::Append, &["a"]),
        ];

        assert_eq!(
            compose(OverlayKind::Routing, &base, &overlays),
            vec!["p", "r", "a"]
        );
        assert_eq!(
            compose(OverlayKind::Dns, &base, &overlays),
            vec!["enable: false"]
        );
    }

    #[test]
    fn test_disabled_and_foreign_overlays_are_ignored() {
        let base = lines(&["base"]);
        let mut disabled = overlay(1, OverlayKind::Routing, OverlayMode::Replace, &["gone"]);
        disabled.enabled = false;
        let overlays = vec![
            disabled,
            overlay(2, OverlayKind::RuleProvider, OverlayMode::Append, &["provider"]),
        ];

        assert_eq!(compose(OverlayKind::Routing, &base, &overlays), vec!["base"]);
    }

    #[test]
    fn test_compose_is_idempotent() {
        let base = lines(&["base"]);
        let overlays = vec![
            overlay(1, OverlayKind::Routing, OverlayMode::Prepend, &["p"]),
            overlay(2, OverlayKind::Routing, OverlayMode::Append, &["a"]),
        ];

        let first = compose(OverlayKind::Routing, &base, &overlays);
        let second = compose(OverlayKind::Routing, &base, &overlays);
        assert_eq!(first, second);
    }

    #[test]
    fn test_compose_document() {
        let base = Sections {
            dns: lines(&["enable: true"]),
            routing: lines(&["MATCH,Proxy"]),
            rule_providers: Vec::new(),
        };
        let overlays = vec![
            overlay(1, OverlayKind::RuleProvider, OverlayMode::Append, &["gfw:"]),
            overlay(2, OverlayKind::Routing, OverlayMode::Prepend, &["RULE-SET,gfw,Proxy"]),
        ];

        let sections = compose_document(&base, &overlays);

        assert_eq!(sections.dns, vec!["enable: true"]);
        assert_eq!(sections.rule_providers, vec!["gfw:"]);
        assert_eq!(sections.routing, vec!["RULE-SET,gfw,Proxy", "MATCH,Proxy"]);
    }
}
