//! 分流规则中策略组引用的提取
//!
//! 用于在保存分流覆写时标记出内容引用了、但模板中尚不存在的策略组。

use std::collections::BTreeSet;

/// 内置策略，不属于策略组
const BUILTIN_POLICIES: &[&str] = &[
    "DIRECT",
    "REJECT",
    "REJECT-DROP",
    "REJECT-TINYGIF",
    "REJECT-NO-DROP",
    "PASS",
    "COMPATIBLE",
];

/// 规则末尾的附加参数，不是策略
const RULE_OPTIONS: &[&str] = &["no-resolve", "src", "extended-matching", "pre-matching"];

/// 提取单条规则引用的策略
///
/// 支持 `TYPE,VALUE,POLICY[,OPTION]`、`MATCH,POLICY` 以及带括号的逻辑规则，
/// 策略总是最后一个非附加参数的字段。
pub fn rule_policy(line: &str) -> Option<&str> {
    let line = line.trim();
    let line = line.strip_prefix("- ").unwrap_or(line).trim();
    if line.is_empty() || line.starts_with('#') || line.starts_with("//") {
        return None;
    }

    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() < 2 {
        return None;
    }

    fields
        .iter()
        .rev()
        .find(|f| !RULE_OPTIONS.iter().any(|o| f.eq_ignore_ascii_case(o)))
        .map(|f| f.trim_matches(|c: char| c == '"' || c == '\''))
        .filter(|f| !f.is_empty() && !f.ends_with(')'))
}

/// 收集内容中引用的、不在 `known_groups` 中的策略组
pub fn collect_new_proxy_groups<S: AsRef<str>>(
    content: &[S],
    known_groups: &BTreeSet<String>,
) -> BTreeSet<String> {
    content
        .iter()
        .filter_map(|line| rule_policy(line.as_ref()))
        .filter(|policy| {
            !BUILTIN_POLICIES
                .iter()
                .any(|b| policy.eq_ignore_ascii_case(b))
        })
        .filter(|policy| !known_groups.contains(*policy))
        .map(str::to_string)
        .collect()
}
