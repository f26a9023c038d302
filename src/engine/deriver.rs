//! # 伴随规则推导
//!
//! 根据规则集预设生成伴随的分流规则片段，并与已有的分流覆写去重。
//!
//! ## 去重规则
//! - 已有覆写的第 0 行视为注释头，不参与去重
//! - 比较前去掉首尾空白并转为小写；行内空白不同的两行视为不同
//! - 模板第 0 行同样是注释头，总是保留
//! - 如果模板的规则行全部重复，返回未过滤的原始模板，避免生成空片段

use std::collections::HashSet;

use crate::preset::PresetCatalog;

use super::error::EngineError;

/// 为预设推导伴随规则
///
/// 预设没有伴随规则模板时返回空片段。
pub fn derive<'a, I>(
    catalog: &PresetCatalog,
    preset_key: &str,
    existing_routing: I,
) -> Result<Vec<String>, EngineError>
where
    I: IntoIterator<Item = &'a [String]>,
{
    let preset = catalog
        .lookup_by_key(preset_key)
        .ok_or_else(|| EngineError::UnknownPresetKey(preset_key.to_string()))?;

    match preset.derived_rule_template {
        Some(template) => Ok(derive_from_template(template, existing_routing)),
        None => Ok(Vec::new()),
    }
}

/// 用给定模板推导伴随规则
pub fn derive_from_template<'a, I, S>(template: &[S], existing_routing: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a [String]>,
    S: AsRef<str>,
{
    let existing: HashSet<String> = existing_routing
        .into_iter()
        .flat_map(|content| content.iter().skip(1))
        .map(|line| normalize(line))
        .collect();

    let Some((header, body)) = template.split_first() else {
        return Vec::new();
    };

    let kept: Vec<&S> = body
        .iter()
        .filter(|line| !existing.contains(&normalize(line.as_ref())))
        .collect();

    if kept.is_empty() && !body.is_empty() {
        log::info!("All derived rules already exist, keeping the template unfiltered");
        return template.iter().map(|l| l.as_ref().to_string()).collect();
    }

    std::iter::once(header)
        .chain(kept)
        .map(|l| l.as_ref().to_string())
        .collect()
}

fn normalize(line: &str) -> String {
    line.trim().to_lowercase()
}
