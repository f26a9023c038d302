//! # 覆写服务
//!
//! 创建、修改、启用开关三种写入都经过这里：先在边界上校验，
//! 需要启用 REPLACE 覆写时统一交给 [`ExclusivityEnforcer`] 执行级联。
//!
//! ## 激活流程
//! 1. 获取种类写锁
//! 2. 以停用状态写入候选覆写（新建或字段更新）
//! 3. 停用同种类的其他 REPLACE 覆写
//! 4. 启用候选覆写

use std::collections::BTreeSet;

use crate::overlay::{NewOverlay, Overlay, OverlayKind, OverlayMode, OverlayPatch, OverlayStore};
use crate::preset::PresetCatalog;
use crate::template::{create_dialect, Category};

use super::deriver;
use super::error::EngineError;
use super::exclusivity::ExclusivityEnforcer;
use super::groups::collect_new_proxy_groups;

/// 规则集预设落地的结果
#[derive(Debug)]
pub struct AppliedPreset {
    pub provider: Overlay,
    /// Surge 或没有伴随规则的预设不会创建分流覆写
    pub routing: Option<Overlay>,
}

/// 覆写服务
pub struct OverlayService<S> {
    store: S,
    enforcer: ExclusivityEnforcer,
    /// 模板中已存在的策略组，用于计算 `derived_proxy_groups`
    known_groups: BTreeSet<String>,
}

impl<S: OverlayStore> OverlayService<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            enforcer: ExclusivityEnforcer::new(),
            known_groups: BTreeSet::new(),
        }
    }

    pub fn with_known_groups(mut self, groups: BTreeSet<String>) -> Self {
        self.known_groups = groups;
        self
    }

    #[cfg(test)]
    pub fn store(&self) -> &S {
        &self.store
    }

    // ========================================
    // 写入操作
    // ========================================

    /// 新建覆写
    pub fn create(&self, mut new: NewOverlay) -> Result<Overlay, EngineError> {
        validate(new.kind, new.mode, &new.content)?;
        new.derived_proxy_groups = self.proxy_groups_for(new.kind, &new.content);

        if !(new.enabled && new.mode == OverlayMode::Replace) {
            let created = self.store.create(new)?;
            log::info!(
                "Created {} {} overlay {}",
                created.mode,
                created.kind,
                created.id
            );
            return Ok(created);
        }

        let guard = self.enforcer.lock(&self.store, new.kind)?;
        let staged = self.store.create(new.with_enabled(false))?;
        let candidate = Overlay {
            enabled: true,
            ..staged
        };
        self.enforcer.activate(&guard, &self.store, &candidate)
    }

    /// 修改覆写的部分字段
    pub fn update(&self, id: u64, mut patch: OverlayPatch) -> Result<Overlay, EngineError> {
        let from = self.store.get(id)?.kind;
        let to = patch.kind.unwrap_or(from);
        // 改种类时原种类也要锁住，否则原种类上进行中的启用会绕过新种类的级联
        let guard = self.enforcer.lock_moving(&self.store, from, to)?;

        // 持锁后重新读取，避免基于过期状态做决定
        let current = self.store.get(id)?;
        if current.kind != from {
            // 读取种类与加锁之间记录被并发改了种类，重新加锁
            drop(guard);
            return self.update(id, patch);
        }

        let mut target = current.clone();
        patch.apply_to(&mut target);
        validate(target.kind, target.mode, &target.content)?;
        debug_assert!(guard.covers(target.kind));

        if patch.content.is_some() || patch.kind.is_some() {
            patch.derived_proxy_groups = Some(self.proxy_groups_for(target.kind, &target.content));
        }

        if !target.is_active_replace() {
            return Ok(self.store.update(id, &patch)?);
        }

        // 已经是同种类的启用 REPLACE 时无需先停用自身
        let already_active = current.is_active_replace() && current.kind == target.kind;
        let staged_patch = if already_active {
            patch
        } else {
            OverlayPatch {
                enabled: Some(false),
                ..patch
            }
        };
        let staged = self.store.update(id, &staged_patch)?;
        let candidate = Overlay {
            enabled: true,
            ..staged
        };
        self.enforcer.activate(&guard, &self.store, &candidate)
    }

    /// 启用或停用覆写
    pub fn set_enabled(&self, id: u64, enabled: bool) -> Result<Overlay, EngineError> {
        if !enabled {
            let disabled = self.store.set_enabled(id, false)?;
            log::info!("Disabled {} overlay {}", disabled.kind, disabled.id);
            return Ok(disabled);
        }

        let kind = self.store.get(id)?.kind;
        let guard = self.enforcer.lock(&self.store, kind)?;
        let current = self.store.get(id)?;
        if current.kind != kind {
            drop(guard);
            return self.set_enabled(id, enabled);
        }

        let candidate = Overlay {
            enabled: true,
            ..current
        };
        self.enforcer.activate(&guard, &self.store, &candidate)
    }

    /// 删除覆写
    pub fn delete(&self, id: u64) -> Result<(), EngineError> {
        self.store.delete(id)?;
        log::info!("Deleted overlay {}", id);
        Ok(())
    }

    // ========================================
    // 读取操作
    // ========================================

    /// 列出覆写，可按种类过滤
    pub fn list(&self, kind: Option<OverlayKind>) -> Result<Vec<Overlay>, EngineError> {
        let overlays = match kind {
            Some(kind) => self.store.list_by_kind(kind)?,
            None => self.store.list_all()?,
        };
        Ok(overlays)
    }

    /// 读取单条覆写
    pub fn get(&self, id: u64) -> Result<Overlay, EngineError> {
        Ok(self.store.get(id)?)
    }

    /// 参与合成的覆写
    pub fn enabled_overlays(&self) -> Result<Vec<Overlay>, EngineError> {
        Ok(self
            .store
            .list_all()?
            .into_iter()
            .filter(|o| o.enabled)
            .collect())
    }

    /// 为预设推导伴随规则，与所有已有的分流覆写去重
    pub fn derive_companion(
        &self,
        catalog: &PresetCatalog,
        preset_key: &str,
    ) -> Result<Vec<String>, EngineError> {
        let routing = self.store.list_by_kind(OverlayKind::Routing)?;
        deriver::derive(
            catalog,
            preset_key,
            routing.iter().map(|o| o.content.as_slice()),
        )
    }

    /// 把预设落地为规则集覆写和伴随分流覆写
    ///
    /// 两条覆写都只参与 `category` 类别模板的合成：规则集条目的格式随方言不同，
    /// 不能混入其他类别的输出。Surge 的 RULE-SET 行本身就带策略，不创建伴随分流覆写。
    /// 伴随分流覆写创建失败时删除已创建的规则集覆写。
    pub fn apply_preset(
        &self,
        catalog: &PresetCatalog,
        preset_key: &str,
        category: Category,
        rule_mode: OverlayMode,
    ) -> Result<AppliedPreset, EngineError> {
        let preset = catalog
            .lookup_by_key(preset_key)
            .ok_or_else(|| EngineError::UnknownPresetKey(preset_key.to_string()))?;

        // 先推导，再落地规则集，去重只针对分流覆写
        let rules = match category {
            Category::Clash => self.derive_companion(catalog, preset_key)?,
            Category::Surge => Vec::new(),
        };
        if !rules.is_empty() {
            validate(OverlayKind::Routing, rule_mode, &rules)?;
        }

        let provider = self.create(
            NewOverlay::new(
                OverlayKind::RuleProvider,
                OverlayMode::Append,
                create_dialect(category).rule_provider_entry(preset),
            )
            .with_name(format!("preset:{}", preset.key))
            .with_category(Some(category)),
        )?;

        if rules.is_empty() {
            return Ok(AppliedPreset {
                provider,
                routing: None,
            });
        }

        let routing = NewOverlay::new(OverlayKind::Routing, rule_mode, rules)
            .with_name(format!("preset:{} rules", preset.key))
            .with_category(Some(category));
        match self.create(routing) {
            Ok(routing) => Ok(AppliedPreset {
                provider,
                routing: Some(routing),
            }),
            Err(err) => {
                log::warn!(
                    "Routing overlay for preset {} failed, removing rule-provider overlay {}",
                    preset.key,
                    provider.id
                );
                let leftover = match self.store.delete(provider.id) {
                    Ok(()) => None,
                    Err(rollback) => {
                        log::warn!("Failed to remove overlay {}: {}", provider.id, rollback);
                        Some(provider.id)
                    }
                };
                Err(EngineError::PresetApplyFailed {
                    key: preset.key.to_string(),
                    leftover,
                    source: Box::new(err),
                })
            }
        }
    }

    // ========================================
    // 约束检查
    // ========================================

    /// 找出违反排他约束的种类及对应的覆写 ID
    pub fn exclusivity_violations(&self) -> Result<Vec<(OverlayKind, Vec<u64>)>, EngineError> {
        let all = self.store.list_all()?;
        let violations = OverlayKind::ALL
            .into_iter()
            .filter_map(|kind| {
                let ids: Vec<u64> = all
                    .iter()
                    .filter(|o| o.kind == kind && o.is_active_replace())
                    .map(|o| o.id)
                    .collect();
                (ids.len() > 1).then_some((kind, ids))
            })
            .collect::<Vec<_>>();

        for (kind, ids) in &violations {
            log::warn!("{} has {} enabled REPLACE overlays: {:?}", kind, ids.len(), ids);
        }
        Ok(violations)
    }

    /// 修复违反排他约束的种类：保留最新创建的一条，停用其余
    pub fn repair_exclusivity(&self) -> Result<Vec<Overlay>, EngineError> {
        let mut kept = Vec::new();
        for (kind, _) in self.exclusivity_violations()? {
            let guard = self.enforcer.lock(&self.store, kind)?;
            let newest = self
                .store
                .list_by_kind(kind)?
                .into_iter()
                .filter(Overlay::is_active_replace)
                .max_by_key(Overlay::creation_key);
            if let Some(newest) = newest {
                kept.push(self.enforcer.activate(&guard, &self.store, &newest)?);
            }
        }
        Ok(kept)
    }

    /// 分流覆写中引用、但模板中不存在的策略组
    fn proxy_groups_for(&self, kind: OverlayKind, content: &[String]) -> Option<BTreeSet<String>> {
        if kind != OverlayKind::Routing {
            return None;
        }
        let groups = collect_new_proxy_groups(content, &self.known_groups);
        (!groups.is_empty()).then_some(groups)
    }
}

/// 边界校验，在任何存储写入之前执行
fn validate(kind: OverlayKind, mode: OverlayMode, content: &[String]) -> Result<(), EngineError> {
    if !mode.allowed_for(kind) {
        return Err(EngineError::InvalidModeForKind { kind, mode });
    }
    if content.is_empty() {
        return Err(EngineError::EmptyContent);
    }
    Ok(())
}
