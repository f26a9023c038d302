//! # 排他约束执行器
//!
//! 保证每个种类最多只有一条已启用的 REPLACE 覆写。
//!
//! 激活一条 REPLACE 覆写时，先停用同种类的其他已启用 REPLACE 覆写，
//! 全部停用成功后才把候选覆写写为启用。整个级联在该种类的写锁内完成：
//! - 进程内：每个种类一把互斥锁，同一种类的并发激活请求被串行化
//! - 进程间：级联期间持有存储的写锁，其他进程的写入要等级联结束
//!
//! 修改覆写种类时同时锁住原种类和新种类，按 `OverlayKind::index` 顺序加锁。

use std::sync::{Mutex, MutexGuard};

use crate::overlay::{Overlay, OverlayKind, OverlayMode, OverlayStore, StoreError, WriteLock};

use super::error::EngineError;

/// 持有种类写锁的凭证，释放时解锁
pub struct KindGuard<'a> {
    /// 级联针对的种类
    kind: OverlayKind,
    /// 修改种类时一并锁住的原种类
    from: OverlayKind,
    _write: WriteLock<'a>,
    _second: Option<MutexGuard<'a, ()>>,
    _first: MutexGuard<'a, ()>,
}

impl KindGuard<'_> {
    pub fn kind(&self) -> OverlayKind {
        self.kind
    }

    /// 该凭证是否锁住了指定种类
    pub fn covers(&self, kind: OverlayKind) -> bool {
        kind == self.kind || kind == self.from
    }
}

/// 排他约束执行器
#[derive(Default)]
pub struct ExclusivityEnforcer {
    /// 每个种类一把写锁，按 `OverlayKind::index` 排列
    locks: [Mutex<()>; 3],
}

impl ExclusivityEnforcer {
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取种类的写锁
    pub fn lock<'a, S: OverlayStore + ?Sized>(
        &'a self,
        store: &'a S,
        kind: OverlayKind,
    ) -> Result<KindGuard<'a>, StoreError> {
        self.lock_moving(store, kind, kind)
    }

    /// 获取把覆写从 `from` 改为 `to` 所需的写锁
    ///
    /// 两个种类不同时都会被锁住，避免原种类上正在进行的激活在改种类后越过新种类的级联。
    pub fn lock_moving<'a, S: OverlayStore + ?Sized>(
        &'a self,
        store: &'a S,
        from: OverlayKind,
        to: OverlayKind,
    ) -> Result<KindGuard<'a>, StoreError> {
        let (low, high) = if from.index() <= to.index() {
            (from, to)
        } else {
            (to, from)
        };

        let first = self.lock_kind(low);
        let second = (high != low).then(|| self.lock_kind(high));
        // 进程内的互斥锁先于存储写锁获取，顺序固定
        let write = store.lock_writes()?;

        Ok(KindGuard {
            kind: to,
            from,
            _write: write,
            _second: second,
            _first: first,
        })
    }

    fn lock_kind(&self, kind: OverlayKind) -> MutexGuard<'_, ()> {
        self.locks[kind.index()]
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// 激活候选覆写
    ///
    /// `candidate` 是期望的最终状态（种类、模式已确定，`enabled = true`），
    /// 记录本身必须已经存在于存储中。候选不是 REPLACE 时不做级联，直接启用。
    pub fn activate<S: OverlayStore + ?Sized>(
        &self,
        guard: &KindGuard<'_>,
        store: &S,
        candidate: &Overlay,
    ) -> Result<Overlay, EngineError> {
        debug_assert_eq!(guard.kind(), candidate.kind);

        if !candidate.enabled {
            return Ok(candidate.clone());
        }

        if candidate.mode == OverlayMode::Replace {
            self.deactivate_conflicts(guard, store, candidate)?;
        }

        // 启用前确认记录仍属于已完成级联的种类
        let current = store.get(candidate.id)?;
        if current.kind != guard.kind() {
            log::warn!(
                "Overlay {} moved from {} to {} during activation, left disabled",
                candidate.id,
                guard.kind(),
                current.kind
            );
            return Err(EngineError::CandidateMoved {
                id: candidate.id,
                expected: guard.kind(),
                found: current.kind,
            });
        }

        let activated = store.set_enabled(candidate.id, true)?;
        log::info!(
            "Activated {} {} overlay {}",
            activated.mode,
            activated.kind,
            activated.id
        );
        Ok(activated)
    }

    /// 停用与候选冲突的覆写，返回被停用的 ID
    ///
    /// 任何一次停用失败都会中止级联，错误中带上已经停用的记录。
    pub fn deactivate_conflicts<S: OverlayStore + ?Sized>(
        &self,
        guard: &KindGuard<'_>,
        store: &S,
        candidate: &Overlay,
    ) -> Result<Vec<u64>, EngineError> {
        let kind = guard.kind();
        let conflicts: Vec<Overlay> = store
            .list_by_kind(kind)?
            .into_iter()
            .filter(|o| o.is_active_replace() && o.id != candidate.id)
            .collect();

        let mut deactivated = Vec::with_capacity(conflicts.len());
        for conflict in conflicts {
            if let Err(source) = store.set_enabled(conflict.id, false) {
                log::warn!(
                    "Cascade for {} overlay {} stopped at {}: {}",
                    kind,
                    candidate.id,
                    conflict.id,
                    source
                );
                return Err(EngineError::ConflictCascadeFailed {
                    kind,
                    candidate: candidate.id,
                    deactivated,
                    failed: conflict.id,
                    source,
                });
            }
            log::info!(
                "Deactivated {} overlay {} ({}) in favor of {}",
                kind,
                conflict.id,
                conflict.name,
                candidate.id
            );
            deactivated.push(conflict.id);
        }

        Ok(deactivated)
    }
}
