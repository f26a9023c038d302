//! 测试用的存储包装：注入写入失败、审计中间状态、模拟并发写入

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::overlay::{
    NewOverlay, Overlay, OverlayKind, OverlayPatch, OverlayStore, StoreError, WriteLock,
};

fn injected_failure() -> StoreError {
    StoreError::Io {
        path: PathBuf::from("<injected>"),
        source: io::Error::new(io::ErrorKind::Other, "injected write failure"),
    }
}

/// 对指定 ID 的停用写入、或指定种类的新建返回错误
pub struct FailingStore<S> {
    inner: S,
    fail_ids: HashSet<u64>,
    fail_create: HashSet<OverlayKind>,
}

impl<S: OverlayStore> FailingStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            fail_ids: HashSet::new(),
            fail_create: HashSet::new(),
        }
    }

    pub fn fail_on(mut self, id: u64) -> Self {
        self.fail_ids.insert(id);
        self
    }

    pub fn fail_create_of(mut self, kind: OverlayKind) -> Self {
        self.fail_create.insert(kind);
        self
    }
}

impl<S: OverlayStore> OverlayStore for FailingStore<S> {
    fn list_all(&self) -> Result<Vec<Overlay>, StoreError> {
        self.inner.list_all()
    }

    fn get(&self, id: u64) -> Result<Overlay, StoreError> {
        self.inner.get(id)
    }

    fn create(&self, new: NewOverlay) -> Result<Overlay, StoreError> {
        if self.fail_create.contains(&new.kind) {
            return Err(injected_failure());
        }
        self.inner.create(new)
    }

    fn update(&self, id: u64, patch: &OverlayPatch) -> Result<Overlay, StoreError> {
        self.inner.update(id, patch)
    }

    fn set_enabled(&self, id: u64, enabled: bool) -> Result<Overlay, StoreError> {
        if !enabled && self.fail_ids.contains(&id) {
            return Err(injected_failure());
        }
        self.inner.set_enabled(id, enabled)
    }

    fn delete(&self, id: u64) -> Result<(), StoreError> {
        self.inner.delete(id)
    }

    fn lock_writes(&self) -> Result<WriteLock<'_>, StoreError> {
        self.inner.lock_writes()
    }
}

/// 每次写入后检查存储快照，记录各种类同时启用的 REPLACE 覆写的最大数量
pub struct AuditingStore<S> {
    inner: S,
    peaks: Mutex<HashMap<OverlayKind, usize>>,
}

impl<S: OverlayStore> AuditingStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            peaks: Mutex::new(HashMap::new()),
        }
    }

    /// 观察到的最大同时启用 REPLACE 数量
    pub fn peak_active_replace(&self, kind: OverlayKind) -> usize {
        let peaks = self.peaks.lock().unwrap();
        peaks.get(&kind).copied().unwrap_or(0)
    }

    fn audit<T>(&self, result: Result<T, StoreError>) -> Result<T, StoreError> {
        let snapshot = self.inner.list_all()?;
        let mut peaks = self.peaks.lock().unwrap();
        for kind in OverlayKind::ALL {
            let active = snapshot
                .iter()
                .filter(|o| o.kind == kind && o.is_active_replace())
                .count();
            let peak = peaks.entry(kind).or_insert(0);
            *peak = (*peak).max(active);
        }
        result
    }
}

impl<S: OverlayStore> OverlayStore for AuditingStore<S> {
    fn list_all(&self) -> Result<Vec<Overlay>, StoreError> {
        self.inner.list_all()
    }

    fn get(&self, id: u64) -> Result<Overlay, StoreError> {
        self.inner.get(id)
    }

    fn create(&self, new: NewOverlay) -> Result<Overlay, StoreError> {
        self.audit(self.inner.create(new))
    }

    fn update(&self, id: u64, patch: &OverlayPatch) -> Result<Overlay, StoreError> {
        self.audit(self.inner.update(id, patch))
    }

    fn set_enabled(&self, id: u64, enabled: bool) -> Result<Overlay, StoreError> {
        self.audit(self.inner.set_enabled(id, enabled))
    }

    fn delete(&self, id: u64) -> Result<(), StoreError> {
        self.audit(self.inner.delete(id))
    }

    fn lock_writes(&self) -> Result<WriteLock<'_>, StoreError> {
        self.inner.lock_writes()
    }
}

/// 在第一次按种类列出记录时先执行一次额外写入，模拟级联过程中另一个写者的修改
pub struct InterleavingStore<S> {
    inner: S,
    hook: Mutex<Option<Box<dyn FnOnce(&S) + Send>>>,
}

impl<S: OverlayStore> InterleavingStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            hook: Mutex::new(None),
        }
    }

    pub fn before_list(self, hook: impl FnOnce(&S) + Send + 'static) -> Self {
        *self.hook.lock().unwrap() = Some(Box::new(hook));
        self
    }
}

impl<S: OverlayStore> OverlayStore for InterleavingStore<S> {
    fn list_all(&self) -> Result<Vec<Overlay>, StoreError> {
        self.inner.list_all()
    }

    fn list_by_kind(&self, kind: OverlayKind) -> Result<Vec<Overlay>, StoreError> {
        let hook = self.hook.lock().unwrap().take();
        if let Some(hook) = hook {
            hook(&self.inner);
        }
        self.inner.list_by_kind(kind)
    }

    fn get(&self, id: u64) -> Result<Overlay, StoreError> {
        self.inner.get(id)
    }

    fn create(&self, new: NewOverlay) -> Result<Overlay, StoreError> {
        self.inner.create(new)
    }

    fn update(&self, id: u64, patch: &OverlayPatch) -> Result<Overlay, StoreError> {
        self.inner.update(id, patch)
    }

    fn set_enabled(&self, id: u64, enabled: bool) -> Result<Overlay, StoreError> {
        self.inner.set_enabled(id, enabled)
    }

    fn delete(&self, id: u64) -> Result<(), StoreError> {
        self.inner.delete(id)
    }

    fn lock_writes(&self) -> Result<WriteLock<'_>, StoreError> {
        self.inner.lock_writes()
    }
}
