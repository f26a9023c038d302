//! # 覆写存储
//!
//! 负责覆写记录的持久化。引擎只通过 [`OverlayStore`] 这个窄接口读写记录，
//! 默认实现 [`JsonStore`] 把所有记录保存在配置目录下的一个 JSON 文件里。
//!
//! 每个 CLI 命令都是独立进程，同一个存储文件可能被多个进程同时写入：
//! - 写入前先获取存储文件旁锁文件上的独占锁，并在锁内重新读取文件
//! - 整文件先写临时文件再 rename，读者总能看到完整的文件
//! - 排他约束的级联通过 [`OverlayStore::lock_writes`] 在整个级联期间持有该锁

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use fs4::fs_std::FileExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::model::{NewOverlay, Overlay, OverlayKind, OverlayPatch};

/// 存储层错误
#[derive(Debug, Error)]
pub enum StoreError {
    /// 读写存储文件失败
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// 存储文件格式错误
    #[error("Malformed overlay store: {0}")]
    Serde(#[from] serde_json::Error),

    /// 记录不存在
    #[error("Overlay {0} not found")]
    NotFound(u64),
}

/// 覆写存储接口
///
/// 所有列表操作按创建顺序返回。
pub trait OverlayStore: Send + Sync {
    /// 读取全部记录
    fn list_all(&self) -> Result<Vec<Overlay>, StoreError>;

    /// 读取指定种类的记录
    fn list_by_kind(&self, kind: OverlayKind) -> Result<Vec<Overlay>, StoreError> {
        Ok(self
            .list_all()?
            .into_iter()
            .filter(|o| o.kind == kind)
            .collect())
    }

    /// 读取单条记录
    fn get(&self, id: u64) -> Result<Overlay, StoreError>;

    /// 创建记录，分配 ID 和时间戳
    fn create(&self, new: NewOverlay) -> Result<Overlay, StoreError>;

    /// 更新部分字段
    fn update(&self, id: u64, patch: &OverlayPatch) -> Result<Overlay, StoreError>;

    /// 修改启用状态，其余字段保持不变
    fn set_enabled(&self, id: u64, enabled: bool) -> Result<Overlay, StoreError>;

    /// 删除记录
    fn delete(&self, id: u64) -> Result<(), StoreError>;

    /// 获取跨进程写锁，持有期间其他进程的写入会阻塞
    ///
    /// 同一进程内可重入：持锁期间本进程的写入照常进行。
    /// 不需要跨进程互斥的实现（例如纯内存存储）使用默认的空锁。
    fn lock_writes(&self) -> Result<WriteLock<'_>, StoreError> {
        Ok(WriteLock::unlocked())
    }
}

// ========================================
// 跨进程写锁
// ========================================

/// 锁文件上的独占锁
///
/// 同一进程内按持有者计数：第一个持有者加锁，最后一个持有者释放时解锁。
/// 进程内的并发由调用方的互斥锁负责，这里只负责进程之间的互斥。
struct FileLock {
    path: PathBuf,
    state: Mutex<FileLockState>,
}

#[derive(Default)]
struct FileLockState {
    file: Option<File>,
    holders: usize,
}

impl FileLock {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            state: Mutex::new(FileLockState::default()),
        }
    }

    fn acquire(&self) -> Result<WriteLock<'_>, StoreError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        if state.holders == 0 {
            let io_err = |source| StoreError::Io {
                path: self.path.clone(),
                source,
            };
            ensure_parent(&self.path).map_err(io_err)?;
            let file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&self.path)
                .map_err(io_err)?;
            FileExt::lock_exclusive(&file).map_err(io_err)?;
            log::debug!("Acquired store lock {}", self.path.display());
            state.file = Some(file);
        }

        state.holders += 1;
        Ok(WriteLock { lock: Some(self) })
    }

    fn release(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.holders = state.holders.saturating_sub(1);
        if state.holders == 0 && state.file.take().is_some() {
            // 关闭文件描述符即释放锁
            log::debug!("Released store lock {}", self.path.display());
        }
    }
}

/// 写锁的持有凭证，drop 时释放
#[must_use = "the store lock is released as soon as the guard is dropped"]
pub struct WriteLock<'a> {
    lock: Option<&'a FileLock>,
}

impl WriteLock<'_> {
    /// 不做任何互斥的空锁
    pub fn unlocked() -> Self {
        WriteLock { lock: None }
    }
}

impl Drop for WriteLock<'_> {
    fn drop(&mut self) {
        if let Some(lock) = self.lock {
            lock.release();
        }
    }
}

// ========================================
// JSON 文件存储
// ========================================

/// 存储文件的内容
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreState {
    /// 下一个可分配的 ID
    next_id: u64,
    /// 全部记录（按创建顺序）
    overlays: Vec<Overlay>,
}

impl StoreState {
    fn empty() -> Self {
        Self {
            next_id: 1,
            overlays: Vec::new(),
        }
    }

    /// 从文件读取状态，文件不存在时视为空存储
    fn load(path: &Path) -> Result<Self, StoreError> {
        if !path.exists() {
            return Ok(Self::empty());
        }

        let content = fs::read_to_string(path).map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut state: StoreState = serde_json::from_str(&content)?;
        state.overlays.sort_by_key(Overlay::creation_key);
        // 兼容手工编辑过的文件：next_id 不能落后于已有 ID
        let max_id = state.overlays.iter().map(|o| o.id).max().unwrap_or(0);
        state.next_id = state.next_id.max(max_id + 1);
        Ok(state)
    }

    fn position(&self, id: u64) -> Result<usize, StoreError> {
        self.overlays
            .iter()
            .position(|o| o.id == id)
            .ok_or(StoreError::NotFound(id))
    }
}

/// 基于 JSON 文件的覆写存储
///
/// 每次读写都以磁盘上的文件为准，其他进程的写入对下一次操作立即可见。
/// 写入在锁文件的独占锁内完成：重新读取、在副本上修改、落盘成功后才替换内存状态，
/// 因此写入失败不会留下半更新的记录，并发进程也不会互相覆盖或分配到相同的 ID。
pub struct JsonStore {
    /// 存储文件路径，`None` 表示仅在内存中保存
    path: Option<PathBuf>,
    /// 存储文件旁的锁文件（`overlays.json.lock`）
    file_lock: Option<FileLock>,
    state: Mutex<StoreState>,
}

impl JsonStore {
    /// 打开存储文件，不存在时视为空存储
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let state = StoreState::load(&path)?;

        log::debug!(
            "Loaded {} overlays from {}",
            state.overlays.len(),
            path.display()
        );

        Ok(Self {
            file_lock: Some(FileLock::new(path.with_extension("json.lock"))),
            path: Some(path),
            state: Mutex::new(state),
        })
    }

    /// 创建仅在内存中保存的存储
    #[cfg(test)]
    pub fn in_memory() -> Self {
        Self {
            path: None,
            file_lock: None,
            state: Mutex::new(StoreState::empty()),
        }
    }

    /// 获取内存状态，文件存储会先从磁盘刷新
    fn current(&self) -> Result<MutexGuard<'_, StoreState>, StoreError> {
        // 持锁线程 panic 不会留下半写的状态（写入总是先在副本上进行）
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(path) = &self.path {
            *guard = StoreState::load(path)?;
        }
        Ok(guard)
    }

    /// 在锁内读取最新状态，在副本上执行修改，落盘成功后提交
    fn write<T>(
        &self,
        mutate: impl FnOnce(&mut StoreState) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let _held = self.lock_writes()?;
        let mut guard = self.current()?;
        let mut next = guard.clone();
        let result = mutate(&mut next)?;
        self.persist(&next)?;
        *guard = next;
        Ok(result)
    }

    /// 写入临时文件后 rename，保证文件始终是完整的
    fn persist(&self, state: &StoreState) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let io_err = |source| StoreError::Io {
            path: path.clone(),
            source,
        };

        ensure_parent(path).map_err(io_err)?;
        let json = serde_json::to_string_pretty(state)?;
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, json).map_err(io_err)?;
        fs::rename(&tmp_path, path).map_err(io_err)?;
        Ok(())
    }
}

/// 创建文件所在的目录
fn ensure_parent(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() && !parent.exists() => {
            fs::create_dir_all(parent)
        }
        _ => Ok(()),
    }
}

impl OverlayStore for JsonStore {
    fn list_all(&self) -> Result<Vec<Overlay>, StoreError> {
        Ok(self.current()?.overlays.clone())
    }

    fn get(&self, id: u64) -> Result<Overlay, StoreError> {
        let state = self.current()?;
        let index = state.position(id)?;
        Ok(state.overlays[index].clone())
    }

    fn create(&self, new: NewOverlay) -> Result<Overlay, StoreError> {
        self.write(|state| {
            let now = Utc::now();
            let overlay = Overlay {
                id: state.next_id,
                kind: new.kind,
                mode: new.mode,
                name: new.name,
                category: new.category,
                content: new.content,
                enabled: new.enabled,
                created_at: now,
                updated_at: now,
                derived_proxy_groups: new.derived_proxy_groups,
            };
            state.next_id += 1;
            state.overlays.push(overlay.clone());
            Ok(overlay)
        })
    }

    fn update(&self, id: u64, patch: &OverlayPatch) -> Result<Overlay, StoreError> {
        self.write(|state| {
            let index = state.position(id)?;
            let overlay = &mut state.overlays[index];
            patch.apply_to(overlay);
            overlay.updated_at = Utc::now();
            Ok(overlay.clone())
        })
    }

    fn set_enabled(&self, id: u64, enabled: bool) -> Result<Overlay, StoreError> {
        self.write(|state| {
            let index = state.position(id)?;
            let overlay = &mut state.overlays[index];
            if overlay.enabled != enabled {
                overlay.enabled = enabled;
                overlay.updated_at = Utc::now();
            }
            Ok(overlay.clone())
        })
    }

    fn delete(&self, id: u64) -> Result<(), StoreError> {
        self.write(|state| {
            let index = state.position(id)?;
            state.overlays.remove(index);
            Ok(())
        })
    }

    fn lock_writes(&self) -> Result<WriteLock<'_>, StoreError> {
        match &self.file_lock {
            Some(lock) => lock.acquire(),
            None => Ok(WriteLock::unlocked()),
        }
    }
}
