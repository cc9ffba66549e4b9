//! 체크포인트 저장소 -- 재개 토큰을 보관하는 외부 협력자 인터페이스
//!
//! 키는 (소스 ID, 키) 쌍이고 값은 불투명한 바이트열입니다.
//! 이벤트 로그 수집기는 (수집기 이름, 채널 이름)에 렌더링된 북마크를 저장합니다.
//!
//! # 불변 조건
//! - 체크포인트는 해당 이벤트가 디스패처에 전달된 **이후**에만 기록됩니다.
//! - 읽기 실패는 치명적이지 않으며, 호출자는 "가장 오래된 레코드부터"로 대체합니다.
//!
//! # 구현
//! - [`MemoryCheckpointStore`]: 프로세스 내 맵
//! - [`FileCheckpointStore`]: `data_dir` 아래의 JSON 문서 (임시 파일 + rename으로 원자적 교체)
//!
//! 손상된 저장소 파일은 [`FileCheckpointStore::open_or_reset`]이 `*.corrupt`로 옮기고
//! 빈 저장소로 시작합니다.

use std::collections::{BTreeMap, HashMap};
use std::ffi::OsString;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::CheckpointError;

/// 체크포인트 키
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CheckpointKey {
    /// 소스 ID (수집기 이름 또는 버킷 이름)
    pub source: String,
    /// 소스 내 키 (채널 이름 등)
    pub key: String,
}

impl CheckpointKey {
    /// 새 키를 생성합니다.
    pub fn new(source: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for CheckpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.source, self.key)
    }
}

/// 체크포인트 저장소 trait
///
/// 구현체는 호출자를 무기한 블로킹해서는 안 됩니다.
pub trait CheckpointStore: Send + Sync {
    /// 키에 해당하는 값을 읽습니다. 키가 없으면 `Ok(None)`입니다.
    fn get(&self, key: &CheckpointKey) -> Result<Option<Vec<u8>>, CheckpointError>;

    /// 키에 값을 기록합니다.
    fn put(&self, key: &CheckpointKey, value: &[u8]) -> Result<(), CheckpointError>;
}

/// 인메모리 체크포인트 저장소
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    entries: Mutex<HashMap<CheckpointKey, Vec<u8>>>,
}

impl MemoryCheckpointStore {
    /// 빈 저장소를 생성합니다.
    pub fn new() -> Self {
        Self::default()
    }

    /// 저장된 엔트리 수를 반환합니다.
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    /// 저장소가 비어 있는지 확인합니다.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 특정 소스에 속한 모든 키를 반환합니다.
    pub fn keys_of(&self, source: &str) -> Vec<String> {
        let Ok(entries) = self.entries.lock() else {
            return Vec::new();
        };
        let mut keys: Vec<String> = entries
            .keys()
            .filter(|k| k.source == source)
            .map(|k| k.key.clone())
            .collect();
        keys.sort();
        keys
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn get(&self, key: &CheckpointKey) -> Result<Option<Vec<u8>>, CheckpointError> {
        let entries = self.entries.lock().map_err(|e| CheckpointError::Read {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        Ok(entries.get(key).cloned())
    }

    fn put(&self, key: &CheckpointKey, value: &[u8]) -> Result<(), CheckpointError> {
        let mut entries = self.entries.lock().map_err(|e| CheckpointError::Write {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        entries.insert(key.clone(), value.to_vec());
        Ok(())
    }
}

/// 손상된 저장소 파일을 옮길 때 붙이는 접미사
pub const CORRUPT_SUFFIX: &str = ".corrupt";

/// 손상된 저장소를 비우고 시작했을 때의 기록
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreReset {
    /// 손상 원인
    pub reason: String,
    /// 손상된 파일을 옮긴 경로. 옮기지 못했으면 `None`
    pub moved_to: Option<PathBuf>,
}

/// 파일 기반 체크포인트 저장소
///
/// `{ "<source>": { "<key>": [bytes...] } }` 형태의 JSON 문서 하나에 모든
/// 엔트리를 보관합니다. `put`마다 전체 문서를 임시 파일에 쓰고 rename합니다.
#[derive(Debug)]
pub struct FileCheckpointStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, BTreeMap<String, Vec<u8>>>>,
}

impl FileCheckpointStore {
    /// 저장소 파일을 열거나 새로 생성합니다.
    ///
    /// 파일이 없으면 빈 저장소로 시작합니다. 파일이 손상되었으면 에러를 반환합니다.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CheckpointError> {
        let path = path.as_ref().to_path_buf();
        let entries = match std::fs::read(&path) {
            Ok(bytes) if bytes.is_empty() => BTreeMap::new(),
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                CheckpointError::Corrupted(format!("{}: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                return Err(CheckpointError::Read {
                    key: path.display().to_string(),
                    reason: e.to_string(),
                });
            }
        };

        tracing::debug!(path = %path.display(), "checkpoint store opened");

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    /// 저장소 파일을 열고, 손상되었으면 옆으로 옮긴 뒤 빈 저장소로 시작합니다.
    ///
    /// 손상은 치명적이지 않습니다. 모든 채널이 가장 오래된 레코드부터 다시 구독됩니다.
    /// 그 외의 읽기 에러는 그대로 반환합니다.
    pub fn open_or_reset(
        path: impl AsRef<Path>,
    ) -> Result<(Self, Option<StoreReset>), CheckpointError> {
        let path = path.as_ref();
        let reason = match Self::open(path) {
            Ok(store) => return Ok((store, None)),
            Err(CheckpointError::Corrupted(reason)) => reason,
            Err(e) => return Err(e),
        };

        let target = corrupt_path(path);
        let moved_to = match std::fs::rename(path, &target) {
            Ok(()) => Some(target),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to move corrupted checkpoint store aside, it will be overwritten"
                );
                None
            }
        };
        tracing::warn!(
            path = %path.display(),
            moved_to = ?moved_to,
            reason = %reason,
            "checkpoint store corrupted, starting with no checkpoints"
        );

        let store = Self {
            path: path.to_path_buf(),
            entries: Mutex::new(BTreeMap::new()),
        };
        Ok((store, Some(StoreReset { reason, moved_to })))
    }

    /// 저장소 파일 경로를 반환합니다.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(
        &self,
        entries: &BTreeMap<String, BTreeMap<String, Vec<u8>>>,
        key: &CheckpointKey,
    ) -> Result<(), CheckpointError> {
        let write_err = |reason: String| CheckpointError::Write {
            key: key.to_string(),
            reason,
        };

        let bytes = serde_json::to_vec(entries).map_err(|e| write_err(e.to_string()))?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| write_err(e.to_string()))?;
            }
        }

        let tmp = self.path.with_extension("tmp");
        let mut file = std::fs::File::create(&tmp).map_err(|e| write_err(e.to_string()))?;
        file.write_all(&bytes)
            .and_then(|()| file.sync_all())
            .map_err(|e| write_err(e.to_string()))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| write_err(e.to_string()))
    }
}

fn corrupt_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(CORRUPT_SUFFIX);
    PathBuf::from(name)
}

impl CheckpointStore for FileCheckpointStore {
    fn get(&self, key: &CheckpointKey) -> Result<Option<Vec<u8>>, CheckpointError> {
        let entries = self.entries.lock().map_err(|e| CheckpointError::Read {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        Ok(entries
            .get(&key.source)
            .and_then(|bucket| bucket.get(&key.key))
            .cloned())
    }

    fn put(&self, key: &CheckpointKey, value: &[u8]) -> Result<(), CheckpointError> {
        let mut entries = self.entries.lock().map_err(|e| CheckpointError::Write {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        let previous = entries
            .entry(key.source.clone())
            .or_default()
            .insert(key.key.clone(), value.to_vec());

        if let Err(e) = self.persist(&entries, key) {
            // 디스크 반영에 실패하면 메모리 상태도 되돌린다
            let bucket = entries.entry(key.source.clone()).or_default();
            match previous {
                Some(old) => {
                    bucket.insert(key.key.clone(), old);
                }
                None => {
                    bucket.remove(&key.key);
                }
            }
            return Err(e);
        }
        Ok(())
    }
}
