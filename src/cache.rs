use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use flate2::Crc;
use log::warn;

use crate::{exception::Exception, param::HASH_TOKEN_LEN};

/// 计算文件内容的指纹：整个文件的 CRC-32，取 `{:04x}` 表示的前 4 位。
pub fn hash_of(path: &Path) -> Result<String, Exception> {
    let content = fs::read(path)?;
    Ok(hash_bytes(&content))
}

pub fn hash_bytes(content: &[u8]) -> String {
    let mut crc = Crc::new();
    crc.update(content);
    let hex = format!("{:04x}", crc.sum());
    hex[..HASH_TOKEN_LEN].to_string()
}

/// 公开 URL 到内容指纹的映射。
///
/// 整张表由一把读写锁保护；文件读取和哈希计算都在锁外完成，
/// 只有发布结果时才短暂持有写锁。条目归属哪个挂载点由调用方判断。
pub struct HashCache {
    entries: RwLock<HashMap<String, String>>,
}

impl HashCache {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    // 锁被污染时恢复并继续，表里只有可重新计算的指纹
    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, String>> {
        match self.entries.read() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("指纹缓存读锁被污染，恢复并继续");
                poisoned.into_inner()
            }
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, String>> {
        match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("指纹缓存写锁被污染，恢复并继续");
                poisoned.into_inner()
            }
        }
    }

    /// 查询已缓存的指纹
    pub fn resolve(&self, url: &str) -> Option<String> {
        self.read().get(url).cloned()
    }

    pub fn publish(&self, url: &str, hash: String) {
        self.write().insert(url.to_string(), hash);
    }

    pub fn remove(&self, url: &str) -> Option<String> {
        self.write().remove(url)
    }

    /// 只保留满足条件的条目
    pub fn retain(&self, mut keep: impl FnMut(&str) -> bool) {
        self.write().retain(|url, _| keep(url));
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

impl Default for HashCache {
    fn default() -> Self {
        Self::new()
    }
}
