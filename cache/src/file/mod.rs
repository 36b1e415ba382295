/**
 * 文件快照存储
 *
 * 每个 ServiceKey 一个文件，内容是实例列表的 JSON 数组。
 * 写入先落到同目录下的临时文件再 rename，其他进程不会读到写了一半的文件。
 * 同一个键在进程内最多从磁盘读取一次，除非显式 invalidate。
 */
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

use common::error::Error;
use common::service_register_center::typos::{Service, ServiceKey};

use crate::SnapshotStore;

/// 快照文件扩展名
const SNAPSHOT_EXT: &str = "json";

#[derive(Debug)]
pub struct FileStore {
    /// 缓存目录
    dir: PathBuf,
    /// 已加载的快照，None 表示磁盘上没有该键的文件
    loaded: DashMap<String, Option<Vec<Service>>>,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            loaded: DashMap::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// 键对应的文件路径，文件名中不安全的字符替换为下划线
    pub fn path_for(&self, key: &ServiceKey) -> PathBuf {
        let name: String = key
            .cache_key()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || "-_.@#,=".contains(c) {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{}.{}", name, SNAPSHOT_EXT))
    }

    async fn read_file(path: &Path) -> Result<Option<Vec<Service>>, Error> {
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let services: Vec<Service> = serde_json::from_slice(&bytes)?;
        Ok(Some(services))
    }
}

#[async_trait]
impl SnapshotStore for FileStore {
    async fn load(&self, key: &ServiceKey) -> Result<Option<Vec<Service>>, Error> {
        let cache_key = key.cache_key();
        if let Some(entry) = self.loaded.get(&cache_key) {
            return Ok(entry.value().clone());
        }

        let path = self.path_for(key);
        let services = match Self::read_file(&path).await {
            Ok(services) => services,
            Err(e) => {
                // 损坏的文件不记入已加载，修复后可以再次读取
                warn!("Failed to read snapshot {}: {}", path.display(), e);
                return Err(e);
            }
        };
        debug!(
            "Loaded snapshot {} ({} instances)",
            path.display(),
            services.as_ref().map_or(0, Vec::len)
        );
        self.loaded.insert(cache_key, services.clone());
        Ok(services)
    }

    async fn store(&self, key: &ServiceKey, services: &[Service]) -> Result<(), Error> {
        fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(key);
        let tmp = self.dir.join(format!(".{}.tmp", Uuid::new_v4()));

        let bytes = serde_json::to_vec(services)?;
        fs::write(&tmp, &bytes).await?;
        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        self.loaded.insert(key.cache_key(), Some(services.to_vec()));
        debug!("Stored snapshot {} ({} instances)", path.display(), services.len());
        Ok(())
    }

    async fn invalidate(&self, key: &ServiceKey) -> Result<(), Error> {
        self.loaded.remove(&key.cache_key());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ServiceKey {
        ServiceKey::new("user", "http", "prod").with_tags(["zone=a/b"])
    }

    #[tokio::test]
    async fn store_then_load_from_fresh_store() {
        let dir = tempfile::tempdir().unwrap();
        let services = vec![
            Service::new("user-http-prod", "10.0.0.1", 8080).with_weight(20),
            Service::new("user-http-prod", "10.0.0.2", 8080),
        ];

        FileStore::new(dir.path()).store(&key(), &services).await.unwrap();

        let store = FileStore::new(dir.path());
        let loaded = store.load(&key()).await.unwrap().unwrap();
        assert_eq!(loaded, services);
        // 文件名里的斜杠被替换
        let path = store.path_for(&key());
        assert!(path.file_name().unwrap().to_str().unwrap().contains("zone=a_b"));
        // 没有残留的临时文件
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn load_reads_disk_at_most_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        assert_eq!(store.load(&key()).await.unwrap(), None);

        // 其他进程写入的文件在 invalidate 之前不可见
        FileStore::new(dir.path())
            .store(&key(), &[Service::new("user", "10.0.0.3", 80)])
            .await
            .unwrap();
        assert_eq!(store.load(&key()).await.unwrap(), None);

        store.invalidate(&key()).await.unwrap();
        let loaded = store.load(&key()).await.unwrap().unwrap();
        assert_eq!(loaded[0].ip, "10.0.0.3");
    }

    #[tokio::test]
    async fn corrupted_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        std::fs::write(store.path_for(&key()), b"{not json").unwrap();
        assert!(matches!(store.load(&key()).await, Err(Error::Json(_))));
    }
}
