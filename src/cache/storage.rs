use crate::error::AppError;
use crate::upstream::UpstreamResponse;
use async_trait::async_trait;
use axum::body::Bytes;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use moka::future::Cache;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

/// 缓存条目：上游原始形态的响应（未做 Link 改写）。
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl From<&UpstreamResponse> for CachedResponse {
    fn from(resp: &UpstreamResponse) -> Self {
        Self {
            status: resp.status,
            headers: resp.headers.clone(),
            body: resp.body.clone(),
        }
    }
}

impl From<CachedResponse> for UpstreamResponse {
    fn from(c: CachedResponse) -> Self {
        Self {
            status: c.status,
            headers: c.headers,
            body: c.body,
        }
    }
}

#[async_trait]
pub trait Storage: Send + Sync {
    async fn lookup(&self, key: &str) -> Result<Option<CachedResponse>, AppError>;
    async fn store(&self, key: &str, entry: &CachedResponse) -> Result<(), AppError>;
}

/// 进程内缓存，按条目数限容。
#[derive(Clone, Debug)]
pub struct MemoryStorage {
    entries: Cache<String, Arc<CachedResponse>>,
}

impl MemoryStorage {
    pub fn new(capacity: u64) -> Self {
        Self {
            entries: Cache::new(capacity.max(1)),
        }
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn lookup(&self, key: &str) -> Result<Option<CachedResponse>, AppError> {
        Ok(self.entries.get(key).await.map(|e| e.as_ref().clone()))
    }

    async fn store(&self, key: &str, entry: &CachedResponse) -> Result<(), AppError> {
        self.entries
            .insert(key.to_string(), Arc::new(entry.clone()))
            .await;
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct FileRecord {
    status: u16,
    headers: Vec<(String, String)>,
    /// base64
    body: String,
}

/// 每个条目一个 JSON 文件；写入先落临时文件再 rename，读到的总是完整条目。
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn lookup(&self, key: &str) -> Result<Option<CachedResponse>, AppError> {
        let data = match tokio::fs::read(self.path_for(key)).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(AppError::cache(format!("读取缓存文件失败: {e}"))),
        };

        let record: FileRecord = sonic_rs::from_slice(&data)
            .map_err(|e| AppError::cache(format!("缓存文件损坏 {key}: {e}")))?;
        let status = StatusCode::from_u16(record.status)
            .map_err(|e| AppError::cache(format!("缓存状态码无效 {key}: {e}")))?;
        let body = STANDARD
            .decode(record.body.as_bytes())
            .map_err(|e| AppError::cache(format!("缓存内容无效 {key}: {e}")))?;

        let mut headers = HeaderMap::with_capacity(record.headers.len());
        for (name, value) in record.headers {
            let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(&value),
            ) else {
                continue;
            };
            headers.append(name, value);
        }

        Ok(Some(CachedResponse {
            status,
            headers,
            body: Bytes::from(body),
        }))
    }

    async fn store(&self, key: &str, entry: &CachedResponse) -> Result<(), AppError> {
        let record = FileRecord {
            status: entry.status.as_u16(),
            headers: entry
                .headers
                .iter()
                .filter_map(|(k, v)| Some((k.as_str().to_string(), v.to_str().ok()?.to_string())))
                .collect(),
            body: STANDARD.encode(&entry.body),
        };
        let data = sonic_rs::to_vec(&record)
            .map_err(|e| AppError::cache(format!("序列化缓存条目失败: {e}")))?;

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| AppError::cache(format!("创建缓存目录失败: {e}")))?;

        let tmp = self.dir.join(format!(".{key}.{}.tmp", uuid::Uuid::new_v4()));
        if let Err(e) = tokio::fs::write(&tmp, &data).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(AppError::cache(format!("写入缓存文件失败: {e}")));
        }
        tokio::fs::rename(&tmp, self.path_for(key))
            .await
            .map_err(|e| AppError::cache(format!("替换缓存文件失败: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> CachedResponse {
        let mut headers = HeaderMap::new();
        headers.insert("etag", HeaderValue::from_static("W/\"abc\""));
        headers.append("link", HeaderValue::from_static("<https://api.github.com/x?page=2>; rel=\"next\""));
        CachedResponse {
            status: StatusCode::OK,
            headers,
            body: Bytes::from_static(b"\x00binary\xffbody"),
        }
    }

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("ghproxy-cache-{}", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn memory_storage_returns_stored_entry() {
        let storage = MemoryStorage::new(16);
        assert_eq!(storage.lookup("k").await.unwrap(), None);
        storage.store("k", &entry()).await.unwrap();
        assert_eq!(storage.lookup("k").await.unwrap(), Some(entry()));
    }

    #[tokio::test]
    async fn file_storage_persists_across_instances() {
        let dir = temp_dir();
        FileStorage::new(&dir).store("abc", &entry()).await.unwrap();

        let reopened = FileStorage::new(&dir);
        assert_eq!(reopened.lookup("abc").await.unwrap(), Some(entry()));
        assert_eq!(reopened.lookup("missing").await.unwrap(), None);

        // 目录里只留下正式文件，没有临时文件。
        let mut names = Vec::new();
        let mut rd = tokio::fs::read_dir(&dir).await.unwrap();
        while let Some(de) = rd.next_entry().await.unwrap() {
            names.push(de.file_name().to_string_lossy().to_string());
        }
        assert_eq!(names, vec!["abc.json"]);
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn corrupt_file_is_an_error() {
        let dir = temp_dir();
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.join("bad.json"), b"{not json").await.unwrap();
        let err = FileStorage::new(&dir).lookup("bad").await.unwrap_err();
        assert!(matches!(err, AppError::Cache(_)));
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
