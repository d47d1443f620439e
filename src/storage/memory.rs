// 进程内存储实现
//
// 行为与 S3 分片上传协议一致，并支持故障注入：
// - 指定分片失败若干次（或始终失败）
// - 指定 AccessKey 视为过期
// - 初始化 / 完成 / 中止请求失败
// - 篡改完成确认中的分片列表
// - 分片上传延迟

use super::{
    CompleteAck, CompletedPart, ObjectMetadata, ObjectTarget, StorageBackend, StorageError,
    StorageErrorKind,
};
use crate::credentials::Credentials;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::debug;

/// 注入的失败：错误类型与剩余次数
#[derive(Debug, Clone, Copy)]
struct InjectedFailure {
    kind: StorageErrorKind,
    remaining: u32,
}

impl InjectedFailure {
    /// 消耗一次，返回是否应当失败
    fn take(&mut self) -> Option<StorageErrorKind> {
        if self.remaining == 0 {
            return None;
        }
        if self.remaining != u32::MAX {
            self.remaining -= 1;
        }
        Some(self.kind)
    }
}

#[derive(Debug, Default)]
struct Faults {
    parts: HashMap<u32, InjectedFailure>,
    initiate: Option<InjectedFailure>,
    complete: Option<InjectedFailure>,
    abort: Option<InjectedFailure>,
    expired_keys: HashSet<String>,
    tamper_ack: bool,
    content_length_override: Option<u64>,
    hide_objects: bool,
    part_delay: Duration,
    part_delays: HashMap<u32, Duration>,
}

#[derive(Debug)]
struct PendingUpload {
    target: ObjectTarget,
    parts: BTreeMap<u32, (String, Bytes)>,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    etag: String,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_upload_id: u64,
    uploads: HashMap<String, PendingUpload>,
    objects: HashMap<ObjectTarget, StoredObject>,
    faults: Faults,
    /// 每次完成请求提交的分片序号
    complete_orders: Vec<Vec<u32>>,
    /// 各分片收到的上传请求次数
    part_attempts: HashMap<u32, usize>,
}

/// 进程内存储
#[derive(Debug, Default)]
pub struct MemoryStorage {
    state: Mutex<MemoryState>,
    initiate_calls: AtomicUsize,
    upload_part_calls: AtomicUsize,
    complete_calls: AtomicUsize,
    abort_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// 分片请求并发计数守卫，请求被取消（future 被丢弃）时同样递减
struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// 分片指纹：带引号的十六进制摘要
fn fingerprint(data: &[u8]) -> String {
    let digest = hex::encode(Sha256::digest(data));
    format!("\"{}\"", &digest[..32])
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    // ========== 故障注入 ==========

    /// 指定分片失败 `times` 次
    pub fn fail_part(&self, index: u32, kind: StorageErrorKind, times: u32) {
        self.state.lock().faults.parts.insert(
            index,
            InjectedFailure {
                kind,
                remaining: times,
            },
        );
    }

    /// 指定分片始终失败
    pub fn fail_part_always(&self, index: u32, kind: StorageErrorKind) {
        self.fail_part(index, kind, u32::MAX);
    }

    pub fn fail_initiate(&self, kind: StorageErrorKind, times: u32) {
        self.state.lock().faults.initiate = Some(InjectedFailure {
            kind,
            remaining: times,
        });
    }

    pub fn fail_complete(&self, kind: StorageErrorKind, times: u32) {
        self.state.lock().faults.complete = Some(InjectedFailure {
            kind,
            remaining: times,
        });
    }

    pub fn fail_abort(&self, kind: StorageErrorKind, times: u32) {
        self.state.lock().faults.abort = Some(InjectedFailure {
            kind,
            remaining: times,
        });
    }

    /// 使用该 AccessKey 的请求返回凭证过期
    pub fn expire_access_key(&self, access_key_id: impl Into<String>) {
        self.state
            .lock()
            .faults
            .expired_keys
            .insert(access_key_id.into());
    }

    /// 完成确认中篡改最后一个分片的指纹
    pub fn tamper_complete_ack(&self, enabled: bool) {
        self.state.lock().faults.tamper_ack = enabled;
    }

    /// 查询对象时返回指定大小
    pub fn override_content_length(&self, length: Option<u64>) {
        self.state.lock().faults.content_length_override = length;
    }

    /// 查询对象时报告对象不存在
    pub fn hide_objects(&self, enabled: bool) {
        self.state.lock().faults.hide_objects = enabled;
    }

    /// 所有分片上传的延迟
    pub fn set_part_delay(&self, delay: Duration) {
        self.state.lock().faults.part_delay = delay;
    }

    /// 单个分片上传的延迟（优先于全局延迟）
    pub fn set_part_delay_for(&self, index: u32, delay: Duration) {
        self.state.lock().faults.part_delays.insert(index, delay);
    }

    // ========== 观测 ==========

    pub fn initiate_calls(&self) -> usize {
        self.initiate_calls.load(Ordering::SeqCst)
    }

    pub fn upload_part_calls(&self) -> usize {
        self.upload_part_calls.load(Ordering::SeqCst)
    }

    pub fn complete_calls(&self) -> usize {
        self.complete_calls.load(Ordering::SeqCst)
    }

    pub fn abort_calls(&self) -> usize {
        self.abort_calls.load(Ordering::SeqCst)
    }

    /// 观测到的最大并发分片请求数
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// 每次完成请求提交的分片序号（按调用顺序）
    pub fn complete_orders(&self) -> Vec<Vec<u32>> {
        self.state.lock().complete_orders.clone()
    }

    /// 某个分片收到的上传请求次数（含失败）
    pub fn part_attempts(&self, index: u32) -> usize {
        self.state
            .lock()
            .part_attempts
            .get(&index)
            .copied()
            .unwrap_or(0)
    }

    /// 未完成也未中止的上传数量
    pub fn active_uploads(&self) -> usize {
        self.state.lock().uploads.len()
    }

    /// 已合并对象的内容
    pub fn object(&self, target: &ObjectTarget) -> Option<Bytes> {
        self.state
            .lock()
            .objects
            .get(target)
            .map(|obj| obj.data.clone())
    }

    fn check_credentials(state: &MemoryState, credentials: &Credentials) -> Result<(), StorageError> {
        if state.faults.expired_keys.contains(&credentials.access_key_id) {
            return Err(StorageError::new(
                StorageErrorKind::CredentialsExpired,
                format!(
                    "ExpiredToken: access key {} has expired",
                    credentials.access_key_id
                ),
            ));
        }
        Ok(())
    }

    fn no_such_upload(upload_id: &str) -> StorageError {
        StorageError::new(
            StorageErrorKind::NotFound,
            format!("NoSuchUpload: {}", upload_id),
        )
    }
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    async fn initiate_upload(
        &self,
        target: &ObjectTarget,
        credentials: &Credentials,
    ) -> Result<String, StorageError> {
        self.initiate_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();

        Self::check_credentials(&state, credentials)?;
        if let Some(kind) = state.faults.initiate.as_mut().and_then(|f| f.take()) {
            return Err(StorageError::new(kind, "injected initiate failure"));
        }

        state.next_upload_id += 1;
        let upload_id = format!("mem-upload-{}", state.next_upload_id);
        state.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                target: target.clone(),
                parts: BTreeMap::new(),
            },
        );

        debug!("内存存储: 初始化上传 {} -> {}", target, upload_id);
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        _target: &ObjectTarget,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
        credentials: &Credentials,
    ) -> Result<String, StorageError> {
        self.upload_part_calls.fetch_add(1, Ordering::SeqCst);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlightGuard(&self.in_flight);
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        let delay = {
            let state = self.state.lock();
            state
                .faults
                .part_delays
                .get(&part_number)
                .copied()
                .unwrap_or(state.faults.part_delay)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        *state.part_attempts.entry(part_number).or_insert(0) += 1;
        Self::check_credentials(&state, credentials)?;
        if let Some(kind) = state
            .faults
            .parts
            .get_mut(&part_number)
            .and_then(|f| f.take())
        {
            return Err(StorageError::new(
                kind,
                format!("injected failure for part {}", part_number),
            ));
        }

        let upload = state
            .uploads
            .get_mut(upload_id)
            .ok_or_else(|| Self::no_such_upload(upload_id))?;
        let etag = fingerprint(&body);
        upload.parts.insert(part_number, (etag.clone(), body));

        Ok(etag)
    }

    async fn complete_upload(
        &self,
        _target: &ObjectTarget,
        upload_id: &str,
        parts: &[CompletedPart],
        credentials: &Credentials,
    ) -> Result<CompleteAck, StorageError> {
        self.complete_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();

        Self::check_credentials(&state, credentials)?;
        if let Some(kind) = state.faults.complete.as_mut().and_then(|f| f.take()) {
            return Err(StorageError::new(kind, "injected complete failure"));
        }
        state
            .complete_orders
            .push(parts.iter().map(|p| p.index).collect());

        if parts.windows(2).any(|w| w[0].index >= w[1].index) {
            return Err(StorageError::new(
                StorageErrorKind::BadRequest,
                "InvalidPartOrder: part list is not in ascending order",
            ));
        }

        let upload = state
            .uploads
            .get(upload_id)
            .ok_or_else(|| Self::no_such_upload(upload_id))?;

        let mut data = BytesMut::new();
        for part in parts {
            match upload.parts.get(&part.index) {
                Some((etag, body)) if *etag == part.fingerprint => data.extend_from_slice(body),
                _ => {
                    return Err(StorageError::new(
                        StorageErrorKind::BadRequest,
                        format!("InvalidPart: part {} not found or etag mismatch", part.index),
                    ))
                }
            }
        }

        // 确认中的分片列表取自服务端记录
        let mut acked: Vec<CompletedPart> = upload
            .parts
            .iter()
            .map(|(index, (etag, _))| CompletedPart {
                index: *index,
                fingerprint: etag.clone(),
            })
            .collect();
        if state.faults.tamper_ack {
            if let Some(last) = acked.last_mut() {
                last.fingerprint = "\"tampered\"".to_string();
            }
        }

        let joined: String = parts.iter().map(|p| p.fingerprint.as_str()).collect();
        let etag = format!("\"{}-{}\"", &hex::encode(Sha256::digest(joined.as_bytes()))[..32], parts.len());

        if let Some(upload) = state.uploads.remove(upload_id) {
            state.objects.insert(
                upload.target,
                StoredObject {
                    data: data.freeze(),
                    etag: etag.clone(),
                },
            );
        }

        Ok(CompleteAck {
            parts: acked,
            etag: Some(etag),
        })
    }

    async fn abort_upload(
        &self,
        _target: &ObjectTarget,
        upload_id: &str,
        credentials: &Credentials,
    ) -> Result<(), StorageError> {
        self.abort_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();

        Self::check_credentials(&state, credentials)?;
        if let Some(kind) = state.faults.abort.as_mut().and_then(|f| f.take()) {
            return Err(StorageError::new(kind, "injected abort failure"));
        }

        // 已不存在的上传视为已中止
        state.uploads.remove(upload_id);
        Ok(())
    }

    async fn head_object(
        &self,
        target: &ObjectTarget,
        credentials: &Credentials,
    ) -> Result<Option<ObjectMetadata>, StorageError> {
        let state = self.state.lock();
        Self::check_credentials(&state, credentials)?;

        let obj = state
            .objects
            .get(target)
            .filter(|_| !state.faults.hide_objects)
            .ok_or_else(|| {
                StorageError::new(StorageErrorKind::NotFound, format!("对象不存在: {}", target))
            })?;
        Ok(Some(ObjectMetadata {
            etag: Some(obj.etag.clone()),
            content_length: state
                .faults
                .content_length_override
                .unwrap_or(obj.data.len() as u64),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> Credentials {
        Credentials::new("AK", "SK")
    }

    #[tokio::test]
    async fn test_multipart_roundtrip() {
        let storage = MemoryStorage::new();
        let target = ObjectTarget::new("bucket", "file.bin");

        let upload_id = storage.initiate_upload(&target, &creds()).await.unwrap();
        let e1 = storage
            .upload_part(&target, &upload_id, 1, Bytes::from_static(b"hello "), &creds())
            .await
            .unwrap();
        let e2 = storage
            .upload_part(&target, &upload_id, 2, Bytes::from_static(b"world"), &creds())
            .await
            .unwrap();

        let parts = vec![
            CompletedPart { index: 1, fingerprint: e1 },
            CompletedPart { index: 2, fingerprint: e2 },
        ];
        let ack = storage
            .complete_upload(&target, &upload_id, &parts, &creds())
            .await
            .unwrap();

        assert_eq!(ack.parts, parts);
        assert!(ack.etag.unwrap().ends_with("-2\""));
        assert_eq!(storage.object(&target).unwrap(), Bytes::from_static(b"hello world"));
        assert_eq!(storage.active_uploads(), 0);

        let meta = storage.head_object(&target, &creds()).await.unwrap().unwrap();
        assert_eq!(meta.content_length, 11);
    }

    #[tokio::test]
    async fn test_head_missing_object_is_not_found() {
        let storage = MemoryStorage::new();
        let target = ObjectTarget::new("bucket", "missing.bin");

        let err = storage.head_object(&target, &creds()).await.unwrap_err();
        assert_eq!(err.kind, StorageErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_injected_part_failures() {
        let storage = MemoryStorage::new();
        let target = ObjectTarget::new("bucket", "file.bin");
        let upload_id = storage.initiate_upload(&target, &creds()).await.unwrap();

        storage.fail_part(1, StorageErrorKind::ServerError, 2);
        for _ in 0..2 {
            let err = storage
                .upload_part(&target, &upload_id, 1, Bytes::from_static(b"x"), &creds())
                .await
                .unwrap_err();
            assert_eq!(err.kind, StorageErrorKind::ServerError);
        }
        assert!(storage
            .upload_part(&target, &upload_id, 1, Bytes::from_static(b"x"), &creds())
            .await
            .is_ok());
        assert_eq!(storage.upload_part_calls(), 3);
    }

    #[tokio::test]
    async fn test_expired_key_rejected() {
        let storage = MemoryStorage::new();
        let target = ObjectTarget::new("bucket", "file.bin");
        storage.expire_access_key("AK");

        let err = storage.initiate_upload(&target, &creds()).await.unwrap_err();
        assert!(err.is_credentials_expired());

        let fresh = Credentials::new("AK2", "SK");
        assert!(storage.initiate_upload(&target, &fresh).await.is_ok());
    }

    #[tokio::test]
    async fn test_complete_rejects_unordered_parts() {
        let storage = MemoryStorage::new();
        let target = ObjectTarget::new("bucket", "file.bin");
        let upload_id = storage.initiate_upload(&target, &creds()).await.unwrap();
        let e1 = storage
            .upload_part(&target, &upload_id, 1, Bytes::from_static(b"a"), &creds())
            .await
            .unwrap();
        let e2 = storage
            .upload_part(&target, &upload_id, 2, Bytes::from_static(b"b"), &creds())
            .await
            .unwrap();

        let parts = vec![
            CompletedPart { index: 2, fingerprint: e2 },
            CompletedPart { index: 1, fingerprint: e1 },
        ];
        let err = storage
            .complete_upload(&target, &upload_id, &parts, &creds())
            .await
            .unwrap_err();
        assert_eq!(err.kind, StorageErrorKind::BadRequest);
        assert_eq!(storage.complete_orders(), vec![vec![2, 1]]);
    }

    #[tokio::test]
    async fn test_abort_is_idempotent() {
        let storage = MemoryStorage::new();
        let target = ObjectTarget::new("bucket", "file.bin");
        let upload_id = storage.initiate_upload(&target, &creds()).await.unwrap();

        storage.abort_upload(&target, &upload_id, &creds()).await.unwrap();
        storage.abort_upload(&target, &upload_id, &creds()).await.unwrap();

        assert_eq!(storage.abort_calls(), 2);
        assert_eq!(storage.active_uploads(), 0);
        let err = storage
            .upload_part(&target, &upload_id, 1, Bytes::from_static(b"x"), &creds())
            .await
            .unwrap_err();
        assert_eq!(err.kind, StorageErrorKind::NotFound);
    }
}
