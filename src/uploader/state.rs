// 上传会话状态机
//
// 状态流转：
//   Initiated → InProgress → Finalizing → Completed
//                  │              │
//                  ├→ Aborted     └→ Failed
//                  └→ Failed（中止请求本身失败）
//
// 会话只由协调器的控制循环修改，分片任务通过结果通道上报，不直接访问。

use super::part::PartResult;
use super::plan::UploadPlan;
use crate::error::{Result, UploadError};
use crate::storage::{CompleteAck, CompletedPart};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// 上传状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    /// 服务端已创建上传
    Initiated,
    /// 分片上传中
    InProgress,
    /// 提交完成请求中
    Finalizing,
    /// 已完成
    Completed,
    /// 已中止
    Aborted,
    /// 失败
    Failed,
}

impl UploadStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UploadStatus::Completed | UploadStatus::Aborted | UploadStatus::Failed
        )
    }

    /// 是否允许流转到 `next`
    pub fn can_transition_to(&self, next: UploadStatus) -> bool {
        use UploadStatus::*;
        matches!(
            (self, next),
            (Initiated, InProgress)
                | (InProgress, Finalizing)
                | (InProgress, Aborted)
                | (InProgress, Failed)
                | (Finalizing, Completed)
                | (Finalizing, Failed)
        )
    }
}

impl std::fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            UploadStatus::Initiated => "initiated",
            UploadStatus::InProgress => "inprogress",
            UploadStatus::Finalizing => "finalizing",
            UploadStatus::Completed => "completed",
            UploadStatus::Aborted => "aborted",
            UploadStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// 单次分片上传的会话状态
#[derive(Debug)]
pub struct UploadSession {
    upload_id: String,
    status: UploadStatus,
    /// 已完成分片（按序号有序）
    completed_parts: BTreeMap<u32, PartResult>,
    /// 未完成分片（含上传中的）
    pending_parts: BTreeSet<u32>,
    /// 上传中的分片
    in_flight: BTreeSet<u32>,
    parts_total: u32,
    bytes_total: u64,
    bytes_completed: u64,
    abort_requested: bool,
    finalize_requested: bool,
}

impl UploadSession {
    /// 服务端确认创建后建立会话
    pub fn new(upload_id: impl Into<String>, plan: &UploadPlan) -> Self {
        Self {
            upload_id: upload_id.into(),
            status: UploadStatus::Initiated,
            completed_parts: BTreeMap::new(),
            pending_parts: plan.parts.iter().map(|p| p.index).collect(),
            in_flight: BTreeSet::new(),
            parts_total: plan.part_count(),
            bytes_total: plan.total_size,
            bytes_completed: 0,
            abort_requested: false,
            finalize_requested: false,
        }
    }

    pub fn upload_id(&self) -> &str {
        &self.upload_id
    }

    pub fn status(&self) -> UploadStatus {
        self.status
    }

    pub fn parts_total(&self) -> u32 {
        self.parts_total
    }

    pub fn parts_completed(&self) -> u32 {
        self.completed_parts.len() as u32
    }

    pub fn bytes_total(&self) -> u64 {
        self.bytes_total
    }

    pub fn bytes_completed(&self) -> u64 {
        self.bytes_completed
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// 状态流转，非法流转返回内部错误
    pub fn transition(&mut self, next: UploadStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(UploadError::Internal(format!(
                "非法状态流转: {} -> {} (uploadId={})",
                self.status, next, self.upload_id
            )));
        }
        self.status = next;
        Ok(())
    }

    /// 下一个可调度的分片（未完成且未在上传中，序号最小）
    pub fn next_dispatchable(&self) -> Option<u32> {
        if self.status != UploadStatus::InProgress || self.abort_requested {
            return None;
        }
        self.pending_parts
            .iter()
            .find(|index| !self.in_flight.contains(*index))
            .copied()
    }

    pub fn mark_dispatched(&mut self, index: u32) {
        self.in_flight.insert(index);
    }

    /// 记录分片完成，返回是否为新完成的分片
    pub fn record_completion(&mut self, result: PartResult) -> bool {
        self.in_flight.remove(&result.index);
        if !self.pending_parts.remove(&result.index) {
            return false;
        }
        self.bytes_completed += result.size_bytes;
        self.completed_parts.insert(result.index, result);
        true
    }

    /// 分片失败或被取消，释放上传中标记
    pub fn release(&mut self, index: u32) {
        self.in_flight.remove(&index);
    }

    /// 所有计划中的分片都已完成
    pub fn all_parts_completed(&self) -> bool {
        self.pending_parts.is_empty()
    }

    /// 完成请求使用的分片列表（按序号升序）
    pub fn completed_part_list(&self) -> Vec<CompletedPart> {
        self.completed_parts
            .values()
            .map(|part| CompletedPart {
                index: part.index,
                fingerprint: part.fingerprint.clone(),
            })
            .collect()
    }

    /// 校验完成确认与本地记录完全一致
    pub fn verify_ack(&self, ack: &CompleteAck) -> Result<()> {
        let expected = self.completed_part_list();
        if ack.parts.len() != expected.len() {
            return Err(UploadError::Consistency(format!(
                "服务端确认 {} 个分片，本地已完成 {} 个",
                ack.parts.len(),
                expected.len()
            )));
        }

        for (local, remote) in expected.iter().zip(ack.parts.iter()) {
            if local != remote {
                return Err(UploadError::Consistency(format!(
                    "分片不一致: 本地 #{} {}，服务端 #{} {}",
                    local.index, local.fingerprint, remote.index, remote.fingerprint
                )));
            }
        }
        Ok(())
    }

    /// 标记开始中止，只有第一次调用返回 true
    pub fn begin_abort(&mut self) -> bool {
        !std::mem::replace(&mut self.abort_requested, true)
    }

    /// 标记开始提交完成请求，只有第一次调用返回 true
    pub fn begin_finalize(&mut self) -> bool {
        !std::mem::replace(&mut self.finalize_requested, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uploader::plan::plan;

    fn session() -> UploadSession {
        // 10 字节，4 字节一片 → 3 个分片
        let plan = plan(10, 4, 4, 10).unwrap();
        UploadSession::new("upload-1", &plan)
    }

    fn result(index: u32, size: u64) -> PartResult {
        PartResult {
            index,
            fingerprint: format!("\"etag-{}\"", index),
            size_bytes: size,
        }
    }

    #[test]
    fn test_status_transitions() {
        use UploadStatus::*;
        assert!(Initiated.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Finalizing));
        assert!(InProgress.can_transition_to(Aborted));
        assert!(Finalizing.can_transition_to(Completed));
        assert!(Finalizing.can_transition_to(Failed));

        assert!(!Initiated.can_transition_to(Completed));
        assert!(!Finalizing.can_transition_to(Aborted));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Aborted.can_transition_to(InProgress));

        assert!(Completed.is_terminal());
        assert!(Aborted.is_terminal());
        assert!(Failed.is_terminal());
        assert!(!Finalizing.is_terminal());
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(
            serde_json::to_string(&UploadStatus::InProgress).unwrap(),
            "\"inprogress\""
        );
        assert_eq!(UploadStatus::Aborted.to_string(), "aborted");
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let mut session = session();
        let err = session.transition(UploadStatus::Completed).unwrap_err();
        assert!(matches!(err, UploadError::Internal(_)));
        assert_eq!(session.status(), UploadStatus::Initiated);
    }

    #[test]
    fn test_dispatch_and_out_of_order_completion() {
        let mut session = session();
        // 未进入 InProgress 前不调度
        assert_eq!(session.next_dispatchable(), None);
        session.transition(UploadStatus::InProgress).unwrap();

        assert_eq!(session.next_dispatchable(), Some(1));
        session.mark_dispatched(1);
        assert_eq!(session.next_dispatchable(), Some(2));
        session.mark_dispatched(2);
        session.mark_dispatched(3);
        assert_eq!(session.next_dispatchable(), None);
        assert_eq!(session.in_flight_count(), 3);

        assert!(session.record_completion(result(3, 2)));
        assert!(session.record_completion(result(1, 4)));
        assert!(!session.all_parts_completed());
        assert!(session.record_completion(result(2, 4)));
        assert!(session.all_parts_completed());

        // 重复上报不重复计数
        assert!(!session.record_completion(result(2, 4)));
        assert_eq!(session.bytes_completed(), 10);
        assert_eq!(session.parts_completed(), 3);

        let indexes: Vec<u32> = session.completed_part_list().iter().map(|p| p.index).collect();
        assert_eq!(indexes, vec![1, 2, 3]);
    }

    #[test]
    fn test_released_part_is_redispatched() {
        let mut session = session();
        session.transition(UploadStatus::InProgress).unwrap();
        session.mark_dispatched(1);
        session.release(1);
        assert_eq!(session.next_dispatchable(), Some(1));
    }

    #[test]
    fn test_no_dispatch_after_abort() {
        let mut session = session();
        session.transition(UploadStatus::InProgress).unwrap();
        assert!(session.begin_abort());
        assert!(!session.begin_abort());
        assert_eq!(session.next_dispatchable(), None);
    }

    #[test]
    fn test_verify_ack() {
        let mut session = session();
        session.transition(UploadStatus::InProgress).unwrap();
        for (index, size) in [(1, 4), (2, 4), (3, 2)] {
            session.mark_dispatched(index);
            session.record_completion(result(index, size));
        }

        let good = CompleteAck {
            parts: session.completed_part_list(),
            etag: None,
        };
        assert!(session.verify_ack(&good).is_ok());

        let mut tampered = good.clone();
        tampered.parts[1].fingerprint = "\"other\"".to_string();
        assert!(matches!(
            session.verify_ack(&tampered),
            Err(UploadError::Consistency(_))
        ));

        let mut missing = good.clone();
        missing.parts.pop();
        assert!(matches!(
            session.verify_ack(&missing),
            Err(UploadError::Consistency(_))
        ));
    }
}
