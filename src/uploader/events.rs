// 上传事件与进度
//
// - 进度快照通过 watch 通道发布，调用方随时读取最新值
// - 事件通过无界 mpsc 通道发布：初始化、每个分片完成后的进度、唯一的终态事件

use super::plan::UploadPlan;
use super::state::{UploadSession, UploadStatus};
use crate::error::UploadError;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::warn;

/// 进度快照
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferProgress {
    pub bytes_completed: u64,
    pub bytes_total: u64,
    pub parts_completed: u32,
    pub parts_total: u32,
    pub status: UploadStatus,
}

impl TransferProgress {
    /// 上传开始前的快照
    pub fn initial(plan: &UploadPlan) -> Self {
        Self {
            bytes_completed: 0,
            bytes_total: plan.total_size,
            parts_completed: 0,
            parts_total: plan.part_count(),
            status: UploadStatus::Initiated,
        }
    }

    /// 完成百分比
    pub fn percent(&self) -> f64 {
        if self.bytes_total == 0 {
            if self.parts_total > 0 && self.parts_completed == self.parts_total {
                return 100.0;
            }
            return 0.0;
        }
        self.bytes_completed as f64 / self.bytes_total as f64 * 100.0
    }
}

/// 上传事件
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum UploadEvent {
    /// 服务端已创建上传
    Initiated {
        transfer_id: String,
        upload_id: String,
        parts_total: u32,
        bytes_total: u64,
    },
    /// 分片完成后的进度
    Progress {
        transfer_id: String,
        bytes_completed: u64,
        bytes_total: u64,
        parts_completed: u32,
        parts_total: u32,
    },
    /// 终态（每次传输只发一次）
    Terminal {
        transfer_id: String,
        status: UploadStatus,
        upload_id: Option<String>,
        error: Option<String>,
    },
}

impl UploadEvent {
    pub fn transfer_id(&self) -> &str {
        match self {
            UploadEvent::Initiated { transfer_id, .. } => transfer_id,
            UploadEvent::Progress { transfer_id, .. } => transfer_id,
            UploadEvent::Terminal { transfer_id, .. } => transfer_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, UploadEvent::Terminal { .. })
    }
}

/// 进度与事件发布器（由协调器独占）
pub(crate) struct ProgressReporter {
    transfer_id: String,
    progress_tx: watch::Sender<TransferProgress>,
    event_tx: mpsc::UnboundedSender<UploadEvent>,
    terminal_sent: bool,
}

impl ProgressReporter {
    pub fn new(
        transfer_id: impl Into<String>,
        initial: TransferProgress,
    ) -> (
        Self,
        watch::Receiver<TransferProgress>,
        mpsc::UnboundedReceiver<UploadEvent>,
    ) {
        let (progress_tx, progress_rx) = watch::channel(initial);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let reporter = Self {
            transfer_id: transfer_id.into(),
            progress_tx,
            event_tx,
            terminal_sent: false,
        };
        (reporter, progress_rx, event_rx)
    }

    fn emit(&self, event: UploadEvent) {
        // 接收端已关闭时忽略
        let _ = self.event_tx.send(event);
    }

    fn publish(&self, session: &UploadSession) {
        self.progress_tx.send_replace(TransferProgress {
            bytes_completed: session.bytes_completed(),
            bytes_total: session.bytes_total(),
            parts_completed: session.parts_completed(),
            parts_total: session.parts_total(),
            status: session.status(),
        });
    }

    pub fn initiated(&self, session: &UploadSession) {
        self.publish(session);
        self.emit(UploadEvent::Initiated {
            transfer_id: self.transfer_id.clone(),
            upload_id: session.upload_id().to_string(),
            parts_total: session.parts_total(),
            bytes_total: session.bytes_total(),
        });
    }

    /// 状态变化，只更新快照
    pub fn status_changed(&self, session: &UploadSession) {
        self.publish(session);
    }

    /// 分片完成
    pub fn part_completed(&self, session: &UploadSession) {
        self.publish(session);
        self.emit(UploadEvent::Progress {
            transfer_id: self.transfer_id.clone(),
            bytes_completed: session.bytes_completed(),
            bytes_total: session.bytes_total(),
            parts_completed: session.parts_completed(),
            parts_total: session.parts_total(),
        });
    }

    /// 终态事件，重复调用被忽略
    pub fn terminal(
        &mut self,
        status: UploadStatus,
        upload_id: Option<&str>,
        error: Option<&UploadError>,
    ) {
        if self.terminal_sent {
            warn!("重复的终态事件被忽略: transfer_id={}", self.transfer_id);
            return;
        }
        self.terminal_sent = true;

        self.progress_tx.send_modify(|progress| progress.status = status);
        self.emit(UploadEvent::Terminal {
            transfer_id: self.transfer_id.clone(),
            status,
            upload_id: upload_id.map(|s| s.to_string()),
            error: error.map(|e| e.to_string()),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uploader::part::PartResult;
    use crate::uploader::plan::plan;

    #[test]
    fn test_event_serialization() {
        let event = UploadEvent::Terminal {
            transfer_id: "t-1".to_string(),
            status: UploadStatus::Completed,
            upload_id: Some("u-1".to_string()),
            error: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_type"], "terminal");
        assert_eq!(json["status"], "completed");
        assert_eq!(json["upload_id"], "u-1");
    }

    #[test]
    fn test_percent() {
        let plan = plan(0, 4, 4, 10).unwrap();
        let mut progress = TransferProgress::initial(&plan);
        assert_eq!(progress.percent(), 0.0);
        progress.parts_completed = 1;
        assert_eq!(progress.percent(), 100.0);
    }

    #[tokio::test]
    async fn test_reporter_publishes_progress_and_single_terminal() {
        let plan = plan(8, 4, 4, 10).unwrap();
        let (mut reporter, progress_rx, mut events) =
            ProgressReporter::new("t-1", TransferProgress::initial(&plan));

        let mut session = UploadSession::new("u-1", &plan);
        reporter.initiated(&session);
        session.transition(UploadStatus::InProgress).unwrap();
        session.mark_dispatched(1);
        session.record_completion(PartResult {
            index: 1,
            fingerprint: "\"a\"".to_string(),
            size_bytes: 4,
        });
        reporter.part_completed(&session);

        let snapshot = *progress_rx.borrow();
        assert_eq!(snapshot.bytes_completed, 4);
        assert_eq!(snapshot.parts_completed, 1);
        assert_eq!(snapshot.status, UploadStatus::InProgress);

        reporter.terminal(UploadStatus::Aborted, Some("u-1"), Some(&UploadError::Cancelled));
        reporter.terminal(UploadStatus::Failed, Some("u-1"), None);
        drop(reporter);

        let mut received = Vec::new();
        while let Some(event) = events.recv().await {
            received.push(event);
        }
        assert_eq!(received.len(), 3);
        assert!(matches!(received[0], UploadEvent::Initiated { .. }));
        assert!(matches!(
            received[1],
            UploadEvent::Progress { bytes_completed: 4, .. }
        ));
        assert!(matches!(
            received[2],
            UploadEvent::Terminal { status: UploadStatus::Aborted, .. }
        ));
        assert_eq!(progress_rx.borrow().status, UploadStatus::Aborted);
    }
}
