// 上传引擎模块
//
// - plan: 分片计划（纯函数）
// - retry: 指数退避 + 抖动的重试策略，凭证过期时刷新重试
// - part: 单个分片上传
// - state: 上传会话状态机
// - events: 进度快照与事件
// - coordinator: 有界并发调度，完成或中止
// - session: 对外入口 start / cancel / progress

mod coordinator;
pub mod events;
pub mod part;
pub mod plan;
pub mod retry;
pub mod session;
pub mod state;

pub use coordinator::TransferOutcome;
pub use events::{TransferProgress, UploadEvent};
pub use part::{PartResult, PartUploader, UploadSource};
pub use plan::{
    plan, plan_for, PartSpec, UploadPlan, MAX_PART_COUNT, MAX_PART_SIZE, MIN_PART_SIZE,
};
pub use retry::{apply_jitter, backoff_delay, RetryPolicy};
pub use session::{TransferHandle, TransferSession, UploadOptions};
pub use state::{UploadSession, UploadStatus};
