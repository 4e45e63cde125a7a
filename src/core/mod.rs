//! 核心层：错误类型与恢复判定

pub mod error;
pub mod recovery;

pub use error::{InsertError, LedgerError, UniqueTarget};
pub use recovery::{plan_replay, relaunch_request, ReplayDecision, ResumeItem, ResumeReport};
