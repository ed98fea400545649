//! 领域模型错误定义

use thiserror::Error;

use crate::events::EventKind;

/// 领域模型错误类型
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DomainError {
    /// 事件类型与载荷不匹配
    #[error("事件类型 {kind:?} 与载荷不匹配: 期望 {expected}")]
    PayloadMismatch {
        kind: EventKind,
        expected: &'static str,
    },

    /// 成员变更事件缺少用户
    #[error("成员变更事件至少需要一个用户")]
    EmptyMembershipDelta,

    /// 验证错误
    #[error("验证失败: {field}: {message}")]
    ValidationError { field: String, message: String },
}

impl DomainError {
    /// 创建验证错误
    pub fn validation_error(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ValidationError {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// 领域模型结果类型
pub type DomainResult<T> = Result<T, DomainError>;
