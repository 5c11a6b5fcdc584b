//! 错误类型
//!
//! 定义核心运行时的错误分类，区分致命错误（结构/拓扑问题）
//! 和可局部恢复的错误（单个 batch 的数值或对齐问题）。

use thiserror::Error;

/// 核心错误类型
#[derive(Debug, Error)]
pub enum CoreError {
    /// 词汇表构建失败（空语料等退化情况）
    #[error("vocabulary build failed: {0}")]
    VocabularyBuild(String),

    /// 组件组合时的形状不匹配（构图期检测，致命）
    #[error("shape mismatch in {component}: expected {expected}, got {actual}")]
    ShapeMismatch {
        component: String,
        expected: String,
        actual: String,
    },

    /// 损失或梯度出现非有限值（跳过该步，训练继续）
    #[error("non-finite {what} detected at step {step}")]
    NumericalInstability { what: String, step: usize },

    /// 检查点参数形状与当前模型拓扑不一致（致命）
    #[error("checkpoint mismatch for parameter '{name}': graph has {expected:?}, checkpoint has {stored:?}")]
    CheckpointMismatch {
        name: String,
        expected: (usize, usize),
        stored: (usize, usize),
    },

    /// batch 内各序列的样本数不一致（跳过该 batch）
    #[error("batch series misaligned: {0}")]
    BatchAlignment(String),

    /// 声明式配置中引用了不存在的块（致命）
    #[error("unknown block reference '{0}'")]
    UnknownReference(String),

    /// 声明式配置中出现循环引用（致命）
    #[error("circular reference involving block '{0}'")]
    CircularReference(String),

    /// 配置内容无效（致命）
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// I/O 错误
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// 序列化/反序列化错误
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl CoreError {
    /// 是否为致命错误
    ///
    /// 致命错误表明图配置错误，必须立即终止；
    /// 非致命错误按 batch 粒度恢复（跳过并记录日志）。
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            CoreError::NumericalInstability { .. } | CoreError::BatchAlignment(_)
        )
    }
}

/// 核心 Result 别名
pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatality_classification() {
        let numeric = CoreError::NumericalInstability {
            what: "loss".to_string(),
            step: 3,
        };
        assert!(!numeric.is_fatal());

        let align = CoreError::BatchAlignment("source=4, target=3".to_string());
        assert!(!align.is_fatal());

        let shape = CoreError::ShapeMismatch {
            component: "decoder".to_string(),
            expected: "[8, 16]".to_string(),
            actual: "[8, 32]".to_string(),
        };
        assert!(shape.is_fatal());

        let ckpt = CoreError::CheckpointMismatch {
            name: "encoder.w_state".to_string(),
            expected: (16, 16),
            stored: (32, 32),
        };
        assert!(ckpt.is_fatal());
    }

    #[test]
    fn test_error_message_carries_context() {
        let err = CoreError::ShapeMismatch {
            component: "attention".to_string(),
            expected: "query dim 16".to_string(),
            actual: "state dim 24".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("attention"));
        assert!(msg.contains("16"));
        assert!(msg.contains("24"));
    }
}
