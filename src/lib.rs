//! # Mini Seq2Seq
//!
//! 一个从零实现的注意力编码器–解码器训练运行时，用于学习
//! 序列到序列模型的完整训练/推理流程。
//!
//! ## 架构概览
//!
//! ```text
//! Dataset → Vocabulary → Batch →
//!     Encoder（循环 + 长度掩码）→ Attention（缩放点积）→
//!     Decoder（教师强制 / 贪婪，maxout 输出）→
//!     Trainer（掩码交叉熵 + L2 + 梯度裁剪）
//!
//! ExecutionManager：单写者训练 / 快照读者推理
//! Experiment：epoch 循环 + 周期验证 + 检查点 + 测试输出
//! ```

pub mod tensor;
pub mod error;
pub mod vocabulary;
pub mod dataset;
pub mod embedding;
pub mod dropout;
pub mod encoder;
pub mod attention;
pub mod decoder;
pub mod gradient_clip;
pub mod optimizer;
pub mod graph;
pub mod trainer;
pub mod checkpoint;
pub mod execution;
pub mod runners;
pub mod metrics;
pub mod experiment;
pub mod config;

pub use tensor::TensorExt;
pub use error::{CoreError, Result};
pub use vocabulary::{Vocabulary, END_ID, PAD_ID, START_ID, UNK_ID};
pub use dataset::{Batch, BatchSeries, Dataset, Sentence};
pub use embedding::Embedding;
pub use dropout::Dropout;
pub use encoder::{EncoderOutput, SequenceEncoder};
pub use attention::{Attention, AttentionResult, ScaledDotAttention};
pub use decoder::{AttentiveDecoder, DecoderConfig, GreedyOutput};
pub use optimizer::{Adam, Optimizer, SGD};
pub use graph::{DecoderBinding, ModelGraph, NamedTensor};
pub use trainer::{CrossEntropyTrainer, TrainStats, TrainerConfig};
pub use checkpoint::{Checkpoint, CHECKPOINT_VERSION};
pub use execution::{ExecutionConfig, ExecutionContext, ExecutionManager};
pub use runners::{
    GreedyRunner, RepresentationRunner, ResultSeries, Runner, SeriesData, TensorRef, TensorRunner,
};
pub use metrics::{Evaluator, TokenAccuracy, BLEU};
pub use experiment::{Experiment, ExperimentConfig, ExperimentReport};
pub use config::{BlockSpec, BuiltExperiment, ExperimentSpec};

/// 预设配置
pub mod configs {
    use super::DecoderConfig;

    /// 小型模型（用于快速测试）
    pub fn mini() -> DecoderConfig {
        DecoderConfig {
            embedding_size: 32,
            rnn_size: 32,
            maxout_size: 32,
            max_output_len: 20,
            supress_unk: false,
            dropout_keep_prob: 1.0,
        }
    }

    /// 基础模型（平衡性能和速度）
    pub fn base() -> DecoderConfig {
        DecoderConfig {
            embedding_size: 256,
            rnn_size: 512,
            maxout_size: 256,
            max_output_len: 60,
            supress_unk: true,
            dropout_keep_prob: 0.9,
        }
    }
}
