//! 模型图
//!
//! 把编码器和若干注意力解码器组合成一个可训练的整体：
//! 构建时校验各组件的维度衔接，对外提供规范命名的参数枚举、
//! 快照/恢复，以及供 runner 提取的命名张量。

use crate::dataset::Batch;
use crate::decoder::AttentiveDecoder;
use crate::encoder::{EncoderOutput, EncoderTrace, SequenceEncoder};
use crate::error::{CoreError, Result};
use crate::vocabulary::Vocabulary;
use ndarray::{Array2, Array3, ArrayD};
use std::collections::HashMap;
use std::sync::Arc;

/// 解码器及其数据绑定
#[derive(Debug)]
pub struct DecoderBinding {
    /// 图内唯一名称，参数和命名张量都以它为前缀
    pub name: String,
    /// 训练时读取的目标序列
    pub target_series: String,
    pub decoder: AttentiveDecoder,
}

/// 供 runner 提取的命名张量
#[derive(Debug, Clone)]
pub struct NamedTensor {
    pub name: String,
    pub values: ArrayD<f32>,
    /// 批次样本所在的维度
    pub batch_dim: usize,
}

/// 编码器 + 解码器组合
#[derive(Debug)]
pub struct ModelGraph {
    pub(crate) encoder: SequenceEncoder,
    source_series: String,
    source_vocab: Arc<Vocabulary>,
    decoders: Vec<DecoderBinding>,
}

impl ModelGraph {
    /// 组装模型图并校验维度衔接
    ///
    /// 解码器期望的编码器状态维度必须等于编码器的 `rnn_size`，
    /// 源端词汇表大小必须与编码器嵌入一致，否则返回维度错误。
    pub fn new(
        encoder: SequenceEncoder,
        source_series: &str,
        source_vocab: Arc<Vocabulary>,
        decoders: Vec<DecoderBinding>,
    ) -> Result<Self> {
        if source_vocab.len() != encoder.vocab_size() {
            return Err(CoreError::ShapeMismatch {
                component: "encoder".to_string(),
                expected: format!("vocab size {}", encoder.vocab_size()),
                actual: format!("vocab size {}", source_vocab.len()),
            });
        }

        if decoders.is_empty() {
            return Err(CoreError::InvalidConfig(
                "model graph needs at least one decoder".to_string(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for binding in &decoders {
            if binding.name == "encoder" || !seen.insert(binding.name.clone()) {
                return Err(CoreError::InvalidConfig(format!(
                    "duplicate or reserved component name '{}'",
                    binding.name
                )));
            }

            if binding.decoder.encoder_state_size() != encoder.rnn_size() {
                return Err(CoreError::ShapeMismatch {
                    component: binding.name.clone(),
                    expected: format!("encoder state size {}", encoder.rnn_size()),
                    actual: format!("encoder state size {}", binding.decoder.encoder_state_size()),
                });
            }

            // 点积注意力要求查询（解码器状态）与编码器状态同维
            if binding.decoder.config().rnn_size != encoder.rnn_size() {
                return Err(CoreError::ShapeMismatch {
                    component: binding.name.clone(),
                    expected: format!("attention query size {}", encoder.rnn_size()),
                    actual: format!("attention query size {}", binding.decoder.config().rnn_size),
                });
            }
        }

        Ok(Self {
            encoder,
            source_series: source_series.to_string(),
            source_vocab,
            decoders,
        })
    }

    pub fn encoder(&self) -> &SequenceEncoder {
        &self.encoder
    }

    pub fn source_series(&self) -> &str {
        &self.source_series
    }

    pub fn source_vocab(&self) -> &Arc<Vocabulary> {
        &self.source_vocab
    }

    pub fn decoders(&self) -> &[DecoderBinding] {
        &self.decoders
    }

    /// 按名称查找解码器
    pub fn decoder(&self, name: &str) -> Result<&DecoderBinding> {
        self.decoders
            .iter()
            .find(|b| b.name == name)
            .ok_or_else(|| CoreError::UnknownReference(format!("decoder '{}'", name)))
    }

    /// 训练批次需要的 (序列, 词汇表) 列表：源端 + 各目标端
    pub fn train_series_vocabs(&self) -> Vec<(&str, &Vocabulary)> {
        let mut out = vec![(self.source_series.as_str(), self.source_vocab.as_ref())];
        for binding in &self.decoders {
            out.push((
                binding.target_series.as_str(),
                binding.decoder.vocabulary().as_ref(),
            ));
        }
        out
    }

    /// 推理批次只需要源端序列
    pub fn infer_series_vocabs(&self) -> Vec<(&str, &Vocabulary)> {
        vec![(self.source_series.as_str(), self.source_vocab.as_ref())]
    }

    /// 编码批次的源端序列
    pub fn encode(&self, batch: &Batch) -> Result<(EncoderOutput, EncoderTrace)> {
        let source = batch.series(&self.source_series)?;
        Ok(self.encoder.forward(&source.ids, &source.lengths))
    }

    /// 规范顺序的命名参数视图
    ///
    /// 顺序固定：先编码器再各解码器，组件内部按各自的声明顺序。
    /// 快照、恢复和优化器更新都以这个顺序为准。
    pub fn parameters(&self) -> Vec<(String, &Array2<f32>)> {
        let mut out = Vec::new();
        for (name, param) in self.encoder.named_parameters() {
            out.push((format!("encoder.{}", name), param));
        }
        for binding in &self.decoders {
            for (name, param) in binding.decoder.named_parameters() {
                out.push((format!("{}.{}", binding.name, name), param));
            }
        }
        out
    }

    pub fn parameters_mut(&mut self) -> Vec<(String, &mut Array2<f32>)> {
        let mut out = Vec::new();
        for (name, param) in self.encoder.named_parameters_mut() {
            out.push((format!("encoder.{}", name), param));
        }
        for binding in self.decoders.iter_mut() {
            for (name, param) in binding.decoder.named_parameters_mut() {
                out.push((format!("{}.{}", binding.name, name), param));
            }
        }
        out
    }

    /// 参数快照（深拷贝）
    pub fn snapshot(&self) -> Vec<(String, Array2<f32>)> {
        self.parameters()
            .into_iter()
            .map(|(name, param)| (name, param.clone()))
            .collect()
    }

    /// 从快照恢复参数
    ///
    /// 名称或形状与当前模型不一致时整体失败，不做部分恢复。
    pub fn restore(&mut self, stored: &[(String, Array2<f32>)]) -> Result<()> {
        let stored_map: HashMap<&str, &Array2<f32>> = stored
            .iter()
            .map(|(name, values)| (name.as_str(), values))
            .collect();

        let mut params = self.parameters_mut();
        if params.len() != stored.len() {
            return Err(CoreError::CheckpointMismatch {
                name: format!("parameter count {} vs {}", params.len(), stored.len()),
                expected: (params.len(), 0),
                stored: (stored.len(), 0),
            });
        }

        for (name, param) in params.iter_mut() {
            let values = stored_map.get(name.as_str()).ok_or_else(|| {
                CoreError::CheckpointMismatch {
                    name: name.clone(),
                    expected: param.dim(),
                    stored: (0, 0),
                }
            })?;
            if values.dim() != param.dim() {
                return Err(CoreError::CheckpointMismatch {
                    name: name.clone(),
                    expected: param.dim(),
                    stored: values.dim(),
                });
            }
        }

        // 全部校验通过后才写入
        for (name, param) in params {
            param.assign(stored_map[name.as_str()]);
        }

        Ok(())
    }

    /// 跑一遍推理并收集命名张量
    ///
    /// - `encoder.temporal_states`: [batch, seq_len, rnn_size]，批次维 0
    /// - `encoder.final_state`: [batch, rnn_size]，批次维 0
    /// - `<decoder>.runtime_logits`: [steps, batch, vocab]，批次维 1
    /// - `<decoder>.decoded`: [steps, batch]，批次维 1
    pub fn collect_tensors(&self, batch: &Batch) -> Result<Vec<NamedTensor>> {
        let (enc, _) = self.encode(batch)?;
        let batch_size = enc.final_state.nrows();
        let seq_len = enc.temporal_states.len();
        let rnn_size = self.encoder.rnn_size();

        let mut temporal = Array3::zeros((batch_size, seq_len, rnn_size));
        for (t, state) in enc.temporal_states.iter().enumerate() {
            for i in 0..batch_size {
                for j in 0..rnn_size {
                    temporal[[i, t, j]] = state[[i, j]];
                }
            }
        }

        let mut tensors = vec![
            NamedTensor {
                name: "encoder.temporal_states".to_string(),
                values: temporal.into_dyn(),
                batch_dim: 0,
            },
            NamedTensor {
                name: "encoder.final_state".to_string(),
                values: enc.final_state.clone().into_dyn(),
                batch_dim: 0,
            },
        ];

        for binding in &self.decoders {
            let out = binding.decoder.forward_greedy(&enc);
            let steps = out.runtime_logits.len();
            let vocab = binding.decoder.vocabulary().len();

            let mut logits = Array3::zeros((steps, batch_size, vocab));
            let mut decoded = Array2::zeros((steps, batch_size));
            for t in 0..steps {
                for i in 0..batch_size {
                    decoded[[t, i]] = out.decoded_steps[t][i] as f32;
                    for v in 0..vocab {
                        logits[[t, i, v]] = out.runtime_logits[t][[i, v]];
                    }
                }
            }

            tensors.push(NamedTensor {
                name: format!("{}.runtime_logits", binding.name),
                values: logits.into_dyn(),
                batch_dim: 1,
            });
            tensors.push(NamedTensor {
                name: format!("{}.decoded", binding.name),
                values: decoded.into_dyn(),
                batch_dim: 1,
            });
        }

        Ok(tensors)
    }
}
