//! 训练器
//!
//! 教师强制下的掩码交叉熵训练：前向、损失、反向、L2 正则、
//! 全局范数裁剪、优化器更新。损失或梯度出现非有限值时
//! 返回可恢复错误并跳过该批次，参数保持不变。

use crate::dataset::Batch;
use crate::error::{CoreError, Result};
use crate::gradient_clip::clip_global_norm;
use crate::graph::ModelGraph;
use crate::optimizer::Optimizer;
use crate::tensor::TensorExt;
use ndarray::Array2;

/// 训练配置
#[derive(Debug, Clone)]
pub struct TrainerConfig {
    /// L2 正则权重，0 表示关闭
    pub l2_weight: f32,
    /// 全局范数裁剪阈值，None 表示不裁剪
    pub clip_norm: Option<f32>,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            l2_weight: 0.0,
            clip_norm: Some(5.0),
        }
    }
}

/// 一步训练的统计量
#[derive(Debug, Clone)]
pub struct TrainStats {
    /// 全局步数（从 1 开始）
    pub step: usize,
    /// 含 L2 项的总损失
    pub loss: f32,
    /// 裁剪前的全局梯度范数
    pub grad_norm: f32,
}

/// 交叉熵训练器
pub struct CrossEntropyTrainer {
    config: TrainerConfig,
    optimizer: Box<dyn Optimizer>,
    step: usize,
}

impl std::fmt::Debug for CrossEntropyTrainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrossEntropyTrainer")
            .field("config", &self.config)
            .field("optimizer", &self.optimizer.name())
            .field("step", &self.step)
            .finish()
    }
}

impl CrossEntropyTrainer {
    pub fn new(config: TrainerConfig, optimizer: Box<dyn Optimizer>) -> Self {
        Self {
            config,
            optimizer,
            step: 0,
        }
    }

    pub fn global_step(&self) -> usize {
        self.step
    }

    /// 恢复检查点时回设全局步数
    pub fn set_global_step(&mut self, step: usize) {
        self.step = step;
    }

    /// 在一个批次上执行完整的训练步
    ///
    /// 多个解码器时各自的平均交叉熵相加。填充位置既不计入
    /// 损失也不产生梯度。
    pub fn train_step(&mut self, graph: &mut ModelGraph, batch: &Batch) -> Result<TrainStats> {
        let (enc_out, enc_trace) = graph.encode(batch)?;

        let mut d_enc_states: Vec<Array2<f32>> = enc_out
            .temporal_states
            .iter()
            .map(|s| Array2::zeros(s.dim()))
            .collect();
        let mut d_final: Array2<f32> = Array2::zeros(enc_out.final_state.dim());

        let mut total_loss = 0.0;
        let mut decoder_grads = Vec::new();

        for binding in graph.decoders() {
            let target = batch.series(&binding.target_series)?;
            let (logits, trace) = binding.decoder.forward_train(&enc_out, &target.ids, true);

            let (loss, d_logits) = masked_cross_entropy(&logits, &target.ids, &target.lengths);
            total_loss += loss;

            let (grads, dhs, df) = binding.decoder.backward(&enc_out, &trace, &d_logits);
            decoder_grads.push((binding.name.clone(), grads));

            for (acc, dh) in d_enc_states.iter_mut().zip(dhs) {
                *acc = &*acc + &dh;
            }
            d_final = d_final + df;
        }

        let enc_grads = graph.encoder.backward(&enc_trace, &d_enc_states, &d_final);

        // 与 graph.parameters() 相同的规范顺序
        let mut named_grads: Vec<(String, Array2<f32>)> = enc_grads
            .into_named()
            .into_iter()
            .map(|(n, g)| (format!("encoder.{}", n), g))
            .collect();
        for (prefix, grads) in decoder_grads {
            for (n, g) in grads.into_named() {
                named_grads.push((format!("{}.{}", prefix, n), g));
            }
        }

        // L2 正则：损失加 λΣw²，梯度加 2λw
        if self.config.l2_weight > 0.0 {
            let l2 = self.config.l2_weight;
            for ((_, grad), (_, param)) in named_grads.iter_mut().zip(graph.parameters()) {
                total_loss += l2 * param.norm_squared();
                *grad = &*grad + &param.mapv(|w| 2.0 * l2 * w);
            }
        }

        if !total_loss.is_finite() {
            return Err(CoreError::NumericalInstability {
                what: "loss".to_string(),
                step: self.step + 1,
            });
        }
        if named_grads
            .iter()
            .any(|(_, g)| g.iter().any(|v| !v.is_finite()))
        {
            return Err(CoreError::NumericalInstability {
                what: "gradients".to_string(),
                step: self.step + 1,
            });
        }

        let mut grad_values: Vec<Array2<f32>> =
            named_grads.into_iter().map(|(_, g)| g).collect();
        let grad_norm = match self.config.clip_norm {
            Some(max_norm) => clip_global_norm(&mut grad_values, max_norm),
            None => crate::gradient_clip::global_grad_norm(&grad_values),
        };

        for ((name, param), grad) in graph.parameters_mut().into_iter().zip(&grad_values) {
            self.optimizer.step(param, grad, &name);
        }

        self.step += 1;
        Ok(TrainStats {
            step: self.step,
            loss: total_loss,
            grad_norm,
        })
    }
}

/// 掩码交叉熵
///
/// 返回平均损失和每步 logits 的梯度（已含 1/N 归一化和长度掩码）。
fn masked_cross_entropy(
    logits: &[Array2<f32>],
    target_ids: &Array2<usize>,
    lengths: &[usize],
) -> (f32, Vec<Array2<f32>>) {
    let (batch, _) = target_ids.dim();
    let eps = 1e-10;

    let total_tokens: usize = lengths.iter().sum();
    let norm = 1.0 / total_tokens.max(1) as f32;

    let mut loss = 0.0;
    let mut d_logits = Vec::with_capacity(logits.len());

    for (t, step_logits) in logits.iter().enumerate() {
        let probs = step_logits.softmax(1);
        let mut d = probs.clone();

        for i in 0..batch {
            if t < lengths[i] {
                let tgt = target_ids[[i, t]];
                loss -= (probs[[i, tgt]] + eps).ln();
                d[[i, tgt]] -= 1.0;
            } else {
                for v in d.row_mut(i).iter_mut() {
                    *v = 0.0;
                }
            }
        }

        d_logits.push(d.mapv(|v| v * norm));
    }

    (loss * norm, d_logits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attention::ScaledDotAttention;
    use crate::dataset::Dataset;
    use crate::decoder::{AttentiveDecoder, DecoderConfig};
    use crate::encoder::SequenceEncoder;
    use crate::graph::DecoderBinding;
    use crate::optimizer::SGD;
    use crate::vocabulary::Vocabulary;
    use ndarray::arr2;
    use std::sync::Arc;

    fn sent(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    fn toy() -> (ModelGraph, Batch) {
        let mut dataset = Dataset::new("toy");
        dataset.add_series(
            "source",
            vec![sent(&["a", "b"]), sent(&["b", "a"]), sent(&["a"])],
        );
        dataset.add_series(
            "target",
            vec![sent(&["x", "y"]), sent(&["y"]), sent(&["x"])],
        );

        let vocab = Arc::new(Vocabulary::build(&[&dataset], &["source", "target"], 20).unwrap());

        let encoder = SequenceEncoder::new(vocab.len(), 4, 6);
        let decoder = AttentiveDecoder::new(
            vocab.clone(),
            Box::new(ScaledDotAttention::new(6)),
            6,
            DecoderConfig {
                embedding_size: 4,
                rnn_size: 6,
                maxout_size: 3,
                max_output_len: 6,
                ..DecoderConfig::default()
            },
        );

        let graph = ModelGraph::new(
            encoder,
            "source",
            vocab,
            vec![DecoderBinding {
                name: "decoder".to_string(),
                target_series: "target".to_string(),
                decoder,
            }],
        )
        .unwrap();

        let batches = dataset
            .batches(&graph.train_series_vocabs(), 3)
            .unwrap();
        (graph, batches.into_iter().next().unwrap())
    }

    #[test]
    fn test_train_step_returns_finite_loss() {
        let (mut graph, batch) = toy();
        let mut trainer =
            CrossEntropyTrainer::new(TrainerConfig::default(), Box::new(SGD::new(0.1)));

        let stats = trainer.train_step(&mut graph, &batch).unwrap();

        assert_eq!(stats.step, 1);
        assert!(stats.loss.is_finite());
        assert!(stats.loss > 0.0);
        assert!(stats.grad_norm.is_finite());
    }

    #[test]
    fn test_loss_decreases_on_repeated_batch() {
        let (mut graph, batch) = toy();
        let mut trainer =
            CrossEntropyTrainer::new(TrainerConfig::default(), Box::new(SGD::new(0.5)));

        let first = trainer.train_step(&mut graph, &batch).unwrap().loss;
        for _ in 0..20 {
            trainer.train_step(&mut graph, &batch).unwrap();
        }
        let last = trainer.train_step(&mut graph, &batch).unwrap().loss;

        assert!(last < first, "loss {} should drop below {}", last, first);
    }

    #[test]
    fn test_l2_increases_loss() {
        let (mut graph, batch) = toy();
        let snapshot = graph.snapshot();

        let mut plain =
            CrossEntropyTrainer::new(TrainerConfig::default(), Box::new(SGD::new(0.0)));
        let base = plain.train_step(&mut graph, &batch).unwrap().loss;

        graph.restore(&snapshot).unwrap();
        let mut regularized = CrossEntropyTrainer::new(
            TrainerConfig {
                l2_weight: 0.1,
                ..TrainerConfig::default()
            },
            Box::new(SGD::new(0.0)),
        );
        let with_l2 = regularized.train_step(&mut graph, &batch).unwrap().loss;

        assert!(with_l2 > base);
    }

    #[test]
    fn test_masked_cross_entropy_ignores_padding() {
        // 两个样本，第二个只有 1 个有效 token
        let logits = vec![
            arr2(&[[2.0, 0.0, 0.0], [0.0, 2.0, 0.0]]),
            arr2(&[[0.0, 2.0, 0.0], [0.0, 0.0, 2.0]]),
        ];
        let targets = arr2(&[[0, 1], [1, 0]]);

        let (_, d_logits) = masked_cross_entropy(&logits, &targets, &[2, 1]);

        // 第二个样本第二步是填充，梯度应全为 0
        for v in d_logits[1].row(1).iter() {
            assert_eq!(*v, 0.0);
        }
        // 有效位置梯度非零
        assert!(d_logits[0].row(0).iter().any(|v| v.abs() > 0.0));
    }
}
