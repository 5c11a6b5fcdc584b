//! 声明式实验配置
//!
//! 实验由一组命名块描述：词汇表、编码器、注意力、解码器、
//! 训练器，块之间按名称互相引用。构建分两个阶段：先校验
//! 所有引用（存在性、无环、类型匹配），全部通过后再实例化，
//! 避免构建到一半才发现配置错误。

use crate::attention::ScaledDotAttention;
use crate::dataset::Dataset;
use crate::decoder::{AttentiveDecoder, DecoderConfig};
use crate::encoder::SequenceEncoder;
use crate::error::{CoreError, Result};
use crate::graph::{DecoderBinding, ModelGraph};
use crate::optimizer::{Adam, Optimizer, SGD};
use crate::trainer::{CrossEntropyTrainer, TrainerConfig};
use crate::vocabulary::Vocabulary;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

fn default_keep_prob() -> f32 {
    1.0
}

fn default_optimizer() -> String {
    "adam".to_string()
}

/// 一个配置块
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockSpec {
    Vocabulary {
        /// 参与统计的序列
        series: Vec<String>,
        max_size: usize,
    },
    Encoder {
        vocabulary: String,
        embedding_size: usize,
        rnn_size: usize,
    },
    Attention {
        encoder: String,
    },
    Decoder {
        vocabulary: String,
        attention: String,
        /// 训练时读取的目标序列
        data_series: String,
        embedding_size: usize,
        rnn_size: usize,
        maxout_size: usize,
        max_output_len: usize,
        #[serde(default)]
        supress_unk: bool,
        #[serde(default = "default_keep_prob")]
        dropout_keep_prob: f32,
    },
    Trainer {
        decoders: Vec<String>,
        #[serde(default)]
        l2_weight: f32,
        #[serde(default)]
        clip_norm: Option<f32>,
        learning_rate: f32,
        #[serde(default = "default_optimizer")]
        optimizer: String,
    },
}

impl BlockSpec {
    fn kind(&self) -> &'static str {
        match self {
            BlockSpec::Vocabulary { .. } => "vocabulary",
            BlockSpec::Encoder { .. } => "encoder",
            BlockSpec::Attention { .. } => "attention",
            BlockSpec::Decoder { .. } => "decoder",
            BlockSpec::Trainer { .. } => "trainer",
        }
    }

    /// 这个块引用的其它块
    fn references(&self) -> Vec<&str> {
        match self {
            BlockSpec::Vocabulary { .. } => Vec::new(),
            BlockSpec::Encoder { vocabulary, .. } => vec![vocabulary.as_str()],
            BlockSpec::Attention { encoder } => vec![encoder.as_str()],
            BlockSpec::Decoder {
                vocabulary,
                attention,
                ..
            } => vec![vocabulary.as_str(), attention.as_str()],
            BlockSpec::Trainer { decoders, .. } => {
                decoders.iter().map(|d| d.as_str()).collect()
            }
        }
    }
}

/// 完整的实验描述
#[derive(Debug, Clone, Deserialize)]
pub struct ExperimentSpec {
    pub blocks: HashMap<String, BlockSpec>,
    /// 图的编码器块
    pub encoder: String,
    /// 编码器读取的源序列
    pub source_series: String,
    /// 训练器块
    pub trainer: String,
}

/// 第二阶段构建出的可运行组件
pub struct BuiltExperiment {
    pub graph: ModelGraph,
    pub trainer: CrossEntropyTrainer,
}

impl ExperimentSpec {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| CoreError::InvalidConfig(e.to_string()))
    }

    /// 第一阶段：校验引用
    ///
    /// 检查顺序：引用存在 → 无循环引用 → 引用的块类型正确。
    pub fn validate(&self) -> Result<()> {
        for root in [&self.encoder, &self.trainer] {
            if !self.blocks.contains_key(root.as_str()) {
                return Err(CoreError::UnknownReference(format!("block '{}'", root)));
            }
        }

        for (name, block) in &self.blocks {
            for reference in block.references() {
                if !self.blocks.contains_key(reference) {
                    return Err(CoreError::UnknownReference(format!(
                        "block '{}' referenced by '{}'",
                        reference, name
                    )));
                }
            }
        }

        let mut resolved = HashSet::new();
        let mut visiting = Vec::new();
        for name in self.blocks.keys() {
            self.check_cycles(name, &mut visiting, &mut resolved)?;
        }

        self.check_kinds()?;
        Ok(())
    }

    fn check_cycles(
        &self,
        name: &str,
        visiting: &mut Vec<String>,
        resolved: &mut HashSet<String>,
    ) -> Result<()> {
        if resolved.contains(name) {
            return Ok(());
        }
        if visiting.iter().any(|v| v == name) {
            let mut chain = visiting.join(" -> ");
            chain.push_str(" -> ");
            chain.push_str(name);
            return Err(CoreError::CircularReference(chain));
        }

        visiting.push(name.to_string());
        for reference in self.blocks[name].references() {
            self.check_cycles(reference, visiting, resolved)?;
        }
        visiting.pop();
        resolved.insert(name.to_string());
        Ok(())
    }

    fn expect_kind(&self, name: &str, wanted: &str, referrer: &str) -> Result<()> {
        let kind = self.blocks[name].kind();
        if kind != wanted {
            return Err(CoreError::InvalidConfig(format!(
                "'{}' expects a {} block, but '{}' is a {}",
                referrer, wanted, name, kind
            )));
        }
        Ok(())
    }

    fn check_kinds(&self) -> Result<()> {
        self.expect_kind(&self.encoder, "encoder", "graph encoder")?;
        self.expect_kind(&self.trainer, "trainer", "graph trainer")?;

        for (name, block) in &self.blocks {
            match block {
                BlockSpec::Vocabulary { .. } => {}
                BlockSpec::Encoder { vocabulary, .. } => {
                    self.expect_kind(vocabulary, "vocabulary", name)?;
                }
                BlockSpec::Attention { encoder } => {
                    self.expect_kind(encoder, "encoder", name)?;
                }
                BlockSpec::Decoder {
                    vocabulary,
                    attention,
                    dropout_keep_prob,
                    ..
                } => {
                    self.expect_kind(vocabulary, "vocabulary", name)?;
                    self.expect_kind(attention, "attention", name)?;
                    // 外部配置的取值错误走错误分类，不允许 panic
                    if !(*dropout_keep_prob > 0.0 && *dropout_keep_prob <= 1.0) {
                        return Err(CoreError::InvalidConfig(format!(
                            "decoder '{}': dropout_keep_prob {} outside (0, 1]",
                            name, dropout_keep_prob
                        )));
                    }
                }
                BlockSpec::Trainer { decoders, .. } => {
                    if decoders.is_empty() {
                        return Err(CoreError::InvalidConfig(format!(
                            "trainer '{}' lists no decoders",
                            name
                        )));
                    }
                    for decoder in decoders {
                        self.expect_kind(decoder, "decoder", name)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// 第二阶段：实例化
    ///
    /// 词汇表从给定的数据集构建；所有解码器的注意力必须指向
    /// 图的编码器。
    pub fn build(&self, datasets: &[&Dataset]) -> Result<BuiltExperiment> {
        self.validate()?;

        // 词汇表
        let mut vocabs: HashMap<&str, Arc<Vocabulary>> = HashMap::new();
        for (name, block) in &self.blocks {
            if let BlockSpec::Vocabulary { series, max_size } = block {
                let ids: Vec<&str> = series.iter().map(|s| s.as_str()).collect();
                vocabs.insert(
                    name.as_str(),
                    Arc::new(Vocabulary::build(datasets, &ids, *max_size)?),
                );
            }
        }

        // 编码器
        let (enc_vocab_name, embedding_size, rnn_size) = match &self.blocks[&self.encoder] {
            BlockSpec::Encoder {
                vocabulary,
                embedding_size,
                rnn_size,
            } => (vocabulary.as_str(), *embedding_size, *rnn_size),
            _ => unreachable!("validated above"),
        };
        let source_vocab = vocabs[enc_vocab_name].clone();
        let encoder = SequenceEncoder::new(source_vocab.len(), embedding_size, rnn_size);

        // 训练器块和它引用的解码器
        let (decoder_names, trainer_config, learning_rate, optimizer_name) =
            match &self.blocks[&self.trainer] {
                BlockSpec::Trainer {
                    decoders,
                    l2_weight,
                    clip_norm,
                    learning_rate,
                    optimizer,
                } => (
                    decoders,
                    TrainerConfig {
                        l2_weight: *l2_weight,
                        clip_norm: *clip_norm,
                    },
                    *learning_rate,
                    optimizer.as_str(),
                ),
                _ => unreachable!("validated above"),
            };

        let mut bindings = Vec::with_capacity(decoder_names.len());
        for name in decoder_names {
            let block = &self.blocks[name];
            let (vocabulary, attention_name, data_series, config) = match block {
                BlockSpec::Decoder {
                    vocabulary,
                    attention,
                    data_series,
                    embedding_size,
                    rnn_size,
                    maxout_size,
                    max_output_len,
                    supress_unk,
                    dropout_keep_prob,
                } => (
                    vocabulary.as_str(),
                    attention.as_str(),
                    data_series.clone(),
                    DecoderConfig {
                        embedding_size: *embedding_size,
                        rnn_size: *rnn_size,
                        maxout_size: *maxout_size,
                        max_output_len: *max_output_len,
                        supress_unk: *supress_unk,
                        dropout_keep_prob: *dropout_keep_prob,
                    },
                ),
                _ => unreachable!("validated above"),
            };

            let attended_encoder = match &self.blocks[attention_name] {
                BlockSpec::Attention { encoder } => encoder,
                _ => unreachable!("validated above"),
            };
            if attended_encoder != &self.encoder {
                return Err(CoreError::InvalidConfig(format!(
                    "attention '{}' points at encoder '{}', graph uses '{}'",
                    attention_name, attended_encoder, self.encoder
                )));
            }

            let decoder = AttentiveDecoder::new(
                vocabs[vocabulary].clone(),
                Box::new(ScaledDotAttention::new(rnn_size)),
                rnn_size,
                config,
            );

            bindings.push(DecoderBinding {
                name: name.clone(),
                target_series: data_series,
                decoder,
            });
        }

        let graph = ModelGraph::new(encoder, &self.source_series, source_vocab, bindings)?;

        let optimizer: Box<dyn Optimizer> = match optimizer_name {
            "sgd" => Box::new(SGD::new(learning_rate)),
            "adam" => Box::new(Adam::new(learning_rate)),
            other => {
                return Err(CoreError::InvalidConfig(format!(
                    "unknown optimizer '{}'",
                    other
                )))
            }
        };
        let trainer = CrossEntropyTrainer::new(trainer_config, optimizer);

        Ok(BuiltExperiment { graph, trainer })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sent(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    fn toy_dataset() -> Dataset {
        let mut dataset = Dataset::new("toy");
        dataset.add_series("src", vec![sent(&["a", "b"]), sent(&["b"])]);
        dataset.add_series("tgt", vec![sent(&["x"]), sent(&["y"])]);
        dataset
    }

    fn toy_json() -> &'static str {
        r#"{
            "blocks": {
                "vocab": { "type": "vocabulary", "series": ["src", "tgt"], "max_size": 50 },
                "enc": { "type": "encoder", "vocabulary": "vocab", "embedding_size": 4, "rnn_size": 6 },
                "attn": { "type": "attention", "encoder": "enc" },
                "dec": {
                    "type": "decoder",
                    "vocabulary": "vocab",
                    "attention": "attn",
                    "data_series": "tgt",
                    "embedding_size": 4,
                    "rnn_size": 6,
                    "maxout_size": 3,
                    "max_output_len": 6
                },
                "train": { "type": "trainer", "decoders": ["dec"], "learning_rate": 0.1, "optimizer": "sgd" }
            },
            "encoder": "enc",
            "source_series": "src",
            "trainer": "train"
        }"#
    }

    #[test]
    fn test_parse_and_build() {
        let spec = ExperimentSpec::from_json(toy_json()).unwrap();
        let dataset = toy_dataset();

        let built = spec.build(&[&dataset]).unwrap();

        assert_eq!(built.graph.source_series(), "src");
        assert_eq!(built.graph.decoders().len(), 1);
        assert_eq!(built.graph.decoders()[0].target_series, "tgt");
        // 默认值生效
        assert!(!built.graph.decoders()[0].decoder.config().supress_unk);
    }

    #[test]
    fn test_unknown_reference_rejected() {
        let spec = ExperimentSpec::from_json(
            &toy_json().replace("\"vocabulary\": \"vocab\"", "\"vocabulary\": \"missing\""),
        )
        .unwrap();

        let result = spec.validate();
        assert!(matches!(result, Err(CoreError::UnknownReference(_))));
    }

    #[test]
    fn test_self_reference_is_a_cycle() {
        let spec = ExperimentSpec::from_json(
            &toy_json().replace(
                r#""attn": { "type": "attention", "encoder": "enc" }"#,
                r#""attn": { "type": "attention", "encoder": "attn" }"#,
            ),
        )
        .unwrap();

        let result = spec.validate();
        assert!(matches!(result, Err(CoreError::CircularReference(_))));
    }

    #[test]
    fn test_kind_mismatch_rejected() {
        // 解码器的 attention 字段指向词汇表块
        let spec = ExperimentSpec::from_json(
            &toy_json().replace("\"attention\": \"attn\"", "\"attention\": \"vocab\""),
        )
        .unwrap();

        let result = spec.validate();
        assert!(matches!(result, Err(CoreError::InvalidConfig(_))));
    }

    #[test]
    fn test_out_of_range_keep_prob_rejected() {
        // 取值错误应返回配置错误而不是中止进程
        for bad in ["0.0", "1.5"] {
            let spec = ExperimentSpec::from_json(&toy_json().replace(
                "\"max_output_len\": 6",
                &format!("\"max_output_len\": 6, \"dropout_keep_prob\": {}", bad),
            ))
            .unwrap();

            let result = spec.build(&[&toy_dataset()]);
            assert!(matches!(result, Err(CoreError::InvalidConfig(_))));
        }
    }

    #[test]
    fn test_unknown_optimizer_rejected() {
        let spec = ExperimentSpec::from_json(
            &toy_json().replace("\"optimizer\": \"sgd\"", "\"optimizer\": \"rmsprop\""),
        )
        .unwrap();

        let result = spec.build(&[&toy_dataset()]);
        assert!(matches!(result, Err(CoreError::InvalidConfig(_))));
    }

    #[test]
    fn test_built_trainer_runs() {
        let spec = ExperimentSpec::from_json(toy_json()).unwrap();
        let dataset = toy_dataset();
        let BuiltExperiment {
            mut graph,
            mut trainer,
        } = spec.build(&[&dataset]).unwrap();

        let batches = dataset
            .batches(&graph.train_series_vocabs(), 2)
            .unwrap();
        let stats = trainer.train_step(&mut graph, &batches[0]).unwrap();

        assert!(stats.loss.is_finite());
    }
}
