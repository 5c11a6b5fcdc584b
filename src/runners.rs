//! 推理 runner
//!
//! 把只读模型应用到批次上并产出命名结果序列：
//! 贪婪解码产出句子，表示提取产出向量，张量提取产出原始数值。
//! 所有结果序列的外层长度都等于批次样本数。

use crate::dataset::{Batch, Sentence};
use crate::error::{CoreError, Result};
use crate::graph::ModelGraph;
use ndarray::{ArrayD, Axis};

/// 结果序列的载荷
#[derive(Debug, Clone)]
pub enum SeriesData {
    /// 解码出的 token 序列
    Sentences(Vec<Sentence>),
    /// 每个样本一个定长向量
    Vectors(Vec<Vec<f32>>),
    /// 每个样本一个任意维张量（批次维已剥离）
    Tensors(Vec<ArrayD<f32>>),
}

impl SeriesData {
    pub fn len(&self) -> usize {
        match self {
            SeriesData::Sentences(s) => s.len(),
            SeriesData::Vectors(v) => v.len(),
            SeriesData::Tensors(t) => t.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 命名结果序列
#[derive(Debug, Clone)]
pub struct ResultSeries {
    pub name: String,
    pub data: SeriesData,
}

impl ResultSeries {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// 按样本顺序拼接同名分片（用于并行推理的结果合并）
    pub fn concat(parts: Vec<ResultSeries>) -> Result<ResultSeries> {
        let mut iter = parts.into_iter();
        let mut merged = iter.next().ok_or_else(|| {
            CoreError::BatchAlignment("cannot concatenate zero result chunks".to_string())
        })?;

        for part in iter {
            if part.name != merged.name {
                return Err(CoreError::BatchAlignment(format!(
                    "cannot merge series '{}' into '{}'",
                    part.name, merged.name
                )));
            }
            match (&mut merged.data, part.data) {
                (SeriesData::Sentences(a), SeriesData::Sentences(b)) => a.extend(b),
                (SeriesData::Vectors(a), SeriesData::Vectors(b)) => a.extend(b),
                (SeriesData::Tensors(a), SeriesData::Tensors(b)) => a.extend(b),
                _ => {
                    return Err(CoreError::BatchAlignment(format!(
                        "series '{}' chunks have mixed payload kinds",
                        merged.name
                    )))
                }
            }
        }

        Ok(merged)
    }
}

/// 推理 runner
///
/// 实现必须线程安全：执行管理器会在多个线程上
/// 用同一个 runner 处理批次分片。
pub trait Runner: Send + Sync {
    /// runner 名称（用于日志和输出文件名）
    fn name(&self) -> &str;

    /// 产出句子时所依附的解码器，评估以它的目标序列为参照；
    /// 不产出句子的 runner 返回 None，不参与打分
    fn decoder(&self) -> Option<&str> {
        None
    }

    /// 在一个批次上运行，产出一个或多个结果序列
    fn run(&self, graph: &ModelGraph, batch: &Batch) -> Result<Vec<ResultSeries>>;
}

/// 贪婪解码 runner：每个样本产出一条 token 序列
#[derive(Debug, Clone)]
pub struct GreedyRunner {
    output_series: String,
    decoder: String,
}

impl GreedyRunner {
    pub fn new(output_series: &str, decoder: &str) -> Self {
        Self {
            output_series: output_series.to_string(),
            decoder: decoder.to_string(),
        }
    }

    pub fn output_series(&self) -> &str {
        &self.output_series
    }
}

impl Runner for GreedyRunner {
    fn name(&self) -> &str {
        &self.output_series
    }

    fn decoder(&self) -> Option<&str> {
        Some(&self.decoder)
    }

    fn run(&self, graph: &ModelGraph, batch: &Batch) -> Result<Vec<ResultSeries>> {
        let (enc, _) = graph.encode(batch)?;
        let binding = graph.decoder(&self.decoder)?;

        let out = binding.decoder.forward_greedy(&enc);
        let vocab = binding.decoder.vocabulary();
        let sentences: Vec<Sentence> = out.decoded.iter().map(|ids| vocab.decode(ids)).collect();

        Ok(vec![ResultSeries {
            name: self.output_series.clone(),
            data: SeriesData::Sentences(sentences),
        }])
    }
}

/// 表示提取 runner：每个样本产出编码器摘要状态
#[derive(Debug, Clone)]
pub struct RepresentationRunner {
    output_series: String,
}

impl RepresentationRunner {
    pub fn new(output_series: &str) -> Self {
        Self {
            output_series: output_series.to_string(),
        }
    }
}

impl Runner for RepresentationRunner {
    fn name(&self) -> &str {
        &self.output_series
    }

    fn run(&self, graph: &ModelGraph, batch: &Batch) -> Result<Vec<ResultSeries>> {
        let (enc, _) = graph.encode(batch)?;

        let vectors: Vec<Vec<f32>> = enc
            .final_state
            .outer_iter()
            .map(|row| row.to_vec())
            .collect();

        Ok(vec![ResultSeries {
            name: self.output_series.clone(),
            data: SeriesData::Vectors(vectors),
        }])
    }
}

/// 张量提取请求：张量名加上批次维所在的位置
#[derive(Debug, Clone)]
pub struct TensorRef {
    pub name: String,
    pub batch_dim: usize,
}

/// 张量提取 runner
///
/// 不同张量的批次维可能在不同位置（编码器状态在 0，
/// 解码器 logits 在 1）；结果统一按样本切分，批次维被剥离。
#[derive(Debug, Clone)]
pub struct TensorRunner {
    tensors: Vec<TensorRef>,
}

impl TensorRunner {
    pub fn new(tensors: Vec<TensorRef>) -> Self {
        Self { tensors }
    }
}

impl Runner for TensorRunner {
    fn name(&self) -> &str {
        "tensors"
    }

    fn run(&self, graph: &ModelGraph, batch: &Batch) -> Result<Vec<ResultSeries>> {
        let available = graph.collect_tensors(batch)?;
        let mut out = Vec::with_capacity(self.tensors.len());

        for wanted in &self.tensors {
            let tensor = available
                .iter()
                .find(|t| t.name == wanted.name)
                .ok_or_else(|| CoreError::UnknownReference(format!("tensor '{}'", wanted.name)))?;

            if wanted.batch_dim >= tensor.values.ndim()
                || tensor.values.shape()[wanted.batch_dim] != batch.len()
            {
                return Err(CoreError::BatchAlignment(format!(
                    "tensor '{}': dim {} does not hold {} examples (shape {:?})",
                    wanted.name,
                    wanted.batch_dim,
                    batch.len(),
                    tensor.values.shape()
                )));
            }

            let per_example: Vec<ArrayD<f32>> = (0..batch.len())
                .map(|i| tensor.values.index_axis(Axis(wanted.batch_dim), i).to_owned())
                .collect();

            out.push(ResultSeries {
                name: wanted.name.clone(),
                data: SeriesData::Tensors(per_example),
            });
        }

        Ok(out)
    }
}
