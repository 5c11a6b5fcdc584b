//! 数据集和批次
//!
//! 数据集以命名序列（series）的形式提供对齐的样本流；
//! 批次把 token 序列编码为等宽的 id 矩阵并记录真实长度。

use crate::error::{CoreError, Result};
use crate::vocabulary::{Vocabulary, END_ID, PAD_ID};
use ndarray::{s, Array2};
use std::collections::HashMap;

/// 一条 token 序列
pub type Sentence = Vec<String>;

/// 命名序列数据集
///
/// 每个序列是一个有序的句子流，同一数据集内各序列按样本下标对齐。
#[derive(Debug, Clone)]
pub struct Dataset {
    name: String,
    series: HashMap<String, Vec<Sentence>>,
}

impl Dataset {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            series: HashMap::new(),
        }
    }

    /// 数据集名称
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 添加一个命名序列
    pub fn add_series(&mut self, id: &str, sentences: Vec<Sentence>) {
        self.series.insert(id.to_string(), sentences);
    }

    /// 按名称取序列
    pub fn series(&self, id: &str) -> Result<&Vec<Sentence>> {
        self.series
            .get(id)
            .ok_or_else(|| CoreError::UnknownReference(format!("series '{}' in dataset '{}'", id, self.name)))
    }

    /// 是否包含某序列
    pub fn has_series(&self, id: &str) -> bool {
        self.series.contains_key(id)
    }

    /// 样本数（取第一个序列的长度）
    pub fn len(&self) -> usize {
        self.series.values().next().map_or(0, |s| s.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 编码为批次流
    ///
    /// 对 `series_vocabs` 中列出的每个序列用对应词汇表编码，
    /// 按 `batch_size` 切分。各序列样本数不一致时返回对齐错误。
    pub fn batches(
        &self,
        series_vocabs: &[(&str, &Vocabulary)],
        batch_size: usize,
    ) -> Result<Vec<Batch>> {
        assert!(batch_size > 0, "batch_size must be positive");

        let total = self.len();
        let mut batches = Vec::new();
        let mut start = 0;

        while start < total {
            let end = (start + batch_size).min(total);
            let mut slices = Vec::new();
            for &(id, vocab) in series_vocabs {
                let sentences = self.series(id)?;
                if sentences.len() != total {
                    return Err(CoreError::BatchAlignment(format!(
                        "dataset '{}': series '{}' has {} examples, expected {}",
                        self.name,
                        id,
                        sentences.len(),
                        total
                    )));
                }
                slices.push((id, vocab, &sentences[start..end]));
            }
            batches.push(Batch::build(&slices)?);
            start = end;
        }

        Ok(batches)
    }
}

/// 批次中的一个序列：矩形 id 矩阵加真实长度
#[derive(Debug, Clone)]
pub struct BatchSeries {
    /// token id 矩阵 [batch, max_len]，不足处以 PAD 填充
    pub ids: Array2<usize>,
    /// 每个样本的真实长度（含结束 token）
    pub lengths: Vec<usize>,
}

/// 训练/推理批次
///
/// 所有序列共享相同的样本数；构建失败的批次被跳过而不是中止训练。
#[derive(Debug, Clone)]
pub struct Batch {
    series: HashMap<String, BatchSeries>,
    examples: usize,
}

impl Batch {
    /// 从按名对齐的句子切片构建批次
    ///
    /// 每条句子编码后追加结束 token，真实长度把它计算在内。
    pub fn build(slices: &[(&str, &Vocabulary, &[Sentence])]) -> Result<Self> {
        let examples = slices.first().map_or(0, |(_, _, s)| s.len());

        for (id, _, sentences) in slices {
            if sentences.len() != examples {
                return Err(CoreError::BatchAlignment(format!(
                    "series '{}' has {} examples, expected {}",
                    id,
                    sentences.len(),
                    examples
                )));
            }
        }

        let mut series = HashMap::new();
        for (id, vocab, sentences) in slices {
            let encoded: Vec<Vec<usize>> = sentences
                .iter()
                .map(|sentence| {
                    let mut ids = vocab.encode(sentence);
                    ids.push(END_ID);
                    ids
                })
                .collect();

            let max_len = encoded.iter().map(|e| e.len()).max().unwrap_or(1);
            let mut ids = Array2::from_elem((examples, max_len), PAD_ID);
            let mut lengths = Vec::with_capacity(examples);

            for (i, row) in encoded.iter().enumerate() {
                lengths.push(row.len());
                for (j, &id_val) in row.iter().enumerate() {
                    ids[[i, j]] = id_val;
                }
            }

            series.insert(
                id.to_string(),
                BatchSeries { ids, lengths },
            );
        }

        Ok(Self { series, examples })
    }

    /// 按名称取批次序列
    pub fn series(&self, id: &str) -> Result<&BatchSeries> {
        self.series
            .get(id)
            .ok_or_else(|| CoreError::UnknownReference(format!("batch series '{}'", id)))
    }

    /// 样本数
    pub fn len(&self) -> usize {
        self.examples
    }

    pub fn is_empty(&self) -> bool {
        self.examples == 0
    }

    /// 把批次按行切成至多 `max_chunks` 份（用于推理并行）
    pub fn split(&self, max_chunks: usize) -> Vec<Batch> {
        let chunks = max_chunks.max(1).min(self.examples.max(1));
        let base = self.examples / chunks;
        let extra = self.examples % chunks;

        let mut out = Vec::with_capacity(chunks);
        let mut start = 0;
        for c in 0..chunks {
            let size = base + if c < extra { 1 } else { 0 };
            if size == 0 {
                continue;
            }
            let end = start + size;

            let mut series = HashMap::new();
            for (id, bs) in &self.series {
                series.insert(
                    id.clone(),
                    BatchSeries {
                        ids: bs.ids.slice(s![start..end, ..]).to_owned(),
                        lengths: bs.lengths[start..end].to_vec(),
                    },
                );
            }
            out.push(Batch {
                series,
                examples: size,
            });
            start = end;
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sent(words: &[&str]) -> Sentence {
        words.iter().map(|w| w.to_string()).collect()
    }

    fn toy() -> (Dataset, Vocabulary) {
        let mut dataset = Dataset::new("toy");
        dataset.add_series(
            "source",
            vec![sent(&["a", "b"]), sent(&["b"]), sent(&["a", "b", "a"])],
        );
        dataset.add_series(
            "target",
            vec![sent(&["b", "a"]), sent(&["a"]), sent(&["b"])],
        );
        let vocab = Vocabulary::build(&[&dataset], &["source", "target"], 10).unwrap();
        (dataset, vocab)
    }

    #[test]
    fn test_batch_shapes_and_lengths() {
        let (dataset, vocab) = toy();
        let batches = dataset
            .batches(&[("source", &vocab), ("target", &vocab)], 2)
            .unwrap();

        assert_eq!(batches.len(), 2);

        let first = &batches[0];
        assert_eq!(first.len(), 2);

        let src = first.series("source").unwrap();
        // 最长句 "a b" + END = 3
        assert_eq!(src.ids.shape(), &[2, 3]);
        assert_eq!(src.lengths, vec![3, 2]);

        // 填充位置是 PAD
        assert_eq!(src.ids[[1, 2]], PAD_ID);
        // 每句以 END 结尾
        assert_eq!(src.ids[[0, 2]], END_ID);
        assert_eq!(src.ids[[1, 1]], END_ID);
    }

    #[test]
    fn test_misaligned_series_rejected() {
        let mut dataset = Dataset::new("bad");
        dataset.add_series("source", vec![sent(&["a"]), sent(&["b"])]);
        dataset.add_series("target", vec![sent(&["a"])]);
        let vocab = Vocabulary::build(&[&dataset], &["source"], 10).unwrap();

        let result = dataset.batches(&[("source", &vocab), ("target", &vocab)], 2);
        assert!(matches!(result, Err(CoreError::BatchAlignment(_))));
    }

    #[test]
    fn test_split_preserves_examples() {
        let (dataset, vocab) = toy();
        let batches = dataset
            .batches(&[("source", &vocab)], 3)
            .unwrap();
        let batch = &batches[0];

        let chunks = batch.split(2);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len() + chunks[1].len(), batch.len());

        // 切分不能多于样本数
        let chunks = batch.split(10);
        assert_eq!(chunks.len(), 3);
    }

    #[test]
    fn test_unknown_series_is_reported() {
        let (dataset, _) = toy();
        assert!(dataset.series("missing").is_err());
    }
}
