//! 词汇表
//!
//! 双向 token↔id 映射，从一个或多个数据序列按词频确定性构建。

use crate::dataset::Dataset;
use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// 填充 token 的保留 id
pub const PAD_ID: usize = 0;
/// 序列起始 token 的保留 id
pub const START_ID: usize = 1;
/// 序列结束 token 的保留 id
pub const END_ID: usize = 2;
/// 未知 token 的保留 id
pub const UNK_ID: usize = 3;

const PAD_TOKEN: &str = "<pad>";
const START_TOKEN: &str = "<s>";
const END_TOKEN: &str = "</s>";
const UNK_TOKEN: &str = "<unk>";

/// 词汇表
///
/// 构建后不可变；id 分配由语料和 max_size 唯一确定：
/// 按词频降序，频率相同时按首次出现顺序。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vocabulary {
    /// token 到 id 的映射
    token_to_id: HashMap<String, usize>,
    /// id 到 token 的映射
    id_to_token: Vec<String>,
}

impl Vocabulary {
    fn with_special_tokens() -> Self {
        let mut token_to_id = HashMap::new();
        let mut id_to_token = Vec::new();

        for token in [PAD_TOKEN, START_TOKEN, END_TOKEN, UNK_TOKEN] {
            token_to_id.insert(token.to_string(), id_to_token.len());
            id_to_token.push(token.to_string());
        }

        Self {
            token_to_id,
            id_to_token,
        }
    }

    /// 从数据集的指定序列构建词汇表
    ///
    /// # 参数
    /// - `datasets`: 参与统计的数据集
    /// - `series_ids`: 参与统计的序列名
    /// - `max_size`: 普通 token 的数量上限（不含保留 token）
    ///
    /// 未观察到任何 token 时返回 `VocabularyBuild` 错误。
    pub fn build(datasets: &[&Dataset], series_ids: &[&str], max_size: usize) -> Result<Self> {
        let mut counts: HashMap<String, usize> = HashMap::new();
        // 首次出现顺序，作为同频 token 的确定性决胜
        let mut first_seen: Vec<String> = Vec::new();

        for dataset in datasets {
            for series_id in series_ids {
                let series = dataset.series(series_id)?;
                for sentence in series {
                    for token in sentence {
                        match counts.get_mut(token) {
                            Some(c) => *c += 1,
                            None => {
                                counts.insert(token.clone(), 1);
                                first_seen.push(token.clone());
                            }
                        }
                    }
                }
            }
        }

        if counts.is_empty() {
            return Err(CoreError::VocabularyBuild(format!(
                "no tokens observed in series {:?}",
                series_ids
            )));
        }

        let mut ranked: Vec<(usize, String)> = first_seen
            .into_iter()
            .enumerate()
            .map(|(order, token)| (order, token))
            .collect();
        // 频率降序，同频按首次出现顺序
        ranked.sort_by(|a, b| counts[&b.1].cmp(&counts[&a.1]).then(a.0.cmp(&b.0)));

        let mut vocab = Self::with_special_tokens();
        for (_, token) in ranked.into_iter().take(max_size) {
            let id = vocab.id_to_token.len();
            vocab.token_to_id.insert(token.clone(), id);
            vocab.id_to_token.push(token);
        }

        Ok(vocab)
    }

    /// 将 token 序列编码为 id 序列
    ///
    /// 词汇表外的 token 映射为 `UNK_ID`。
    pub fn encode(&self, sequence: &[String]) -> Vec<usize> {
        sequence
            .iter()
            .map(|token| *self.token_to_id.get(token).unwrap_or(&UNK_ID))
            .collect()
    }

    /// 将 id 序列解码回 token 序列
    ///
    /// 在第一个 `END_ID` 处停止；跳过填充和起始标记。
    pub fn decode(&self, ids: &[usize]) -> Vec<String> {
        let mut tokens = Vec::new();
        for &id in ids {
            if id == END_ID {
                break;
            }
            if id == PAD_ID || id == START_ID {
                continue;
            }
            if let Some(token) = self.id_to_token.get(id) {
                tokens.push(token.clone());
            }
        }
        tokens
    }

    /// 词汇表大小（含保留 token）
    pub fn len(&self) -> usize {
        self.id_to_token.len()
    }

    /// 是否只包含保留 token
    pub fn is_empty(&self) -> bool {
        self.id_to_token.len() <= UNK_ID + 1
    }

    /// 查询 token 的 id
    pub fn id_of(&self, token: &str) -> Option<usize> {
        self.token_to_id.get(token).copied()
    }

    /// 保存词汇表
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path)?;
        let writer = BufWriter::new(file);
        serde_json::to_writer(writer, self)
            .map_err(|e| CoreError::Serialization(e.to_string()))?;
        Ok(())
    }

    /// 加载词汇表
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        serde_json::from_reader(reader).map_err(|e| CoreError::Serialization(e.to_string()))
    }
}
