//! 检查点
//!
//! 把模型参数和训练进度序列化到磁盘。写入先落到同目录的
//! 临时文件再原子重命名，崩溃时不会留下半截检查点。

use crate::error::{CoreError, Result};
use crate::graph::ModelGraph;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// 检查点格式版本
pub const CHECKPOINT_VERSION: u32 = 1;

/// 可序列化的二维数组
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerializableArray {
    data: Vec<f32>,
    shape: (usize, usize),
}

impl From<&Array2<f32>> for SerializableArray {
    fn from(arr: &Array2<f32>) -> Self {
        Self {
            data: arr.iter().cloned().collect(),
            shape: arr.dim(),
        }
    }
}

impl SerializableArray {
    pub fn shape(&self) -> (usize, usize) {
        self.shape
    }

    pub fn to_array(&self) -> Result<Array2<f32>> {
        Array2::from_shape_vec(self.shape, self.data.clone())
            .map_err(|e| CoreError::Serialization(e.to_string()))
    }
}

/// 训练检查点
///
/// 参数按模型图的规范命名顺序存储，恢复时逐一核对名称和形状。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    /// 已完成的 epoch 序号
    pub epoch: usize,
    /// 全局训练步数
    pub global_step: usize,
    /// 迄今最好的验证分数
    pub best_score: Option<f32>,
    params: Vec<(String, SerializableArray)>,
}

impl Checkpoint {
    /// 抓取当前模型参数
    pub fn capture(
        graph: &ModelGraph,
        epoch: usize,
        global_step: usize,
        best_score: Option<f32>,
    ) -> Self {
        let params = graph
            .parameters()
            .into_iter()
            .map(|(name, param)| (name, SerializableArray::from(param)))
            .collect();

        Self {
            version: CHECKPOINT_VERSION,
            epoch,
            global_step,
            best_score,
            params,
        }
    }

    /// 把存储的参数写回模型
    ///
    /// 版本、参数名或形状不一致时整体失败，模型保持原样。
    pub fn restore_into(&self, graph: &mut ModelGraph) -> Result<()> {
        if self.version != CHECKPOINT_VERSION {
            return Err(CoreError::Serialization(format!(
                "unsupported checkpoint version {} (current {})",
                self.version, CHECKPOINT_VERSION
            )));
        }

        let mut stored = Vec::with_capacity(self.params.len());
        for (name, arr) in &self.params {
            stored.push((name.clone(), arr.to_array()?));
        }

        graph.restore(&stored)
    }

    /// 保存到文件（临时文件 + 重命名）
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let tmp_path = path.with_extension("tmp");

        {
            let file = File::create(&tmp_path)?;
            let writer = BufWriter::new(file);
            bincode::serialize_into(writer, self)
                .map_err(|e| CoreError::Serialization(e.to_string()))?;
        }

        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }

    /// 从文件加载
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        bincode::deserialize_from(reader).map_err(|e| CoreError::Serialization(e.to_string()))
    }
}
