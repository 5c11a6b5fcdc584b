//! 嵌入层
//!
//! 将离散的 token id 转换为连续向量，编码器和解码器各持有一份。

use crate::tensor::TensorExt;
use ndarray::Array2;

/// 词嵌入层
///
/// 权重矩阵 [vocab_size, embedding_size]
#[derive(Debug, Clone)]
pub struct Embedding {
    weights: Array2<f32>,
}

impl Embedding {
    /// 创建新的嵌入层（Xavier 初始化）
    pub fn new(vocab_size: usize, embedding_size: usize) -> Self {
        Self {
            weights: Array2::random_xavier((vocab_size, embedding_size)),
        }
    }

    /// 查表
    ///
    /// # 输入
    /// - `tokens`: 一个时间步上整批的 token id [batch]
    ///
    /// # 输出
    /// - [batch, embedding_size]
    pub fn forward(&self, tokens: &[usize]) -> Array2<f32> {
        let mut out = Array2::zeros((tokens.len(), self.embedding_size()));
        for (i, &id) in tokens.iter().enumerate() {
            // 越界 id 保持零向量（构图期已校验词表大小，这里只做防御性下界）
            if id < self.weights.nrows() {
                out.row_mut(i).assign(&self.weights.row(id));
            }
        }
        out
    }

    /// 反向传播：把该时间步的梯度散射累加回嵌入表
    pub fn accumulate_grad(
        &self,
        grad_table: &mut Array2<f32>,
        tokens: &[usize],
        d_output: &Array2<f32>,
    ) {
        for (i, &id) in tokens.iter().enumerate() {
            if id < grad_table.nrows() {
                let mut row = grad_table.row_mut(id);
                row += &d_output.row(i);
            }
        }
    }

    pub fn vocab_size(&self) -> usize {
        self.weights.nrows()
    }

    pub fn embedding_size(&self) -> usize {
        self.weights.ncols()
    }

    pub fn weights(&self) -> &Array2<f32> {
        &self.weights
    }

    pub fn weights_mut(&mut self) -> &mut Array2<f32> {
        &mut self.weights
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_shape() {
        let emb = Embedding::new(10, 4);
        let out = emb.forward(&[0, 3, 7]);

        assert_eq!(out.shape(), &[3, 4]);
        assert_eq!(out.row(1), emb.weights().row(3));
    }

    #[test]
    fn test_grad_scatter_accumulates() {
        let emb = Embedding::new(5, 2);
        let mut grad = Array2::zeros((5, 2));

        let d_out = Array2::from_shape_vec((3, 2), vec![1.0, 1.0, 2.0, 2.0, 3.0, 3.0]).unwrap();
        // token 1 出现两次，梯度应相加
        emb.accumulate_grad(&mut grad, &[1, 1, 4], &d_out);

        assert!((grad[[1, 0]] - 3.0).abs() < 1e-6);
        assert!((grad[[4, 1]] - 3.0).abs() < 1e-6);
        assert_eq!(grad[[0, 0]], 0.0);
    }
}
