//! 注意力机制
//!
//! 给定解码器当前查询状态和编码器的逐位置隐状态，计算归一化权重
//! 和上下文向量。跨步无状态：每个解码步独立调用。

use crate::tensor::{rowwise_dot, TensorExt};
use ndarray::{Array2, Axis};

/// 一次注意力计算的结果
#[derive(Debug, Clone)]
pub struct AttentionResult {
    /// 上下文向量 [batch, state_size]
    pub context: Array2<f32>,
    /// 位置权重 [batch, seq_len]，有效位置之和为 1，填充位置恰好为 0
    pub weights: Array2<f32>,
}

/// 注意力打分策略
///
/// 实现必须跨解码步无状态：除参数外不得持有任何步间记忆。
pub trait Attention: Send + Sync {
    /// 计算一步注意力
    ///
    /// # 输入
    /// - `query`: 解码器当前状态 [batch, state_size]
    /// - `states`: 编码器逐位置隐状态，每步 [batch, state_size]
    /// - `mask`: 有效位置掩码 [batch, seq_len]
    fn score(&self, query: &Array2<f32>, states: &[Array2<f32>], mask: &Array2<f32>)
        -> AttentionResult;

    /// 反向传播
    ///
    /// 给定上下文向量的梯度，返回查询梯度和每个编码器状态的梯度。
    fn backward(
        &self,
        query: &Array2<f32>,
        states: &[Array2<f32>],
        weights: &Array2<f32>,
        d_context: &Array2<f32>,
    ) -> (Array2<f32>, Vec<Array2<f32>>);

    /// 期望的编码器状态维度
    fn state_size(&self) -> usize;
}

/// 缩放点积注意力
///
/// ```text
/// e_t = (query · h_t) / √d
/// w   = masked_softmax(e)
/// c   = Σ w_t * h_t
/// ```
#[derive(Debug, Clone)]
pub struct ScaledDotAttention {
    state_size: usize,
}

impl ScaledDotAttention {
    pub fn new(state_size: usize) -> Self {
        Self { state_size }
    }

    fn scale(&self) -> f32 {
        1.0 / (self.state_size as f32).sqrt()
    }
}

impl Attention for ScaledDotAttention {
    fn score(
        &self,
        query: &Array2<f32>,
        states: &[Array2<f32>],
        mask: &Array2<f32>,
    ) -> AttentionResult {
        let batch = query.nrows();
        let seq_len = states.len();
        let scale = self.scale();

        let mut scores = Array2::zeros((batch, seq_len));
        for (t, h) in states.iter().enumerate() {
            let dots = rowwise_dot(query, h);
            for i in 0..batch {
                scores[[i, t]] = dots[i] * scale;
            }
        }

        let weights = scores.masked_softmax(mask);

        let mut context = Array2::zeros((batch, self.state_size));
        for (t, h) in states.iter().enumerate() {
            let w = weights.column(t).to_owned().insert_axis(Axis(1));
            context = context + h * &w;
        }

        AttentionResult { context, weights }
    }

    fn backward(
        &self,
        query: &Array2<f32>,
        states: &[Array2<f32>],
        weights: &Array2<f32>,
        d_context: &Array2<f32>,
    ) -> (Array2<f32>, Vec<Array2<f32>>) {
        let batch = query.nrows();
        let seq_len = states.len();
        let scale = self.scale();

        let mut d_query: Array2<f32> = Array2::zeros(query.dim());
        let mut d_states: Vec<Array2<f32>> =
            states.iter().map(|h| Array2::zeros(h.dim())).collect();

        // dL/dw_t = d_context · h_t；上下文对状态的直接贡献 w_t * d_context
        let mut d_weights = Array2::zeros((batch, seq_len));
        for (t, h) in states.iter().enumerate() {
            let dots = rowwise_dot(d_context, h);
            for i in 0..batch {
                d_weights[[i, t]] = dots[i];
            }
            let w = weights.column(t).to_owned().insert_axis(Axis(1));
            d_states[t] = &d_states[t] + &(d_context * &w);
        }

        // softmax 反向：de = w ⊙ (dw - Σ w ⊙ dw)，掩码位置 w=0 自然归零
        let inner = (weights * &d_weights).sum_axis(Axis(1)).insert_axis(Axis(1));
        let d_scores = weights * &(d_weights - &inner);

        for (t, h) in states.iter().enumerate() {
            let de = d_scores.column(t).to_owned().insert_axis(Axis(1));
            d_query = d_query + &(h * &de) * scale;
            d_states[t] = &d_states[t] + &(query * &de) * scale;
        }

        (d_query, d_states)
    }

    fn state_size(&self) -> usize {
        self.state_size
    }
}
