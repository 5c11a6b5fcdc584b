//! 序列编码器
//!
//! 嵌入 + tanh 循环单元，产出逐位置隐状态（temporal states）
//! 和整句摘要状态。填充位置通过长度掩码冻结，不参与注意力和摘要。

use crate::embedding::Embedding;
use crate::tensor::{length_mask, TensorExt};
use ndarray::{Array2, Axis};

/// 编码器输出
#[derive(Debug, Clone)]
pub struct EncoderOutput {
    /// 逐时间步隐状态，每步 [batch, rnn_size]
    pub temporal_states: Vec<Array2<f32>>,
    /// 有效位置掩码 [batch, seq_len]
    pub mask: Array2<f32>,
    /// 整句摘要状态 [batch, rnn_size]
    pub final_state: Array2<f32>,
}

/// 前向轨迹（反向传播所需的中间量）
#[derive(Debug)]
pub struct EncoderTrace {
    tokens: Vec<Vec<usize>>,
    embedded: Vec<Array2<f32>>,
    raw_states: Vec<Array2<f32>>,
    states: Vec<Array2<f32>>,
    mask: Array2<f32>,
}

/// 编码器参数梯度（与参数同形）
#[derive(Debug)]
pub struct EncoderGradients {
    pub embedding: Array2<f32>,
    pub w_input: Array2<f32>,
    pub w_state: Array2<f32>,
    pub bias: Array2<f32>,
}

impl EncoderGradients {
    /// 与 `named_parameters` 相同顺序展开
    pub fn into_named(self) -> Vec<(&'static str, Array2<f32>)> {
        vec![
            ("embedding", self.embedding),
            ("w_input", self.w_input),
            ("w_state", self.w_state),
            ("bias", self.bias),
        ]
    }
}

/// 循环序列编码器
#[derive(Debug, Clone)]
pub struct SequenceEncoder {
    pub(crate) embedding: Embedding,
    /// 输入投影 [embedding_size, rnn_size]
    pub(crate) w_input: Array2<f32>,
    /// 状态转移 [rnn_size, rnn_size]
    pub(crate) w_state: Array2<f32>,
    /// 偏置 [1, rnn_size]
    pub(crate) bias: Array2<f32>,
    rnn_size: usize,
}

impl SequenceEncoder {
    pub fn new(vocab_size: usize, embedding_size: usize, rnn_size: usize) -> Self {
        Self {
            embedding: Embedding::new(vocab_size, embedding_size),
            w_input: Array2::random_xavier((embedding_size, rnn_size)),
            w_state: Array2::random_xavier((rnn_size, rnn_size)),
            bias: Array2::zeros((1, rnn_size)),
            rnn_size,
        }
    }

    pub fn rnn_size(&self) -> usize {
        self.rnn_size
    }

    pub fn embedding_size(&self) -> usize {
        self.embedding.embedding_size()
    }

    pub fn vocab_size(&self) -> usize {
        self.embedding.vocab_size()
    }

    /// 按固定顺序枚举参数
    pub(crate) fn named_parameters(&self) -> Vec<(&'static str, &Array2<f32>)> {
        vec![
            ("embedding", self.embedding.weights()),
            ("w_input", &self.w_input),
            ("w_state", &self.w_state),
            ("bias", &self.bias),
        ]
    }

    pub(crate) fn named_parameters_mut(&mut self) -> Vec<(&'static str, &mut Array2<f32>)> {
        vec![
            ("embedding", self.embedding.weights_mut()),
            ("w_input", &mut self.w_input),
            ("w_state", &mut self.w_state),
            ("bias", &mut self.bias),
        ]
    }

    /// 编码一个批次
    ///
    /// # 输入
    /// - `ids`: [batch, seq_len] token id 矩阵
    /// - `lengths`: 每个样本的真实长度
    ///
    /// 超出真实长度的位置状态被冻结为上一个有效状态，
    /// 因此 `final_state` 恰好是每个样本最后一个有效位置的状态。
    pub fn forward(&self, ids: &Array2<usize>, lengths: &[usize]) -> (EncoderOutput, EncoderTrace) {
        let (batch, seq_len) = ids.dim();
        let mask = length_mask(lengths, seq_len);

        let mut h_prev: Array2<f32> = Array2::zeros((batch, self.rnn_size));

        let mut tokens = Vec::with_capacity(seq_len);
        let mut embedded = Vec::with_capacity(seq_len);
        let mut raw_states = Vec::with_capacity(seq_len);
        let mut states = Vec::with_capacity(seq_len);

        for t in 0..seq_len {
            let toks: Vec<usize> = (0..batch).map(|i| ids[[i, t]]).collect();
            let x = self.embedding.forward(&toks);

            let a = x.matmul(&self.w_input) + h_prev.matmul(&self.w_state) + &self.bias;
            let h_raw = a.mapv(|v| v.tanh());

            // 掩码混合：有效位置取新状态，填充位置保持旧状态
            let m = mask.column(t).to_owned().insert_axis(Axis(1));
            let h = &h_raw * &m + &h_prev * &(1.0 - &m);

            tokens.push(toks);
            embedded.push(x);
            raw_states.push(h_raw);
            states.push(h.clone());
            h_prev = h;
        }

        let final_state = h_prev;
        let output = EncoderOutput {
            temporal_states: states.clone(),
            mask: mask.clone(),
            final_state,
        };
        let trace = EncoderTrace {
            tokens,
            embedded,
            raw_states,
            states,
            mask,
        };

        (output, trace)
    }

    /// 反向传播（穿越时间）
    ///
    /// # 输入
    /// - `d_states`: 每个时间步隐状态的外部梯度（来自注意力）
    /// - `d_final`: 摘要状态的梯度（来自解码器初始化）
    pub fn backward(
        &self,
        trace: &EncoderTrace,
        d_states: &[Array2<f32>],
        d_final: &Array2<f32>,
    ) -> EncoderGradients {
        let seq_len = trace.states.len();
        let batch = trace.mask.nrows();

        let mut grads = EncoderGradients {
            embedding: Array2::zeros(self.embedding.weights().dim()),
            w_input: Array2::zeros(self.w_input.dim()),
            w_state: Array2::zeros(self.w_state.dim()),
            bias: Array2::zeros(self.bias.dim()),
        };

        let mut dh_next: Array2<f32> = Array2::zeros((batch, self.rnn_size));

        for t in (0..seq_len).rev() {
            let mut dh = d_states[t].clone() + &dh_next;
            if t == seq_len - 1 {
                dh = dh + d_final;
            }

            let m = trace.mask.column(t).to_owned().insert_axis(Axis(1));
            let dh_raw = &dh * &m;
            // 填充位置的梯度直通上一个状态
            let dh_carry = &dh * &(1.0 - &m);

            let raw = &trace.raw_states[t];
            let da = dh_raw * raw.mapv(|v| 1.0 - v * v);

            let h_prev = if t == 0 {
                Array2::zeros((batch, self.rnn_size))
            } else {
                trace.states[t - 1].clone()
            };

            grads.w_input = grads.w_input + trace.embedded[t].t().to_owned().matmul(&da);
            grads.w_state = grads.w_state + h_prev.t().to_owned().matmul(&da);
            grads.bias = grads.bias + da.sum_axis(Axis(0)).insert_axis(Axis(0));

            let dx = da.matmul(&self.w_input.t().to_owned());
            self.embedding
                .accumulate_grad(&mut grads.embedding, &trace.tokens[t], &dx);

            dh_next = dh_carry + da.matmul(&self.w_state.t().to_owned());
        }

        grads
    }
}
