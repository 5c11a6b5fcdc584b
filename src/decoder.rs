//! 注意力解码器
//!
//! 解码步状态机：训练时教师强制，推理时贪婪自回归。
//! 输出投影使用 maxout 非线性；`supress_unk` 只作用于推理期的
//! 选择阶段，从不影响训练损失。
//!
//! 对外暴露两个命名张量供 runner 提取：
//! - `decoded`: 每步选中的 token id
//! - `runtime_logits`: 每步选择前的打分

use crate::attention::Attention;
use crate::dropout::Dropout;
use crate::embedding::Embedding;
use crate::encoder::EncoderOutput;
use crate::tensor::TensorExt;
use crate::vocabulary::{Vocabulary, END_ID, START_ID, UNK_ID};
use ndarray::{concatenate, s, Array2, Axis};
use std::sync::Arc;

/// maxout 的分段数
const MAXOUT_POOL: usize = 2;

/// 解码器配置
#[derive(Debug, Clone)]
pub struct DecoderConfig {
    /// 目标端嵌入维度
    pub embedding_size: usize,
    /// 解码器状态维度
    pub rnn_size: usize,
    /// maxout 输出维度
    pub maxout_size: usize,
    /// 生成长度上限
    pub max_output_len: usize,
    /// 推理时抑制未知 token
    pub supress_unk: bool,
    /// 状态连接上的 dropout 保留概率
    pub dropout_keep_prob: f32,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            embedding_size: 32,
            rnn_size: 32,
            maxout_size: 32,
            max_output_len: 20,
            supress_unk: false,
            dropout_keep_prob: 1.0,
        }
    }
}

/// 单个解码步的前向轨迹
#[derive(Debug)]
struct StepTrace {
    input_tokens: Vec<usize>,
    y_emb: Array2<f32>,
    s_prev: Array2<f32>,
    weights: Array2<f32>,
    context: Array2<f32>,
    s_tanh: Array2<f32>,
    drop_mask: Option<Array2<f32>>,
    state: Array2<f32>,
    concat: Array2<f32>,
    argmax: Array2<usize>,
    maxout_out: Array2<f32>,
}

/// 教师强制前向的完整轨迹
#[derive(Debug)]
pub struct DecoderTrace {
    init_tanh: Array2<f32>,
    steps: Vec<StepTrace>,
}

/// 解码器参数梯度（与参数同形）
#[derive(Debug)]
pub struct DecoderGradients {
    pub embedding: Array2<f32>,
    pub w_input: Array2<f32>,
    pub w_state: Array2<f32>,
    pub w_context: Array2<f32>,
    pub bias: Array2<f32>,
    pub w_init: Array2<f32>,
    pub b_init: Array2<f32>,
    pub maxout_w: Array2<f32>,
    pub maxout_b: Array2<f32>,
    pub output_w: Array2<f32>,
    pub output_b: Array2<f32>,
}

impl DecoderGradients {
    /// 与 `named_parameters` 相同顺序展开
    pub fn into_named(self) -> Vec<(&'static str, Array2<f32>)> {
        vec![
            ("embedding", self.embedding),
            ("w_input", self.w_input),
            ("w_state", self.w_state),
            ("w_context", self.w_context),
            ("bias", self.bias),
            ("w_init", self.w_init),
            ("b_init", self.b_init),
            ("maxout_w", self.maxout_w),
            ("maxout_b", self.maxout_b),
            ("output_w", self.output_w),
            ("output_b", self.output_b),
        ]
    }
}

/// 贪婪解码结果
#[derive(Debug, Clone)]
pub struct GreedyOutput {
    /// 每个样本生成的 id 序列（到第一个 END 为止，不含 END）
    pub decoded: Vec<Vec<usize>>,
    /// 每步选中的 id，时间主序 [steps][batch]
    pub decoded_steps: Vec<Vec<usize>>,
    /// 每步选择前的打分，时间主序，每步 [batch, vocab]
    pub runtime_logits: Vec<Array2<f32>>,
}

/// 注意力解码器
pub struct AttentiveDecoder {
    pub(crate) embedding: Embedding,
    /// 输入投影 [embedding_size, rnn_size]
    pub(crate) w_input: Array2<f32>,
    /// 状态转移 [rnn_size, rnn_size]
    pub(crate) w_state: Array2<f32>,
    /// 上下文投影 [encoder_state_size, rnn_size]
    pub(crate) w_context: Array2<f32>,
    /// 偏置 [1, rnn_size]
    pub(crate) bias: Array2<f32>,
    /// 初始状态投影 [encoder_state_size, rnn_size]
    pub(crate) w_init: Array2<f32>,
    pub(crate) b_init: Array2<f32>,
    /// maxout 投影 [rnn + enc + emb, maxout_size * MAXOUT_POOL]
    pub(crate) maxout_w: Array2<f32>,
    pub(crate) maxout_b: Array2<f32>,
    /// 输出投影 [maxout_size, vocab]
    pub(crate) output_w: Array2<f32>,
    pub(crate) output_b: Array2<f32>,
    attention: Box<dyn Attention>,
    vocabulary: Arc<Vocabulary>,
    dropout: Dropout,
    config: DecoderConfig,
    encoder_state_size: usize,
}

impl std::fmt::Debug for AttentiveDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttentiveDecoder")
            .field("config", &self.config)
            .field("vocab_size", &self.vocabulary.len())
            .finish()
    }
}

impl AttentiveDecoder {
    pub fn new(
        vocabulary: Arc<Vocabulary>,
        attention: Box<dyn Attention>,
        encoder_state_size: usize,
        config: DecoderConfig,
    ) -> Self {
        let vocab_size = vocabulary.len();
        let concat_size = config.rnn_size + encoder_state_size + config.embedding_size;

        Self {
            embedding: Embedding::new(vocab_size, config.embedding_size),
            w_input: Array2::random_xavier((config.embedding_size, config.rnn_size)),
            w_state: Array2::random_xavier((config.rnn_size, config.rnn_size)),
            w_context: Array2::random_xavier((encoder_state_size, config.rnn_size)),
            bias: Array2::zeros((1, config.rnn_size)),
            w_init: Array2::random_xavier((encoder_state_size, config.rnn_size)),
            b_init: Array2::zeros((1, config.rnn_size)),
            maxout_w: Array2::random_xavier((concat_size, config.maxout_size * MAXOUT_POOL)),
            maxout_b: Array2::zeros((1, config.maxout_size * MAXOUT_POOL)),
            output_w: Array2::random_xavier((config.maxout_size, vocab_size)),
            output_b: Array2::zeros((1, vocab_size)),
            dropout: Dropout::new(config.dropout_keep_prob),
            attention,
            vocabulary,
            config,
            encoder_state_size,
        }
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    pub fn vocabulary(&self) -> &Arc<Vocabulary> {
        &self.vocabulary
    }

    pub fn encoder_state_size(&self) -> usize {
        self.encoder_state_size
    }

    /// 按固定顺序枚举参数
    pub(crate) fn named_parameters(&self) -> Vec<(&'static str, &Array2<f32>)> {
        vec![
            ("embedding", self.embedding.weights()),
            ("w_input", &self.w_input),
            ("w_state", &self.w_state),
            ("w_context", &self.w_context),
            ("bias", &self.bias),
            ("w_init", &self.w_init),
            ("b_init", &self.b_init),
            ("maxout_w", &self.maxout_w),
            ("maxout_b", &self.maxout_b),
            ("output_w", &self.output_w),
            ("output_b", &self.output_b),
        ]
    }

    pub(crate) fn named_parameters_mut(&mut self) -> Vec<(&'static str, &mut Array2<f32>)> {
        vec![
            ("embedding", self.embedding.weights_mut()),
            ("w_input", &mut self.w_input),
            ("w_state", &mut self.w_state),
            ("w_context", &mut self.w_context),
            ("bias", &mut self.bias),
            ("w_init", &mut self.w_init),
            ("b_init", &mut self.b_init),
            ("maxout_w", &mut self.maxout_w),
            ("maxout_b", &mut self.maxout_b),
            ("output_w", &mut self.output_w),
            ("output_b", &mut self.output_b),
        ]
    }

    /// 由编码器摘要状态初始化解码器状态
    pub fn initial_state(&self, enc: &EncoderOutput) -> Array2<f32> {
        (enc.final_state.matmul(&self.w_init) + &self.b_init).mapv(|v| v.tanh())
    }

    /// 单步解码
    ///
    /// # 输入
    /// - `prev_tokens`: 上一步的 token（训练时为真值，推理时为自身预测）
    /// - `state`: 当前解码器状态 [batch, rnn_size]
    ///
    /// # 返回
    /// - (logits [batch, vocab], 新状态 [batch, rnn_size])
    pub fn step(
        &self,
        prev_tokens: &[usize],
        state: &Array2<f32>,
        enc: &EncoderOutput,
    ) -> (Array2<f32>, Array2<f32>) {
        let (logits, trace) = self.compute_step(prev_tokens, state, enc, false);
        (logits, trace.state)
    }

    fn compute_step(
        &self,
        prev_tokens: &[usize],
        s_prev: &Array2<f32>,
        enc: &EncoderOutput,
        training: bool,
    ) -> (Array2<f32>, StepTrace) {
        let y_emb = self.embedding.forward(prev_tokens);
        let attn = self
            .attention
            .score(s_prev, &enc.temporal_states, &enc.mask);

        let a = y_emb.matmul(&self.w_input)
            + s_prev.matmul(&self.w_state)
            + attn.context.matmul(&self.w_context)
            + &self.bias;
        let s_tanh = a.mapv(|v| v.tanh());

        let drop_mask = self.dropout.sample_mask(s_tanh.dim(), training);
        let state = Dropout::apply(&s_tanh, drop_mask.as_ref());

        // maxout 输入：状态、上下文、上一步嵌入
        let concat = concatenate(
            Axis(1),
            &[state.view(), attn.context.view(), y_emb.view()],
        )
        .expect("concat dims verified at build time");

        let z = concat.matmul(&self.maxout_w) + &self.maxout_b;
        let batch = z.nrows();
        let m = self.config.maxout_size;

        let mut maxout_out = Array2::zeros((batch, m));
        let mut argmax = Array2::zeros((batch, m));
        for i in 0..batch {
            for j in 0..m {
                let mut best = f32::NEG_INFINITY;
                let mut best_k = 0;
                for k in 0..MAXOUT_POOL {
                    let v = z[[i, j * MAXOUT_POOL + k]];
                    if v > best {
                        best = v;
                        best_k = k;
                    }
                }
                maxout_out[[i, j]] = best;
                argmax[[i, j]] = best_k;
            }
        }

        let logits = maxout_out.matmul(&self.output_w) + &self.output_b;

        let trace = StepTrace {
            input_tokens: prev_tokens.to_vec(),
            y_emb,
            s_prev: s_prev.clone(),
            weights: attn.weights,
            context: attn.context,
            s_tanh,
            drop_mask,
            state,
            concat,
            argmax,
            maxout_out,
        };

        (logits, trace)
    }

    /// 教师强制前向
    ///
    /// 第 t 步的输入是真值序列的第 t-1 个 token（首步为 START），
    /// 与模型自身预测无关。返回每步 logits 和反向传播所需轨迹。
    pub fn forward_train(
        &self,
        enc: &EncoderOutput,
        target_ids: &Array2<usize>,
        training: bool,
    ) -> (Vec<Array2<f32>>, DecoderTrace) {
        let (batch, steps) = target_ids.dim();

        let init_tanh = self.initial_state(enc);
        let mut s_prev = init_tanh.clone();

        let mut logits_per_step = Vec::with_capacity(steps);
        let mut traces = Vec::with_capacity(steps);

        for t in 0..steps {
            let inputs: Vec<usize> = if t == 0 {
                vec![START_ID; batch]
            } else {
                (0..batch).map(|i| target_ids[[i, t - 1]]).collect()
            };

            let (logits, trace) = self.compute_step(&inputs, &s_prev, enc, training);
            s_prev = trace.state.clone();
            logits_per_step.push(logits);
            traces.push(trace);
        }

        (
            logits_per_step,
            DecoderTrace {
                init_tanh,
                steps: traces,
            },
        )
    }

    /// 贪婪推理
    ///
    /// 每步取概率最高的 token；每个样本在产出 END 后独立停止，
    /// 到 `max_output_len` 仍未结束的样本被截断。
    pub fn forward_greedy(&self, enc: &EncoderOutput) -> GreedyOutput {
        let batch = enc.final_state.nrows();
        let max_len = self.config.max_output_len;

        let mut s_prev = self.initial_state(enc);
        let mut finished = vec![false; batch];
        let mut prev: Vec<usize> = vec![START_ID; batch];

        let mut decoded: Vec<Vec<usize>> = vec![Vec::new(); batch];
        let mut decoded_steps = Vec::new();
        let mut runtime_logits = Vec::new();

        for _ in 0..max_len {
            if finished.iter().all(|&f| f) {
                break;
            }

            let (logits, trace) = self.compute_step(&prev, &s_prev, enc, false);
            s_prev = trace.state;

            let mut chosen = Vec::with_capacity(batch);
            for i in 0..batch {
                if finished[i] {
                    chosen.push(END_ID);
                    continue;
                }

                let row = logits.row(i);
                let mut best = f32::NEG_INFINITY;
                let mut best_id = END_ID;
                for (id, &v) in row.iter().enumerate() {
                    // 抑制 UNK 只发生在选择阶段
                    if self.config.supress_unk && id == UNK_ID {
                        continue;
                    }
                    if v > best {
                        best = v;
                        best_id = id;
                    }
                }

                if best_id == END_ID {
                    finished[i] = true;
                } else {
                    decoded[i].push(best_id);
                }
                chosen.push(best_id);
            }

            runtime_logits.push(logits);
            decoded_steps.push(chosen.clone());
            prev = chosen;
        }

        GreedyOutput {
            decoded,
            decoded_steps,
            runtime_logits,
        }
    }

    /// 反向传播
    ///
    /// # 输入
    /// - `d_logits`: 每步 logits 的梯度（已含损失归一化和长度掩码）
    ///
    /// # 返回
    /// - 解码器参数梯度、编码器逐位置状态梯度、编码器摘要状态梯度
    pub fn backward(
        &self,
        enc: &EncoderOutput,
        trace: &DecoderTrace,
        d_logits: &[Array2<f32>],
    ) -> (DecoderGradients, Vec<Array2<f32>>, Array2<f32>) {
        let h = self.config.rnn_size;
        let c = self.encoder_state_size;
        let m = self.config.maxout_size;
        let batch = trace.init_tanh.nrows();

        let mut grads = DecoderGradients {
            embedding: Array2::zeros(self.embedding.weights().dim()),
            w_input: Array2::zeros(self.w_input.dim()),
            w_state: Array2::zeros(self.w_state.dim()),
            w_context: Array2::zeros(self.w_context.dim()),
            bias: Array2::zeros(self.bias.dim()),
            w_init: Array2::zeros(self.w_init.dim()),
            b_init: Array2::zeros(self.b_init.dim()),
            maxout_w: Array2::zeros(self.maxout_w.dim()),
            maxout_b: Array2::zeros(self.maxout_b.dim()),
            output_w: Array2::zeros(self.output_w.dim()),
            output_b: Array2::zeros(self.output_b.dim()),
        };

        let mut d_enc_states: Vec<Array2<f32>> = enc
            .temporal_states
            .iter()
            .map(|s| Array2::zeros(s.dim()))
            .collect();

        let mut ds_next: Array2<f32> = Array2::zeros((batch, h));

        for (t, step) in trace.steps.iter().enumerate().rev() {
            let dl = &d_logits[t];

            // 输出投影
            grads.output_w = grads.output_w + step.maxout_out.t().to_owned().matmul(dl);
            grads.output_b = grads.output_b + dl.sum_axis(Axis(0)).insert_axis(Axis(0));
            let du = dl.matmul(&self.output_w.t().to_owned());

            // maxout：梯度只流向获胜分段
            let mut dz = Array2::zeros((batch, m * MAXOUT_POOL));
            for i in 0..batch {
                for j in 0..m {
                    let k = step.argmax[[i, j]];
                    dz[[i, j * MAXOUT_POOL + k]] = du[[i, j]];
                }
            }
            grads.maxout_w = grads.maxout_w + step.concat.t().to_owned().matmul(&dz);
            grads.maxout_b = grads.maxout_b + dz.sum_axis(Axis(0)).insert_axis(Axis(0));
            let dr = dz.matmul(&self.maxout_w.t().to_owned());

            let mut d_state = dr.slice(s![.., 0..h]).to_owned();
            let mut d_context = dr.slice(s![.., h..h + c]).to_owned();
            let mut d_y = dr.slice(s![.., h + c..]).to_owned();

            // 下一步经由状态转移回传的梯度
            d_state = d_state + &ds_next;

            // dropout 反向复用前向掩码
            let d_s_tanh = Dropout::apply(&d_state, step.drop_mask.as_ref());
            let da = d_s_tanh * step.s_tanh.mapv(|v| 1.0 - v * v);

            grads.w_input = grads.w_input + step.y_emb.t().to_owned().matmul(&da);
            grads.w_state = grads.w_state + step.s_prev.t().to_owned().matmul(&da);
            grads.w_context = grads.w_context + step.context.t().to_owned().matmul(&da);
            grads.bias = grads.bias + da.sum_axis(Axis(0)).insert_axis(Axis(0));

            d_y = d_y + da.matmul(&self.w_input.t().to_owned());
            self.embedding
                .accumulate_grad(&mut grads.embedding, &step.input_tokens, &d_y);

            d_context = d_context + da.matmul(&self.w_context.t().to_owned());
            let mut ds_prev = da.matmul(&self.w_state.t().to_owned());

            // 注意力反向：上下文梯度拆分到查询和编码器状态
            let (dq, dhs) = self.attention.backward(
                &step.s_prev,
                &enc.temporal_states,
                &step.weights,
                &d_context,
            );
            ds_prev = ds_prev + dq;
            for (acc, dh) in d_enc_states.iter_mut().zip(dhs) {
                *acc = &*acc + &dh;
            }

            ds_next = ds_prev;
        }

        // 初始状态投影
        let da_init = ds_next * trace.init_tanh.mapv(|v| 1.0 - v * v);
        grads.w_init = grads.w_init + enc.final_state.t().to_owned().matmul(&da_init);
        grads.b_init = grads.b_init + da_init.sum_axis(Axis(0)).insert_axis(Axis(0));
        let d_final = da_init.matmul(&self.w_init.t().to_owned());

        (grads, d_enc_states, d_final)
    }
}
