//! Dropout 正则化
//!
//! Inverted dropout：训练时按保留概率采样掩码并放大，推理时恒等。
//! 掩码保存在前向轨迹里，反向传播复用同一份。

use ndarray::Array2;
use rand::Rng;

/// Dropout 配置
#[derive(Debug, Clone, Copy)]
pub struct Dropout {
    /// 保留概率，1.0 表示关闭 dropout
    pub keep_prob: f32,
}

impl Dropout {
    pub fn new(keep_prob: f32) -> Self {
        assert!(
            keep_prob > 0.0 && keep_prob <= 1.0,
            "keep_prob must be in (0, 1]"
        );
        Self { keep_prob }
    }

    /// 采样掩码
    ///
    /// 掩码元素为 0 或 1/keep_prob，前向和反向都直接逐元素相乘即可。
    /// 推理模式或 keep_prob = 1.0 时返回 None。
    pub fn sample_mask(&self, shape: (usize, usize), training: bool) -> Option<Array2<f32>> {
        if !training || self.keep_prob >= 1.0 {
            return None;
        }

        let mut rng = rand::thread_rng();
        let scale = 1.0 / self.keep_prob;
        Some(Array2::from_shape_fn(shape, |_| {
            if rng.gen_range(0.0f32..1.0) < self.keep_prob {
                scale
            } else {
                0.0
            }
        }))
    }

    /// 应用掩码（掩码为 None 时恒等）
    pub fn apply(x: &Array2<f32>, mask: Option<&Array2<f32>>) -> Array2<f32> {
        match mask {
            Some(m) => x * m,
            None => x.clone(),
        }
    }
}
