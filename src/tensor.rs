//! 张量操作扩展和工具函数
//!
//! 基于 ndarray 实现编码器/注意力/解码器所需的张量操作。

use ndarray::{Array1, Array2, Axis};
use rand::Rng;
use std::ops::Add;

/// 张量扩展 trait
pub trait TensorExt<T> {
    /// 创建随机张量（Xavier 初始化）
    fn random_xavier(shape: (usize, usize)) -> Array2<T>
    where
        T: Add<Output = T> + num_traits::Float + rand::distributions::uniform::SampleUniform;

    /// 矩阵乘法
    fn matmul(&self, other: &Array2<T>) -> Array2<T>
    where
        T: num_traits::Num + Clone;

    /// 应用 softmax
    fn softmax(&self, axis: usize) -> Array2<T>
    where
        T: num_traits::Float + num_traits::NumAssign;

    /// 带掩码的 softmax
    ///
    /// 掩码为 0 的位置在归一化前被置为 -inf，归一化后权重恰好为 0。
    fn masked_softmax(&self, mask: &Array2<T>) -> Array2<T>
    where
        T: num_traits::Float + num_traits::NumAssign;

    /// Frobenius 范数的平方
    fn norm_squared(&self) -> T
    where
        T: num_traits::Float;
}

/// 为 f32 实现张量扩展
impl TensorExt<f32> for Array2<f32> {
    fn random_xavier(shape: (usize, usize)) -> Array2<f32> {
        let mut rng = rand::thread_rng();
        let limit = (6.0 / (shape.0 + shape.1) as f32).sqrt();

        Array2::from_shape_fn(shape, |_| rng.gen_range(-limit..limit))
    }

    fn matmul(&self, other: &Array2<f32>) -> Array2<f32> {
        self.dot(other)
    }

    fn softmax(&self, axis: usize) -> Array2<f32> {
        // 减去最大值以提高数值稳定性
        let max = self.fold_axis(Axis(axis), f32::NEG_INFINITY, |a, &b| a.max(b));
        let max_view = max.insert_axis(Axis(axis));

        let exp = (self - &max_view).mapv(|x: f32| x.exp());
        let sum = exp.sum_axis(Axis(axis));
        let sum_view = sum.insert_axis(Axis(axis));

        exp / sum_view
    }

    fn masked_softmax(&self, mask: &Array2<f32>) -> Array2<f32> {
        assert_eq!(self.dim(), mask.dim(), "mask shape must match scores");

        let masked = ndarray::Zip::from(self)
            .and(mask)
            .map_collect(|&s, &m| if m > 0.0 { s } else { f32::NEG_INFINITY });

        let soft = masked.softmax(1);
        // 全掩码行会产生 NaN（0/0），显式归零
        soft.mapv(|x| if x.is_finite() { x } else { 0.0 })
    }

    fn norm_squared(&self) -> f32 {
        self.iter().map(|&x| x * x).sum()
    }
}

/// 逐行点积：返回 [rows] 向量，r[i] = a.row(i) · b.row(i)
pub fn rowwise_dot(a: &Array2<f32>, b: &Array2<f32>) -> Array1<f32> {
    assert_eq!(a.dim(), b.dim(), "rowwise_dot shape mismatch");
    let mut out = Array1::zeros(a.nrows());
    for i in 0..a.nrows() {
        out[i] = a.row(i).dot(&b.row(i));
    }
    out
}

/// 序列长度掩码：[batch, seq_len]，有效位置为 1.0，填充位置为 0.0
pub fn length_mask(lengths: &[usize], seq_len: usize) -> Array2<f32> {
    let mut mask = Array2::zeros((lengths.len(), seq_len));
    for (i, &len) in lengths.iter().enumerate() {
        for j in 0..len.min(seq_len) {
            mask[[i, j]] = 1.0;
        }
    }
    mask
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matmul() {
        let a = Array2::from_shape_vec((2, 3), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let b = Array2::from_shape_vec((3, 2), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let c = a.matmul(&b);

        assert_eq!(c.shape(), &[2, 2]);
        assert!((c[[0, 0]] - 22.0).abs() < 1e-6);
    }

    #[test]
    fn test_softmax() {
        let x = Array2::from_shape_vec((1, 3), vec![1.0, 2.0, 3.0]).unwrap();
        let s = x.softmax(1);

        let sum: f32 = s.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_masked_softmax_zeroes_padding() {
        let scores = Array2::from_shape_vec((2, 3), vec![1.0, 2.0, 3.0, 0.5, 0.5, 0.5]).unwrap();
        let mask = Array2::from_shape_vec((2, 3), vec![1.0, 1.0, 0.0, 1.0, 0.0, 0.0]).unwrap();

        let w = scores.masked_softmax(&mask);

        // 填充位置权重恰好为 0
        assert_eq!(w[[0, 2]], 0.0);
        assert_eq!(w[[1, 1]], 0.0);
        assert_eq!(w[[1, 2]], 0.0);

        // 有效位置权重和为 1
        for row in 0..2 {
            let sum: f32 = w.row(row).iter().sum();
            assert!((sum - 1.0).abs() < 1e-5);
        }

        // 单个有效位置获得全部权重
        assert!((w[[1, 0]] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_length_mask() {
        let mask = length_mask(&[2, 3], 4);

        assert_eq!(mask[[0, 0]], 1.0);
        assert_eq!(mask[[0, 1]], 1.0);
        assert_eq!(mask[[0, 2]], 0.0);
        assert_eq!(mask[[1, 2]], 1.0);
        assert_eq!(mask[[1, 3]], 0.0);
    }

    #[test]
    fn test_rowwise_dot() {
        let a = Array2::from_shape_vec((2, 2), vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let b = Array2::from_shape_vec((2, 2), vec![5.0, 6.0, 7.0, 8.0]).unwrap();

        let r = rowwise_dot(&a, &b);
        assert!((r[0] - 17.0).abs() < 1e-6);
        assert!((r[1] - 53.0).abs() < 1e-6);
    }
}
