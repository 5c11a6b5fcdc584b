//! 梯度裁剪
//!
//! 按全局范数缩放梯度，防止梯度爆炸；范数已在阈值内时不做任何改动。

use ndarray::Array2;

/// 计算一组梯度的全局 Frobenius 范数
///
/// ||G|| = sqrt(Σ_i ||g_i||²)
pub fn global_grad_norm(grads: &[Array2<f32>]) -> f32 {
    let mut sum_squared = 0.0;

    for grad in grads {
        for &val in grad.iter() {
            sum_squared += val * val;
        }
    }

    sum_squared.sqrt()
}

/// 按全局范数就地裁剪
///
/// 如果全局范数超过 `max_norm`，所有梯度按同一比例缩放；
/// 否则保持不变。返回裁剪前的全局范数。
pub fn clip_global_norm(grads: &mut [Array2<f32>], max_norm: f32) -> f32 {
    let norm = global_grad_norm(grads);

    if norm > max_norm {
        let scale = max_norm / norm;
        for grad in grads.iter_mut() {
            grad.mapv_inplace(|g| g * scale);
        }
    }

    norm
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_grad_norm() {
        let grad1 = Array2::from_shape_vec((2, 2), vec![3.0, 4.0, 0.0, 0.0]).unwrap();
        // sqrt(3^2 + 4^2) = 5.0
        let norm = global_grad_norm(&[grad1]);
        assert!((norm - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_clip_rescales_above_threshold() {
        let mut grads = vec![Array2::from_shape_vec((2, 2), vec![3.0, 4.0, 0.0, 0.0]).unwrap()];
        // norm = 5.0, max_norm = 2.5, scale = 0.5
        let norm = clip_global_norm(&mut grads, 2.5);

        assert!((norm - 5.0).abs() < 1e-6);
        assert!((grads[0][[0, 0]] - 1.5).abs() < 1e-6);
        assert!((grads[0][[0, 1]] - 2.0).abs() < 1e-6);

        let clipped_norm = global_grad_norm(&grads);
        assert!((clipped_norm - 2.5).abs() < 1e-5);
    }

    #[test]
    fn test_clip_is_noop_under_threshold() {
        let mut grads = vec![Array2::from_shape_vec((2, 2), vec![1.0, 1.0, 0.0, 0.0]).unwrap()];
        // norm = sqrt(2) ≈ 1.414 < 2.5，不应该裁剪
        clip_global_norm(&mut grads, 2.5);

        assert_eq!(grads[0][[0, 0]], 1.0);
        assert_eq!(grads[0][[0, 1]], 1.0);
        assert_eq!(grads[0][[1, 0]], 0.0);
        assert_eq!(grads[0][[1, 1]], 0.0);
    }

    #[test]
    fn test_clip_spans_multiple_tensors() {
        let mut grads = vec![
            Array2::from_elem((1, 2), 3.0),
            Array2::from_elem((1, 2), 4.0),
        ];
        // 全局范数 = sqrt(2*9 + 2*16) = sqrt(50)
        clip_global_norm(&mut grads, 1.0);

        let norm = global_grad_norm(&grads);
        assert!((norm - 1.0).abs() < 1e-5);
    }
}
