//! 优化器
//!
//! 实现常见的优化算法：SGD、Adam。

use ndarray::Array2;
use std::collections::HashMap;

/// 优化器 trait
pub trait Optimizer: Send {
    /// 更新参数
    fn step(&mut self, param: &mut Array2<f32>, grad: &Array2<f32>, param_name: &str);

    /// 获取当前学习率
    fn lr(&self) -> f32;

    /// 设置学习率
    fn set_lr(&mut self, lr: f32);

    /// 优化器名称
    fn name(&self) -> &str;
}

/// SGD（随机梯度下降）
///
/// ```text
/// param = param - lr * grad
/// ```
#[derive(Debug, Clone)]
pub struct SGD {
    lr: f32,
}

impl SGD {
    pub fn new(lr: f32) -> Self {
        Self { lr }
    }
}

impl Optimizer for SGD {
    fn step(&mut self, param: &mut Array2<f32>, grad: &Array2<f32>, _param_name: &str) {
        *param = &*param - &(grad.mapv(|g| g * self.lr));
    }

    fn lr(&self) -> f32 {
        self.lr
    }

    fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }

    fn name(&self) -> &str {
        "SGD"
    }
}

/// Adam 优化器
///
/// ```text
/// m = β1 * m + (1 - β1) * grad
/// v = β2 * v + (1 - β2) * grad²
/// m_hat = m / (1 - β1^t)
/// v_hat = v / (1 - β2^t)
/// param = param - lr * m_hat / (√v_hat + ε)
/// ```
#[derive(Debug, Clone)]
pub struct Adam {
    lr: f32,
    beta1: f32,
    beta2: f32,
    eps: f32,
    /// 一阶矩估计
    m: HashMap<String, Array2<f32>>,
    /// 二阶矩估计
    v: HashMap<String, Array2<f32>>,
    /// 每个参数各自的时间步（偏差修正按参数计数）
    t: HashMap<String, usize>,
}

impl Adam {
    pub fn new(lr: f32) -> Self {
        Self {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            m: HashMap::new(),
            v: HashMap::new(),
            t: HashMap::new(),
        }
    }

    pub fn with_betas(mut self, beta1: f32, beta2: f32) -> Self {
        self.beta1 = beta1;
        self.beta2 = beta2;
        self
    }
}

impl Optimizer for Adam {
    fn step(&mut self, param: &mut Array2<f32>, grad: &Array2<f32>, param_name: &str) {
        let t = self.t.entry(param_name.to_string()).or_insert(0);
        *t += 1;
        let t = *t as i32;
        let (beta1, beta2) = (self.beta1, self.beta2);

        let m = self
            .m
            .entry(param_name.to_string())
            .or_insert_with(|| Array2::zeros(param.dim()));
        *m = m.mapv(|x| beta1 * x) + &(grad.mapv(|g| g * (1.0 - beta1)));

        let v = self
            .v
            .entry(param_name.to_string())
            .or_insert_with(|| Array2::zeros(param.dim()));
        *v = v.mapv(|x| beta2 * x) + &(grad.mapv(|g| g * g * (1.0 - beta2)));

        // 偏差修正
        let m_hat = self.m[param_name].mapv(|x| x / (1.0 - beta1.powi(t)));
        let v_hat = self.v[param_name].mapv(|x| x / (1.0 - beta2.powi(t)));

        let update = m_hat / &(v_hat.mapv(|x| x.sqrt() + self.eps));
        *param = &*param - &(update.mapv(|x| x * self.lr));
    }

    fn lr(&self) -> f32 {
        self.lr
    }

    fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }

    fn name(&self) -> &str {
        "Adam"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    #[test]
    fn test_sgd() {
        let mut optimizer = SGD::new(0.01);
        let mut param = arr2(&[[1.0, 2.0]]);
        let grad = arr2(&[[0.1, 0.2]]);

        optimizer.step(&mut param, &grad, "test");

        // param = param - lr * grad
        assert!((param[[0, 0]] - 0.999).abs() < 1e-5);
        assert!((param[[0, 1]] - 1.998).abs() < 1e-5);
    }

    #[test]
    fn test_adam() {
        let mut optimizer = Adam::new(0.01);
        let mut param = arr2(&[[1.0, 2.0]]);
        let grad = arr2(&[[0.1, 0.2]]);

        optimizer.step(&mut param, &grad, "test");

        // Adam 的更新更复杂，这里只检查参数确实朝梯度反方向移动
        assert!(param[[0, 0]] < 1.0);
        assert!(param[[0, 1]] < 2.0);
    }

    #[test]
    fn test_adam_state_is_per_parameter() {
        let mut optimizer = Adam::new(0.01);
        let mut a = arr2(&[[1.0]]);
        let mut b = arr2(&[[1.0]]);
        let grad = arr2(&[[0.5]]);

        optimizer.step(&mut a, &grad, "a");
        optimizer.step(&mut b, &grad, "b");

        // 两个参数各自维护矩估计和时间步，首步更新应相同
        assert!((a[[0, 0]] - b[[0, 0]]).abs() < 1e-7);
    }

    #[test]
    fn test_adam_bias_correction_counts_per_parameter() {
        // 偏差修正的 t 按参数计数：更新过别的参数
        // 不应改变本参数首步的更新量
        let mut interleaved = Adam::new(0.01);
        let mut other = arr2(&[[1.0]]);
        let mut a = arr2(&[[1.0]]);
        let grad = arr2(&[[0.5]]);
        interleaved.step(&mut other, &grad, "other");
        interleaved.step(&mut a, &grad, "a");

        let mut alone = Adam::new(0.01);
        let mut b = arr2(&[[1.0]]);
        alone.step(&mut b, &grad, "b");

        assert!((a[[0, 0]] - b[[0, 0]]).abs() < 1e-7);
    }

    #[test]
    fn test_lr_scheduling() {
        let mut optimizer = SGD::new(0.01);

        assert_eq!(optimizer.lr(), 0.01);

        optimizer.set_lr(0.001);

        assert_eq!(optimizer.lr(), 0.001);
    }
}
