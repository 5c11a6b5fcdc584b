//! 评估指标
//!
//! 把生成的 token 序列与参考序列比较，给出标量分数。
//! 所有指标都约定分数越高越好。

use crate::dataset::Sentence;
use std::collections::HashMap;

/// 序列生成评估器
pub trait Evaluator: Send + Sync {
    /// 指标名称（用于日志）
    fn name(&self) -> &str;

    /// 计算整个数据集上的分数，越高越好
    fn score(&self, hypotheses: &[Sentence], references: &[Sentence]) -> f32;
}

/// BLEU score
///
/// # 参考文献
/// Papineni, K., Roukos, S., Ward, T., & Zhu, W. J. (2002).
/// BLEU: a method for automatic evaluation of machine translation.
pub struct BLEU {
    /// n-gram 大小（通常为 4）
    n: usize,
}

impl BLEU {
    pub fn new(n: usize) -> Self {
        assert!(n > 0, "BLEU needs at least unigrams");
        Self { n }
    }

    /// 默认 BLEU-4
    pub fn bleu4() -> Self {
        Self { n: 4 }
    }
}

impl Evaluator for BLEU {
    fn name(&self) -> &str {
        "BLEU"
    }

    /// # 返回
    /// - BLEU score [0, 1]
    fn score(&self, hypotheses: &[Sentence], references: &[Sentence]) -> f32 {
        assert_eq!(references.len(), hypotheses.len());

        let mut precisions = Vec::new();
        let mut bp_len_ref = 0;
        let mut bp_len_hyp = 0;

        // 计算 1-gram 到 n-gram 的精确率
        for n in 1..=self.n {
            let mut correct = 0;
            let mut total = 0;

            for (reference, hyp) in references.iter().zip(hypotheses.iter()) {
                let ref_ngrams = count_ngrams(reference, n);
                let hyp_ngrams = count_ngrams(hyp, n);

                for (ngram, &count) in hyp_ngrams.iter() {
                    let ref_count = ref_ngrams.get(ngram).unwrap_or(&0);
                    correct += *ref_count.min(&count);
                }

                total += hyp_ngrams.values().sum::<usize>();
            }

            let precision = if total > 0 {
                correct as f32 / total as f32
            } else {
                0.0
            };

            precisions.push(precision);
        }

        // 长度惩罚
        for reference in references.iter() {
            bp_len_ref += reference.len();
        }
        for hyp in hypotheses.iter() {
            bp_len_hyp += hyp.len();
        }

        let bp = if bp_len_hyp > 0 && bp_len_hyp < bp_len_ref {
            (1.0 - bp_len_ref as f32 / bp_len_hyp as f32).exp()
        } else {
            1.0
        };

        // 几何平均
        let geo_mean: f32 = precisions
            .iter()
            .product::<f32>()
            .powf(1.0 / precisions.len() as f32);

        bp * geo_mean
    }
}

/// 逐位置 token 准确率
///
/// 对短序列和小数据集比 BLEU 稳定，适合训练早期的验证信号。
pub struct TokenAccuracy;

impl Evaluator for TokenAccuracy {
    fn name(&self) -> &str {
        "TokenAccuracy"
    }

    fn score(&self, hypotheses: &[Sentence], references: &[Sentence]) -> f32 {
        assert_eq!(references.len(), hypotheses.len());

        let mut correct = 0;
        let mut total = 0;

        for (hyp, reference) in hypotheses.iter().zip(references.iter()) {
            total += reference.len().max(hyp.len());
            correct += hyp
                .iter()
                .zip(reference.iter())
                .filter(|(h, r)| h == r)
                .count();
        }

        if total > 0 {
            correct as f32 / total as f32
        } else {
            0.0
        }
    }
}

/// 计算 n-gram 计数
fn count_ngrams(tokens: &[String], n: usize) -> HashMap<&[String], usize> {
    let mut ngrams = HashMap::new();

    if tokens.len() < n {
        return ngrams;
    }

    for i in 0..=(tokens.len() - n) {
        *ngrams.entry(&tokens[i..i + n]).or_insert(0) += 1;
    }

    ngrams
}
