//! 实验主循环
//!
//! 把训练器、执行管理器、runner 和评估器串成完整的实验：
//! 按 epoch 遍历训练批次，按周期记录日志和验证，验证分数
//! 提升时保存检查点，训练结束后在测试集上产出输出文件。
//! 外部可通过停止句柄在批次边界优雅中止。

use crate::dataset::{Dataset, Sentence};
use crate::error::Result;
use crate::execution::ExecutionManager;
use crate::metrics::Evaluator;
use crate::runners::{ResultSeries, Runner, SeriesData};
use crate::trainer::CrossEntropyTrainer;
use ndarray::ArrayD;
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// 实验配置
#[derive(Debug, Clone)]
pub struct ExperimentConfig {
    /// 训练轮数
    pub epochs: usize,
    pub batch_size: usize,
    /// 每多少个训练步记录一次日志，0 表示关闭
    pub logging_period: usize,
    /// 每多少个训练步验证一次，0 表示关闭
    pub validation_period: usize,
    /// 检查点路径
    pub checkpoint_path: PathBuf,
    /// 测试集输出目录，None 表示不落盘
    pub output_dir: Option<PathBuf>,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            epochs: 10,
            batch_size: 32,
            logging_period: 20,
            validation_period: 100,
            checkpoint_path: PathBuf::from("model.ckpt"),
            output_dir: None,
        }
    }
}

/// 实验结束后的摘要
#[derive(Debug, Clone)]
pub struct ExperimentReport {
    /// 实际完成的 epoch 数
    pub epochs_completed: usize,
    /// 总训练步数
    pub steps: usize,
    /// 每个 epoch 的平均损失
    pub epoch_losses: Vec<f32>,
    /// 最好的验证分数
    pub best_score: Option<f32>,
    /// 是否因停止信号提前结束
    pub stopped_early: bool,
}

/// 一次完整的训练实验
pub struct Experiment {
    config: ExperimentConfig,
    manager: ExecutionManager,
    trainer: CrossEntropyTrainer,
    runners: Vec<Box<dyn Runner>>,
    evaluators: Vec<Box<dyn Evaluator>>,
    stop: Arc<AtomicBool>,
    best_score: Option<f32>,
    start_epoch: usize,
}

impl Experiment {
    pub fn new(
        manager: ExecutionManager,
        trainer: CrossEntropyTrainer,
        runners: Vec<Box<dyn Runner>>,
        evaluators: Vec<Box<dyn Evaluator>>,
        config: ExperimentConfig,
    ) -> Self {
        Self {
            config,
            manager,
            trainer,
            runners,
            evaluators,
            stop: Arc::new(AtomicBool::new(false)),
            best_score: None,
            start_epoch: 0,
        }
    }

    /// 停止句柄：置位后训练在下一个批次边界结束
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    pub fn manager(&self) -> &ExecutionManager {
        &self.manager
    }

    /// 从检查点续训
    ///
    /// 恢复模型参数、全局步数、最好分数，并从记录的 epoch 继续。
    pub fn resume_from<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let checkpoint = self.manager.load_checkpoint(path)?;
        self.start_epoch = checkpoint.epoch;
        self.best_score = checkpoint.best_score;
        self.trainer.set_global_step(checkpoint.global_step);

        log::info!(
            "resumed from checkpoint: epoch {}, step {}",
            checkpoint.epoch,
            checkpoint.global_step
        );
        Ok(())
    }

    /// 跑完整个实验
    ///
    /// 训练 + 周期验证 + 测试集输出。验证依次覆盖所有验证集，
    /// 主分数取第一个验证集上的第一个分数。不可恢复的错误立即
    /// 中止；数值不稳定的批次被跳过并记录。
    pub fn run(
        &mut self,
        train: &Dataset,
        validation: &[&Dataset],
        tests: &[&Dataset],
    ) -> Result<ExperimentReport> {
        if self.config.batch_size == 0 {
            return Err(crate::error::CoreError::InvalidConfig(
                "batch_size must be positive".to_string(),
            ));
        }

        let batches = self
            .manager
            .with_graph(|g| train.batches(&g.train_series_vocabs(), self.config.batch_size))?;

        log::info!(
            "starting experiment: {} epochs, {} batches per epoch",
            self.config.epochs,
            batches.len()
        );

        let mut epoch_losses = Vec::new();
        let mut epochs_completed = self.start_epoch;
        let mut stopped_early = false;

        'epochs: for epoch in self.start_epoch..self.config.epochs {
            let mut epoch_loss = 0.0;
            let mut counted = 0usize;

            for batch in &batches {
                if self.stop.load(Ordering::Relaxed) {
                    log::info!("stop requested, ending at batch boundary");
                    stopped_early = true;
                    break 'epochs;
                }

                match self.manager.run_train(&mut self.trainer, batch) {
                    Ok(stats) => {
                        epoch_loss += stats.loss;
                        counted += 1;

                        if self.config.logging_period > 0
                            && stats.step % self.config.logging_period == 0
                        {
                            log::info!(
                                "epoch {} step {}: loss {:.4}, grad norm {:.4}",
                                epoch,
                                stats.step,
                                stats.loss,
                                stats.grad_norm
                            );
                        }

                        if self.config.validation_period > 0
                            && stats.step % self.config.validation_period == 0
                            && !validation.is_empty()
                        {
                            self.validate_and_checkpoint(validation, epoch)?;
                        }
                    }
                    Err(e) if !e.is_fatal() => {
                        log::warn!("skipping batch: {}", e);
                    }
                    Err(e) => return Err(e),
                }
            }

            let avg = if counted > 0 {
                epoch_loss / counted as f32
            } else {
                f32::NAN
            };
            epoch_losses.push(avg);
            epochs_completed = epoch + 1;
            log::info!("epoch {} done: avg loss {:.4}", epoch, avg);

            if validation.is_empty() {
                // 没有验证集就按 epoch 保存进度
                self.manager.save_checkpoint(
                    &self.config.checkpoint_path,
                    epochs_completed,
                    self.trainer.global_step(),
                    self.best_score,
                )?;
            }
        }

        // 收尾验证，保证最后的改进也被保存
        if !stopped_early && !validation.is_empty() {
            self.validate_and_checkpoint(validation, epochs_completed)?;
        }

        for test in tests {
            self.run_test_pass(test)?;
        }

        Ok(ExperimentReport {
            epochs_completed,
            steps: self.trainer.global_step(),
            epoch_losses,
            best_score: self.best_score,
            stopped_early,
        })
    }

    fn validate_and_checkpoint(&mut self, datasets: &[&Dataset], epoch: usize) -> Result<()> {
        // 所有验证集都跑，主分数取第一个产出的分数
        let mut primary = None;
        for dataset in datasets {
            let score = self.validate(dataset)?;
            if primary.is_none() {
                primary = score;
            }
        }
        let score = match primary {
            Some(score) => score,
            None => return Ok(()),
        };

        let improved = self.best_score.map_or(true, |best| score > best);
        if improved {
            log::info!(
                "validation improved to {:.4} (was {:?}), saving checkpoint",
                score,
                self.best_score
            );
            self.best_score = Some(score);
            self.manager.save_checkpoint(
                &self.config.checkpoint_path,
                epoch,
                self.trainer.global_step(),
                self.best_score,
            )?;
        }

        Ok(())
    }

    /// 在一个验证集上跑所有 runner 并打分
    ///
    /// 每个 runner 的假设与它所依附解码器的目标序列比较，
    /// 不同解码器各对各的参照。返回第一个产出的分数。
    fn validate(&self, dataset: &Dataset) -> Result<Option<f32>> {
        let batches = self
            .manager
            .with_graph(|g| dataset.batches(&g.infer_series_vocabs(), self.config.batch_size))?;

        let mut primary = None;

        for runner in &self.runners {
            let decoder_name = match runner.decoder() {
                Some(name) => name,
                None => continue,
            };
            let target_series = self
                .manager
                .with_graph(|g| g.decoder(decoder_name).map(|b| b.target_series.clone()))?;
            let references: Vec<Sentence> = dataset.series(&target_series)?.clone();

            let merged = self.run_over_batches(runner.as_ref(), &batches)?;

            for series in &merged {
                let hypotheses = match &series.data {
                    SeriesData::Sentences(s) => s,
                    _ => continue,
                };

                for evaluator in &self.evaluators {
                    let score = evaluator.score(hypotheses, &references);
                    log::info!(
                        "validation '{}' {} on '{}': {:.4}",
                        dataset.name(),
                        evaluator.name(),
                        series.name,
                        score
                    );
                    if primary.is_none() {
                        primary = Some(score);
                    }
                }
            }
        }

        Ok(primary)
    }

    /// 对一个数据集跑 runner，把每个批次的结果按序列合并
    fn run_over_batches(
        &self,
        runner: &dyn Runner,
        batches: &[crate::dataset::Batch],
    ) -> Result<Vec<ResultSeries>> {
        let mut per_batch = Vec::with_capacity(batches.len());
        for batch in batches {
            per_batch.push(self.manager.run_inference(runner, batch)?);
        }

        let series_count = per_batch.first().map_or(0, |s| s.len());
        let mut merged = Vec::with_capacity(series_count);
        for idx in 0..series_count {
            let parts: Vec<ResultSeries> = per_batch.iter().map(|s| s[idx].clone()).collect();
            merged.push(ResultSeries::concat(parts)?);
        }
        Ok(merged)
    }

    /// 测试集推理：产出结果并按需写到输出目录
    fn run_test_pass(&self, dataset: &Dataset) -> Result<()> {
        let batches = self
            .manager
            .with_graph(|g| dataset.batches(&g.infer_series_vocabs(), self.config.batch_size))?;

        for runner in &self.runners {
            let merged = self.run_over_batches(runner.as_ref(), &batches)?;

            for series in &merged {
                log::info!(
                    "test '{}' series '{}': {} examples",
                    dataset.name(),
                    series.name,
                    series.len()
                );

                if let Some(dir) = &self.config.output_dir {
                    write_series(dir, dataset.name(), series)?;
                }
            }
        }

        Ok(())
    }
}

#[derive(Serialize)]
struct TensorJson {
    shape: Vec<usize>,
    values: Vec<f32>,
}

impl From<&ArrayD<f32>> for TensorJson {
    fn from(arr: &ArrayD<f32>) -> Self {
        Self {
            shape: arr.shape().to_vec(),
            values: arr.iter().cloned().collect(),
        }
    }
}

/// 把一个结果序列写到 `<dir>/<dataset>.<series>` 下
///
/// 句子写成每行一句的文本，向量和张量写成 JSON。
fn write_series(dir: &Path, dataset_name: &str, series: &ResultSeries) -> Result<()> {
    std::fs::create_dir_all(dir)?;

    match &series.data {
        SeriesData::Sentences(sentences) => {
            let path = dir.join(format!("{}.{}.txt", dataset_name, series.name));
            let mut file = std::fs::File::create(path)?;
            for sentence in sentences {
                writeln!(file, "{}", sentence.join(" "))?;
            }
        }
        SeriesData::Vectors(vectors) => {
            let path = dir.join(format!("{}.{}.json", dataset_name, series.name));
            let json = serde_json::to_string(vectors)
                .map_err(|e| crate::error::CoreError::Serialization(e.to_string()))?;
            std::fs::write(path, json)?;
        }
        SeriesData::Tensors(tensors) => {
            let path = dir.join(format!("{}.{}.json", dataset_name, series.name));
            let payload: Vec<TensorJson> = tensors.iter().map(TensorJson::from).collect();
            let json = serde_json::to_string(&payload)
                .map_err(|e| crate::error::CoreError::Serialization(e.to_string()))?;
            std::fs::write(path, json)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attention::ScaledDotAttention;
    use crate::decoder::{AttentiveDecoder, DecoderConfig};
    use crate::encoder::SequenceEncoder;
    use crate::execution::ExecutionConfig;
    use crate::graph::{DecoderBinding, ModelGraph};
    use crate::metrics::TokenAccuracy;
    use crate::optimizer::SGD;
    use crate::runners::GreedyRunner;
    use crate::trainer::TrainerConfig;
    use crate::vocabulary::Vocabulary;

    fn sent(words: &[&str]) -> Sentence {
        words.iter().map(|w| w.to_string()).collect()
    }

    fn toy_dataset(name: &str) -> Dataset {
        let mut dataset = Dataset::new(name);
        dataset.add_series(
            "source",
            vec![
                sent(&["a", "b"]),
                sent(&["b", "a"]),
                sent(&["a"]),
                sent(&["b"]),
            ],
        );
        dataset.add_series(
            "target",
            vec![sent(&["x"]), sent(&["y"]), sent(&["x"]), sent(&["y"])],
        );
        dataset
    }

    fn toy_experiment(dir: &Path) -> (Experiment, Dataset) {
        let dataset = toy_dataset("train");
        let vocab = Arc::new(
            Vocabulary::build(&[&dataset], &["source", "target"], 20).unwrap(),
        );

        let encoder = SequenceEncoder::new(vocab.len(), 4, 6);
        let decoder = AttentiveDecoder::new(
            vocab.clone(),
            Box::new(ScaledDotAttention::new(6)),
            6,
            DecoderConfig {
                embedding_size: 4,
                rnn_size: 6,
                maxout_size: 3,
                max_output_len: 5,
                ..DecoderConfig::default()
            },
        );
        let graph = ModelGraph::new(
            encoder,
            "source",
            vocab,
            vec![DecoderBinding {
                name: "decoder".to_string(),
                target_series: "target".to_string(),
                decoder,
            }],
        )
        .unwrap();

        let manager = ExecutionManager::new(graph, ExecutionConfig::default());
        let trainer =
            CrossEntropyTrainer::new(TrainerConfig::default(), Box::new(SGD::new(0.1)));

        let experiment = Experiment::new(
            manager,
            trainer,
            vec![Box::new(GreedyRunner::new("translation", "decoder"))],
            vec![Box::new(TokenAccuracy)],
            ExperimentConfig {
                epochs: 2,
                batch_size: 2,
                logging_period: 1,
                validation_period: 2,
                checkpoint_path: dir.join("model.ckpt"),
                output_dir: Some(dir.join("out")),
            },
        );

        (experiment, dataset)
    }

    #[test]
    fn test_full_run_produces_report_and_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let (mut experiment, train) = toy_experiment(dir.path());
        let validation = toy_dataset("val");
        let test = toy_dataset("test");

        let report = experiment
            .run(&train, &[&validation], &[&test])
            .unwrap();

        assert_eq!(report.epochs_completed, 2);
        assert_eq!(report.epoch_losses.len(), 2);
        assert!(report.epoch_losses.iter().all(|l| l.is_finite()));
        assert!(report.steps > 0);
        assert!(!report.stopped_early);

        // 验证过至少一次，最佳分数被记录且检查点落盘
        assert!(report.best_score.is_some());
        assert!(dir.path().join("model.ckpt").exists());

        // 测试集输出文件
        assert!(dir.path().join("out/test.translation.txt").exists());
    }

    #[test]
    fn test_zero_batch_size_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let (mut experiment, train) = toy_experiment(dir.path());
        experiment.config.batch_size = 0;

        // 取值错误返回配置错误而不是中止进程
        let result = experiment.run(&train, &[], &[]);
        assert!(matches!(
            result,
            Err(crate::error::CoreError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_validation_scores_against_each_runners_decoder() {
        let dir = tempfile::tempdir().unwrap();

        let mut train = toy_dataset("train");
        train.add_series(
            "target2",
            vec![sent(&["p"]), sent(&["q"]), sent(&["p"]), sent(&["q"])],
        );
        let vocab = Arc::new(
            Vocabulary::build(&[&train], &["source", "target", "target2"], 20).unwrap(),
        );

        let make_decoder = |vocab: &Arc<Vocabulary>| {
            AttentiveDecoder::new(
                vocab.clone(),
                Box::new(ScaledDotAttention::new(6)),
                6,
                DecoderConfig {
                    embedding_size: 4,
                    rnn_size: 6,
                    maxout_size: 3,
                    max_output_len: 5,
                    ..DecoderConfig::default()
                },
            )
        };

        let encoder = SequenceEncoder::new(vocab.len(), 4, 6);
        let graph = ModelGraph::new(
            encoder,
            "source",
            vocab.clone(),
            vec![
                DecoderBinding {
                    name: "dec_a".to_string(),
                    target_series: "target".to_string(),
                    decoder: make_decoder(&vocab),
                },
                DecoderBinding {
                    name: "dec_b".to_string(),
                    target_series: "target2".to_string(),
                    decoder: make_decoder(&vocab),
                },
            ],
        )
        .unwrap();

        let manager = ExecutionManager::new(graph, ExecutionConfig::default());
        let trainer =
            CrossEntropyTrainer::new(TrainerConfig::default(), Box::new(SGD::new(0.1)));

        // runner 只依附第二个解码器，验证集也只带它的目标序列：
        // 打分必须以 runner 自己的解码器为参照
        let mut experiment = Experiment::new(
            manager,
            trainer,
            vec![Box::new(GreedyRunner::new("out_b", "dec_b"))],
            vec![Box::new(TokenAccuracy)],
            ExperimentConfig {
                epochs: 1,
                batch_size: 2,
                logging_period: 0,
                validation_period: 1,
                checkpoint_path: dir.path().join("model.ckpt"),
                output_dir: None,
            },
        );

        let mut validation = Dataset::new("val");
        validation.add_series(
            "source",
            vec![sent(&["a", "b"]), sent(&["b", "a"])],
        );
        validation.add_series("target2", vec![sent(&["p"]), sent(&["q"])]);

        let report = experiment.run(&train, &[&validation], &[]).unwrap();
        assert!(report.best_score.is_some());
    }

    #[test]
    fn test_stop_flag_halts_before_first_batch() {
        let dir = tempfile::tempdir().unwrap();
        let (mut experiment, train) = toy_experiment(dir.path());

        experiment.stop_handle().store(true, Ordering::Relaxed);
        let report = experiment.run(&train, &[], &[]).unwrap();

        assert!(report.stopped_early);
        assert_eq!(report.steps, 0);
    }

    #[test]
    fn test_resume_restores_progress() {
        let dir = tempfile::tempdir().unwrap();
        let (mut experiment, train) = toy_experiment(dir.path());

        // 无验证集：每个 epoch 结束保存进度
        let report = experiment.run(&train, &[], &[]).unwrap();
        assert_eq!(report.epochs_completed, 2);

        let (mut resumed, _) = toy_experiment(dir.path());
        resumed.resume_from(dir.path().join("model.ckpt")).unwrap();

        // 已完成全部 epoch，续训立即结束
        let report = resumed.run(&train, &[], &[]).unwrap();
        assert_eq!(report.epochs_completed, 2);
        assert_eq!(report.epoch_losses.len(), 0);
    }
}
