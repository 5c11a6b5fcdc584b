//! 执行管理
//!
//! 持有模型的唯一可写副本，按轮转把工作派发到固定数量的
//! 执行上下文上。训练步持写锁串行执行；推理持读锁，可以
//! 并发进行，并按上下文的线程数把批次切片派到多个线程。

use crate::checkpoint::Checkpoint;
use crate::dataset::Batch;
use crate::error::Result;
use crate::graph::ModelGraph;
use crate::runners::{ResultSeries, Runner};
use crate::trainer::{CrossEntropyTrainer, TrainStats};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

/// 执行配置
#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    /// 执行上下文数量
    pub num_sessions: usize,
    /// 每个上下文用于推理的线程数
    pub num_threads: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            num_sessions: 1,
            num_threads: 1,
        }
    }
}

/// 一个执行上下文
#[derive(Debug)]
pub struct ExecutionContext {
    id: usize,
    num_threads: usize,
}

impl ExecutionContext {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads
    }
}

/// 执行管理器
#[derive(Debug)]
pub struct ExecutionManager {
    graph: Arc<RwLock<ModelGraph>>,
    contexts: Vec<ExecutionContext>,
    next: AtomicUsize,
}

impl ExecutionManager {
    pub fn new(graph: ModelGraph, config: ExecutionConfig) -> Self {
        let sessions = config.num_sessions.max(1);
        let contexts = (0..sessions)
            .map(|id| ExecutionContext {
                id,
                num_threads: config.num_threads.max(1),
            })
            .collect();

        Self {
            graph: Arc::new(RwLock::new(graph)),
            contexts,
            next: AtomicUsize::new(0),
        }
    }

    pub fn contexts(&self) -> &[ExecutionContext] {
        &self.contexts
    }

    /// 轮转选择下一个上下文
    fn next_context(&self) -> &ExecutionContext {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.contexts.len();
        &self.contexts[idx]
    }

    /// 对模型的只读访问
    pub fn with_graph<R>(&self, f: impl FnOnce(&ModelGraph) -> R) -> R {
        let graph = self.graph.read().expect("model lock poisoned");
        f(&graph)
    }

    /// 执行一个训练步
    ///
    /// 训练持写锁：同一时刻最多一个写者，排斥所有推理。
    pub fn run_train(
        &self,
        trainer: &mut CrossEntropyTrainer,
        batch: &Batch,
    ) -> Result<TrainStats> {
        let _ctx = self.next_context();
        let mut graph = self.graph.write().expect("model lock poisoned");
        trainer.train_step(&mut graph, batch)
    }

    /// 执行一次推理
    ///
    /// 整个批次在同一个读锁下完成，结果对应一个一致的参数快照。
    /// 上下文线程数大于 1 时批次按行切片并行处理，结果按原样本
    /// 顺序合并。
    pub fn run_inference(&self, runner: &dyn Runner, batch: &Batch) -> Result<Vec<ResultSeries>> {
        let ctx = self.next_context();
        let graph = self.graph.read().expect("model lock poisoned");

        if ctx.num_threads <= 1 || batch.len() < 2 {
            return runner.run(&graph, batch);
        }

        let chunks = batch.split(ctx.num_threads);
        let graph_ref: &ModelGraph = &graph;

        let chunk_results: Vec<Result<Vec<ResultSeries>>> = std::thread::scope(|scope| {
            let handles: Vec<_> = chunks
                .iter()
                .map(|chunk| scope.spawn(move || runner.run(graph_ref, chunk)))
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().expect("inference worker panicked"))
                .collect()
        });

        let mut per_chunk = Vec::with_capacity(chunk_results.len());
        for result in chunk_results {
            per_chunk.push(result?);
        }

        // 按序列下标合并各分片
        let series_count = per_chunk.first().map_or(0, |s| s.len());
        let mut merged = Vec::with_capacity(series_count);
        for idx in 0..series_count {
            let parts: Vec<ResultSeries> = per_chunk.iter().map(|s| s[idx].clone()).collect();
            merged.push(ResultSeries::concat(parts)?);
        }

        Ok(merged)
    }

    /// 保存检查点
    pub fn save_checkpoint<P: AsRef<Path>>(
        &self,
        path: P,
        epoch: usize,
        global_step: usize,
        best_score: Option<f32>,
    ) -> Result<()> {
        let graph = self.graph.read().expect("model lock poisoned");
        Checkpoint::capture(&graph, epoch, global_step, best_score).save(path)
    }

    /// 从检查点恢复模型，返回其中的训练进度
    pub fn load_checkpoint<P: AsRef<Path>>(&self, path: P) -> Result<Checkpoint> {
        let checkpoint = Checkpoint::load(path)?;
        let mut graph = self.graph.write().expect("model lock poisoned");
        checkpoint.restore_into(&mut graph)?;
        Ok(checkpoint)
    }
}
