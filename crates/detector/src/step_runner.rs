//! 单个子单的检测编排
//!
//! 所有步骤类型共享一个结果通道。每个步骤类型先提交到各自的执行器，再由独立
//! 任务把执行器的结果转发到共享通道。共享通道的发送端随转发任务结束而释放，
//! 全部步骤类型转发完成后通道自然关闭。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use recycler_core::models::StepName;
use recycler_core::{RecyclerError, RecyclerResult};

use crate::executor_registry::ExecutorRegistry;
use crate::step_executor::{StepExecutor, StepResult};
use crate::wait_list::StepMeta;

/// 一个步骤类型在本次检测中的工作
#[derive(Debug, Clone)]
pub struct StepBatch {
    pub step_name: StepName,
    pub to_run: Vec<StepMeta>,
    /// 无需执行、直接按成功计入的步骤
    pub skipped: Vec<StepMeta>,
}

impl StepBatch {
    pub fn new(step_name: StepName) -> Self {
        Self {
            step_name,
            to_run: Vec::new(),
            skipped: Vec::new(),
        }
    }
}

/// 共享结果流
pub struct ResultStream {
    receiver: mpsc::Receiver<StepResult>,
}

impl ResultStream {
    /// 至少等到一个结果，然后在窗口内继续读取直到达到批量上限
    ///
    /// 返回 `None` 表示所有步骤类型都已完成。
    pub async fn recv_batch(&mut self, max: usize, window: Duration) -> Option<Vec<StepResult>> {
        let first = self.receiver.recv().await?;
        let mut batch = vec![first];
        let deadline = Instant::now() + window;

        while batch.len() < max {
            match tokio::time::timeout_at(deadline, self.receiver.recv()).await {
                Ok(Some(result)) => batch.push(result),
                Ok(None) | Err(_) => break,
            }
        }
        Some(batch)
    }
}

pub struct StepRunner {
    registry: Arc<ExecutorRegistry>,
}

impl StepRunner {
    pub fn new(registry: Arc<ExecutorRegistry>) -> Self {
        Self { registry }
    }

    /// 提交子单全部步骤类型并返回共享结果流
    ///
    /// 任一步骤类型提交失败时，已经提交成功的步骤类型会被取消。
    pub fn run(
        &self,
        suborder_id: &str,
        rid: &str,
        batches: Vec<StepBatch>,
        host_count: usize,
    ) -> RecyclerResult<ResultStream> {
        let capacity = (batches.len() * host_count).max(1);
        let (sender, receiver) = mpsc::channel(capacity);

        let mut submitted: Vec<Arc<StepExecutor>> = Vec::new();
        let mut forwards = Vec::with_capacity(batches.len());

        for batch in batches {
            let upstream = if batch.to_run.is_empty() {
                None
            } else {
                let submission = self
                    .registry
                    .get(batch.step_name)
                    .ok_or_else(|| RecyclerError::UnsupportedStep(batch.step_name.to_string()))
                    .and_then(|executor| {
                        let rx = executor.submit_steps(suborder_id, rid, batch.to_run)?;
                        Ok((executor, rx))
                    });
                match submission {
                    Ok((executor, rx)) => {
                        submitted.push(executor);
                        Some(rx)
                    }
                    Err(e) => {
                        warn!(
                            suborder_id = suborder_id,
                            step = %batch.step_name,
                            "提交检测步骤失败，取消已提交的步骤: {}",
                            e
                        );
                        for executor in &submitted {
                            executor.cancel_suborder(suborder_id);
                        }
                        return Err(e);
                    }
                }
            };
            forwards.push((batch.step_name, batch.skipped, upstream));
        }

        for (step_name, skipped, upstream) in forwards {
            let sender = sender.clone();
            let suborder_id = suborder_id.to_string();
            tokio::spawn(async move {
                for meta in &skipped {
                    if sender.send(StepResult::skipped(meta)).await.is_err() {
                        return;
                    }
                }
                if let Some(mut upstream) = upstream {
                    while let Some(result) = upstream.recv().await {
                        if sender.send(result).await.is_err() {
                            return;
                        }
                    }
                }
                debug!(suborder_id = %suborder_id, step = %step_name, "检测步骤类型已完成");
            });
        }

        Ok(ResultStream { receiver })
    }
}
