//! 去重的回收单分发队列
//!
//! 同一子单在队列中最多出现一次；正在处理中的子单再次入队时只做标记，处理
//! 完成后重新入队，因此同一子单不会被两个消费者同时处理。

use std::collections::{HashSet, VecDeque};

use parking_lot::Mutex;
use tokio::sync::Notify;

#[derive(Default)]
struct QueueState {
    pending: VecDeque<String>,
    queued: HashSet<String>,
    processing: HashSet<String>,
    dirty: HashSet<String>,
}

#[derive(Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// 入队，已在队列中则忽略，返回是否真正进入了待处理队列
    pub fn push(&self, suborder_id: &str) -> bool {
        let mut state = self.state.lock();
        if state.processing.contains(suborder_id) {
            state.dirty.insert(suborder_id.to_string());
            return false;
        }
        if !state.queued.insert(suborder_id.to_string()) {
            return false;
        }
        state.pending.push_back(suborder_id.to_string());
        drop(state);
        self.notify.notify_one();
        true
    }

    /// 取出一个子单并标记为处理中，队列为空时等待
    pub async fn pop(&self) -> String {
        loop {
            let notified = self.notify.notified();
            if let Some(id) = self.try_pop() {
                return id;
            }
            notified.await;
        }
    }

    pub fn try_pop(&self) -> Option<String> {
        let mut state = self.state.lock();
        let id = state.pending.pop_front()?;
        state.queued.remove(&id);
        state.processing.insert(id.clone());
        Some(id)
    }

    /// 处理结束；处理期间被再次入队的子单重新进入队列
    pub fn done(&self, suborder_id: &str) {
        let mut state = self.state.lock();
        state.processing.remove(suborder_id);
        if state.dirty.remove(suborder_id) && state.queued.insert(suborder_id.to_string()) {
            state.pending.push_back(suborder_id.to_string());
            drop(state);
            self.notify.notify_one();
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_processing(&self, suborder_id: &str) -> bool {
        self.state.lock().processing.contains(suborder_id)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_push_dedupes() {
        let queue = WorkQueue::new();
        assert!(queue.push("a"));
        assert!(!queue.push("a"));
        assert!(queue.push("b"));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.try_pop().as_deref(), Some("a"));
        assert_eq!(queue.try_pop().as_deref(), Some("b"));
        assert!(queue.try_pop().is_none());
    }

    #[test]
    fn test_requeue_while_processing() {
        let queue = WorkQueue::new();
        queue.push("a");
        let id = queue.try_pop().unwrap();
        assert!(queue.is_processing("a"));

        assert!(!queue.push("a"));
        assert!(queue.is_empty());

        queue.done(&id);
        assert!(!queue.is_processing("a"));
        assert_eq!(queue.try_pop().as_deref(), Some("a"));
        queue.done("a");
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_pop_waits_for_push() {
        let queue = Arc::new(WorkQueue::new());
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push("x");
        let id = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(id, "x");
    }
}
