//! 检测步骤的等待队列

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use recycler_core::models::DetectStep;

/// 加急条目的分值提前量（毫秒）
pub const URGENT_BUMP_MS: i64 = 60_000;

/// 内存中的调度元数据，不持久化，恢复时由检测步骤记录重建
#[derive(Debug, Clone)]
pub struct StepMeta {
    pub step: DetectStep,
    pub ip: String,
    pub asset_id: String,
    pub joined_at: DateTime<Utc>,
    pub retry_times: u32,
    /// 一次检测运行的关联ID，用于识别过期结果
    pub rid: String,
    pub urgent: bool,
}

impl StepMeta {
    pub fn new(step: DetectStep, ip: &str, asset_id: &str) -> Self {
        Self {
            step,
            ip: ip.to_string(),
            asset_id: asset_id.to_string(),
            joined_at: Utc::now(),
            retry_times: 0,
            rid: String::new(),
            urgent: false,
        }
    }

    pub fn suborder_id(&self) -> &str {
        &self.step.suborder_id
    }
}

/// 默认分值：入队时间越早分值越低，越先执行
pub fn default_score(meta: &StepMeta) -> i64 {
    let score = meta.joined_at.timestamp_millis();
    if meta.urgent {
        score - URGENT_BUMP_MS
    } else {
        score
    }
}

/// 并发安全的等待队列，按分值取出最小的K个
#[derive(Debug, Default)]
pub struct WaitList {
    items: Mutex<Vec<StepMeta>>,
}

impl WaitList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, items: Vec<StepMeta>) {
        if items.is_empty() {
            return;
        }
        self.items.lock().extend(items);
    }

    /// 取出分值最低的 `k` 个条目，队列不足 `k` 个时全部取出
    ///
    /// 分值相同的条目之间不保证顺序。
    pub fn pop_top_k<F>(&self, score: F, k: usize) -> Vec<StepMeta>
    where
        F: Fn(&StepMeta) -> i64,
    {
        if k == 0 {
            return Vec::new();
        }

        let mut items = self.items.lock();
        if items.len() <= k {
            return std::mem::take(&mut *items);
        }

        let mut scored: Vec<(i64, StepMeta)> = items.drain(..).map(|m| (score(&m), m)).collect();
        scored.select_nth_unstable_by_key(k - 1, |(s, _)| *s);
        let rest = scored.split_off(k);
        items.extend(rest.into_iter().map(|(_, m)| m));

        scored.into_iter().map(|(_, m)| m).collect()
    }

    /// 移除满足条件的条目，返回移除数量
    pub fn remove_where<P>(&self, pred: P) -> usize
    where
        P: Fn(&StepMeta) -> bool,
    {
        let mut items = self.items.lock();
        let before = items.len();
        items.retain(|m| !pred(m));
        before - items.len()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use chrono::Duration;
    use recycler_core::models::{DetectTask, StepName};

    use super::*;

    fn meta(seq: u32, joined_offset_ms: i64) -> StepMeta {
        let task = DetectTask::new(format!("T{seq}"), "1-1", seq as i64, "10.0.0.1", "A1");
        let mut meta = StepMeta::new(DetectStep::new(&task, StepName::BasicCheck, 1), "", "");
        meta.joined_at = DateTime::<Utc>::UNIX_EPOCH + Duration::milliseconds(joined_offset_ms);
        meta
    }

    #[test]
    fn test_pop_top_k_returns_lowest_scores() {
        let list = WaitList::new();
        let offsets = [50, 10, 90, 30, 70, 20, 80, 60, 40, 0];
        list.add(
            offsets
                .iter()
                .enumerate()
                .map(|(i, off)| meta(i as u32, *off))
                .collect(),
        );

        let popped = list.pop_top_k(default_score, 4);
        let scores: HashSet<i64> = popped.iter().map(default_score).collect();
        assert_eq!(scores, HashSet::from([0, 10, 20, 30]));
        assert_eq!(list.len(), 6);

        let rest: HashSet<i64> = list.pop_top_k(default_score, 100).iter().map(default_score).collect();
        assert_eq!(rest, HashSet::from([40, 50, 60, 70, 80, 90]));
        assert!(list.is_empty());
    }

    #[test]
    fn test_pop_drains_when_smaller_than_k() {
        let list = WaitList::new();
        list.add(vec![meta(1, 5), meta(2, 1)]);
        assert_eq!(list.pop_top_k(default_score, 2).len(), 2);
        assert!(list.pop_top_k(default_score, 2).is_empty());
        assert!(list.pop_top_k(default_score, 0).is_empty());
    }

    #[test]
    fn test_urgent_item_jumps_ahead() {
        let list = WaitList::new();
        let mut late = meta(1, 30_000);
        late.urgent = true;
        list.add(vec![meta(2, 0), late]);
        let popped = list.pop_top_k(default_score, 1);
        assert_eq!(popped[0].step.host_id, 1);
    }

    #[test]
    fn test_remove_where() {
        let list = WaitList::new();
        let mut other = meta(3, 0);
        other.step.suborder_id = "2-1".to_string();
        list.add(vec![meta(1, 0), meta(2, 0), other]);
        assert_eq!(list.remove_where(|m| m.suborder_id() == "1-1"), 2);
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_concurrent_add_and_pop() {
        let list = Arc::new(WaitList::new());
        let producers: Vec<_> = (0..8)
            .map(|p| {
                let list = list.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        list.add(vec![meta(p * 100 + i, i as i64)]);
                    }
                })
            })
            .collect();

        let mut popped = 0;
        while popped < 800 {
            popped += list.pop_top_k(default_score, 7).len();
            if producers.iter().all(|h| h.is_finished()) && list.is_empty() {
                break;
            }
        }
        for handle in producers {
            handle.join().unwrap();
        }
        popped += list.pop_top_k(default_score, usize::MAX).len();
        assert_eq!(popped, 800);
    }
}
