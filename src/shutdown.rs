use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info};

/// 关闭信号管理
///
/// 所有后台循环订阅同一个广播通道；关闭后再订阅的接收端会立即收到信号。
#[derive(Clone)]
pub struct ShutdownManager {
    sender: broadcast::Sender<()>,
    is_shutdown: Arc<AtomicBool>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(16);
        Self {
            sender,
            is_shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        if self.is_shutdown() {
            let (tx, rx) = broadcast::channel(1);
            let _ = tx.send(());
            return rx;
        }
        self.sender.subscribe()
    }

    /// 触发关闭，重复调用无副作用
    pub fn shutdown(&self) {
        if self.is_shutdown.swap(true, Ordering::SeqCst) {
            debug!("关闭信号已经发送过");
            return;
        }
        let receivers = self.sender.receiver_count();
        let _ = self.sender.send(());
        info!("关闭信号已发送给 {} 个订阅者", receivers);
    }

    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown.load(Ordering::SeqCst)
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}
