use async_trait::async_trait;

use recycler_core::LeaderElector;

/// 单实例部署时的选主实现，始终认为自己是主节点
#[derive(Debug, Clone, Copy)]
pub struct StandaloneElector {
    is_master: bool,
}

impl StandaloneElector {
    pub fn new(is_master: bool) -> Self {
        Self { is_master }
    }
}

impl Default for StandaloneElector {
    fn default() -> Self {
        Self::new(true)
    }
}

#[async_trait]
impl LeaderElector for StandaloneElector {
    async fn is_master(&self) -> bool {
        self.is_master
    }
}
