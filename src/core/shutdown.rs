//! 优雅关闭
//!
//! Ctrl+C / SIGTERM 触发根取消令牌；关闭时依次执行清理：
//! 中止排队与进行中的任务，然后把会话时间线落盘。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::agent::Agent;
use crate::memory::SessionTimeline;

/// 关闭原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C 或输入流结束
    UserInitiated,
    /// SIGTERM
    Signal,
    FatalError(String),
}

/// 关闭信号：一个根令牌 + 原因广播
#[derive(Clone)]
pub struct ShutdownManager {
    token: CancellationToken,
    reason_tx: broadcast::Sender<ShutdownReason>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::with_token(CancellationToken::new())
    }

    /// 以已有令牌（通常是 agent 的根令牌）作为关闭信号
    pub fn with_token(token: CancellationToken) -> Self {
        let (reason_tx, _) = broadcast::channel(1);
        Self { token, reason_tx }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn shutdown(&self, reason: ShutdownReason) {
        tracing::info!(?reason, "Shutdown requested");
        let _ = self.reason_tx.send(reason);
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownReason> {
        self.reason_tx.subscribe()
    }

    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }

    /// 安装 Ctrl+C / SIGTERM 处理器
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    manager.shutdown(ShutdownReason::Signal);
                }
            });
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

/// 关闭时执行的清理
#[async_trait::async_trait]
pub trait ShutdownCleanup: Send + Sync {
    async fn cleanup(&self) -> anyhow::Result<()>;

    fn name(&self) -> &'static str;
}

/// 按注册顺序执行清理，每项有独立超时
pub struct ShutdownCoordinator {
    manager: Arc<ShutdownManager>,
    cleanups: Vec<Arc<dyn ShutdownCleanup>>,
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(manager: Arc<ShutdownManager>) -> Self {
        Self {
            manager,
            cleanups: Vec::new(),
            timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn register<T: ShutdownCleanup + 'static>(&mut self, cleanup: T) {
        self.cleanups.push(Arc::new(cleanup));
    }

    pub fn manager(&self) -> &Arc<ShutdownManager> {
        &self.manager
    }

    pub async fn run_cleanup(&self) {
        for cleanup in &self.cleanups {
            let name = cleanup.name();
            match tokio::time::timeout(self.timeout, cleanup.cleanup()).await {
                Ok(Ok(())) => tracing::info!("Cleanup '{}' done", name),
                Ok(Err(e)) => tracing::warn!("Cleanup '{}' failed: {}", name, e),
                Err(_) => tracing::warn!("Cleanup '{}' timed out after {:?}", name, self.timeout),
            }
        }
    }
}

/// 中止 agent 的所有任务
pub struct AgentCleanup(pub Arc<Agent>);

#[async_trait::async_trait]
impl ShutdownCleanup for AgentCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.0.shutdown().await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "Agent"
    }
}

/// 会话时间线落盘
pub struct TimelineFlush(pub Arc<SessionTimeline>);

#[async_trait::async_trait]
impl ShutdownCleanup for TimelineFlush {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.0.persist().await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "Timeline"
    }
}
