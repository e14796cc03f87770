//! bee-react 命令行入口
//!
//! stdin 每行一个输入事件（JSON，或直接输入文本作为新任务），
//! stdout 每行一个输出事件（JSON）。Ctrl+C / SIGTERM / 输入结束时优雅关闭。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bee_react::core::shutdown::{
    AgentCleanup, ShutdownCoordinator, ShutdownManager, ShutdownReason, TimelineFlush,
};
use bee_react::core::{parse_input_line, spawn_input_loop};
use bee_react::tools::EchoTool;
use bee_react::{config::load_config, observability, AgentBuilder};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let app = load_config(config_path).context("Failed to load config")?;

    let (agent, mut events) = AgentBuilder::from_app_config(&app)
        .context("Failed to open timeline store")?
        .tool(EchoTool)
        .build()
        .await;

    let shutdown = Arc::new(ShutdownManager::with_token(agent.root_token()));
    shutdown.install_signal_handlers();
    let mut coordinator = ShutdownCoordinator::new(shutdown.clone());
    coordinator.register(AgentCleanup(agent.clone()));
    coordinator.register(TimelineFlush(agent.session().clone()));

    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(e) => tracing::warn!("Failed to serialize event: {}", e),
            }
        }
    });

    let scheduler = agent.start();
    let (input_tx, input_rx) = mpsc::unbounded_channel();
    let inputs = spawn_input_loop(agent.clone(), input_rx, shutdown.token());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = shutdown.wait_for_shutdown() => break,
            line = lines.next_line() => match line.context("Failed to read stdin")? {
                Some(line) => {
                    if let Some(event) = parse_input_line(&line) {
                        let _ = input_tx.send(event);
                    }
                }
                None => {
                    // 输入结束：等当前与排队任务跑完再退出
                    drop(input_tx);
                    let _ = inputs.await;
                    wait_idle(&agent).await;
                    shutdown.shutdown(ShutdownReason::UserInitiated);
                    break;
                }
            },
        }
    }

    coordinator.run_cleanup().await;
    let _ = scheduler.await;
    drop(coordinator);
    drop(agent);
    // 嵌套执行可能仍持有事件发送端，只给输出一点时间
    let _ = tokio::time::timeout(Duration::from_secs(1), printer).await;
    Ok(())
}

async fn wait_idle(agent: &bee_react::Agent) {
    loop {
        match agent.current_task() {
            Some(task) => {
                task.wait_terminal().await;
            }
            None if agent.queued_ids().is_empty() => break,
            None => tokio::time::sleep(Duration::from_millis(50)).await,
        }
    }
}
