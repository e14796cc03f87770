//! 调度集成测试：单一活动任务、取消、插队、移除、入队 hook、panic 隔离

mod common;

use std::sync::Arc;

use bee_react::core::task::{FinishReason, TaskStatus};
use bee_react::core::task_queue::{DequeueReason, HookDecision};
use bee_react::core::{AgentError, InputEvent, SyncSignal};
use bee_react::review::ReviewPolicy;
use bee_react::tools::EchoTool;
use bee_react::{Agent, ReactEvent};
use common::*;

async fn manual_agent() -> (Arc<Agent>, tokio::sync::mpsc::UnboundedReceiver<ReactEvent>) {
    Agent::builder(config(ReviewPolicy::Manual), Arc::new(RoutedLlm))
        .tool(EchoTool)
        .build()
        .await
}

#[tokio::test]
async fn test_one_task_processing_at_a_time_in_fifo_order() {
    let (agent, mut events) = manual_agent().await;
    agent.start();

    // A 停在工具审核点上
    let a = agent.submit("tool:echo a").unwrap();
    let checkpoint = wait_checkpoint(&mut events).await;
    let b = agent.submit("b").unwrap();
    let c = agent.submit("c").unwrap();

    assert_eq!(agent.current_task().unwrap().id(), a);
    assert_eq!(agent.queued_ids(), vec![b.clone(), c.clone()]);
    assert_eq!(agent.task(&b).unwrap().status(), TaskStatus::Queueing);

    agent
        .release_checkpoint(&checkpoint, bee_react::review::ReviewParams::approve("human"))
        .unwrap();
    for id in [&a, &b, &c] {
        assert_eq!(finished(&agent, id).await.status, TaskStatus::Completed);
    }

    // A 之后按提交顺序切换到 Processing
    let mut order = Vec::new();
    while order.len() < 2 {
        if let ReactEvent::TaskStatusChanged { task_id, .. } = wait_event(&mut events, |e| {
            matches!(e, ReactEvent::TaskStatusChanged { to: TaskStatus::Processing, .. })
        })
        .await
        {
            order.push(task_id);
        }
    }
    assert_eq!(order, vec![b, c]);
}

#[tokio::test]
async fn test_remove_queued_task() {
    let (agent, mut events) = manual_agent().await;
    agent.start();

    let a = agent.submit("tool:echo a").unwrap();
    wait_checkpoint(&mut events).await;
    let b = agent.submit("b").unwrap();
    let c = agent.submit("c").unwrap();

    agent
        .handle_input(InputEvent::sync(SyncSignal::RemoveTask, Some(b.as_str())))
        .await;
    match wait_event(&mut events, |e| matches!(e, ReactEvent::TaskDequeued { .. })).await {
        ReactEvent::TaskDequeued { task_id, reason } => {
            assert_eq!(task_id, b);
            assert_eq!(reason, DequeueReason::ManualRemove);
        }
        _ => unreachable!(),
    }
    assert_eq!(agent.queued_ids(), vec![c.clone()]);
    let removed = finished(&agent, &b).await;
    assert_eq!(removed.status, TaskStatus::Aborted);
    assert_eq!(removed.finish_reason, Some(FinishReason::Removed));

    // 处理中的任务不能移除
    agent
        .handle_input(InputEvent::sync(SyncSignal::RemoveTask, Some(a.as_str())))
        .await;
    wait_event(&mut events, |e| matches!(e, ReactEvent::Warning { .. })).await;
    assert_eq!(agent.current_task().unwrap().id(), a);
}

#[tokio::test]
async fn test_cancel_current_task_moves_on() {
    let (agent, mut events) = manual_agent().await;
    agent.start();

    let a = agent.submit("tool:echo a").unwrap();
    wait_checkpoint(&mut events).await;
    let b = agent.submit("b").unwrap();

    agent
        .handle_input(InputEvent::sync(SyncSignal::CancelCurrentTask, None))
        .await;
    let cancelled = finished(&agent, &a).await;
    assert_eq!(cancelled.status, TaskStatus::Aborted);
    assert_eq!(cancelled.finish_reason, Some(FinishReason::Cancelled));
    wait_event(&mut events, |e| matches!(e, ReactEvent::TaskCancelled { task_id } if *task_id == a)).await;

    // 审核点随任务一起撤销
    assert!(agent.checkpoints().is_empty());
    let next = finished(&agent, &b).await;
    assert_eq!(next.result.as_deref(), Some("done: b"));
}

#[tokio::test]
async fn test_cancel_reaches_running_tool() {
    let tool = SleepTool::default();
    let token = tool.token.clone();
    let (agent, mut events) = Agent::builder(config(ReviewPolicy::Yolo), Arc::new(RoutedLlm))
        .tool(tool)
        .build()
        .await;
    agent.start();

    let id = agent.submit("tool:sleep forever").unwrap();
    wait_event(&mut events, |e| matches!(e, ReactEvent::ToolCallStart { .. })).await;
    while token.lock().unwrap().is_none() {
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    agent.handle_input(InputEvent::sync(SyncSignal::CancelCurrentTask, Some(id.as_str()))).await;

    let snapshot = finished(&agent, &id).await;
    assert_eq!(snapshot.finish_reason, Some(FinishReason::Cancelled));
    assert!(token.lock().unwrap().as_ref().unwrap().is_cancelled());
}

#[tokio::test]
async fn test_jump_queue_preempts_current_task() {
    let (agent, mut events) = manual_agent().await;
    agent.start();

    let a = agent.submit("tool:echo a").unwrap();
    wait_checkpoint(&mut events).await;
    let b = agent.submit("b").unwrap();
    let c = agent.submit("c").unwrap();

    agent
        .handle_input(InputEvent::sync(SyncSignal::JumpQueue, Some(c.as_str())))
        .await;

    // 被抢占的 A 先进入 Aborted，C 之后才进入 Processing
    let mut jumped_event = None;
    let mut transitions = Vec::new();
    while !transitions.contains(&(c.clone(), TaskStatus::Processing)) {
        match wait_event(&mut events, |e| {
            matches!(e, ReactEvent::TaskJumped { .. } | ReactEvent::TaskStatusChanged { .. })
        })
        .await
        {
            ReactEvent::TaskJumped { task_id, preempted } => jumped_event = Some((task_id, preempted)),
            ReactEvent::TaskStatusChanged { task_id, to, .. } if to != TaskStatus::Queueing => {
                transitions.push((task_id, to));
            }
            _ => {}
        }
    }
    assert_eq!(jumped_event, Some((c.clone(), Some(a.clone()))));
    assert_eq!(
        transitions,
        vec![(a.clone(), TaskStatus::Aborted), (c.clone(), TaskStatus::Processing)]
    );

    let preempted = finished(&agent, &a).await;
    assert_eq!(preempted.status, TaskStatus::Aborted);
    assert_eq!(preempted.finish_reason, Some(FinishReason::Preempted));

    let jumped = finished(&agent, &c).await;
    let later = finished(&agent, &b).await;
    assert!(jumped.finished_at.unwrap() <= later.finished_at.unwrap());
}

#[tokio::test]
async fn test_jump_unknown_task_is_reported() {
    let (agent, mut events) = manual_agent().await;
    agent
        .handle_input(InputEvent::sync(SyncSignal::JumpQueue, Some("task-missing")))
        .await;
    match wait_event(&mut events, |e| matches!(e, ReactEvent::Warning { .. })).await {
        ReactEvent::Warning { text, .. } => assert!(text.contains("task-missing")),
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_enqueue_hooks_skip_and_reject() {
    let (agent, mut events) = Agent::builder(config(ReviewPolicy::Yolo), Arc::new(RoutedLlm))
        .on_enqueue("no-spam", |task| {
            Ok(if task.input().contains("spam") {
                HookDecision::Skip
            } else {
                HookDecision::Queue
            })
        })
        .on_enqueue("length", |task| {
            if task.input().len() > 20 {
                Err("input too long".to_string())
            } else {
                Ok(HookDecision::Queue)
            }
        })
        .build()
        .await;

    let skipped = agent.submit("buy spam").unwrap();
    match wait_event(&mut events, |e| matches!(e, ReactEvent::TaskSkipped { .. })).await {
        ReactEvent::TaskSkipped { task_id, hook } => {
            assert_eq!(task_id, skipped);
            assert_eq!(hook, "no-spam");
        }
        _ => unreachable!(),
    }
    assert!(agent.task(&skipped).is_none());
    assert!(agent.queued_ids().is_empty());

    match agent.submit("this input is definitely too long") {
        Err(AgentError::EnqueueRejected { hook, .. }) => assert_eq!(hook, "length"),
        other => panic!("unexpected: {other:?}"),
    }
    wait_event(&mut events, |e| matches!(e, ReactEvent::TaskRejected { .. })).await;

    let ok = agent.submit("fine").unwrap();
    agent.start();
    assert_eq!(finished(&agent, &ok).await.result.as_deref(), Some("done: fine"));
}

#[tokio::test]
async fn test_panicking_task_is_contained() {
    let (agent, mut events) = Agent::builder(config(ReviewPolicy::Yolo), Arc::new(RoutedLlm))
        .tool(PanicTool)
        .build()
        .await;
    agent.start();

    let bad = agent.submit("tool:boom now").unwrap();
    let good = agent.submit("after").unwrap();

    let crashed = finished(&agent, &bad).await;
    assert_eq!(crashed.status, TaskStatus::Aborted);
    assert_eq!(crashed.finish_reason, Some(FinishReason::Panicked));
    assert!(agent.task(&bad).unwrap().errors()[0].contains("tool exploded"));
    wait_event(&mut events, |e| matches!(e, ReactEvent::Error { .. })).await;

    assert_eq!(finished(&agent, &good).await.result.as_deref(), Some("done: after"));
}

#[tokio::test]
async fn test_query_queue_and_timeline() {
    let (agent, mut events) = manual_agent().await;
    agent.start();

    let a = agent.submit("tool:echo a").unwrap();
    wait_checkpoint(&mut events).await;
    let b = agent.submit("b").unwrap();

    agent.handle_input(InputEvent::sync(SyncSignal::QueryQueue, None)).await;
    match wait_event(&mut events, |e| matches!(e, ReactEvent::QueueState { .. })).await {
        ReactEvent::QueueState { current, queued } => {
            assert_eq!(current.unwrap().id, a);
            assert_eq!(queued.len(), 1);
            assert_eq!(queued[0].id, b);
        }
        _ => unreachable!(),
    }

    agent.handle_input(InputEvent::sync(SyncSignal::QueryTimeline, None)).await;
    match wait_event(&mut events, |e| matches!(e, ReactEvent::Timeline { .. })).await {
        ReactEvent::Timeline { dump } => assert!(dump.contains("[user_input] tool:echo a")),
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_shutdown_aborts_everything() {
    let (agent, mut events) = manual_agent().await;
    agent.start();

    let a = agent.submit("tool:echo a").unwrap();
    wait_checkpoint(&mut events).await;
    let b = agent.submit("b").unwrap();

    agent.shutdown().await;
    assert_eq!(finished(&agent, &a).await.status, TaskStatus::Aborted);
    assert_eq!(finished(&agent, &b).await.status, TaskStatus::Aborted);
    assert!(agent.queued_ids().is_empty());
}
