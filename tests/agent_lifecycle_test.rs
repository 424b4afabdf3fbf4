use helmsman::allocator::OfferAllAllocator;
use helmsman::auth::PermissiveAuthorizer;
use helmsman::ids::{Address, AgentId, FrameworkId};
use helmsman::master::{AgentConnection, Master, MasterHandle, OperatorOp, OperatorResponse};
use helmsman::messages::agent::{AgentCall, AgentMessage, RunningTask};
use helmsman::messages::scheduler::{Call, Event, Filters, ReconcileTask};
use helmsman::messages::{AgentInfo, FrameworkInfo, TaskInfo, TaskState, TaskStatus};
use helmsman::registry::{MemoryStorage, Registry};
use helmsman::resources::{Operation, Resources};
use helmsman::MasterConfig;
use slog::{o, Logger};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

fn logger() -> Logger {
    Logger::root(slog::Discard, o!())
}

fn start_master(config: MasterConfig, storage: MemoryStorage) -> MasterHandle {
    Master::start(
        config,
        Box::new(storage),
        Box::new(OfferAllAllocator::new()),
        Arc::new(PermissiveAuthorizer),
        None,
        logger(),
    )
    .expect("master should start")
}

async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("channel closed")
}

async fn register_agent(
    master: &MasterHandle,
    address: &str,
    hostname: &str,
    resources: Resources,
) -> (AgentId, mpsc::UnboundedReceiver<AgentMessage>) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    master
        .register_agent(
            AgentConnection::new(Address::from(address), tx),
            AgentInfo::new(hostname, resources),
            Resources::new(),
            "0.1.0",
        )
        .await
        .expect("register_agent send");

    loop {
        if let AgentMessage::Registered { agent_id, .. } = recv(&mut rx).await {
            return (agent_id, rx);
        }
    }
}

async fn subscribe_framework(
    master: &MasterHandle,
    address: &str,
    name: &str,
    role: &str,
) -> (FrameworkId, mpsc::UnboundedReceiver<Event>) {
    let mut rx = master
        .subscribe(Address::from(address), FrameworkInfo::new(name, role), false)
        .await
        .expect("subscribe send");

    loop {
        if let Event::Subscribed { framework_id, .. } = recv(&mut rx).await {
            return (framework_id, rx);
        }
    }
}

async fn next_offer(
    rx: &mut mpsc::UnboundedReceiver<Event>,
) -> helmsman::messages::scheduler::Offer {
    loop {
        if let Event::Offers { mut offers } = recv(rx).await {
            return offers.remove(0);
        }
    }
}

#[tokio::test]
async fn test_agent_first_registration() {
    let master = start_master(MasterConfig::for_tests(), MemoryStorage::new());

    let (agent_id, _agent_rx) = register_agent(
        &master,
        "agent-1",
        "a1",
        Resources::cpus_mem(4.0, 8192.0),
    )
    .await;

    let state = master.get_state().await.expect("get_state");
    assert_eq!(state.agents.len(), 1);
    assert_eq!(state.agents[0].agent_id, agent_id);
    assert!(state.agents[0].connected);
    assert!(state.agents[0].active);
    assert_eq!(state.agents[0].total_resources.scalar("cpus"), 4.0);
}

#[tokio::test]
async fn test_duplicate_register_resends_ack() {
    let master = start_master(MasterConfig::for_tests(), MemoryStorage::new());

    let (agent_id, _rx) =
        register_agent(&master, "agent-1", "a1", Resources::cpus_mem(1.0, 512.0)).await;

    // Same address registers again: same id comes back, no new agent.
    let (tx, mut rx) = mpsc::unbounded_channel();
    master
        .register_agent(
            AgentConnection::new(Address::from("agent-1"), tx),
            AgentInfo::new("a1", Resources::cpus_mem(1.0, 512.0)),
            Resources::new(),
            "0.1.0",
        )
        .await
        .expect("send");

    loop {
        if let AgentMessage::Registered { agent_id: again, .. } = recv(&mut rx).await {
            assert_eq!(again, agent_id);
            break;
        }
    }

    let state = master.get_state().await.expect("get_state");
    assert_eq!(state.agents.len(), 1);
}

#[tokio::test]
async fn test_unreachable_agent_tasks_are_lost_and_kill_reissued_on_return() {
    let master = start_master(MasterConfig::for_tests(), MemoryStorage::new());

    let (agent_id, mut agent_rx) =
        register_agent(&master, "agent-1", "a1", Resources::cpus_mem(4.0, 8192.0)).await;
    let (framework_id, mut events) =
        subscribe_framework(&master, "framework-1", "demo", "web").await;

    // Launch a task through an offer.
    let offer = next_offer(&mut events).await;
    master
        .scheduler_call(
            framework_id.clone(),
            Call::Accept {
                offer_ids: vec![offer.offer_id],
                operations: vec![Operation::Launch {
                    tasks: vec![TaskInfo::new("t1", Resources::cpus_mem(1.0, 1024.0))],
                }],
                filters: Filters::default(),
            },
        )
        .await
        .expect("accept");

    loop {
        if let AgentMessage::RunTask { .. } = recv(&mut agent_rx).await {
            break;
        }
    }

    // The agent partitions away and the health checker gives up on it.
    master
        .agent_exited(Address::from("agent-1"))
        .await
        .expect("agent_exited");
    master
        .mark_agent_unreachable(agent_id.clone())
        .await
        .expect("mark unreachable");

    // The framework hears TASK_LOST.
    loop {
        if let Event::Update { status } = recv(&mut events).await {
            if status.task_id.as_str() == "t1" {
                assert_eq!(status.state, TaskState::Lost);
                break;
            }
        }
    }

    // Reconciliation now reports the task unreachable.
    master
        .scheduler_call(
            framework_id.clone(),
            Call::Reconcile {
                tasks: vec![ReconcileTask {
                    task_id: "t1".into(),
                    agent_id: Some(agent_id.clone()),
                }],
            },
        )
        .await
        .expect("reconcile");
    loop {
        if let Event::Update { status } = recv(&mut events).await {
            if status.task_id.as_str() == "t1" {
                assert_eq!(status.state, TaskState::Unreachable);
                break;
            }
        }
    }

    // The agent comes back without the task: the master re-issues a
    // kill so nothing lingers.
    let (tx, mut returned_rx) = mpsc::unbounded_channel();
    let mut info = AgentInfo::new("a1", Resources::cpus_mem(4.0, 8192.0));
    info.id = Some(agent_id.clone());
    master
        .reregister_agent(
            AgentConnection::new(Address::from("agent-1b"), tx),
            info,
            Resources::new(),
            vec![],
            vec![],
            vec![],
            "0.1.0",
        )
        .await
        .expect("reregister");

    let mut saw_reregistered = false;
    let mut saw_kill = false;
    for _ in 0..4 {
        match timeout(Duration::from_secs(2), returned_rx.recv()).await {
            Ok(Some(AgentMessage::Reregistered { agent_id: id })) => {
                assert_eq!(id, agent_id);
                saw_reregistered = true;
            }
            Ok(Some(AgentMessage::KillTask { task_id, .. })) => {
                assert_eq!(task_id.as_str(), "t1");
                saw_kill = true;
            }
            Ok(Some(_)) => continue,
            _ => break,
        }
        if saw_reregistered && saw_kill {
            break;
        }
    }
    assert!(saw_reregistered, "agent should be readmitted");
    assert!(saw_kill, "kill should be re-issued for the unreported task");
}

#[tokio::test]
async fn test_reregistration_reconciles_known_agent() {
    let master = start_master(MasterConfig::for_tests(), MemoryStorage::new());

    let (agent_id, mut agent_rx) =
        register_agent(&master, "agent-1", "a1", Resources::cpus_mem(4.0, 8192.0)).await;
    let (framework_id, mut events) =
        subscribe_framework(&master, "framework-1", "demo", "web").await;

    let offer = next_offer(&mut events).await;
    master
        .scheduler_call(
            framework_id.clone(),
            Call::Accept {
                offer_ids: vec![offer.offer_id],
                operations: vec![Operation::Launch {
                    tasks: vec![
                        TaskInfo::new("t1", Resources::cpus_mem(1.0, 1024.0)),
                        TaskInfo::new("t2", Resources::cpus_mem(1.0, 1024.0)),
                    ],
                }],
                filters: Filters::default(),
            },
        )
        .await
        .expect("accept");

    let mut launched = 0;
    while launched < 2 {
        if let AgentMessage::RunTask { .. } = recv(&mut agent_rx).await {
            launched += 1;
        }
    }

    // The agent restarts and reports only t1: t2 is lost.
    let (tx, _new_rx) = mpsc::unbounded_channel();
    let mut info = AgentInfo::new("a1", Resources::cpus_mem(4.0, 8192.0));
    info.id = Some(agent_id.clone());
    master
        .reregister_agent(
            AgentConnection::new(Address::from("agent-1"), tx),
            info,
            Resources::new(),
            vec![],
            vec![RunningTask {
                task_id: "t1".into(),
                framework_id: framework_id.clone(),
                executor_id: None,
                state: TaskState::Running,
                resources: Resources::cpus_mem(1.0, 1024.0),
            }],
            vec![],
            "0.1.0",
        )
        .await
        .expect("reregister");

    loop {
        if let Event::Update { status } = recv(&mut events).await {
            if status.task_id.as_str() == "t2" {
                assert_eq!(status.state, TaskState::Lost);
                break;
            }
        }
    }

    let state = master.get_state().await.expect("get_state");
    let tasks: Vec<_> = state.tasks.iter().map(|t| t.task_id.as_str()).collect();
    assert!(tasks.contains(&"t1"));
    assert!(!tasks.contains(&"t2"));
}

#[tokio::test]
async fn test_removed_agent_is_refused_reregistration() {
    let master = start_master(MasterConfig::for_tests(), MemoryStorage::new());

    let (agent_id, mut agent_rx) =
        register_agent(&master, "agent-1", "a1", Resources::cpus_mem(1.0, 512.0)).await;

    match master
        .operator(
            None,
            OperatorOp::RemoveAgent {
                agent_id: agent_id.clone(),
            },
        )
        .await
        .expect("remove agent")
    {
        OperatorResponse::Ack => {}
        _ => panic!("expected ack"),
    }

    loop {
        if let AgentMessage::Shutdown { .. } = recv(&mut agent_rx).await {
            break;
        }
    }

    // A stale incarnation presenting the removed id is told to shut
    // down.
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut info = AgentInfo::new("a1", Resources::cpus_mem(1.0, 512.0));
    info.id = Some(agent_id);
    master
        .reregister_agent(
            AgentConnection::new(Address::from("agent-1"), tx),
            info,
            Resources::new(),
            vec![],
            vec![],
            vec![],
            "0.1.0",
        )
        .await
        .expect("reregister");

    loop {
        if let AgentMessage::Shutdown { .. } = recv(&mut rx).await {
            break;
        }
    }

    let state = master.get_state().await.expect("get_state");
    assert!(state.agents.is_empty());
}

#[tokio::test]
async fn test_recovered_agent_marked_unreachable_after_timeout() {
    // Seed the registry with an admitted agent, as a previous master
    // incarnation would have left it.
    let mut registry = Registry::new();
    let mut info = AgentInfo::new("a1", Resources::cpus_mem(2.0, 1024.0));
    info.id = Some(AgentId::new("old-master-S0"));
    registry.admitted.push(info);
    let storage = MemoryStorage::with_registry(&registry);

    let config = MasterConfig {
        agent_reregister_timeout: Duration::from_millis(100),
        ..MasterConfig::for_tests()
    };
    let master = start_master(config, storage.clone());

    // The agent never re-registers; after the window it must move to
    // the unreachable list.
    tokio::time::sleep(Duration::from_millis(400)).await;

    let state = master.get_state().await.expect("get_state");
    assert!(state.agents.is_empty());
    assert_eq!(state.unreachable_agents, vec![AgentId::new("old-master-S0")]);
}

#[tokio::test]
async fn test_recovered_agent_reregisters_within_window() {
    let mut registry = Registry::new();
    let mut info = AgentInfo::new("a1", Resources::cpus_mem(2.0, 1024.0));
    info.id = Some(AgentId::new("old-master-S0"));
    registry.admitted.push(info.clone());
    let storage = MemoryStorage::with_registry(&registry);

    let config = MasterConfig {
        agent_reregister_timeout: Duration::from_secs(30),
        ..MasterConfig::for_tests()
    };
    let master = start_master(config, storage);

    let (tx, mut rx) = mpsc::unbounded_channel();
    master
        .reregister_agent(
            AgentConnection::new(Address::from("agent-1"), tx),
            info,
            Resources::new(),
            vec![],
            vec![RunningTask {
                task_id: "survivor".into(),
                framework_id: FrameworkId::new("old-framework"),
                executor_id: None,
                state: TaskState::Running,
                resources: Resources::cpus_mem(1.0, 512.0),
            }],
            vec![],
            "0.1.0",
        )
        .await
        .expect("reregister");

    loop {
        if let AgentMessage::Reregistered { agent_id } = recv(&mut rx).await {
            assert_eq!(agent_id, AgentId::new("old-master-S0"));
            break;
        }
    }

    let state = master.get_state().await.expect("get_state");
    assert_eq!(state.agents.len(), 1);
    assert!(state.unreachable_agents.is_empty());
    // The reported task was adopted.
    assert_eq!(state.tasks.len(), 1);
    assert_eq!(state.tasks[0].task_id.as_str(), "survivor");
}

#[tokio::test]
async fn test_status_update_roundtrip_with_acknowledgement() {
    let master = start_master(MasterConfig::for_tests(), MemoryStorage::new());

    let (agent_id, mut agent_rx) =
        register_agent(&master, "agent-1", "a1", Resources::cpus_mem(4.0, 8192.0)).await;
    let (framework_id, mut events) =
        subscribe_framework(&master, "framework-1", "demo", "web").await;

    let offer = next_offer(&mut events).await;
    master
        .scheduler_call(
            framework_id.clone(),
            Call::Accept {
                offer_ids: vec![offer.offer_id],
                operations: vec![Operation::Launch {
                    tasks: vec![TaskInfo::new("t1", Resources::cpus_mem(1.0, 1024.0))],
                }],
                filters: Filters::default(),
            },
        )
        .await
        .expect("accept");
    loop {
        if let AgentMessage::RunTask { .. } = recv(&mut agent_rx).await {
            break;
        }
    }

    // Terminal update with a uuid: forwarded, then acknowledged back to
    // the agent.
    let uuid = uuid::Uuid::new_v4();
    master
        .agent_call(AgentCall::StatusUpdate {
            framework_id: framework_id.clone(),
            update: TaskStatus::new("t1".into(), TaskState::Finished)
                .with_agent(agent_id.clone())
                .with_uuid(uuid),
        })
        .await
        .expect("status update");

    let received = loop {
        if let Event::Update { status } = recv(&mut events).await {
            if status.task_id.as_str() == "t1" {
                break status;
            }
        }
    };
    assert_eq!(received.state, TaskState::Finished);
    assert_eq!(received.uuid, Some(uuid));

    master
        .scheduler_call(
            framework_id.clone(),
            Call::Acknowledge {
                agent_id: agent_id.clone(),
                task_id: "t1".into(),
                uuid,
            },
        )
        .await
        .expect("acknowledge");

    loop {
        if let AgentMessage::StatusUpdateAcknowledgement {
            task_id,
            uuid: acked,
            ..
        } = recv(&mut agent_rx).await
        {
            assert_eq!(task_id.as_str(), "t1");
            assert_eq!(acked, uuid);
            break;
        }
    }

    // Once acknowledged, the terminal task leaves the active set and
    // its resources are free again.
    let state = master.get_state().await.expect("get_state");
    assert!(state.tasks.is_empty());
    let agent = &state.agents[0];
    assert!(agent.used_resources.is_empty());
}
