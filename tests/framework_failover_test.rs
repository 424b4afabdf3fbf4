use helmsman::allocator::OfferAllAllocator;
use helmsman::auth::{PermissiveAuthorizer, StaticAuthenticator};
use helmsman::ids::{Address, AgentId, FrameworkId};
use helmsman::master::{AgentConnection, Master, MasterHandle, OperatorOp, OperatorResponse};
use helmsman::messages::agent::AgentMessage;
use helmsman::messages::scheduler::{Call, Event, Filters};
use helmsman::messages::subscriber::MasterEvent;
use helmsman::messages::{AgentInfo, FrameworkInfo, TaskInfo};
use helmsman::registry::MemoryStorage;
use helmsman::resources::{Operation, Resources};
use helmsman::config::RateLimit;
use helmsman::MasterConfig;
use slog::{o, Logger};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

fn logger() -> Logger {
    Logger::root(slog::Discard, o!())
}

fn start_master(config: MasterConfig) -> MasterHandle {
    Master::start(
        config,
        Box::new(MemoryStorage::new()),
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
    resources: Resources,
) -> (AgentId, mpsc::UnboundedReceiver<AgentMessage>) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    master
        .register_agent(
            AgentConnection::new(Address::from(address), tx),
            AgentInfo::new(address, resources),
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

async fn subscribe(
    master: &MasterHandle,
    address: &str,
    info: FrameworkInfo,
) -> (FrameworkId, mpsc::UnboundedReceiver<Event>) {
    let mut rx = master
        .subscribe(Address::from(address), info, false)
        .await
        .expect("subscribe send");

    loop {
        match recv(&mut rx).await {
            Event::Subscribed { framework_id, .. } => return (framework_id, rx),
            Event::Error { message } => panic!("subscription failed: {}", message),
            _ => {}
        }
    }
}

async fn launch_one_task(
    master: &MasterHandle,
    framework_id: &FrameworkId,
    events: &mut mpsc::UnboundedReceiver<Event>,
    agent_rx: &mut mpsc::UnboundedReceiver<AgentMessage>,
    name: &str,
) {
    let offer = loop {
        if let Event::Offers { mut offers } = recv(events).await {
            break offers.remove(0);
        }
    };

    master
        .scheduler_call(
            framework_id.clone(),
            Call::Accept {
                offer_ids: vec![offer.offer_id],
                operations: vec![Operation::Launch {
                    tasks: vec![TaskInfo::new(name, Resources::cpus_mem(1.0, 1024.0))],
                }],
                filters: Filters::default(),
            },
        )
        .await
        .expect("accept");

    loop {
        if let AgentMessage::RunTask { .. } = recv(agent_rx).await {
            break;
        }
    }
}

#[tokio::test]
async fn test_framework_failover_rebinds_connection_and_keeps_tasks() {
    let master = start_master(MasterConfig::for_tests());

    let (_agent_id, mut agent_rx) =
        register_agent(&master, "agent-1", Resources::cpus_mem(4.0, 8192.0)).await;

    let mut info = FrameworkInfo::new("demo", "web");
    info.failover_timeout = Some(Duration::from_secs(30));
    let (framework_id, mut events) = subscribe(&master, "framework-1", info.clone()).await;

    launch_one_task(&master, &framework_id, &mut events, &mut agent_rx, "t1").await;

    // The framework's transport drops; the task must survive the
    // failover window.
    master
        .framework_exited(framework_id.clone())
        .await
        .expect("exited");

    // A new incarnation re-subscribes with the same id.
    let mut resubscribe = info;
    resubscribe.id = Some(framework_id.clone());
    let (same_id, _new_events) = subscribe(&master, "framework-1b", resubscribe).await;
    assert_eq!(same_id, framework_id);

    let state = master.get_state().await.expect("get_state");
    assert_eq!(state.frameworks.len(), 1);
    assert!(state.frameworks[0].connected);
    assert!(state.frameworks[0].active);
    assert_eq!(state.tasks.len(), 1);
    assert_eq!(state.tasks[0].task_id.as_str(), "t1");
}

#[tokio::test]
async fn test_framework_failover_timeout_tears_framework_down() {
    let master = start_master(MasterConfig::for_tests());

    let (_agent_id, mut agent_rx) =
        register_agent(&master, "agent-1", Resources::cpus_mem(4.0, 8192.0)).await;

    let mut info = FrameworkInfo::new("demo", "web");
    info.failover_timeout = Some(Duration::from_millis(100));
    let (framework_id, mut events) = subscribe(&master, "framework-1", info).await;

    launch_one_task(&master, &framework_id, &mut events, &mut agent_rx, "t1").await;

    master
        .framework_exited(framework_id.clone())
        .await
        .expect("exited");

    // No re-subscription: the framework is torn down and its task is
    // killed on the agent.
    loop {
        if let AgentMessage::KillTask { task_id, .. } = recv(&mut agent_rx).await {
            assert_eq!(task_id.as_str(), "t1");
            break;
        }
    }

    // Wait for removal to settle.
    let mut torn_down = false;
    for _ in 0..50 {
        let state = master.get_state().await.expect("get_state");
        if state.frameworks.is_empty() {
            assert!(state.tasks.is_empty());
            assert!(state.completed_frameworks.contains(&framework_id));
            torn_down = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(torn_down, "framework should be moved to the completed ring");
}

#[tokio::test]
async fn test_zero_failover_timeout_fires_immediately() {
    let master = start_master(MasterConfig::for_tests());

    let (_agent_id, _agent_rx) =
        register_agent(&master, "agent-1", Resources::cpus_mem(2.0, 1024.0)).await;

    // No declared failover timeout and a zero default: teardown on the
    // next actor turn after disconnect.
    let (framework_id, _events) =
        subscribe(&master, "framework-1", FrameworkInfo::new("demo", "web")).await;

    master
        .framework_exited(framework_id.clone())
        .await
        .expect("exited");

    let mut torn_down = false;
    for _ in 0..50 {
        let state = master.get_state().await.expect("get_state");
        if state.frameworks.is_empty() {
            torn_down = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(torn_down);
}

#[tokio::test]
async fn test_teardown_is_immediate_failover_expiry() {
    let master = start_master(MasterConfig::for_tests());

    let (_agent_id, mut agent_rx) =
        register_agent(&master, "agent-1", Resources::cpus_mem(4.0, 8192.0)).await;

    let mut info = FrameworkInfo::new("demo", "web");
    info.failover_timeout = Some(Duration::from_secs(3600));
    let (framework_id, mut events) = subscribe(&master, "framework-1", info).await;

    launch_one_task(&master, &framework_id, &mut events, &mut agent_rx, "t1").await;

    master
        .scheduler_call(framework_id.clone(), Call::Teardown)
        .await
        .expect("teardown");

    loop {
        if let AgentMessage::KillTask { task_id, .. } = recv(&mut agent_rx).await {
            assert_eq!(task_id.as_str(), "t1");
            break;
        }
    }

    let state = master.get_state().await.expect("get_state");
    assert!(state.frameworks.is_empty());
    assert!(state.completed_frameworks.contains(&framework_id));

    // A torn-down framework cannot come back under its old id.
    let mut stale = FrameworkInfo::new("demo", "web");
    stale.id = Some(framework_id);
    let mut rx = master
        .subscribe(Address::from("framework-1c"), stale, false)
        .await
        .expect("subscribe send");
    loop {
        if let Event::Error { message } = recv(&mut rx).await {
            assert!(message.contains("torn down"));
            break;
        }
    }
}

#[tokio::test]
async fn test_rate_limit_queue_and_capacity() {
    let config = MasterConfig {
        rate_limits: vec![RateLimit {
            principal: "alice".to_string(),
            qps: Some(1.0),
            capacity: Some(5),
        }],
        ..MasterConfig::for_tests()
    };

    let authenticator = StaticAuthenticator::new().with_credential("alice", "s3cret");
    let master = Master::start(
        config,
        Box::new(MemoryStorage::new()),
        Box::new(OfferAllAllocator::new()),
        Arc::new(PermissiveAuthorizer),
        Some(Arc::new(authenticator)),
        logger(),
    )
    .expect("master should start");

    master
        .authenticate(
            Address::from("framework-1"),
            helmsman::auth::Credential {
                principal: "alice".to_string(),
                secret: "s3cret".to_string(),
            },
        )
        .await
        .expect("authenticate");
    // Let authentication complete before subscribing.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let info = FrameworkInfo::new("demo", "web").with_principal("alice");
    let (framework_id, mut events) = subscribe(&master, "framework-1", info).await;

    // Ten reconcile calls in one burst: one token is mature, four wait
    // in the queue, five are dropped with an explicit error.
    for _ in 0..10 {
        master
            .scheduler_call(framework_id.clone(), Call::Reconcile { tasks: vec![] })
            .await
            .expect("call");
    }

    let mut errors = 0;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline && errors < 5 {
        match timeout(Duration::from_millis(200), events.recv()).await {
            Ok(Some(Event::Error { message })) => {
                assert!(message.contains("capacity"));
                errors += 1;
            }
            Ok(Some(_)) => {}
            _ => break,
        }
    }
    assert_eq!(errors, 5, "five calls should be dropped for capacity");

    if let OperatorResponse::Metrics(metrics) = master
        .operator(None, OperatorOp::GetMetrics)
        .await
        .expect("metrics")
    {
        assert_eq!(metrics.messages_dropped_capacity, 5);
    } else {
        panic!("expected metrics response");
    }
}

#[tokio::test]
async fn test_authentication_required_rejects_anonymous_subscription() {
    let config = MasterConfig {
        authentication_required: true,
        ..MasterConfig::for_tests()
    };
    let authenticator = StaticAuthenticator::new().with_credential("alice", "s3cret");
    let master = Master::start(
        config,
        Box::new(MemoryStorage::new()),
        Box::new(OfferAllAllocator::new()),
        Arc::new(PermissiveAuthorizer),
        Some(Arc::new(authenticator)),
        logger(),
    )
    .expect("master should start");

    let mut rx = master
        .subscribe(
            Address::from("framework-1"),
            FrameworkInfo::new("demo", "web"),
            false,
        )
        .await
        .expect("subscribe send");

    loop {
        if let Event::Error { message } = recv(&mut rx).await {
            assert!(message.contains("not authenticated"));
            break;
        }
    }

    // After authenticating, the same endpoint subscribes fine.
    master
        .authenticate(
            Address::from("framework-1"),
            helmsman::auth::Credential {
                principal: "alice".to_string(),
                secret: "s3cret".to_string(),
            },
        )
        .await
        .expect("authenticate");
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (_framework_id, _events) = subscribe(
        &master,
        "framework-1",
        FrameworkInfo::new("demo", "web"),
    )
    .await;
}

#[tokio::test]
async fn test_event_stream_sees_lifecycle_events() {
    let master = start_master(MasterConfig::for_tests());

    let (stream_id, mut stream) = master
        .subscribe_events(None)
        .await
        .expect("subscribe events");
    assert!(!stream_id.is_nil());

    loop {
        if let MasterEvent::Subscribed { .. } = recv(&mut stream).await {
            break;
        }
    }

    let (agent_id, _agent_rx) =
        register_agent(&master, "agent-1", Resources::cpus_mem(1.0, 512.0)).await;
    loop {
        if let MasterEvent::AgentAdded { agent_id: added, .. } = recv(&mut stream).await {
            assert_eq!(added, agent_id);
            break;
        }
    }

    let (framework_id, _events) =
        subscribe(&master, "framework-1", FrameworkInfo::new("demo", "web")).await;
    loop {
        if let MasterEvent::FrameworkAdded {
            framework_id: added,
            ..
        } = recv(&mut stream).await
        {
            assert_eq!(added, framework_id);
            break;
        }
    }

    // Heartbeats keep flowing on the stream.
    loop {
        if let MasterEvent::Heartbeat = recv(&mut stream).await {
            break;
        }
    }
}

#[tokio::test]
async fn test_role_whitelist_rejects_unlisted_role() {
    let config = MasterConfig {
        role_whitelist: Some(["web".to_string()].into_iter().collect()),
        ..MasterConfig::for_tests()
    };
    let master = start_master(config);

    let mut rx = master
        .subscribe(
            Address::from("framework-1"),
            FrameworkInfo::new("demo", "batch"),
            false,
        )
        .await
        .expect("subscribe send");

    loop {
        if let Event::Error { message } = recv(&mut rx).await {
            assert!(message.contains("not whitelisted"));
            break;
        }
    }
}
