use helmsman::allocator::OfferAllAllocator;
use helmsman::auth::{AclAuthorizer, PermissiveAuthorizer};
use helmsman::ids::{Address, AgentId, MachineId};
use helmsman::machine::{MaintenanceMode, Schedule, ScheduleWindow};
use helmsman::master::{AgentConnection, Master, MasterHandle, OperatorOp, OperatorResponse};
use helmsman::messages::agent::AgentMessage;
use helmsman::messages::{AgentInfo, Unavailability};
use helmsman::registry::MemoryStorage;
use helmsman::resources::{Reservation, Resource, Resources};
use helmsman::role::Quota;
use helmsman::{Error, MasterConfig};
use slog::{o, Logger};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
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
    hostname: &str,
    resources: Resources,
) -> (AgentId, MachineId, mpsc::UnboundedReceiver<AgentMessage>) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let info = AgentInfo::new(hostname, resources);
    let machine = info.machine.clone();
    master
        .register_agent(
            AgentConnection::new(Address::from(address), tx),
            info,
            Resources::new(),
            "0.1.0",
        )
        .await
        .expect("register_agent send");

    loop {
        if let AgentMessage::Registered { agent_id, .. } = recv(&mut rx).await {
            return (agent_id, machine, rx);
        }
    }
}

#[tokio::test]
async fn test_quota_set_get_remove() {
    let master = start_master(MasterConfig::for_tests());

    let quota = Quota {
        guarantee: Resources::cpus_mem(10.0, 4096.0),
    };
    match master
        .operator(
            None,
            OperatorOp::SetQuota {
                role: "web".to_string(),
                quota: quota.clone(),
            },
        )
        .await
        .expect("set quota")
    {
        OperatorResponse::Ack => {}
        _ => panic!("expected ack"),
    }

    match master
        .operator(None, OperatorOp::GetQuota)
        .await
        .expect("get quota")
    {
        OperatorResponse::Quotas(quotas) => {
            assert_eq!(quotas.get("web"), Some(&quota));
        }
        _ => panic!("expected quotas"),
    }

    master
        .operator(
            None,
            OperatorOp::RemoveQuota {
                role: "web".to_string(),
            },
        )
        .await
        .expect("remove quota");

    // Removing a quota that is gone is a validation error.
    let again = master
        .operator(
            None,
            OperatorOp::RemoveQuota {
                role: "web".to_string(),
            },
        )
        .await;
    assert!(matches!(again, Err(Error::Validation(_))));
}

#[tokio::test]
async fn test_weights_update_and_validation() {
    let master = start_master(MasterConfig::for_tests());

    let mut weights = HashMap::new();
    weights.insert("web".to_string(), 2.0);
    master
        .operator(None, OperatorOp::UpdateWeights { weights })
        .await
        .expect("update weights");

    match master
        .operator(None, OperatorOp::GetWeights)
        .await
        .expect("get weights")
    {
        OperatorResponse::Weights(weights) => {
            assert_eq!(weights.get("web"), Some(&2.0));
        }
        _ => panic!("expected weights"),
    }

    let mut bad = HashMap::new();
    bad.insert("web".to_string(), -1.0);
    let result = master
        .operator(None, OperatorOp::UpdateWeights { weights: bad })
        .await;
    assert!(matches!(result, Err(Error::Validation(_))));
}

#[tokio::test]
async fn test_denied_operator_call() {
    let authorizer = Arc::new(AclAuthorizer::new().deny(None, "UPDATE_QUOTA"));
    let master = Master::start(
        MasterConfig::for_tests(),
        Box::new(MemoryStorage::new()),
        Box::new(OfferAllAllocator::new()),
        authorizer,
        None,
        logger(),
    )
    .expect("master should start");

    let result = master
        .operator(
            None,
            OperatorOp::SetQuota {
                role: "web".to_string(),
                quota: Quota {
                    guarantee: Resources::cpus_mem(1.0, 512.0),
                },
            },
        )
        .await;
    assert!(matches!(result, Err(Error::AuthorizationDenied(_))));
}

#[tokio::test]
async fn test_operator_reserve_and_unreserve() {
    let master = start_master(MasterConfig::for_tests());

    let (agent_id, _machine, mut agent_rx) =
        register_agent(&master, "agent-1", "a1", Resources::cpus_mem(4.0, 8192.0)).await;

    let reserved: Resources = std::iter::once(
        Resource::scalar("cpus", 2.0).reserved(Reservation::new("web", None)),
    )
    .collect();

    master
        .operator(
            None,
            OperatorOp::ReserveResources {
                agent_id: agent_id.clone(),
                resources: reserved.clone(),
            },
        )
        .await
        .expect("reserve");

    loop {
        if let AgentMessage::CheckpointResources { checkpointed } = recv(&mut agent_rx).await {
            assert_eq!(checkpointed, reserved);
            break;
        }
    }

    master
        .operator(
            None,
            OperatorOp::UnreserveResources {
                agent_id: agent_id.clone(),
                resources: reserved,
            },
        )
        .await
        .expect("unreserve");

    loop {
        if let AgentMessage::CheckpointResources { checkpointed } = recv(&mut agent_rx).await {
            assert!(checkpointed.is_empty());
            break;
        }
    }

    // Reserving more than the agent holds is refused.
    let too_much: Resources = std::iter::once(
        Resource::scalar("cpus", 64.0).reserved(Reservation::new("web", None)),
    )
    .collect();
    let result = master
        .operator(
            None,
            OperatorOp::ReserveResources {
                agent_id,
                resources: too_much,
            },
        )
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_maintenance_schedule_down_up_cycle() {
    let master = start_master(MasterConfig::for_tests());

    let (agent_id, machine, _agent_rx) =
        register_agent(&master, "agent-1", "a1", Resources::cpus_mem(2.0, 1024.0)).await;

    let schedule = Schedule {
        windows: vec![ScheduleWindow {
            machines: vec![machine.clone()],
            unavailability: Unavailability {
                start: SystemTime::now(),
                duration: Some(Duration::from_secs(3600)),
            },
        }],
    };
    master
        .operator(None, OperatorOp::UpdateMaintenanceSchedule { schedule })
        .await
        .expect("schedule");

    match master
        .operator(None, OperatorOp::GetMaintenanceStatus)
        .await
        .expect("status")
    {
        OperatorResponse::MaintenanceStatus(status) => {
            assert_eq!(status, vec![(machine.clone(), MaintenanceMode::Draining)]);
        }
        _ => panic!("expected maintenance status"),
    }

    // Down deactivates the machine's agents.
    master
        .operator(
            None,
            OperatorOp::MachineDown {
                machine: machine.clone(),
            },
        )
        .await
        .expect("down");

    let state = master.get_state().await.expect("get_state");
    let agent = state
        .agents
        .iter()
        .find(|agent| agent.agent_id == agent_id)
        .expect("agent still registered");
    assert!(!agent.active);

    // Up reactivates them and clears the schedule.
    master
        .operator(None, OperatorOp::MachineUp { machine })
        .await
        .expect("up");

    let state = master.get_state().await.expect("get_state");
    let agent = state
        .agents
        .iter()
        .find(|agent| agent.agent_id == agent_id)
        .expect("agent still registered");
    assert!(agent.active);

    match master
        .operator(None, OperatorOp::GetMaintenanceSchedule)
        .await
        .expect("schedule")
    {
        OperatorResponse::Schedule(schedule) => assert!(schedule.windows.is_empty()),
        _ => panic!("expected schedule"),
    }
}

#[tokio::test]
async fn test_registry_gc_prunes_old_unreachable_agents() {
    let config = MasterConfig {
        registry_gc_interval: Duration::from_millis(100),
        registry_max_agent_age: Duration::from_millis(50),
        ..MasterConfig::for_tests()
    };
    let master = start_master(config);

    let (agent_id, _machine, _agent_rx) =
        register_agent(&master, "agent-1", "a1", Resources::cpus_mem(1.0, 512.0)).await;

    master
        .agent_exited(Address::from("agent-1"))
        .await
        .expect("exited");
    master
        .mark_agent_unreachable(agent_id.clone())
        .await
        .expect("mark unreachable");

    // The unreachable entry outlives the age cap and the GC interval:
    // it must disappear from the master's view.
    let mut pruned = false;
    for _ in 0..50 {
        let state = master.get_state().await.expect("get_state");
        if state.agents.is_empty() && state.unreachable_agents.is_empty() {
            pruned = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(pruned, "unreachable agent should be garbage collected");
}

#[tokio::test]
async fn test_flags_health_version() {
    let master = start_master(MasterConfig::for_tests());

    match master
        .operator(None, OperatorOp::GetHealth)
        .await
        .expect("health")
    {
        OperatorResponse::Health(healthy) => assert!(healthy),
        _ => panic!("expected health"),
    }

    match master
        .operator(None, OperatorOp::GetVersion)
        .await
        .expect("version")
    {
        OperatorResponse::Version(version) => assert!(!version.is_empty()),
        _ => panic!("expected version"),
    }

    match master
        .operator(None, OperatorOp::GetFlags)
        .await
        .expect("flags")
    {
        OperatorResponse::Flags(flags) => {
            assert_eq!(flags.max_completed_frameworks, 4);
        }
        _ => panic!("expected flags"),
    }
}
