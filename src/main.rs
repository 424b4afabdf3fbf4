use helmsman::allocator::OfferAllAllocator;
use helmsman::auth::PermissiveAuthorizer;
use helmsman::ids::Address;
use helmsman::master::{AgentConnection, Master, OperatorOp, OperatorResponse};
use helmsman::messages::agent::{AgentCall, AgentMessage};
use helmsman::messages::scheduler::{Call, Event, Filters};
use helmsman::messages::{AgentInfo, FrameworkInfo, TaskInfo, TaskState, TaskStatus};
use helmsman::registry::MemoryStorage;
use helmsman::resources::{Operation, Resources};
use helmsman::MasterConfig;
use slog::{info, o, Drain, Logger};
use std::sync::Arc;
use tokio::sync::mpsc;

fn terminal_logger() -> Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(drain, o!())
}

/// Single-process demo: start a master, register one agent, subscribe
/// one framework, launch a task through an offer, and watch it finish.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logger = terminal_logger();

    let master = Master::start(
        MasterConfig::default(),
        Box::new(MemoryStorage::new()),
        Box::new(OfferAllAllocator::new()),
        Arc::new(PermissiveAuthorizer),
        None,
        logger.clone(),
    )?;

    // Register an agent with 4 cpus and 8 GB.
    let (agent_tx, mut agent_rx) = mpsc::unbounded_channel();
    let connection = AgentConnection::new(Address::from("agent-1"), agent_tx);
    master
        .register_agent(
            connection,
            AgentInfo::new("node-1", Resources::cpus_mem(4.0, 8192.0)),
            Resources::new(),
            "0.1.0",
        )
        .await?;

    let agent_id = loop {
        if let AgentMessage::Registered { agent_id, .. } =
            agent_rx.recv().await.ok_or("agent channel closed")?
        {
            break agent_id;
        }
    };
    info!(logger, "Agent registered"; "agent_id" => %agent_id);

    // Subscribe a framework.
    let mut events = master
        .subscribe(
            Address::from("framework-1"),
            FrameworkInfo::new("demo", "web"),
            false,
        )
        .await?;

    let framework_id = loop {
        match events.recv().await.ok_or("framework channel closed")? {
            Event::Subscribed { framework_id, .. } => break framework_id,
            other => info!(logger, "Framework event"; "event" => ?other),
        }
    };
    info!(logger, "Framework subscribed"; "framework_id" => %framework_id);

    // Wait for an offer and launch a task on it.
    let offer = loop {
        match events.recv().await.ok_or("framework channel closed")? {
            Event::Offers { mut offers } => break offers.remove(0),
            other => info!(logger, "Framework event"; "event" => ?other),
        }
    };
    info!(logger, "Received offer";
        "offer_id" => %offer.offer_id, "resources" => %offer.resources);

    master
        .scheduler_call(
            framework_id.clone(),
            Call::Accept {
                offer_ids: vec![offer.offer_id.clone()],
                operations: vec![Operation::Launch {
                    tasks: vec![TaskInfo::new("demo-task", Resources::cpus_mem(1.0, 1024.0))],
                }],
                filters: Filters::default(),
            },
        )
        .await?;

    // The agent runs the task and reports it finished.
    let task = loop {
        if let AgentMessage::RunTask { task, .. } =
            agent_rx.recv().await.ok_or("agent channel closed")?
        {
            break task;
        }
    };
    info!(logger, "Agent launched task"; "task_id" => %task.task_id);

    master
        .agent_call(AgentCall::StatusUpdate {
            framework_id: framework_id.clone(),
            update: TaskStatus::new(task.task_id.clone(), TaskState::Finished)
                .with_agent(agent_id.clone())
                .with_uuid(uuid::Uuid::new_v4()),
        })
        .await?;

    loop {
        if let Event::Update { status } = events.recv().await.ok_or("framework channel closed")? {
            info!(logger, "Task update"; "task_id" => %status.task_id, "state" => ?status.state);
            if status.state == TaskState::Finished {
                break;
            }
        }
    }

    if let OperatorResponse::State(state) = master.operator(None, OperatorOp::GetState).await? {
        info!(logger, "Final state";
            "agents" => state.agents.len(),
            "frameworks" => state.frameworks.len(),
            "tasks_launched" => state.metrics.tasks_launched
        );
    }

    master.terminate().await?;
    Ok(())
}
