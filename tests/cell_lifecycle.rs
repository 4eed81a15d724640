//! Cell lifecycle: dependency-ordered startup, reverse shutdown, events

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use colony::agent::{Agent, AgentContext, AgentError, AgentTypeRegistry};
use colony::bridge::EventBridge;
use colony::config::{CellConfig, CellsConfig, InfraConfig, PoolConfig};
use colony::envelope::Envelope;
use colony::orchestrator::{CellState, Orchestrator, OrchestratorError};
use colony::support::AgentState;

/// Records init/cleanup invocations into a shared log
struct RecorderAgent {
    log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Agent for RecorderAgent {
    async fn init(&mut self, ctx: &AgentContext) -> Result<(), AgentError> {
        self.log
            .lock()
            .unwrap()
            .push(format!("init:{}", ctx.agent_id()));
        Ok(())
    }

    async fn process_message(
        &mut self,
        _envelope: Envelope,
        _ctx: &AgentContext,
    ) -> Result<Option<Envelope>, AgentError> {
        Ok(None)
    }

    async fn cleanup(&mut self, ctx: &AgentContext) -> Result<(), AgentError> {
        self.log
            .lock()
            .unwrap()
            .push(format!("cleanup:{}", ctx.agent_id()));
        Ok(())
    }
}

/// Never finishes init; used to trip the startup timeout
struct StuckAgent;

#[async_trait]
impl Agent for StuckAgent {
    async fn init(&mut self, _ctx: &AgentContext) -> Result<(), AgentError> {
        std::future::pending::<()>().await;
        Ok(())
    }

    async fn process_message(
        &mut self,
        _envelope: Envelope,
        _ctx: &AgentContext,
    ) -> Result<Option<Envelope>, AgentError> {
        Ok(None)
    }

    async fn cleanup(&mut self, _ctx: &AgentContext) -> Result<(), AgentError> {
        Ok(())
    }
}

fn pool() -> PoolConfig {
    serde_yaml::from_str(
        r"
agent_types:
  - type: recorder
    binary: builtin
    operator: call
    capabilities: [record]
  - type: stuck
    binary: builtin
    operator: call
",
    )
    .unwrap()
}

fn pipeline_cell() -> CellConfig {
    serde_yaml::from_str(
        r"
id: pipeline
description: three-stage pipeline
orchestration:
  startup_timeout: 5.0
  shutdown_timeout: 2.0
  health_check_interval: 0.5
agents:
  - id: source
    agent_type: recorder
  - id: transform
    agent_type: recorder
    dependencies: [source]
  - id: sink
    agent_type: recorder
    dependencies: [transform]
",
    )
    .unwrap()
}

fn registry_with_log(log: &Arc<Mutex<Vec<String>>>) -> Arc<AgentTypeRegistry> {
    let registry = AgentTypeRegistry::new();
    let factory_log = Arc::clone(log);
    registry.register("recorder", move || {
        Box::new(RecorderAgent {
            log: Arc::clone(&factory_log),
        })
    });
    registry.register("stuck", || Box::new(StuckAgent));
    Arc::new(registry)
}

fn position(log: &[String], entry: &str) -> usize {
    log.iter()
        .position(|e| e == entry)
        .unwrap_or_else(|| panic!("{entry} not found in {log:?}"))
}

#[test_log::test(tokio::test)]
async fn startup_and_shutdown_follow_dependency_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut orchestrator = Orchestrator::new(
        pool(),
        pipeline_cell(),
        InfraConfig::default(),
        registry_with_log(&log),
    )
    .unwrap();

    let bridge = EventBridge::new(orchestrator.broker());
    let mut cell_events = bridge.subscribe("cell:*").unwrap();

    orchestrator.start().await.unwrap();
    assert_eq!(orchestrator.state(), CellState::Running);

    for agent_id in ["source", "transform", "sink"] {
        assert_eq!(
            orchestrator.support().status(agent_id).unwrap().state,
            AgentState::Running
        );
    }

    {
        let log = log.lock().unwrap();
        assert!(position(&log, "init:source") < position(&log, "init:transform"));
        assert!(position(&log, "init:transform") < position(&log, "init:sink"));
    }

    orchestrator.shutdown().await;
    assert_eq!(orchestrator.state(), CellState::Stopped);

    {
        let log = log.lock().unwrap();
        // Agents complete in reverse topological order.
        assert!(position(&log, "cleanup:sink") < position(&log, "cleanup:transform"));
        assert!(position(&log, "cleanup:transform") < position(&log, "cleanup:source"));
    }

    // The control topic saw the whole cell lifecycle, in order.
    let mut seen = Vec::new();
    while let Some(event) = cell_events.try_recv() {
        seen.push(event.destination);
    }
    assert_eq!(
        seen,
        vec!["cell:starting", "cell:running", "cell:stopping", "cell:stopped"]
    );
}

#[test_log::test(tokio::test)]
async fn startup_timeout_tears_down_started_agents() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let cell: CellConfig = serde_yaml::from_str(
        r"
id: stuck-cell
orchestration:
  startup_timeout: 0.3
  shutdown_timeout: 0.5
agents:
  - id: source
    agent_type: recorder
  - id: jammed
    agent_type: stuck
    dependencies: [source]
",
    )
    .unwrap();

    let mut orchestrator =
        Orchestrator::new(pool(), cell, InfraConfig::default(), registry_with_log(&log)).unwrap();

    let result = orchestrator.start().await;
    assert!(matches!(
        result,
        Err(OrchestratorError::StartupTimeout { ref agent_id }) if agent_id == "jammed"
    ));
    assert_eq!(orchestrator.state(), CellState::Stopped);

    // The already-started stratum was initialized, then torn down.
    let log = log.lock().unwrap();
    assert!(log.contains(&"init:source".to_string()));
}

#[test_log::test(tokio::test)]
async fn cyclic_dependencies_are_rejected_up_front() {
    let cell: CellConfig = serde_yaml::from_str(
        r"
id: cyclic
agents:
  - id: a
    agent_type: recorder
    dependencies: [b]
  - id: b
    agent_type: recorder
    dependencies: [a]
",
    )
    .unwrap();

    let log = Arc::new(Mutex::new(Vec::new()));
    let result = Orchestrator::new(
        pool(),
        cell,
        InfraConfig::default(),
        registry_with_log(&log),
    );
    assert!(matches!(result, Err(OrchestratorError::Config { .. })));
}

#[test_log::test(tokio::test)]
async fn replan_applies_additions_and_removals() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut orchestrator = Orchestrator::new(
        pool(),
        pipeline_cell(),
        InfraConfig::default(),
        registry_with_log(&log),
    )
    .unwrap();
    orchestrator.start().await.unwrap();

    // Drop the sink, add an auditor beside the transform.
    let new_cell: CellConfig = serde_yaml::from_str(
        r"
id: pipeline
orchestration:
  startup_timeout: 5.0
  shutdown_timeout: 2.0
  health_check_interval: 0.5
agents:
  - id: source
    agent_type: recorder
  - id: transform
    agent_type: recorder
    dependencies: [source]
  - id: auditor
    agent_type: recorder
    dependencies: [source]
",
    )
    .unwrap();

    orchestrator.replan(new_cell).await.unwrap();

    let support = orchestrator.support();
    assert!(support.status("sink").is_none(), "removed agent is gone");
    assert_eq!(
        support.status("auditor").unwrap().state,
        AgentState::Running
    );
    assert_eq!(
        support.status("source").unwrap().state,
        AgentState::Running,
        "unchanged agent was not restarted"
    );

    orchestrator.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn cells_config_selects_by_id() {
    let pool = pool();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cells.yaml");
    std::fs::write(
        &path,
        r"
cells:
  - id: first
    agents:
      - id: a
        agent_type: recorder
  - id: second
    agents:
      - id: b
        agent_type: recorder
",
    )
    .unwrap();

    let cells = CellsConfig::from_path(&path, &pool).unwrap();
    assert_eq!(cells.select(None).unwrap().id, "first");
    assert_eq!(cells.select(Some("second")).unwrap().id, "second");
    assert!(cells.select(Some("missing")).is_err());
}
