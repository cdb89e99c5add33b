//! Agentic task executor (C9): validates a request's tool/agent/skill
//! allowlist against the caller's permission profile, assembles a
//! subprocess invocation through the worker pool, accumulates the child's
//! event stream into an ordered execution log, harvests artifacts written
//! under the working directory, and enforces a cost deadline independent of
//! the pool's own wall-clock timeout.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use gw_permissions::PermissionProfile;
use gw_pool::{ChildEvent, SubmitRequest, WorkerPool};
use gw_pricing::Rate;
use gw_registry::CapabilityRegistry;
use gw_types::{FilesystemAccess, GatewayError, TaskErrorKind, TaskState, Usage};
use gw_wire::{AgenticTaskRequest, ArtifactInfo, ExecutionEvent};
use tokio::sync::mpsc;
use uuid::Uuid;

pub struct AgenticOutcome {
    pub task_id: Uuid,
    pub state: TaskState,
    pub result_text: Option<String>,
    pub execution_log: Vec<ExecutionEvent>,
    pub artifacts: Vec<ArtifactInfo>,
    pub usage: Option<Usage>,
    pub cost_usd: f64,
    /// Set when `state` is terminal-but-not-`Completed` for a reason the
    /// caller needs to distinguish from a plain child failure — currently
    /// only ever `CostExceeded`.
    pub error: Option<TaskErrorKind>,
}

/// Validates `request`'s allowlists against `profile`, returning the first
/// offending field name on failure (`PermissionDenied { field }`).
pub fn validate_permissions(
    request: &AgenticTaskRequest,
    profile: &PermissionProfile,
    registry: &CapabilityRegistry,
) -> Result<(), GatewayError> {
    for tool in &request.allow_tools {
        if !profile.permits_tool(tool) {
            return Err(GatewayError::PermissionDenied { field: tool.clone() });
        }
    }
    for agent in &request.allow_agents {
        if !registry.has_agent(agent) {
            return Err(GatewayError::InvalidRequest {
                field: agent.clone(),
            });
        }
        if !profile.permits_agent(agent) {
            return Err(GatewayError::PermissionDenied {
                field: agent.clone(),
            });
        }
    }
    for skill in &request.allow_skills {
        if !registry.has_skill(skill) {
            return Err(GatewayError::InvalidRequest {
                field: skill.clone(),
            });
        }
        if !profile.permits_skill(skill) {
            return Err(GatewayError::PermissionDenied {
                field: skill.clone(),
            });
        }
    }
    if request.timeout_seconds > profile.max_execution_seconds {
        return Err(GatewayError::PermissionDenied {
            field: "timeout_seconds".to_string(),
        });
    }
    if request.max_cost_usd > profile.max_cost_per_task {
        return Err(GatewayError::PermissionDenied {
            field: "max_cost_usd".to_string(),
        });
    }
    Ok(())
}

/// Resolves the working directory the child may touch, honoring the
/// profile's filesystem cap. `None` filesystem access rejects any
/// caller-supplied directory outright.
pub fn resolve_working_directory(
    requested: Option<&str>,
    profile: &PermissionProfile,
) -> Result<Option<PathBuf>, GatewayError> {
    match (requested, profile.filesystem_access) {
        (_, FilesystemAccess::None) if requested.is_some() => Err(GatewayError::PermissionDenied {
            field: "working_directory".to_string(),
        }),
        (None, _) => Ok(None),
        (Some(dir), _) => Ok(Some(PathBuf::from(dir))),
    }
}

pub struct AgenticExecutor {
    pool: WorkerPool,
    rate: Rate,
}

impl AgenticExecutor {
    pub fn new(pool: WorkerPool, rate: Rate) -> Self {
        Self { pool, rate }
    }

    /// Runs one agentic task to completion (or to a cost/time cutoff).
    /// Permission validation must already have happened; this only builds
    /// and drives the subprocess invocation.
    pub async fn execute(
        &self,
        request_id: String,
        prompt: String,
        allow_tools: Vec<String>,
        working_directory: Option<PathBuf>,
        timeout: Duration,
        max_cost_usd: f64,
    ) -> Result<AgenticOutcome, GatewayError> {
        let snapshot = working_directory
            .as_deref()
            .map(snapshot_directory)
            .unwrap_or_default();

        let (tx, mut rx) = mpsc::unbounded_channel::<ChildEvent>();
        let submit = SubmitRequest {
            prompt,
            model_alias: "sonnet".to_string(),
            allowed_tools: Some(allow_tools),
            working_directory: working_directory.clone(),
            request_id,
            timeout,
        };

        let task_id = self.pool.submit_with_events(submit, tx)?;

        let mut execution_log = Vec::new();
        let mut cost_accumulated_chars: usize = 0;
        let mut cost_exceeded = false;

        while let Some(event) = rx.recv().await {
            if let Some(wire_event) = to_wire_event(&event) {
                if let ExecutionEvent::Thinking { text } = &wire_event {
                    cost_accumulated_chars += text.len();
                }
                execution_log.push(wire_event);
            }
            if !cost_exceeded {
                let estimated_output_tokens = (cost_accumulated_chars as u64).div_ceil(4).max(1);
                let estimated = gw_pricing::price(self.rate, 0, estimated_output_tokens);
                if estimated > max_cost_usd {
                    cost_exceeded = true;
                    let _ = self.pool.cancel(task_id);
                }
            }
        }

        let outcome = self.pool.get_result(task_id, timeout + Duration::from_secs(1)).await?;

        let artifacts = working_directory
            .as_deref()
            .map(|dir| diff_artifacts(dir, &snapshot))
            .unwrap_or_default();

        // The cancel raced the child's own completion: if the child had
        // already produced a terminal result before the cut landed, honor
        // that result rather than discarding real work as a cost failure.
        let state = if cost_exceeded && outcome.state != TaskState::Completed {
            TaskState::Failed
        } else {
            outcome.state
        };
        let error = if cost_exceeded && state != TaskState::Completed {
            Some(TaskErrorKind::CostExceeded)
        } else {
            None
        };

        let cost_usd = outcome
            .usage
            .map(|u| gw_pricing::price_usage(self.rate, u))
            .unwrap_or(0.0);

        Ok(AgenticOutcome {
            task_id,
            state,
            result_text: outcome.text,
            execution_log,
            artifacts,
            usage: outcome.usage,
            cost_usd,
            error,
        })
    }
}

fn to_wire_event(event: &ChildEvent) -> Option<ExecutionEvent> {
    match event {
        ChildEvent::ToolCall { name, args } => Some(ExecutionEvent::ToolCall {
            name: name.clone(),
            args: args.clone(),
        }),
        ChildEvent::ToolResult { name, output } => Some(ExecutionEvent::ToolResult {
            name: name.clone(),
            output: output.clone(),
        }),
        ChildEvent::AgentSpawn { agent } => Some(ExecutionEvent::AgentSpawn { agent: agent.clone() }),
        ChildEvent::SkillInvoke { skill } => Some(ExecutionEvent::SkillInvoke { skill: skill.clone() }),
        ChildEvent::Thinking { text } => Some(ExecutionEvent::Thinking { text: text.clone() }),
        ChildEvent::Result { text, usage, .. } => Some(ExecutionEvent::Result {
            text: text.clone(),
            usage: *usage,
        }),
        ChildEvent::Token { .. } | ChildEvent::Unknown => None,
    }
}

fn snapshot_directory(dir: &Path) -> HashSet<PathBuf> {
    ignore::WalkBuilder::new(dir)
        .build()
        .flatten()
        .filter(|entry| entry.file_type().map(|f| f.is_file()).unwrap_or(false))
        .map(|entry| entry.path().to_path_buf())
        .collect()
}

fn diff_artifacts(dir: &Path, before: &HashSet<PathBuf>) -> Vec<ArtifactInfo> {
    let mut artifacts = Vec::new();
    for entry in ignore::WalkBuilder::new(dir).build().flatten() {
        if !entry.file_type().map(|f| f.is_file()).unwrap_or(false) {
            continue;
        }
        let path = entry.path().to_path_buf();
        if before.contains(&path) {
            continue;
        }
        let Ok(metadata) = std::fs::metadata(&path) else {
            continue;
        };
        artifacts.push(ArtifactInfo {
            path: path.display().to_string(),
            kind: path
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("unknown")
                .to_string(),
            size: metadata.len(),
            created_at: Utc::now(),
        });
    }
    artifacts
}

#[cfg(test)]
mod tests {
    use super::*;
    use gw_permissions::Preset;

    fn req(tools: Vec<&str>, agents: Vec<&str>, skills: Vec<&str>) -> AgenticTaskRequest {
        AgenticTaskRequest {
            description: "do something".to_string(),
            allow_tools: tools.into_iter().map(String::from).collect(),
            allow_agents: agents.into_iter().map(String::from).collect(),
            allow_skills: skills.into_iter().map(String::from).collect(),
            working_directory: None,
            timeout_seconds: 30,
            max_cost_usd: 0.01,
            project_id: None,
        }
    }

    #[test]
    fn blocked_tool_is_rejected_naming_the_tool() {
        let profile = PermissionProfile::preset(Preset::Free);
        let registry = CapabilityRegistry::builtin();
        let request = req(vec!["Bash"], vec![], vec![]);
        let err = validate_permissions(&request, &profile, &registry).unwrap_err();
        assert!(matches!(err, GatewayError::PermissionDenied { field } if field == "Bash"));
    }

    #[test]
    fn unknown_agent_name_is_invalid_request_not_permission_denied() {
        let profile = PermissionProfile::preset(Preset::Enterprise);
        let registry = CapabilityRegistry::builtin();
        let request = req(vec![], vec!["no-such-agent"], vec![]);
        let err = validate_permissions(&request, &profile, &registry).unwrap_err();
        assert!(matches!(err, GatewayError::InvalidRequest { .. }));
    }

    #[test]
    fn timeout_above_cap_is_rejected() {
        let profile = PermissionProfile::preset(Preset::Free);
        let registry = CapabilityRegistry::builtin();
        let mut request = req(vec!["Read"], vec![], vec![]);
        request.timeout_seconds = 999;
        let err = validate_permissions(&request, &profile, &registry).unwrap_err();
        assert!(matches!(err, GatewayError::PermissionDenied { field } if field == "timeout_seconds"));
    }

    #[test]
    fn none_filesystem_access_rejects_any_working_directory() {
        let mut profile = PermissionProfile::preset(Preset::Free);
        profile.filesystem_access = FilesystemAccess::None;
        let result = resolve_working_directory(Some("/tmp/whatever"), &profile);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn cost_cap_trip_cancels_the_child_and_preserves_partial_results() {
        let pool = WorkerPool::new(2, 4, "sh");
        let rate = Rate {
            input_per_mtok: 3.0,
            output_per_mtok: 15.0,
        };
        let executor = AgenticExecutor::new(pool, rate);

        // A single `thinking` event large enough to blow a cent-sized cap on
        // its own, followed by a sleep so the cancel has time to land before
        // the child would otherwise produce its `result` line.
        let big_thought = "x".repeat(4000);
        let script = format!(
            "echo '{{\"type\":\"thinking\",\"text\":\"{big_thought}\"}}' && sleep 2 && echo '{{\"type\":\"result\",\"text\":\"done\",\"usage\":{{\"input_tokens\":1,\"output_tokens\":1}},\"model\":\"sonnet\"}}'"
        );

        let outcome = executor
            .execute(
                "req-1".to_string(),
                script,
                vec![],
                None,
                Duration::from_secs(5),
                0.001,
            )
            .await
            .unwrap();

        assert_ne!(outcome.state, TaskState::Completed);
        assert_eq!(outcome.error, Some(TaskErrorKind::CostExceeded));
        assert!(outcome
            .execution_log
            .iter()
            .any(|e| matches!(e, ExecutionEvent::Thinking { .. })));
    }

    #[test]
    fn artifact_diff_only_reports_newly_created_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("existing.txt"), "a").unwrap();
        let before = snapshot_directory(dir.path());
        std::fs::write(dir.path().join("new.txt"), "b").unwrap();
        let artifacts = diff_artifacts(dir.path(), &before);
        assert_eq!(artifacts.len(), 1);
        assert!(artifacts[0].path.ends_with("new.txt"));
    }
}
