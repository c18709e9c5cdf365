//! Test blueprints for validating queueing and DAG execution.

use std::time::{Duration, Instant};

use serde::Deserialize;
use serde_json::{json, Value};

use crate::dag::{SpawnOptions, WaitOptions, WaitOutcome, WaitPolicy};
use crate::model::StepKind;
use crate::registry::BlueprintRegistry;

pub fn register(registry: &mut BlueprintRegistry) {
    registry.register("core.test.echo@v1", |ctx, inputs| async move {
        let ctx = &ctx;
        ctx.step("Echoing inputs", StepKind::AgentTask, |_scope| async move {
            ctx.emit_progress("Echoing inputs back", None).await?;
            Ok(())
        })
        .await?;

        Ok(json!({
            "echo": inputs,
            "timestamp": chrono::Utc::now().timestamp_millis(),
        }))
    });

    registry.register("core.test.sleep@v1", |ctx, inputs| async move {
        let ctx = &ctx;
        let ms = inputs.get("ms").and_then(Value::as_u64).unwrap_or(100);
        let fail = inputs.get("fail").and_then(Value::as_bool).unwrap_or(false);

        ctx.step(
            &format!("Sleeping for {}ms", ms),
            StepKind::AgentTask,
            |_scope| async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                ctx.emit_progress(&format!("Slept for {}ms", ms), None).await?;

                if fail {
                    anyhow::bail!("intentional failure after {}ms sleep", ms);
                }
                Ok(())
            },
        )
        .await?;

        Ok(json!({
            "slept_ms": ms,
            "failed": false,
        }))
    });

    registry.register("core.test.orchestrator@v1", |ctx, inputs| async move {
        let ctx = &ctx;
        let params: OrchestratorInputs = serde_json::from_value(inputs)?;
        let params = &params;
        let start = Instant::now();
        let mut child_run_ids: Vec<uuid::Uuid> = Vec::new();

        let outcome = if params.parallel {
            // Spawn all children, then wait under the requested policy.
            let spawned = &mut child_run_ids;
            ctx.step(
                &format!("Spawning {} children in parallel", params.children.len()),
                StepKind::AgentTask,
                |_scope| async move {
                    for spec in &params.children {
                        let child_id = ctx
                            .spawn_run(
                                &spec.blueprint_ref,
                                spec.effective_inputs(params.fail_child_key.as_deref()),
                                spawn_options(spec),
                            )
                            .await?;
                        spawned.push(child_id);
                        ctx.emit_progress(
                            &format!("Spawned {:?}: {}", spec.child_key, child_id),
                            None,
                        )
                        .await?;
                    }
                    Ok(())
                },
            )
            .await?;

            let waiting_on = &child_run_ids;
            ctx.step(
                &format!("Waiting for children (policy={})", params.mode.as_str()),
                StepKind::AgentTask,
                |_scope| async move {
                    ctx.wait_runs(waiting_on, params.mode, WaitOptions::default())
                        .await
                },
            )
            .await?
        } else {
            // Sequential mode: spawn and wait for each child in turn.
            for (i, spec) in params.children.iter().enumerate() {
                let spawned = &mut child_run_ids;
                ctx.step(
                    &format!("Sequential step {}: {:?}", i + 1, spec.child_key),
                    StepKind::AgentTask,
                    |_scope| async move {
                        let child_id = ctx
                            .spawn_run(
                                &spec.blueprint_ref,
                                spec.effective_inputs(params.fail_child_key.as_deref()),
                                spawn_options(spec),
                            )
                            .await?;
                        spawned.push(child_id);
                        ctx.emit_progress(&format!("Spawned {:?}: {}", spec.child_key, child_id), None)
                            .await?;

                        ctx.wait_runs(&[child_id], WaitPolicy::All, WaitOptions::default())
                            .await?;
                        ctx.emit_progress(&format!("Completed {:?}", spec.child_key), None)
                            .await?;
                        Ok(())
                    },
                )
                .await?;
            }

            WaitOutcome {
                completed: child_run_ids.clone(),
                failed: Vec::new(),
            }
        };

        Ok(json!({
            "child_run_ids": as_strings(&child_run_ids),
            "completed": as_strings(&outcome.completed),
            "failed": as_strings(&outcome.failed),
            "policy": params.mode.as_str(),
            "elapsed_ms": start.elapsed().as_millis() as u64,
            "parallel": params.parallel,
        }))
    });
}

#[derive(Debug, Deserialize)]
struct OrchestratorInputs {
    #[serde(default)]
    mode: WaitPolicy,
    #[serde(default)]
    children: Vec<ChildSpec>,
    #[serde(default)]
    fail_child_key: Option<String>,
    #[serde(default = "default_parallel")]
    parallel: bool,
}

#[derive(Debug, Deserialize)]
struct ChildSpec {
    #[serde(rename = "ref")]
    blueprint_ref: String,
    #[serde(default = "empty_object")]
    inputs: Value,
    #[serde(default)]
    child_key: Option<String>,
}

impl ChildSpec {
    /// Child inputs, poisoned with `fail: true` when this child is the
    /// designated failure.
    fn effective_inputs(&self, fail_child_key: Option<&str>) -> Value {
        let mut inputs = self.inputs.clone();
        if self.child_key.as_deref() == fail_child_key && fail_child_key.is_some() {
            if let Some(map) = inputs.as_object_mut() {
                map.insert("fail".to_string(), json!(true));
            }
        }
        inputs
    }
}

fn spawn_options(spec: &ChildSpec) -> SpawnOptions {
    match &spec.child_key {
        Some(key) => SpawnOptions::builder().child_key(key.clone()).build(),
        None => SpawnOptions::default(),
    }
}

fn as_strings(ids: &[uuid::Uuid]) -> Vec<String> {
    ids.iter().map(|id| id.to_string()).collect()
}

fn default_parallel() -> bool {
    true
}

fn empty_object() -> Value {
    json!({})
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orchestrator_inputs_defaults() {
        let params: OrchestratorInputs = serde_json::from_value(json!({})).unwrap();
        assert_eq!(params.mode, WaitPolicy::All);
        assert!(params.children.is_empty());
        assert!(params.parallel);
    }

    #[test]
    fn child_spec_poisoning_targets_matching_key() {
        let spec: ChildSpec = serde_json::from_value(json!({
            "ref": "core.test.sleep@v1",
            "inputs": { "ms": 100 },
            "child_key": "b",
        }))
        .unwrap();

        let poisoned = spec.effective_inputs(Some("b"));
        assert_eq!(poisoned["fail"], json!(true));

        let untouched = spec.effective_inputs(Some("a"));
        assert!(untouched.get("fail").is_none());
    }

    #[test]
    fn orchestrator_inputs_parse_any_mode() {
        let params: OrchestratorInputs = serde_json::from_value(json!({
            "mode": "any",
            "children": [{ "ref": "core.test.sleep@v1" }],
        }))
        .unwrap();
        assert_eq!(params.mode, WaitPolicy::Any);
        assert_eq!(params.children.len(), 1);
        assert_eq!(params.children[0].inputs, json!({}));
    }
}
