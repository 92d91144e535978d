//! Append-only run audit trail.
//!
//! Every pipeline stage transition is recorded as a [`StageRecord`] with
//! its name, counts, and latency. The finished trace is serialized once
//! into the `runs` table at terminal state and never mutated afterwards.
//! External evaluation tooling consumes this JSON; fields are only ever
//! added, not renamed or removed.

use anyhow::Result;
use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;

/// One recorded pipeline stage transition.
#[derive(Debug, Clone, Serialize)]
pub struct StageRecord {
    pub stage: String,
    pub detail: serde_json::Value,
    pub latency_ms: f64,
}

/// Ordered list of stage transitions for one run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ToolTrace {
    pub stages: Vec<StageRecord>,
}

impl ToolTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, stage: &str, detail: serde_json::Value, latency_ms: f64) {
        self.stages.push(StageRecord {
            stage: stage.to_string(),
            detail,
            latency_ms,
        });
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({ "stages": self.stages })
    }
}

/// Persist a completed run. Write-once: runs are never updated.
pub async fn log_run(
    pool: &SqlitePool,
    run_id: &str,
    query: &str,
    intent: &str,
    trace: &ToolTrace,
    latency_ms: f64,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO runs (run_id, query, intent, tool_trace, latency_ms, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(run_id)
    .bind(query)
    .bind(intent)
    .bind(trace.to_json().to_string())
    .bind(latency_ms)
    .bind(chrono::Utc::now().to_rfc3339())
    .execute(pool)
    .await?;
    Ok(())
}

/// Print the most recent runs with their intent, stage names, and latency.
pub async fn run_list_runs(config: &Config, limit: i64) -> Result<()> {
    let pool = db::connect(config).await?;

    let rows = sqlx::query(
        r#"
        SELECT run_id, query, intent, tool_trace, latency_ms, created_at
        FROM runs
        ORDER BY created_at DESC
        LIMIT ?
        "#,
    )
    .bind(limit)
    .fetch_all(&pool)
    .await?;

    if rows.is_empty() {
        println!("No runs recorded.");
        pool.close().await;
        return Ok(());
    }

    for row in &rows {
        let run_id: String = row.get("run_id");
        let query: String = row.get("query");
        let intent: Option<String> = row.get("intent");
        let latency_ms: f64 = row.get("latency_ms");
        let created_at: String = row.get("created_at");
        let trace_json: String = row.get("tool_trace");

        let stages: Vec<String> = serde_json::from_str::<serde_json::Value>(&trace_json)
            .ok()
            .and_then(|v| {
                v.get("stages").and_then(|s| s.as_array()).map(|stages| {
                    stages
                        .iter()
                        .filter_map(|s| s.get("stage").and_then(|n| n.as_str()))
                        .map(|n| n.to_string())
                        .collect()
                })
            })
            .unwrap_or_default();

        println!("{}  [{}]", run_id, intent.as_deref().unwrap_or("-"));
        println!("    query:   {}", query);
        println!("    stages:  {}", stages.join(" → "));
        println!("    latency: {:.1} ms", latency_ms);
        println!("    at:      {}", created_at);
        println!();
    }

    pool.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trace_preserves_stage_order() {
        let mut trace = ToolTrace::new();
        trace.record("route", serde_json::json!({"intent": "fact"}), 0.1);
        trace.record("retrieve", serde_json::json!({"hits": 4}), 2.5);
        trace.record("verify", serde_json::json!({"decision": "answer"}), 0.7);

        let names: Vec<&str> = trace.stages.iter().map(|s| s.stage.as_str()).collect();
        assert_eq!(names, vec!["route", "retrieve", "verify"]);
    }

    #[test]
    fn test_trace_json_shape_is_stable() {
        let mut trace = ToolTrace::new();
        trace.record("route", serde_json::json!({"intent": "fact"}), 0.1);
        let json = trace.to_json();
        let stages = json.get("stages").and_then(|s| s.as_array()).unwrap();
        assert_eq!(stages.len(), 1);
        assert_eq!(stages[0].get("stage").unwrap(), "route");
        assert!(stages[0].get("latency_ms").is_some());
        assert!(stages[0].get("detail").is_some());
    }
}
