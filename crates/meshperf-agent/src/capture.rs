//! Server-result capture.
//!
//! `iperf3 -s -J` writes its report to stdout only when it exits, and the
//! stream may hold several concatenated objects (one per completed test) or
//! a truncated tail if the server was killed mid-write. Capture reads the
//! redirected stdout file, picks the most complete object, persists it, and
//! posts it as a result update. Nothing here may fail the kill path.

use crate::{client::ManagerClient, paths::AgentPaths};
use anyhow::Context;
use meshperf_core::{
    report::{choose_server_report, decode_concatenated},
    TaskStatus,
};
use serde_json::Value;
use std::path::Path;

/// Pick the report object out of raw server stdout.
pub fn parse_server_output(stdout: &str) -> Option<Value> {
    let objects = decode_concatenated(stdout);
    choose_server_report(&objects).cloned()
}

pub async fn capture_server_result(
    client: &ManagerClient,
    paths: &AgentPaths,
    task_id: i64,
    output_file: &Path,
) -> anyhow::Result<()> {
    let stdout = tokio::fs::read_to_string(output_file)
        .await
        .with_context(|| format!("read server stdout {}", output_file.display()))?;

    let Some(report) = parse_server_output(&stdout) else {
        tracing::warn!(
            event = "agent.capture.empty",
            task_id,
            bytes = stdout.len(),
            "no usable report in server output"
        );
        return Ok(());
    };

    let result_file = paths.result_file(task_id, true);
    let pretty = serde_json::to_vec_pretty(&report).context("encode server report")?;
    tokio::fs::write(&result_file, pretty)
        .await
        .with_context(|| format!("write {}", result_file.display()))?;

    tracing::info!(
        event = "agent.capture.stored",
        task_id,
        result_file = %result_file.display(),
        "server report captured"
    );

    if let Err(err) = client
        .submit_result(task_id, TaskStatus::Succeeded, Some(report), String::new(), 0)
        .await
    {
        tracing::warn!(
            event = "agent.capture.submit_failed",
            task_id,
            error = %err,
            "could not post captured server report"
        );
        return Ok(());
    }

    let _ = tokio::fs::remove_file(output_file).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn picks_completed_test_from_concatenated_stream() {
        let stdout = format!(
            "{}{}",
            json!({"start": {}, "intervals": []}),
            json!({"start": {}, "intervals": [], "end": {"sum_sent": {"bits_per_second": 5e8}}}),
        );
        let report = parse_server_output(&stdout).unwrap();
        assert_eq!(report["end"]["sum_sent"]["bits_per_second"], 5e8);
    }

    #[test]
    fn survives_truncated_tail() {
        let stdout = r#"{"start": {}, "intervals": [1]}{"start": {}, "inter"#;
        let report = parse_server_output(stdout).unwrap();
        assert_eq!(report["intervals"], json!([1]));
    }

    #[test]
    fn empty_output_yields_nothing() {
        assert!(parse_server_output("").is_none());
        assert!(parse_server_output("iperf3: interrupt\n").is_none());
    }
}
