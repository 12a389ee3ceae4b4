//! Real-iperf3 smoke test.
//!
//! Requires an iperf3 binary on PATH; set `MESHPERF_RUN_IPERF_TESTS=1` to
//! run. Spawns a local server, runs a short client test against it, and
//! checks that both sides produce reports our parsers understand.

use anyhow::Context;
use meshperf_agent::{capture::parse_server_output, exec};
use meshperf_core::report::client_metrics;
use std::{process::Stdio, time::Duration};
use tokio::process::Command;

#[tokio::test]
async fn local_loopback_test_produces_parseable_reports() -> anyhow::Result<()> {
    if std::env::var("MESHPERF_RUN_IPERF_TESTS").ok().as_deref() != Some("1") {
        return Ok(());
    }

    Command::new("iperf3")
        .arg("--version")
        .output()
        .await
        .context("MESHPERF_RUN_IPERF_TESTS=1 but iperf3 is not runnable")?;

    let port = 5899;
    let server_payload: meshperf_core::ServerPayload =
        serde_json::from_value(serde_json::json!({"port": port}))?;
    let client_payload: meshperf_core::ClientPayload = serde_json::from_value(serde_json::json!({
        "server_ip": "127.0.0.1",
        "port": port,
        "parallel": 1,
        "time": 1,
        "client_delay_seconds": 0,
        "max_retries": 3,
        "retry_delay_seconds": 1
    }))?;

    let tmp = tempfile::tempdir()?;
    let server_stdout_path = tmp.path().join("server.json");
    let server_stdout = std::fs::File::create(&server_stdout_path)?;

    let mut server = Command::new("iperf3")
        .args(exec::server_args(&server_payload))
        .stdout(Stdio::from(server_stdout))
        .stderr(Stdio::null())
        .spawn()
        .context("spawn iperf3 server")?;

    tokio::time::sleep(Duration::from_millis(500)).await;

    let client = Command::new("iperf3")
        .args(exec::client_args(&client_payload))
        .output()
        .await
        .context("run iperf3 client")?;
    anyhow::ensure!(
        client.status.success(),
        "client failed: {}",
        String::from_utf8_lossy(&client.stderr)
    );

    let report: serde_json::Value =
        serde_json::from_slice(&client.stdout).context("parse client report")?;
    let metrics = client_metrics(&report).context("extract client metrics")?;
    anyhow::ensure!(metrics.bps_avg > 0.0, "expected nonzero throughput");

    // Terminate the server the way the kill path does and harvest stdout.
    let pid = server.id().context("server pid")?;
    let _ = Command::new("kill").arg(pid.to_string()).output().await;
    let _ = tokio::time::timeout(Duration::from_secs(5), server.wait()).await;

    let stdout = std::fs::read_to_string(&server_stdout_path)?;
    anyhow::ensure!(
        parse_server_output(&stdout).is_some() || stdout.trim().is_empty(),
        "server output present but unparseable: {stdout}"
    );

    Ok(())
}
