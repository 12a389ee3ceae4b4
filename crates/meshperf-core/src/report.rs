//! Projections over iperf3 `-J` output.
//!
//! Client runs emit exactly one JSON object on stdout. The server side is
//! messier: a long-lived `iperf3 -s -J` may emit zero, one, or several
//! concatenated objects before it is terminated, and the last one may be
//! truncated. The decoder here consumes whatever prefix of the stream is
//! valid and the selection logic picks the most complete object.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Decode a stream of concatenated JSON objects, stopping at the first
/// syntax error (a truncated trailing object is expected, not fatal).
pub fn decode_concatenated(input: &str) -> Vec<Value> {
    let mut objects = Vec::new();
    for item in serde_json::Deserializer::from_str(input).into_iter::<Value>() {
        match item {
            Ok(value) => objects.push(value),
            Err(_) => break,
        }
    }
    objects
}

/// Pick the best server-side report out of a decoded stream.
///
/// Preference order: the first object with a non-empty `end` (a completed
/// test), then the first object that has `intervals` or no `error`, then
/// whatever came first.
pub fn choose_server_report(objects: &[Value]) -> Option<&Value> {
    if let Some(complete) = objects.iter().find(|obj| {
        obj.get("end")
            .is_some_and(|end| end.as_object().is_some_and(|m| !m.is_empty()))
    }) {
        return Some(complete);
    }

    if let Some(partial) = objects
        .iter()
        .find(|obj| obj.get("error").is_none() || obj.get("intervals").is_some())
    {
        return Some(partial);
    }

    objects.first()
}

/// The per-test metrics surfaced in exercise results.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClientMetrics {
    pub bps_avg: f64,
    pub retransmits: i64,
    pub jitter_ms: Option<f64>,
    pub loss_pct: Option<f64>,
}

/// Extract metrics from a successful client report. Returns `None` when the
/// report has no `end.sum_sent` section.
pub fn client_metrics(report: &Value) -> Option<ClientMetrics> {
    let end = report.get("end")?;
    let sum_sent = end.get("sum_sent")?;
    let sum = end.get("sum");

    Some(ClientMetrics {
        bps_avg: sum_sent
            .get("bits_per_second")
            .and_then(Value::as_f64)
            .unwrap_or(0.0),
        retransmits: sum_sent
            .get("retransmits")
            .and_then(Value::as_i64)
            .unwrap_or(0),
        jitter_ms: sum.and_then(|s| s.get("jitter_ms")).and_then(Value::as_f64),
        loss_pct: sum
            .and_then(|s| s.get("lost_percent"))
            .and_then(Value::as_f64),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_concatenated_objects() {
        let input = r#"{"a": 1}
{"b": 2}{"c": 3}"#;
        let objects = decode_concatenated(input);
        assert_eq!(objects.len(), 3);
        assert_eq!(objects[1], json!({"b": 2}));
    }

    #[test]
    fn truncated_tail_is_dropped_not_fatal() {
        let input = r#"{"a": 1}{"b": "#;
        let objects = decode_concatenated(input);
        assert_eq!(objects, vec![json!({"a": 1})]);
    }

    #[test]
    fn empty_and_garbage_input_decode_to_nothing() {
        assert!(decode_concatenated("").is_empty());
        assert!(decode_concatenated("iperf3: error").is_empty());
    }

    #[test]
    fn prefers_object_with_complete_end() {
        let objects = vec![
            json!({"start": {}, "intervals": []}),
            json!({"start": {}, "end": {"sum_sent": {"bits_per_second": 1e9}}}),
        ];
        let chosen = choose_server_report(&objects).unwrap();
        assert!(chosen.get("end").is_some());
    }

    #[test]
    fn empty_end_does_not_count_as_complete() {
        let objects = vec![
            json!({"error": "interrupt"}),
            json!({"end": {}, "intervals": [1]}),
        ];
        // Neither object has a usable `end`; the second has intervals.
        let chosen = choose_server_report(&objects).unwrap();
        assert_eq!(chosen.get("intervals"), Some(&json!([1])));
    }

    #[test]
    fn falls_back_to_first_object() {
        let objects = vec![json!({"error": "x"}), json!({"error": "y"})];
        assert_eq!(choose_server_report(&objects), Some(&objects[0]));
        assert_eq!(choose_server_report(&[]), None);
    }

    #[test]
    fn extracts_tcp_client_metrics() {
        let report = json!({
            "end": {
                "sum_sent": {"bits_per_second": 9.4e8, "retransmits": 12},
                "sum_received": {"bits_per_second": 9.3e8}
            }
        });
        let metrics = client_metrics(&report).unwrap();
        assert_eq!(metrics.bps_avg, 9.4e8);
        assert_eq!(metrics.retransmits, 12);
        assert_eq!(metrics.jitter_ms, None);
    }

    #[test]
    fn extracts_udp_jitter_and_loss() {
        let report = json!({
            "end": {
                "sum_sent": {"bits_per_second": 1e8},
                "sum": {"jitter_ms": 0.042, "lost_percent": 1.5}
            }
        });
        let metrics = client_metrics(&report).unwrap();
        assert_eq!(metrics.jitter_ms, Some(0.042));
        assert_eq!(metrics.loss_pct, Some(1.5));
        assert_eq!(metrics.retransmits, 0);
    }

    #[test]
    fn report_without_sums_has_no_metrics() {
        assert!(client_metrics(&json!({"end": {}})).is_none());
        assert!(client_metrics(&json!({"intervals": []})).is_none());
    }
}
