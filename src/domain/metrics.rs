use crate::domain::EventRecord;
use serde::Deserialize;

/// Running usage totals for the selected session. Token counts accumulate
/// deltas and never decrease; cost and duration are cumulative totals the
/// backend reports once at completion, so those replace instead of add.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TokenMetrics {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub estimated_cost_usd: Option<f64>,
    pub duration_ms: Option<f64>,
}

const TOPIC_ASSISTANT: &str = "assistant";
const TOPIC_RESULT: &str = "result";

#[derive(Debug, Deserialize)]
struct AssistantPayload {
    #[serde(default)]
    usage: Option<UsageDelta>,
}

#[derive(Debug, Deserialize)]
struct UsageDelta {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct ResultPayload {
    #[serde(default)]
    total_cost_usd: Option<f64>,
    #[serde(default)]
    duration_ms: Option<f64>,
}

/// Folds one record into the running totals. Must be applied in arrival
/// order; only `assistant` and `result` topics change anything. A recognized
/// topic with an unparseable payload leaves the totals untouched.
pub fn fold_record(metrics: &mut TokenMetrics, record: &EventRecord) {
    match record.topic.as_str() {
        TOPIC_ASSISTANT => {
            let Ok(parsed) = serde_json::from_str::<AssistantPayload>(&record.payload) else {
                tracing::debug!(topic = %record.topic, "assistant payload not parseable, skipping");
                return;
            };
            if let Some(usage) = parsed.usage {
                metrics.input_tokens = metrics.input_tokens.saturating_add(usage.input_tokens);
                metrics.output_tokens = metrics.output_tokens.saturating_add(usage.output_tokens);
            }
        }
        TOPIC_RESULT => {
            let Ok(parsed) = serde_json::from_str::<ResultPayload>(&record.payload) else {
                tracing::debug!(topic = %record.topic, "result payload not parseable, skipping");
                return;
            };
            if parsed.total_cost_usd.is_some() {
                metrics.estimated_cost_usd = parsed.total_cost_usd;
            }
            if parsed.duration_ms.is_some() {
                metrics.duration_ms = parsed.duration_ms;
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assistant(input: u64, output: u64) -> EventRecord {
        EventRecord {
            timestamp: "2026-01-01T00:00:00Z".to_string(),
            topic: "assistant".to_string(),
            payload: format!(
                "{{\"usage\":{{\"input_tokens\":{input},\"output_tokens\":{output}}}}}"
            ),
        }
    }

    fn result(cost: f64, duration_ms: f64) -> EventRecord {
        EventRecord {
            timestamp: "2026-01-01T00:00:00Z".to_string(),
            topic: "result".to_string(),
            payload: format!(
                "{{\"total_cost_usd\":{cost},\"duration_ms\":{duration_ms}}}"
            ),
        }
    }

    #[test]
    fn assistant_deltas_accumulate_and_result_replaces() {
        let mut metrics = TokenMetrics::default();
        fold_record(&mut metrics, &assistant(10, 5));
        fold_record(&mut metrics, &assistant(20, 8));
        fold_record(&mut metrics, &assistant(5, 2));

        assert_eq!(metrics.input_tokens, 35);
        assert_eq!(metrics.output_tokens, 15);

        fold_record(&mut metrics, &result(0.42, 4200.0));
        assert_eq!(metrics.duration_ms, Some(4200.0));
        assert_eq!(metrics.estimated_cost_usd, Some(0.42));
        // Totals untouched by result records.
        assert_eq!(metrics.input_tokens, 35);

        fold_record(&mut metrics, &result(0.5, 5000.0));
        assert_eq!(metrics.duration_ms, Some(5000.0), "replace, not add");
    }

    #[test]
    fn unrecognized_topics_pass_through() {
        let mut metrics = TokenMetrics::default();
        fold_record(
            &mut metrics,
            &EventRecord {
                timestamp: "t".to_string(),
                topic: "build.done".to_string(),
                payload: "{\"usage\":{\"input_tokens\":99}}".to_string(),
            },
        );
        assert_eq!(metrics, TokenMetrics::default());
    }

    #[test]
    fn unparseable_payload_on_recognized_topic_is_ignored() {
        let mut metrics = TokenMetrics::default();
        fold_record(&mut metrics, &assistant(10, 5));
        fold_record(
            &mut metrics,
            &EventRecord {
                timestamp: "t".to_string(),
                topic: "assistant".to_string(),
                payload: "not json".to_string(),
            },
        );
        assert_eq!(metrics.input_tokens, 10);
        assert_eq!(metrics.output_tokens, 5);
    }

    #[test]
    fn assistant_without_usage_changes_nothing() {
        let mut metrics = TokenMetrics::default();
        fold_record(
            &mut metrics,
            &EventRecord {
                timestamp: "t".to_string(),
                topic: "assistant".to_string(),
                payload: "{}".to_string(),
            },
        );
        assert_eq!(metrics, TokenMetrics::default());
    }
}
