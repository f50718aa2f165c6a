//! HTTP judge client
//!
//! Judge payloads are heterogeneous; every element is normalized with
//! `coerce_outcome` so a new score format never fails a turn.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use turnscope_trace::{coerce_outcome, EvaluationOutcome};

use super::{server_error, ClientError, EvaluationRequest, HttpClientConfig, Judge};

/// Posts exchanges to `{base_url}/evaluate`
pub struct HttpJudge {
    base_url: String,
    client: Client,
}

impl HttpJudge {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ClientError> {
        Self::with_config(base_url, HttpClientConfig::default())
    }

    pub fn with_config(base_url: impl Into<String>, config: HttpClientConfig) -> Result<Self, ClientError> {
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: config.build_client()?,
        })
    }
}

#[async_trait]
impl Judge for HttpJudge {
    async fn evaluate(&self, request: &EvaluationRequest) -> Result<Vec<EvaluationOutcome>, ClientError> {
        let url = format!("{}/evaluate", self.base_url);

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(ClientError::from_reqwest)?;

        if !response.status().is_success() {
            return Err(server_error(response).await);
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ClientError::Parse(e.to_string()))?;
        Ok(outcomes_from_body(&request.turn_reference, &body))
    }
}

pub fn outcomes_from_body(turn_reference: &str, body: &Value) -> Vec<EvaluationOutcome> {
    let items: Vec<&Value> = match body {
        Value::Array(items) => items.iter().collect(),
        Value::Object(object) => match ["results", "evaluations", "metrics"]
            .iter()
            .find_map(|k| object.get(*k).and_then(Value::as_array))
        {
            Some(items) => items.iter().collect(),
            // a single metric object
            None => vec![body],
        },
        other => vec![other],
    };
    items
        .into_iter()
        .map(|item| coerce_outcome(turn_reference, item))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_outcome_envelopes() {
        let outcomes = outcomes_from_body(
            "c:1",
            &json!({"results": [{"metric_name": "accuracy", "score": 0.9}, {"metric": "safety", "score": 0.1}]}),
        );
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes[0].passed);
        assert!(!outcomes[1].passed);
        assert_eq!(outcomes[1].turn_reference, "c:1");

        let single = outcomes_from_body("c:1", &json!({"name": "tone", "score": 0.7}));
        assert_eq!(single.len(), 1);
        assert_eq!(single[0].metric_name, "tone");

        let garbage = outcomes_from_body("c:1", &json!(null));
        assert_eq!(garbage.len(), 1);
        assert!(!garbage[0].passed);
    }

    #[test]
    fn test_empty_list_yields_no_outcomes() {
        assert!(outcomes_from_body("c:1", &json!([])).is_empty());
        assert!(outcomes_from_body("c:1", &json!({"metrics": []})).is_empty());
    }
}
