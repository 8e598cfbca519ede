//! Batch request/response types and the per-index [`Outcome`].
//!
//! A batch is N opaque action strings with N parallel trajectory IDs and N
//! metadata maps ("extra fields"). The response carries N observations, N
//! `done` flags, and N `valid` flags, aligned to the request order.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::error::BatchError;

/// Per-action metadata map.
pub type Metadata = Map<String, Value>;

/// Metadata key carrying an explicit tool slug.
pub const TOOL_KEY: &str = "tool";
/// Metadata key carrying an explicit connection ID.
pub const CONNECTION_KEY: &str = "connection";
/// Metadata key carrying an application (toolkit) key for connection lookup.
pub const APP_KEY: &str = "app_key";

/// Keys consumed by the scheduler and not passed through to handlers.
pub const RESERVED_KEYS: &[&str] = &[TOOL_KEY, CONNECTION_KEY, APP_KEY];

/// Read a reserved metadata value as a string key.
///
/// Strings are taken as-is; other truthy values (non-zero numbers, `true`,
/// non-empty arrays and maps) use their JSON text. `null`, `false`, `0`, and
/// empty values count as absent.
pub fn metadata_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) if n.as_f64().is_some_and(|f| f != 0.0) => Some(n.to_string()),
        Value::Bool(true) => Some("true".to_string()),
        Value::Array(a) if !a.is_empty() => Some(value.to_string()),
        Value::Object(o) if !o.is_empty() => Some(value.to_string()),
        _ => None,
    }
}

// ── Request ───────────────────────────────────────────────────────

/// Batch action request body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchRequest {
    pub trajectory_ids: Vec<String>,
    pub actions: Vec<String>,
    #[serde(default)]
    pub extra_fields: Vec<Metadata>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub trace_id: Option<String>,
}

impl BatchRequest {
    /// Build a request with generated trajectory IDs and empty metadata.
    pub fn from_actions<I, S>(actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let actions: Vec<String> = actions.into_iter().map(Into::into).collect();
        let trajectory_ids = (0..actions.len()).map(|i| format!("traj-{i}")).collect();
        Self {
            trajectory_ids,
            actions,
            ..Default::default()
        }
    }

    /// Attach per-action metadata (builder pattern).
    pub fn with_extra_fields(mut self, extra_fields: Vec<Metadata>) -> Self {
        self.extra_fields = extra_fields;
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Check that the parallel sequences line up.
    pub fn validate(&self) -> Result<(), BatchError> {
        if self.actions.len() != self.trajectory_ids.len() {
            return Err(BatchError::InvalidRequest(
                "actions and trajectory_ids must have the same length".into(),
            ));
        }
        if !self.extra_fields.is_empty() && self.extra_fields.len() != self.actions.len() {
            return Err(BatchError::InvalidRequest(
                "extra_fields must have the same length as actions".into(),
            ));
        }
        Ok(())
    }

    /// Fill omitted metadata with one empty map per action.
    pub fn fill_default_extra_fields(&mut self) {
        if self.extra_fields.is_empty() {
            self.extra_fields = vec![Metadata::new(); self.actions.len()];
        }
    }
}

/// Build a metadata map that tags an action with an explicit tool slug.
pub fn tool_hint(slug: &str) -> Metadata {
    let mut map = Metadata::new();
    map.insert(TOOL_KEY.into(), Value::String(slug.to_string()));
    map
}

// ── Outcome ───────────────────────────────────────────────────────

/// Result for a single action index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    /// Opaque handler value or a structured error map.
    pub observation: Value,
    pub done: bool,
    pub valid: bool,
}

impl Outcome {
    /// A successful outcome with the defaults for a bare handler value.
    pub fn value(observation: Value) -> Self {
        Self {
            observation,
            done: false,
            valid: true,
        }
    }

    /// A terminal, invalid outcome carrying a structured observation.
    pub fn failure(observation: Value) -> Self {
        Self {
            observation,
            done: true,
            valid: false,
        }
    }

    /// `{error, trace_id}` failure for a single action.
    pub fn error(message: impl Into<String>, trace_id: &str) -> Self {
        Self::failure(json!({ "error": message.into(), "trace_id": trace_id }))
    }

    /// `{error, tool, trace_id}` failure used when a whole group fails.
    pub fn group_error(message: impl Into<String>, slug: &str, trace_id: &str) -> Self {
        Self::failure(json!({
            "error": message.into(),
            "tool": slug,
            "trace_id": trace_id,
        }))
    }

    /// Outcome for an action whose tool could not be determined.
    pub fn no_tool(trace_id: &str) -> Self {
        Self::failure(json!({
            "invalid_reason": "no tool specified",
            "available": "set extra_fields[i]['tool'] or use recognizable action format",
            "trace_id": trace_id,
        }))
    }

    /// Stamp the trace ID into a structured observation. Bare values are
    /// left untouched.
    pub fn stamp_trace_id(&mut self, trace_id: &str) {
        if let Value::Object(map) = &mut self.observation {
            map.insert("trace_id".into(), Value::String(trace_id.to_string()));
        }
    }
}

// ── Response ──────────────────────────────────────────────────────

/// Batch action response body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResponse {
    pub observations: Vec<Value>,
    pub dones: Vec<bool>,
    pub valids: Vec<bool>,
    pub trace_id: String,
    pub processing_time_ms: f64,
}

impl BatchResponse {
    /// Split index-aligned outcomes into the three parallel response arrays.
    pub fn from_outcomes(outcomes: Vec<Outcome>, trace_id: String, processing_time_ms: f64) -> Self {
        let mut observations = Vec::with_capacity(outcomes.len());
        let mut dones = Vec::with_capacity(outcomes.len());
        let mut valids = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            observations.push(outcome.observation);
            dones.push(outcome.done);
            valids.push(outcome.valid);
        }
        Self {
            observations,
            dones,
            valids,
            trace_id,
            processing_time_ms,
        }
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    /// Number of indices with `valid == false`.
    pub fn invalid_count(&self) -> usize {
        self.valids.iter().filter(|v| !**v).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_strings_follow_truthiness() {
        assert_eq!(metadata_string(&json!("conn-1")), Some("conn-1".into()));
        assert_eq!(metadata_string(&json!(42)), Some("42".into()));
        assert_eq!(metadata_string(&json!(1.5)), Some("1.5".into()));
        assert_eq!(metadata_string(&json!(true)), Some("true".into()));
        assert_eq!(metadata_string(&json!(["a"])), Some(r#"["a"]"#.into()));
        for falsy in [json!(null), json!(false), json!(0), json!(0.0), json!(""), json!([]), json!({})] {
            assert_eq!(metadata_string(&falsy), None, "{falsy}");
        }
    }

    #[test]
    fn request_deserializes_with_defaults() {
        let json = r#"{"trajectory_ids":["t0"],"actions":["{}"]}"#;
        let req: BatchRequest = serde_json::from_str(json).unwrap();
        assert!(req.extra_fields.is_empty());
        assert!(req.user_id.is_none());
        assert!(req.trace_id.is_none());
        assert!(req.validate().is_ok());
    }

    #[test]
    fn validate_rejects_trajectory_mismatch() {
        let mut req = BatchRequest::from_actions(["a", "b"]);
        req.trajectory_ids.pop();
        let err = req.validate().unwrap_err();
        assert!(err.to_string().contains("trajectory_ids"));
    }

    #[test]
    fn validate_rejects_extra_fields_mismatch() {
        let req = BatchRequest::from_actions(["a", "b"]).with_extra_fields(vec![Metadata::new()]);
        let err = req.validate().unwrap_err();
        assert!(err.to_string().contains("extra_fields"));
    }

    #[test]
    fn empty_request_is_valid() {
        let req = BatchRequest::from_actions(Vec::<String>::new());
        assert!(req.validate().is_ok());
        assert!(req.is_empty());
    }

    #[test]
    fn fill_default_extra_fields_matches_length() {
        let mut req = BatchRequest::from_actions(["a", "b", "c"]);
        req.fill_default_extra_fields();
        assert_eq!(req.extra_fields.len(), 3);
        assert!(req.extra_fields.iter().all(|m| m.is_empty()));
    }

    #[test]
    fn stamp_trace_id_only_touches_maps() {
        let mut structured = Outcome::value(json!({"x": 1}));
        structured.stamp_trace_id("tr-1");
        assert_eq!(structured.observation["trace_id"], "tr-1");

        let mut bare = Outcome::value(json!(3));
        bare.stamp_trace_id("tr-1");
        assert_eq!(bare.observation, json!(3));
    }

    #[test]
    fn response_from_outcomes_splits_arrays() {
        let resp = BatchResponse::from_outcomes(
            vec![Outcome::value(json!(1)), Outcome::error("boom", "tr")],
            "tr".into(),
            1.0,
        );
        assert_eq!(resp.observations.len(), 2);
        assert_eq!(resp.dones, vec![false, true]);
        assert_eq!(resp.valids, vec![true, false]);
        assert_eq!(resp.invalid_count(), 1);
    }
}
