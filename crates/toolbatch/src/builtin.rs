//! A small built-in tool catalog, one tool per lane.
//!
//! | Slug | Kind |
//! |------|------|
//! | `math.add` | cooperative |
//! | `text.echo` | blocking-light |
//! | `stats.data_analysis` | blocking-heavy |

use schemars::JsonSchema;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use crate::json_schema_for;
use crate::registry::{ToolDescriptor, ToolHandler, ToolRegistry};

/// Arguments for `math.add`.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct AddArgs {
    /// First addend.
    pub a: f64,
    /// Second addend.
    pub b: f64,
}

/// Arguments for `stats.data_analysis`.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct AnalysisArgs {
    /// Sample values to summarize.
    pub values: Vec<f64>,
}

impl ToolRegistry {
    /// Register the built-in `math`, `text` and `stats` toolkits.
    pub fn with_builtin_tools(self) -> Self {
        self.with_toolkit("math", "Arithmetic helpers")
            .with_toolkit("text", "String utilities")
            .with_toolkit("stats", "Summary statistics")
            .with(
                ToolDescriptor::new("math.add", "Add two numbers", json_schema_for::<AddArgs>()),
                ToolHandler::cooperative(|args, _ctx| async move {
                    let args: AddArgs = parse_args(args)?;
                    Ok(number(args.a + args.b))
                }),
            )
            .with(
                ToolDescriptor::new(
                    "text.echo",
                    "Return the arguments unchanged",
                    json!({ "type": "object" }),
                ),
                ToolHandler::blocking(|args, _ctx| Ok(args)),
            )
            .with(
                ToolDescriptor::new(
                    "stats.data_analysis",
                    "Count, mean, min, max and standard deviation of a series",
                    json_schema_for::<AnalysisArgs>(),
                ),
                ToolHandler::heavy(|args, _ctx| summarize(&parse_args::<AnalysisArgs>(args)?.values)),
            )
    }
}

fn parse_args<T: DeserializeOwned>(args: Value) -> Result<T, String> {
    serde_json::from_value(args).map_err(|e| format!("invalid tool arguments: {e}"))
}

/// Integral results are reported as integers.
fn number(x: f64) -> Value {
    const EXACT: f64 = 9_007_199_254_740_992.0;
    if x.fract() == 0.0 && x.abs() < EXACT {
        json!(x as i64)
    } else {
        json!(x)
    }
}

fn summarize(values: &[f64]) -> Result<Value, String> {
    if values.is_empty() {
        return Err("values must not be empty".into());
    }
    let count = values.len() as f64;
    let mean = values.iter().sum::<f64>() / count;
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / count;
    Ok(json!({
        "count": values.len(),
        "mean": mean,
        "min": min,
        "max": max,
        "std_dev": variance.sqrt(),
    }))
}
