//! Tool-call dispatcher: explicit descriptor registration, schema exposure,
//! and execution of model-issued tool calls with structured results.
//!
//! Runtime reflection on callables is deliberately not used here — each tool
//! publishes its own [`ToolSpec`] at registration time. [`ToolSpec::from_docstring`]
//! is a construction-time helper for tools that want their schema derived from
//! a docstring instead of hand-written, matching the shape described by the
//! `name / description / parameter_schema / callable_reference` tool
//! descriptor: it is never consulted at call time.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod builtins;

// ── Tool trait and registry ──────────────────────────────────────────────────

/// Describes a single parameter that a tool accepts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolParam {
    pub name: String,
    pub description: String,
    pub required: bool,
}

impl ToolParam {
    pub fn required(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            required: true,
        }
    }

    pub fn optional(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            required: false,
        }
    }
}

/// Static metadata about a tool, used by the LLM to decide which tool to call
/// and to build the provider's native tool-call schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub params: Vec<ToolParam>,
}

impl ToolSpec {
    /// Derive a spec from a name and a Python-style docstring: the first
    /// non-empty paragraph above an `Args:`/`Parameters:` marker becomes the
    /// description; lines below it of the form `name: description` become
    /// parameters. Every derived parameter is required (callers needing
    /// optional parameters should hand-write the `ToolSpec`).
    pub fn from_docstring(name: impl Into<String>, docstring: &str) -> Self {
        let mut description_lines = Vec::new();
        let mut params = Vec::new();
        let mut in_params = false;

        for raw_line in docstring.lines() {
            let line = raw_line.trim();
            if !in_params {
                if line.eq_ignore_ascii_case("Args:") || line.eq_ignore_ascii_case("Parameters:") {
                    in_params = true;
                    continue;
                }
                if line.is_empty() && !description_lines.is_empty() {
                    // First blank line after the opening paragraph ends it.
                    in_params = true;
                    continue;
                }
                if !line.is_empty() {
                    description_lines.push(line.to_string());
                }
            } else if line.eq_ignore_ascii_case("Args:") || line.eq_ignore_ascii_case("Parameters:") {
                continue;
            } else if let Some((pname, pdesc)) = line.split_once(':') {
                let pname = pname.trim();
                if !pname.is_empty() {
                    params.push(ToolParam::required(pname, pdesc.trim()));
                }
            }
        }

        Self {
            name: name.into(),
            description: description_lines.join(" "),
            params,
        }
    }
}

/// The result returned after a tool runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutput {
    pub success: bool,
    pub output: String,
}

/// Trait implemented by every registered tool.
#[async_trait]
pub trait Tool: Send + Sync {
    fn spec(&self) -> ToolSpec;
    async fn run(&self, args: &HashMap<String, String>) -> Result<ToolOutput>;
}

/// A fully-formed tool invocation emitted by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// Outcome of executing a single [`ToolCallRecord`]. Matches the spec's
/// `{ success: true, call_id, name, result }` / `{ success: false, call_id,
/// name?, error }` shape; callers that need that exact wire form serialize
/// through [`ToolResultRecord::to_json`] rather than deriving it structurally,
/// since an enum tagged on a boolean field isn't representable with `serde`'s
/// built-in tagging.
#[derive(Debug, Clone)]
pub enum ToolResultRecord {
    Ok {
        call_id: String,
        name: String,
        result: serde_json::Value,
    },
    Err {
        call_id: String,
        name: Option<String>,
        error: String,
    },
}

impl ToolResultRecord {
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            ToolResultRecord::Ok { call_id, name, result } => serde_json::json!({
                "success": true,
                "call_id": call_id,
                "name": name,
                "result": result,
            }),
            ToolResultRecord::Err { call_id, name, error } => serde_json::json!({
                "success": false,
                "call_id": call_id,
                "name": name,
                "error": error,
            }),
        }
    }
}

/// Central registry for all available tools.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        self.tools.push(tool);
    }

    /// Descriptors in the shape expected by the LLM gateway.
    pub fn tool_schemas(&self) -> Vec<ToolSpec> {
        self.tools.iter().map(|t| t.spec()).collect()
    }

    pub fn list_specs(&self) -> Vec<ToolSpec> {
        self.tool_schemas()
    }

    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools
            .iter()
            .find(|t| t.spec().name == name)
            .map(|t| t.as_ref())
    }

    /// Look up by name, parse `arguments` (accepting either a JSON text or an
    /// already-decoded value), invoke with keyword arguments, and capture the
    /// return value or error as data — never propagated as an exception.
    pub async fn execute(&self, call: &ToolCallRecord) -> ToolResultRecord {
        let Some(tool) = self.get(&call.name) else {
            return ToolResultRecord::Err {
                call_id: call.id.clone(),
                name: None,
                error: format!("no tool registered with name '{}'", call.name),
            };
        };

        let args = match json_value_to_string_map(&call.arguments) {
            Ok(m) => m,
            Err(e) => {
                return ToolResultRecord::Err {
                    call_id: call.id.clone(),
                    name: Some(call.name.clone()),
                    error: format!("malformed arguments: {e}"),
                };
            }
        };

        match tool.run(&args).await {
            Ok(out) if out.success => ToolResultRecord::Ok {
                call_id: call.id.clone(),
                name: call.name.clone(),
                result: serde_json::Value::String(out.output),
            },
            Ok(out) => ToolResultRecord::Err {
                call_id: call.id.clone(),
                name: Some(call.name.clone()),
                error: out.output,
            },
            Err(e) => ToolResultRecord::Err {
                call_id: call.id.clone(),
                name: Some(call.name.clone()),
                error: e.to_string(),
            },
        }
    }

    /// Execute a batch of tool calls in order, synchronously relative to one
    /// another. A `None`/unit-equivalent result is preserved in the output
    /// list (as `serde_json::Value::Null`) rather than suppressed, so the
    /// output list always has one entry per input call.
    pub async fn process_batch(&self, calls: &[ToolCallRecord]) -> Vec<ToolResultRecord> {
        let mut results = Vec::with_capacity(calls.len());
        for call in calls {
            results.push(self.execute(call).await);
        }
        results
    }
}

fn json_value_to_string_map(val: &serde_json::Value) -> Result<HashMap<String, String>> {
    let obj = match val {
        serde_json::Value::Null => return Ok(HashMap::new()),
        serde_json::Value::String(s) => serde_json::from_str::<serde_json::Value>(s)
            .unwrap_or_else(|_| serde_json::Value::String(s.clone())),
        other => other.clone(),
    };
    let obj = obj
        .as_object()
        .ok_or_else(|| anyhow::anyhow!("arguments must decode to a JSON object"))?;
    Ok(obj
        .iter()
        .map(|(k, v)| {
            let s = match v {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Null => String::new(),
                other => other.to_string(),
            };
            (k.clone(), s)
        })
        .collect())
}

/// Build the OpenAI-compatible tools JSON array from tool specs, the shape
/// expected by the gateway's `tool_schemas` parameter.
pub fn specs_to_openai_tools(specs: &[ToolSpec]) -> serde_json::Value {
    let arr: Vec<serde_json::Value> = specs
        .iter()
        .map(|spec| {
            let mut properties = serde_json::Map::new();
            let mut required = Vec::new();
            for p in &spec.params {
                properties.insert(
                    p.name.clone(),
                    serde_json::json!({ "type": "string", "description": p.description }),
                );
                if p.required {
                    required.push(p.name.clone());
                }
            }
            serde_json::json!({
                "type": "function",
                "function": {
                    "name": spec.name,
                    "description": spec.description,
                    "parameters": {
                        "type": "object",
                        "properties": properties,
                        "required": required,
                    }
                }
            })
        })
        .collect();
    serde_json::Value::Array(arr)
}

#[cfg(test)]
mod registry_tests {
    use super::*;

    struct DummyTool {
        name: String,
    }

    #[async_trait]
    impl Tool for DummyTool {
        fn spec(&self) -> ToolSpec {
            ToolSpec {
                name: self.name.clone(),
                description: format!("Dummy tool: {}", self.name),
                params: vec![ToolParam::required("input", "test param")],
            }
        }
        async fn run(&self, _args: &HashMap<String, String>) -> Result<ToolOutput> {
            Ok(ToolOutput {
                success: true,
                output: format!("ran {}", self.name),
            })
        }
    }

    /// A tool whose run() returns a unit-equivalent (empty) success output,
    /// standing in for the spec's "None return preserved, not suppressed"
    /// rule (distilled spec §4.2, Open Question 1).
    struct VoidTool;

    #[async_trait]
    impl Tool for VoidTool {
        fn spec(&self) -> ToolSpec {
            ToolSpec {
                name: "finish_edits".to_string(),
                description: "Sentinel tool with no return value".to_string(),
                params: vec![],
            }
        }
        async fn run(&self, _args: &HashMap<String, String>) -> Result<ToolOutput> {
            Ok(ToolOutput {
                success: true,
                output: String::new(),
            })
        }
    }

    #[test]
    fn empty_registry() {
        let reg = ToolRegistry::default();
        assert!(reg.list_specs().is_empty());
        assert!(reg.get("anything").is_none());
    }

    #[test]
    fn register_and_get() {
        let mut reg = ToolRegistry::default();
        reg.register(Box::new(DummyTool { name: "alpha".into() }));
        reg.register(Box::new(DummyTool { name: "beta".into() }));

        assert!(reg.get("alpha").is_some());
        assert!(reg.get("beta").is_some());
        assert!(reg.get("gamma").is_none());
    }

    /// Duplicate registration: the first tool wins on `get` (Vec + find).
    #[test]
    fn duplicate_name_get_returns_first_registered() {
        let mut reg = ToolRegistry::default();
        reg.register(Box::new(DummyTool { name: "dup".into() }));
        reg.register(Box::new(DummyTool { name: "dup".into() }));

        let specs = reg.list_specs();
        assert_eq!(specs.iter().filter(|s| s.name == "dup").count(), 2);
        assert!(reg.get("dup").is_some());
    }

    #[tokio::test]
    async fn execute_unknown_tool_is_data_not_panic() {
        let reg = ToolRegistry::default();
        let call = ToolCallRecord {
            id: "1".into(),
            name: "nope".into(),
            arguments: serde_json::json!({}),
        };
        match reg.execute(&call).await {
            ToolResultRecord::Err { error, .. } => assert!(error.contains("no tool registered")),
            other => panic!("expected Err, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn process_batch_preserves_order_and_count() {
        let mut reg = ToolRegistry::default();
        reg.register(Box::new(DummyTool { name: "one".into() }));
        reg.register(Box::new(VoidTool));

        let calls = vec![
            ToolCallRecord {
                id: "a".into(),
                name: "one".into(),
                arguments: serde_json::json!({"input": "x"}),
            },
            ToolCallRecord {
                id: "b".into(),
                name: "finish_edits".into(),
                arguments: serde_json::json!({}),
            },
        ];
        let results = reg.process_batch(&calls).await;
        assert_eq!(results.len(), 2);
        match &results[1] {
            ToolResultRecord::Ok { result, .. } => {
                assert_eq!(result, &serde_json::Value::String(String::new()));
            }
            other => panic!("expected Ok with empty string, got {other:?}"),
        }
    }

    #[test]
    fn from_docstring_extracts_description_and_params() {
        let doc = "Roll dice and report the sum.\n\nArgs:\n    dice_str: Dice expression like 2d6";
        let spec = ToolSpec::from_docstring("roll_dice", doc);
        assert_eq!(spec.description, "Roll dice and report the sum.");
        assert_eq!(spec.params.len(), 1);
        assert_eq!(spec.params[0].name, "dice_str");
        assert!(spec.params[0].required);
    }

    #[test]
    fn specs_to_openai_tools_shapes_schema() {
        let specs = vec![ToolSpec {
            name: "web_search".to_string(),
            description: "Search the web".to_string(),
            params: vec![ToolParam::required("query", "Search query")],
        }];
        let tools = specs_to_openai_tools(&specs);
        let arr = tools.as_array().unwrap();
        assert_eq!(arr.len(), 1);
        assert_eq!(arr[0]["function"]["name"], "web_search");
        assert_eq!(arr[0]["function"]["parameters"]["required"][0], "query");
    }
}
