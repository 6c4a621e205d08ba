//! Tool descriptors and `tools/list` catalog parsing.
//!
//! A [`ToolDescriptor`] is the supervisor's record of one downstream tool:
//! the owning server, the tool name, and an *ordered* parameter list derived
//! from the tool's `inputSchema`. Ordering matters: positional arguments in
//! user code are matched against the schema's declaration order, which
//! `serde_json`'s `preserve_order` feature keeps intact.
//!
//! Tool names are unique only per `(server, tool)`; the same tool name may
//! appear under several servers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CapabilityError;

/// Coarse parameter type taken from the schema's `type` keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
    /// Schema carried no usable `type` keyword.
    Any,
}

impl ParamType {
    fn from_schema(prop: &Value) -> Self {
        match prop.get("type").and_then(|t| t.as_str()) {
            Some("string") => ParamType::String,
            Some("number") => ParamType::Number,
            Some("integer") => ParamType::Integer,
            Some("boolean") => ParamType::Boolean,
            Some("object") => ParamType::Object,
            Some("array") => ParamType::Array,
            _ => ParamType::Any,
        }
    }
}

/// One declared parameter of a tool, in schema declaration order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub required: bool,
    #[serde(rename = "type")]
    pub type_hint: ParamType,
}

/// One tool advertised by a downstream server.
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    /// Name of the server that owns this tool (configuration key).
    pub server: String,
    /// Tool name as advertised in `tools/list`.
    pub name: String,
    /// Human-readable description, empty when the server omitted one.
    pub description: String,
    /// Declared parameters in schema order.
    pub params: Vec<ParamSpec>,
}

/// Parse a `tools/list` result into descriptors for `server`.
///
/// Expected shape: `{tools: [{name, description?, inputSchema: {properties,
/// required[]}}]}`. Tools without a name are rejected; missing schemas yield
/// an empty parameter list.
///
/// # Errors
///
/// Returns [`CapabilityError::Downstream`] when the result does not carry a
/// `tools` array or an entry has no name.
pub fn parse_tools_list(server: &str, result: &Value) -> Result<Vec<ToolDescriptor>, CapabilityError> {
    let tools = result
        .get("tools")
        .and_then(|t| t.as_array())
        .ok_or_else(|| CapabilityError::Downstream {
            message: format!("server '{server}' returned a tools/list result without a tools array"),
        })?;

    let mut descriptors = Vec::with_capacity(tools.len());
    for tool in tools {
        let name = tool
            .get("name")
            .and_then(|n| n.as_str())
            .ok_or_else(|| CapabilityError::Downstream {
                message: format!("server '{server}' advertised a tool without a name"),
            })?;

        let description = tool
            .get("description")
            .and_then(|d| d.as_str())
            .unwrap_or_default()
            .to_string();

        descriptors.push(ToolDescriptor {
            server: server.to_string(),
            name: name.to_string(),
            description,
            params: parse_params(tool.get("inputSchema")),
        });
    }
    Ok(descriptors)
}

fn parse_params(schema: Option<&Value>) -> Vec<ParamSpec> {
    let Some(schema) = schema else {
        return Vec::new();
    };

    let required: Vec<&str> = schema
        .get("required")
        .and_then(|r| r.as_array())
        .map(|r| r.iter().filter_map(|v| v.as_str()).collect())
        .unwrap_or_default();

    let Some(properties) = schema.get("properties").and_then(|p| p.as_object()) else {
        return Vec::new();
    };

    properties
        .iter()
        .map(|(name, prop)| ParamSpec {
            name: name.clone(),
            required: required.contains(&name.as_str()),
            type_hint: ParamType::from_schema(prop),
        })
        .collect()
}
