use async_trait::async_trait;
use parley_common::{Error, Result};
use parley_db::ToolInit;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

mod clock;
mod invoker;
mod registry;
mod webhook;

pub use clock::CurrentTime;
pub use invoker::Invoker;
pub use registry::ToolRegistry;
pub use webhook::WorkflowWebhook;

/// JSON-Schema-like description of a tool's arguments. Serialized as
/// `{"type":"object","properties":{...},"required":[...]}`, the same object
/// the tool protocol exposes as `inputSchema`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    #[serde(default)]
    pub properties: Map<String, Value>,
    #[serde(default)]
    pub required: Vec<String>,
}

impl ToolSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn property(mut self, name: &str, kind: &str, description: &str) -> Self {
        self.properties.insert(
            name.to_string(),
            json!({ "type": kind, "description": description }),
        );
        self
    }

    pub fn required_property(mut self, name: &str, kind: &str, description: &str) -> Self {
        self = self.property(name, kind, description);
        self.required.push(name.to_string());
        self
    }

    pub fn to_json(&self) -> Value {
        json!({
            "type": "object",
            "properties": self.properties,
            "required": self.required,
        })
    }
}

/// Immutable descriptor of a registered tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub requires_init: bool,
    pub schema: ToolSchema,
}

impl ToolDefinition {
    pub fn input_schema(&self) -> Value {
        self.schema.to_json()
    }

    pub fn required_params(&self) -> &[String] {
        &self.schema.required
    }
}

/// Object-safe tool contract used by the registry and invoker.
#[async_trait]
pub trait Tool: Send + Sync {
    fn definition(&self) -> &ToolDefinition;

    /// Parse `arguments` (JSON text from the model or a protocol caller) and
    /// run the tool.
    async fn call(&self, arguments: &str, init: Option<&ToolInit>) -> Result<String>;
}

/// Tool with a statically typed input. Each tool supplies its own decode
/// step; the default deserializes the argument object into `Input`.
#[async_trait]
pub trait TypedTool: Send + Sync + 'static {
    type Input: DeserializeOwned + Send;

    fn definition(&self) -> ToolDefinition;

    fn decode(&self, arguments: Value) -> Result<Self::Input> {
        serde_json::from_value(arguments).map_err(|e| Error::InvalidArguments(e.to_string()))
    }

    async fn run(&self, input: Self::Input, init: Option<&ToolInit>) -> Result<String>;
}

/// Adapter turning a `TypedTool` into a `dyn Tool`.
pub(crate) struct Typed<T: TypedTool> {
    tool: T,
    definition: ToolDefinition,
}

impl<T: TypedTool> Typed<T> {
    pub(crate) fn new(tool: T) -> Self {
        let definition = tool.definition();
        Self { tool, definition }
    }
}

#[async_trait]
impl<T: TypedTool> Tool for Typed<T> {
    fn definition(&self) -> &ToolDefinition {
        &self.definition
    }

    async fn call(&self, arguments: &str, init: Option<&ToolInit>) -> Result<String> {
        if self.definition.requires_init && init.is_none() {
            return Err(Error::InvalidArguments(format!(
                "tool '{}' requires init data that is not configured",
                self.definition.name
            )));
        }

        let args = parse_arguments(arguments)?;
        if let Some(missing) = self
            .definition
            .required_params()
            .iter()
            .find(|p| args.get(p.as_str()).is_none_or(Value::is_null))
        {
            return Err(Error::InvalidArguments(format!(
                "missing required parameter '{missing}'"
            )));
        }

        let input = self.tool.decode(Value::Object(args))?;
        self.tool.run(input, init).await
    }
}

/// Arguments arrive as JSON text; an empty string means "no arguments".
fn parse_arguments(arguments: &str) -> Result<Map<String, Value>> {
    let trimmed = arguments.trim();
    if trimmed.is_empty() {
        return Ok(Map::new());
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(Value::Null) => Ok(Map::new()),
        Ok(other) => Err(Error::InvalidArguments(format!(
            "arguments must be a JSON object, got {other}"
        ))),
        Err(e) => Err(Error::InvalidArguments(format!(
            "arguments are not valid JSON: {e}"
        ))),
    }
}

/// Registry preloaded with the built-in tools.
pub fn builtin_registry(http_timeout: std::time::Duration) -> Result<ToolRegistry> {
    let mut registry = ToolRegistry::new();
    registry.register(CurrentTime)?;
    registry.register(WorkflowWebhook::new(http_timeout)?)?;
    Ok(registry)
}
