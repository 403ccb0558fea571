//! The subset of the Model Context Protocol data model that the bridge needs to understand.
//!
//! Tool results, resource contents and rendered prompts are deliberately *not* modelled here;
//! the bridge passes those through as opaque JSON.
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Name and version of either end of the connection (`clientInfo`/`serverInfo`).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Implementation {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
}

/// The three categories of capability a server can offer
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, strum::IntoStaticStr, strum::Display,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum CapabilityKind {
    Tools,
    Resources,
    Prompts,
}

impl CapabilityKind {
    /// The method that enumerates this category
    pub fn list_method(self) -> &'static str {
        match self {
            CapabilityKind::Tools => "tools/list",
            CapabilityKind::Resources => "resources/list",
            CapabilityKind::Prompts => "prompts/list",
        }
    }

    /// The member of the listing result that holds the entries
    pub fn result_key(self) -> &'static str {
        self.into()
    }
}

/// The `capabilities` object from the server's `initialize` result, kept as raw JSON since
/// servers put all kinds of things in there.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerCapabilities(pub Map<String, Value>);

impl ServerCapabilities {
    /// Whether the server declared support for a category.
    ///
    /// MCP declares support with an object (possibly empty); a boolean is accepted as well.  A
    /// missing key, `false` or `null` all mean "not supported".
    pub fn supports(&self, kind: CapabilityKind) -> bool {
        !matches!(
            self.0.get(kind.result_key()),
            None | Some(Value::Null) | Some(Value::Bool(false))
        )
    }
}

/// The result of the `initialize` request
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: ServerCapabilities,
    #[serde(default)]
    pub server_info: Implementation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

/// A tool the server offers
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub input_schema: InputSchema,
}

/// A JSON schema describing a tool's arguments.
///
/// Only the parts needed to describe the parameters are broken out; everything else the server
/// put in the schema is kept in `extra` so nothing is lost when it's serialized again.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InputSchema {
    #[serde(rename = "type", default = "InputSchema::object_type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub properties: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl InputSchema {
    fn object_type() -> String {
        "object".to_string()
    }
}

impl Default for InputSchema {
    fn default() -> Self {
        Self {
            kind: Self::object_type(),
            properties: Map::new(),
            required: Vec::new(),
            extra: Map::new(),
        }
    }
}

/// One parameter of a tool, flattened out of the tool's input schema
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ToolParameter {
    pub name: String,
    /// The JSON schema type, if the schema states a single one
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub required: bool,
    pub description: Option<String>,
}

impl Tool {
    /// The tool's parameters in the order the schema lists them.
    pub fn parameters(&self) -> Vec<ToolParameter> {
        self.input_schema
            .properties
            .iter()
            .map(|(name, schema)| ToolParameter {
                name: name.clone(),
                kind: schema
                    .get("type")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                required: self.input_schema.required.iter().any(|r| r == name),
                description: schema
                    .get("description")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            })
            .collect()
    }
}

/// A resource the server exposes
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// A prompt template the server offers
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prompt {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub arguments: Vec<PromptArgument>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptArgument {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
}

/// An entry in one of the three capability listings.
pub trait ListingEntry: serde::de::DeserializeOwned + Send + Sync + 'static {
    const KIND: CapabilityKind;

    /// What makes this entry unique within its listing
    fn key(&self) -> &str;
}

impl ListingEntry for Tool {
    const KIND: CapabilityKind = CapabilityKind::Tools;

    fn key(&self) -> &str {
        &self.name
    }
}

impl ListingEntry for Resource {
    const KIND: CapabilityKind = CapabilityKind::Resources;

    fn key(&self) -> &str {
        &self.uri
    }
}

impl ListingEntry for Prompt {
    const KIND: CapabilityKind = CapabilityKind::Prompts;

    fn key(&self) -> &str {
        &self.name
    }
}
