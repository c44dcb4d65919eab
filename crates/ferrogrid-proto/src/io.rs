//! Dispatch payloads exchanged between the grid and agent handlers

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use crate::ProtocolError;

/// Identifies one immutable version of a file or directory bundle
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileVersionId {
    /// Stable identifier of the file across versions
    pub file_id: String,
    /// Version of the content
    pub version: String,
}

impl FileVersionId {
    /// Suffix of the property carrying the file id
    pub const ID_SUFFIX: &'static str = ".id";
    /// Suffix of the property carrying the version
    pub const VERSION_SUFFIX: &'static str = ".version";

    /// Create a new file version id
    pub fn new(file_id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            file_id: file_id.into(),
            version: version.into(),
        }
    }

    /// Encode this id as the `<name>.id` / `<name>.version` property pair
    pub fn to_properties(&self, property_name: &str) -> HashMap<String, String> {
        let mut props = HashMap::new();
        props.insert(format!("{}{}", property_name, Self::ID_SUFFIX), self.file_id.clone());
        props.insert(format!("{}{}", property_name, Self::VERSION_SUFFIX), self.version.clone());
        props
    }

    /// Read a `<name>.id` / `<name>.version` property pair.
    ///
    /// Returns `None` unless both properties are present.
    pub fn from_properties(property_name: &str, properties: &HashMap<String, String>) -> Option<Self> {
        let file_id = properties.get(&format!("{}{}", property_name, Self::ID_SUFFIX))?;
        let version = properties.get(&format!("{}{}", property_name, Self::VERSION_SUFFIX))?;
        Some(Self::new(file_id.clone(), version.clone()))
    }
}

impl fmt::Display for FileVersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.file_id, self.version)
    }
}

/// One file inside a directory bundle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Path relative to the bundle root, `/` separated
    pub path: String,
    /// File content
    pub content: Bytes,
}

/// Content of a [`FileVersionId`] as transferred from the grid to an agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilePayload {
    /// A single file
    File {
        /// File name
        name: String,
        /// File content
        content: Bytes,
    },
    /// A directory tree
    Directory {
        /// Directory name
        name: String,
        /// All regular files of the tree
        entries: Vec<FileEntry>,
    },
}

impl FilePayload {
    /// Name of the materialized file or directory
    pub fn name(&self) -> &str {
        match self {
            Self::File { name, .. } => name,
            Self::Directory { name, .. } => name,
        }
    }

    /// Total number of content bytes
    pub fn size(&self) -> usize {
        match self {
            Self::File { content, .. } => content.len(),
            Self::Directory { entries, .. } => entries.iter().map(|e| e.content.len()).sum(),
        }
    }
}

/// Request addressed to a handler on an agent token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputMessage {
    /// Name of the function being executed, used for reporting
    pub function: String,
    /// Argument passed to the handler
    pub argument: Value,
    /// Name of the handler to resolve on the agent
    pub handler: String,
    /// Bundle providing the handler, if not built into the agent
    pub handler_package: Option<FileVersionId>,
    /// Free-form properties, including embedded file version ids
    pub properties: HashMap<String, String>,
    /// Maximum time the agent may spend on this call
    pub call_timeout_ms: u64,
}

impl InputMessage {
    /// Default call timeout
    pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 180_000;

    /// Create an input message for a built-in handler
    pub fn new(function: impl Into<String>, handler: impl Into<String>, argument: Value) -> Self {
        Self {
            function: function.into(),
            argument,
            handler: handler.into(),
            handler_package: None,
            properties: HashMap::new(),
            call_timeout_ms: Self::DEFAULT_CALL_TIMEOUT_MS,
        }
    }

    /// Set the bundle providing the handler
    pub fn with_handler_package(mut self, package: FileVersionId) -> Self {
        self.handler_package = Some(package);
        self
    }

    /// Add a property
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Embed a file version id under `property_name`
    pub fn with_file_property(mut self, property_name: &str, file: &FileVersionId) -> Self {
        self.properties.extend(file.to_properties(property_name));
        self
    }

    /// Set the call timeout
    pub fn with_call_timeout_ms(mut self, call_timeout_ms: u64) -> Self {
        self.call_timeout_ms = call_timeout_ms;
        self
    }
}

/// Machine readable classification of agent-side failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AgentErrorCode {
    /// The call timed out and the handler ignored the interruption request
    TimeoutRequestNotInterrupted,
    /// The call timed out and the handler stopped after being interrupted
    TimeoutRequestInterrupted,
    /// The addressed token does not exist on the agent
    TokenNotFound,
    /// Building the execution context failed
    ContextBuilder,
    /// Downloading a file from the grid timed out
    ContextBuilderFileDownloadTimeout,
    /// Downloading a file from the grid failed
    ContextBuilderFileDownloadError,
    /// Any other agent-side failure
    Unexpected,
}

impl AgentErrorCode {
    /// Whether a caller may retry the same request unchanged
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            Self::ContextBuilderFileDownloadTimeout | Self::ContextBuilderFileDownloadError
        )
    }
}

/// Structured agent failure returned alongside the human readable error
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentError {
    /// Failure classification
    pub code: AgentErrorCode,
    /// Additional data, keyed by the `DETAIL_*` constants
    pub details: HashMap<String, String>,
}

impl AgentError {
    /// Detail key: timeout in milliseconds
    pub const DETAIL_TIMEOUT: &'static str = "timeout";
    /// Detail key: file id
    pub const DETAIL_FILE_ID: &'static str = "fileId";
    /// Detail key: file version
    pub const DETAIL_FILE_VERSION: &'static str = "version";

    /// Create an agent error without details
    pub fn new(code: AgentErrorCode) -> Self {
        Self {
            code,
            details: HashMap::new(),
        }
    }

    /// Add a detail entry
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }
}

/// Binary blob attached to an output message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// Attachment name, e.g. `exception.log`
    pub name: String,
    /// Optional MIME type
    pub mime_type: Option<String>,
    /// Hex encoded content
    pub hex_content: String,
}

impl Attachment {
    /// Name used for attachments describing a handler failure
    pub const EXCEPTION_LOG: &'static str = "exception.log";

    /// Create an attachment from raw bytes
    pub fn from_bytes(name: impl Into<String>, mime_type: Option<String>, content: &[u8]) -> Self {
        Self {
            name: name.into(),
            mime_type,
            hex_content: hex::encode(content),
        }
    }

    /// Create a plain text attachment
    pub fn text(name: impl Into<String>, text: &str) -> Self {
        Self::from_bytes(name, Some("text/plain".to_string()), text.as_bytes())
    }

    /// Decode the attachment content
    pub fn content(&self) -> Result<Vec<u8>, ProtocolError> {
        hex::decode(&self.hex_content).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

/// Named duration recorded while executing a handler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measure {
    /// Measure name
    pub name: String,
    /// Start time in milliseconds since the Unix epoch
    pub begin_ms: u64,
    /// Duration in milliseconds
    pub duration_ms: u64,
    /// Custom data
    pub data: HashMap<String, Value>,
}

/// Result of a handler invocation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputMessage {
    /// Handler output
    pub payload: Option<Value>,
    /// Human readable error
    pub error: Option<String>,
    /// Structured agent failure
    pub agent_error: Option<AgentError>,
    /// Attachments such as logs or stack traces
    pub attachments: Vec<Attachment>,
    /// Timed measures
    pub measures: Vec<Measure>,
}

impl OutputMessage {
    /// Output with a payload and nothing else
    pub fn with_payload(payload: Value) -> Self {
        Self {
            payload: Some(payload),
            ..Default::default()
        }
    }

    /// Output reporting an error
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Default::default()
        }
    }

    /// Output reporting a structured agent failure
    pub fn agent_error(message: impl Into<String>, agent_error: AgentError) -> Self {
        Self {
            error: Some(message.into()),
            agent_error: Some(agent_error),
            ..Default::default()
        }
    }

    /// Append an attachment
    pub fn add_attachment(&mut self, attachment: Attachment) {
        self.attachments.push(attachment);
    }

    /// Whether the output carries an error of any kind
    pub fn is_error(&self) -> bool {
        self.error.is_some() || self.agent_error.is_some()
    }
}

fn epoch_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

struct OpenMeasure {
    name: String,
    begin_ms: u64,
    started: Instant,
}

/// Incrementally assembles an [`OutputMessage`]
#[derive(Default)]
pub struct OutputMessageBuilder {
    payload: Map<String, Value>,
    payload_value: Option<Value>,
    error: Option<String>,
    attachments: Vec<Attachment>,
    measures: Vec<Measure>,
    open_measures: Vec<OpenMeasure>,
}

impl OutputMessageBuilder {
    /// Create an empty builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an output attribute, replacing any previous value with that name
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.payload.insert(name.into(), value.into());
        self
    }

    /// Replace the whole payload. Attributes added with [`add`](Self::add) are ignored afterwards.
    pub fn set_payload(&mut self, payload: Value) -> &mut Self {
        self.payload_value = Some(payload);
        self
    }

    /// Report an error
    pub fn set_error(&mut self, error: impl Into<String>) -> &mut Self {
        self.error = Some(error.into());
        self
    }

    /// Append to the reported error, setting it if none was reported yet
    pub fn append_error(&mut self, error: &str) -> &mut Self {
        match self.error.as_mut() {
            Some(existing) => existing.push_str(error),
            None => self.error = Some(error.to_string()),
        }
        self
    }

    /// Report an error and attach its detailed description as `exception.log`
    pub fn set_error_with_details(&mut self, error: impl Into<String>, details: &str) -> &mut Self {
        self.set_error(error);
        self.add_attachment(Attachment::text(Attachment::EXCEPTION_LOG, details));
        self
    }

    /// Add an attachment
    pub fn add_attachment(&mut self, attachment: Attachment) -> &mut Self {
        self.attachments.push(attachment);
        self
    }

    /// Start a measure now. Measures nest; `stop_measure` closes the latest one.
    pub fn start_measure(&mut self, name: impl Into<String>) {
        self.open_measures.push(OpenMeasure {
            name: name.into(),
            begin_ms: epoch_millis(SystemTime::now()),
            started: Instant::now(),
        });
    }

    /// Stop the most recently started measure
    pub fn stop_measure(&mut self) {
        self.stop_measure_with_data(HashMap::new());
    }

    /// Stop the most recently started measure, attaching custom data
    pub fn stop_measure_with_data(&mut self, data: HashMap<String, Value>) {
        if let Some(open) = self.open_measures.pop() {
            self.measures.push(Measure {
                name: open.name,
                begin_ms: open.begin_ms,
                duration_ms: open.started.elapsed().as_millis() as u64,
                data,
            });
        }
    }

    /// Add an already measured duration
    pub fn add_measure(&mut self, name: impl Into<String>, duration_ms: u64, data: HashMap<String, Value>) {
        let now = epoch_millis(SystemTime::now());
        self.measures.push(Measure {
            name: name.into(),
            begin_ms: now.saturating_sub(duration_ms),
            duration_ms,
            data,
        });
    }

    /// Build the output message
    pub fn build(self) -> OutputMessage {
        let payload = match self.payload_value {
            Some(value) => value,
            None => Value::Object(self.payload),
        };
        OutputMessage {
            payload: Some(payload),
            error: self.error,
            agent_error: None,
            attachments: self.attachments,
            measures: self.measures,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_file_version_id_properties() {
        let id = FileVersionId::new("lib-42", "1700000000000");
        let props = id.to_properties("$libraries");

        assert_eq!(props.get("$libraries.id"), Some(&"lib-42".to_string()));
        assert_eq!(props.get("$libraries.version"), Some(&"1700000000000".to_string()));
        assert_eq!(FileVersionId::from_properties("$libraries", &props), Some(id));
    }

    #[test]
    fn test_file_version_id_requires_both_properties() {
        let mut props = HashMap::new();
        props.insert("pkg.id".to_string(), "x".to_string());
        assert_eq!(FileVersionId::from_properties("pkg", &props), None);
    }

    #[test]
    fn test_attachment_hex_content() {
        let attachment = Attachment::text("exception.log", "boom");
        assert_eq!(attachment.hex_content, "626f6f6d");
        assert_eq!(attachment.content().unwrap(), b"boom");
    }

    #[test]
    fn test_output_builder_collects_attributes() {
        let mut builder = OutputMessageBuilder::new();
        builder.add("answer", 42).add("name", "grid");
        builder.add("answer", 43);
        let output = builder.build();

        assert_eq!(output.payload, Some(json!({"answer": 43, "name": "grid"})));
        assert!(output.error.is_none());
    }

    #[test]
    fn test_output_builder_errors_and_measures() {
        let mut builder = OutputMessageBuilder::new();
        builder.append_error("first");
        builder.append_error(", second");
        builder.start_measure("outer");
        builder.start_measure("inner");
        builder.stop_measure();
        builder.stop_measure();
        builder.add_measure("manual", 12, HashMap::new());
        let output = builder.build();

        assert_eq!(output.error.as_deref(), Some("first, second"));
        let names: Vec<_> = output.measures.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["inner", "outer", "manual"]);
        assert_eq!(output.measures[2].duration_ms, 12);
    }

    #[test]
    fn test_transient_codes() {
        assert!(AgentErrorCode::ContextBuilderFileDownloadTimeout.is_transient());
        assert!(AgentErrorCode::ContextBuilderFileDownloadError.is_transient());
        assert!(!AgentErrorCode::ContextBuilder.is_transient());
        assert!(!AgentErrorCode::TokenNotFound.is_transient());
    }
}
