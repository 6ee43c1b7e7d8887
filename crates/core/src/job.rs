//! Job payloads exchanged with the server node.
//!
//! The server describes a claimed job as XML. Two body shapes are in use:
//! the `<job>` element at the document root, or a `<job>` element nested
//! inside an envelope element. [`parse_job`] inspects the root element and
//! deserializes whichever shape is present, so both produce the same
//! [`JobDescriptor`].

use std::fmt;

use quick_xml::events::Event;
use quick_xml::Reader;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::JobId;

/// Root element name of a raw (unwrapped) job body.
const JOB_ELEMENT: &[u8] = b"job";

/// Prefix for the environment variables that carry job parameters.
pub const PARAM_ENV_PREFIX: &str = "CRDATA_PARAM_";

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a job on this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Successful,
    Failed,
}

impl JobStatus {
    /// Only a successful job is reported to the server with `success=true`.
    pub fn is_successful(self) -> bool {
        matches!(self, JobStatus::Successful)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Successful => write!(f, "successful"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

// ---------------------------------------------------------------------------
// Descriptor
// ---------------------------------------------------------------------------

/// Identity of a claimed job, as sent by the server node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct JobDescriptor {
    pub id: JobId,
    #[serde(default)]
    pub name: String,
}

/// Wrapped body shape: any root element with a `<job>` child.
#[derive(Debug, Deserialize)]
struct Envelope {
    job: JobDescriptor,
}

/// Parse a claim response body into a [`JobDescriptor`].
pub fn parse_job(xml: &str) -> Result<JobDescriptor, CoreError> {
    let root = root_element(xml)?;

    let parsed = if root == JOB_ELEMENT {
        quick_xml::de::from_str::<JobDescriptor>(xml)
    } else {
        quick_xml::de::from_str::<Envelope>(xml).map(|envelope| envelope.job)
    };

    parsed.map_err(|e| CoreError::Parse(format!("job body: {e}")))
}

/// Local name of the document's root element.
fn root_element(xml: &str) -> Result<Vec<u8>, CoreError> {
    let mut reader = Reader::from_str(xml);

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                return Ok(e.local_name().as_ref().to_vec());
            }
            Ok(Event::Eof) => {
                return Err(CoreError::Parse("job body has no root element".into()))
            }
            // Declaration, comments, doctype, whitespace.
            Ok(_) => continue,
            Err(e) => return Err(CoreError::Parse(format!("job body: {e}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

/// A single named script parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobParam {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Default, Deserialize)]
struct ParamList {
    #[serde(rename = "param", default)]
    params: Vec<JobParam>,
}

/// Parse a `<params>` document. An empty body means the job takes no
/// parameters.
pub fn parse_params(xml: &str) -> Result<Vec<JobParam>, CoreError> {
    if xml.trim().is_empty() {
        return Ok(Vec::new());
    }

    let list: ParamList =
        quick_xml::de::from_str(xml).map_err(|e| CoreError::Parse(format!("params body: {e}")))?;

    if list.params.iter().any(|p| p.name.trim().is_empty()) {
        return Err(CoreError::Validation(
            "job parameter with an empty name".to_string(),
        ));
    }

    Ok(list.params)
}

/// Render parameters as a flat JSON object (`name -> value`). Later
/// duplicates win.
pub fn params_to_json(params: &[JobParam]) -> serde_json::Value {
    let map: serde_json::Map<String, serde_json::Value> = params
        .iter()
        .map(|p| (p.name.clone(), serde_json::Value::String(p.value.clone())))
        .collect();
    serde_json::Value::Object(map)
}

/// Environment variable name for a parameter: upper-cased, with anything
/// outside `[A-Z0-9]` replaced by `_`.
pub fn param_env_name(name: &str) -> String {
    let sanitized: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("{PARAM_ENV_PREFIX}{sanitized}")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
