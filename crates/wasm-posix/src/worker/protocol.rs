//! Messages between a worker and its owner.
//!
//! The shapes are plain JSON-compatible (`event` tag, camelCase), so the
//! same protocol can be spoken across a process or thread boundary.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, WasmPosixError};
use crate::wasm::{RuntimeConfig, StringArg};

/// Default size of the shared data buffer.
pub const DEFAULT_BUFFER_SIZE: usize = 8 * 1024;

/// Options for loading a module on a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerOptions {
    /// Runtime the worker builds its instance with
    #[serde(default)]
    pub config: RuntimeConfig,
    /// Capacity of the shared buffer used to hand stdin to the worker
    #[serde(default = "default_buffer_size")]
    pub stdin_buffer_size: usize,
}

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            config: RuntimeConfig::default(),
            stdin_buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl WorkerOptions {
    /// Options with the given runtime configuration.
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }
}

/// Owner to worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum Request {
    /// Load and instantiate `name`
    Init {
        /// Module path
        name: String,
        /// Load options
        options: WorkerOptions,
    },
    /// Numeric call
    Call {
        /// Function name
        name: String,
        /// Numeric arguments
        #[serde(default)]
        args: Vec<i64>,
        /// Correlation id
        id: u64,
    },
    /// Call with a leading string (or argv) argument
    CallWithString {
        /// Function name
        name: String,
        /// The string argument
        #[serde(rename = "str")]
        text: StringPayload,
        /// Numeric arguments after the string
        #[serde(default)]
        args: Vec<i64>,
        /// Correlation id
        id: u64,
    },
}

/// A single string or an argv-style list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StringPayload {
    /// One string
    One(String),
    /// `argc, argv`
    Many(Vec<String>),
}

impl StringPayload {
    /// Borrow as a marshaling argument.
    pub fn as_arg(&self) -> StringArg<'_> {
        match self {
            StringPayload::One(s) => StringArg::One(s),
            StringPayload::Many(list) => StringArg::Many(list),
        }
    }
}

impl From<&str> for StringPayload {
    fn from(s: &str) -> Self {
        StringPayload::One(s.to_string())
    }
}

impl From<&[String]> for StringPayload {
    fn from(list: &[String]) -> Self {
        StringPayload::Many(list.to_vec())
    }
}

/// Worker to owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Upstream {
    /// Init outcome or a blocking request
    Notice(Notice),
    /// Answer to a call
    Reply(Reply),
}

/// Unsolicited worker messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum Notice {
    /// Outcome of an init request
    Init {
        /// ok or error
        status: InitStatus,
        /// Why init failed
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Sleep `time` milliseconds, then release the worker
    Sleep {
        /// Milliseconds
        time: u64,
    },
    /// Read stdin into the shared buffer, then release the worker
    WaitForStdin,
}

/// Init outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InitStatus {
    /// Module loaded
    Ok,
    /// Module failed to load
    Error,
}

/// Answer to a call, correlated by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    /// Id of the request being answered
    pub id: u64,
    /// Call output
    #[serde(default)]
    pub output: Value,
    /// Set when the call failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Reply {
    pub(crate) fn from_result(id: u64, result: Result<Value>) -> Self {
        match result {
            Ok(output) => Self {
                id,
                output,
                error: None,
            },
            Err(e) => Self {
                id,
                output: Value::Null,
                error: Some(e.to_string()),
            },
        }
    }

    /// The call's output, or the worker-side error.
    pub fn into_result(self) -> Result<Value> {
        match self.error {
            Some(error) => Err(WasmPosixError::WorkerCallError(error)),
            None => Ok(self.output),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_call_with_string_shape() {
        let request = Request::CallWithString {
            name: "eval".to_string(),
            text: StringPayload::from("1+1"),
            args: vec![3],
            id: 7,
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({"event": "callWithString", "name": "eval", "str": "1+1", "args": [3], "id": 7})
        );
    }

    #[test]
    fn test_argv_payload() {
        let request: Request = serde_json::from_value(json!({
            "event": "callWithString", "name": "terminal", "str": ["python", "-q"], "id": 1
        }))
        .unwrap();
        match request {
            Request::CallWithString { text, args, .. } => {
                assert_eq!(text, StringPayload::Many(vec!["python".into(), "-q".into()]));
                assert!(args.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_init_request_defaults() {
        let request: Request =
            serde_json::from_value(json!({"event": "init", "name": "python.wasm", "options": {}}))
                .unwrap();
        match request {
            Request::Init { name, options } => {
                assert_eq!(name, "python.wasm");
                assert_eq!(options.stdin_buffer_size, DEFAULT_BUFFER_SIZE);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_notices() {
        let ok = Upstream::Notice(Notice::Init {
            status: InitStatus::Ok,
            error: None,
        });
        assert_eq!(serde_json::to_value(&ok).unwrap(), json!({"event": "init", "status": "ok"}));

        let failed: Upstream = serde_json::from_value(
            json!({"event": "init", "status": "error", "error": "bad magic"}),
        )
        .unwrap();
        assert_eq!(
            failed,
            Upstream::Notice(Notice::Init {
                status: InitStatus::Error,
                error: Some("bad magic".to_string()),
            })
        );

        let sleep: Upstream = serde_json::from_value(json!({"event": "sleep", "time": 250})).unwrap();
        assert_eq!(sleep, Upstream::Notice(Notice::Sleep { time: 250 }));

        assert_eq!(
            serde_json::to_value(Upstream::Notice(Notice::WaitForStdin)).unwrap(),
            json!({"event": "waitForStdin"})
        );
    }

    #[test]
    fn test_reply() {
        let reply: Upstream = serde_json::from_value(json!({"id": 3, "output": 5})).unwrap();
        let Upstream::Reply(reply) = reply else {
            panic!("expected a reply");
        };
        assert_eq!(reply.clone().into_result().unwrap(), json!(5));

        let failed = Reply::from_result(4, Err(WasmPosixError::NotFound("nope".into())));
        assert!(matches!(
            failed.into_result(),
            Err(WasmPosixError::WorkerCallError(msg)) if msg.contains("nope")
        ));
    }
}
