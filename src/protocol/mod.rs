//! Coordinator/worker wire protocol
//!
//! Newline-delimited JSON. The coordinator writes [`WorkerRequest`]s to a
//! worker's stdin and reads [`WorkerMessage`]s from its stdout. Every message
//! is one line tagged by `type`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::hooks::HookSpec;
use crate::models::{HookFailure, ItemOutcome, ItemRef, TaskTarget};

/// A result or request could not be carried across the process boundary
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("cannot encode message: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("cannot decode message: {source} (line: {line})")]
    Decode {
        line: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("channel I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// One unit of dispatched work
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerTask {
    /// Unique per submission; correlates events with the task
    pub job_id: u64,
    /// Submission order
    pub sequence_index: usize,
    pub target: TaskTarget,
    /// Items selected for this task, in run order
    pub items: Vec<ItemRef>,
}

/// Everything a worker needs before it accepts tasks
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSettings {
    pub worker_index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initializer: Option<HookSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finalizer: Option<HookSpec>,
    #[serde(default)]
    pub allow_output_passthrough: bool,
    /// Set when coverage instrumentation is enabled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coverage_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_timeout_secs: Option<u64>,
}

/// Coordinator to worker
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerRequest {
    Configure { settings: WorkerSettings },
    Run { task: WorkerTask },
    /// Sentinel: no more work is coming
    Shutdown,
}

/// Worker to coordinator
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    Ready {
        pid: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        initializer: Option<HookFailure>,
    },
    Started {
        job_id: u64,
        item: ItemRef,
    },
    Completed {
        job_id: u64,
        outcome: ItemOutcome,
    },
    TaskDone {
        job_id: u64,
    },
    Finalized {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        finalizer: Option<HookFailure>,
    },
    /// Something went wrong on the worker side of the channel
    Fault {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        job_id: Option<u64>,
        message: String,
    },
}

/// Encode a message as one protocol line, newline included
pub fn encode<T: Serialize>(message: &T) -> Result<String, ProtocolError> {
    let mut line = serde_json::to_string(message).map_err(ProtocolError::Encode)?;
    line.push('\n');
    Ok(line)
}

/// Decode one protocol line
pub fn decode<T: DeserializeOwned>(line: &str) -> Result<T, ProtocolError> {
    serde_json::from_str(line.trim()).map_err(|source| ProtocolError::Decode {
        line: truncate(line.trim(), 200),
        source,
    })
}

/// Write an encoded line and flush
pub async fn write_line<W>(writer: &mut W, line: &str) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Encode, write and flush one message
pub async fn send<W, T>(writer: &mut W, message: &T) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let line = encode(message)?;
    write_line(writer, &line).await
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Verdict;

    #[test]
    fn test_request_wire_shape() {
        let line = encode(&WorkerRequest::Shutdown).unwrap();
        assert_eq!(line, "{\"type\":\"shutdown\"}\n");

        let task = WorkerTask {
            job_id: 3,
            sequence_index: 0,
            target: TaskTarget {
                suite: PathBuf::from("/s/test_a.yaml"),
                module: "test_a".into(),
                path: vec!["G".into()],
            },
            items: vec![ItemRef::new("test_a.G.x", "x", "test_a.G")],
        };
        let line = encode(&WorkerRequest::Run { task: task.clone() }).unwrap();
        assert!(line.starts_with("{\"type\":\"run\""));
        assert_eq!(decode::<WorkerRequest>(&line).unwrap(), WorkerRequest::Run { task });
    }

    #[test]
    fn test_completed_carries_output() {
        let outcome = ItemOutcome::failed(ItemRef::from_id("m.case"), "exit status 1")
            .with_output("out\n".into(), "err\n".into());
        let line = encode(&WorkerMessage::Completed {
            job_id: 9,
            outcome,
        })
        .unwrap();

        match decode::<WorkerMessage>(&line).unwrap() {
            WorkerMessage::Completed { job_id, outcome } => {
                assert_eq!(job_id, 9);
                assert_eq!(outcome.verdict, Verdict::Failed);
                assert_eq!(outcome.stdout, "out\n");
                assert_eq!(outcome.stderr, "err\n");
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn test_decode_rejects_noise() {
        let err = decode::<WorkerMessage>("hello from a stray println").unwrap_err();
        assert!(matches!(err, ProtocolError::Decode { .. }));
    }

    #[tokio::test]
    async fn test_send_writes_one_line() {
        let mut buffer: Vec<u8> = Vec::new();
        send(&mut buffer, &WorkerMessage::TaskDone { job_id: 1 })
            .await
            .unwrap();
        let text = String::from_utf8(buffer).unwrap();
        assert_eq!(text.lines().count(), 1);
        assert!(text.ends_with('\n'));
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let s = "ééééé";
        let t = truncate(s, 3);
        assert!(t.ends_with("..."));
    }
}
