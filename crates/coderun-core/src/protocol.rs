//! Wire protocol
//!
//! Submissions and results travel as JSON. The CLI additionally accepts the
//! backend's container convention of a base64-encoded submission in the
//! `PAYLOAD` environment variable; the daemon frames every message with a
//! 4-byte big-endian length prefix.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::result::{ExecutionResult, GradeReport};
use crate::submission::Submission;
use crate::{CoderunError, Result};

/// Largest frame either side will accept
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Environment variable carrying a base64 submission
pub const PAYLOAD_ENV: &str = "PAYLOAD";

/// Request types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    /// Run a submission; graded when it carries test cases
    Execute(Submission),
    /// Get pool status
    Status,
    /// Ping
    Ping,
}

/// Response types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Response {
    /// Result of an ungraded submission
    Execute(ExecutionResult),
    /// Report of a graded submission
    Grade(GradeReport),
    /// Pool status
    Status {
        total: usize,
        idle: usize,
        busy: usize,
    },
    /// Pong
    Pong,
    /// Request could not be served
    Error { message: String },
}

/// Encode a message as JSON
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(msg)?)
}

/// Decode a JSON message
pub fn decode<'a, T: Deserialize<'a>>(data: &'a [u8]) -> Result<T> {
    serde_json::from_slice(data).map_err(|e| CoderunError::Protocol(format!("malformed message: {e}")))
}

/// Decode a submission, rejecting ones no toolchain could accept
pub fn decode_submission(data: &[u8]) -> Result<Submission> {
    let submission: Submission = decode(data)?;
    if submission.tests.iter().any(|t| t.id.is_empty()) {
        return Err(CoderunError::Protocol("test case without id".into()));
    }
    Ok(submission)
}

/// Decode the base64 `PAYLOAD` form of a submission
pub fn decode_payload_env(value: &str) -> Result<Submission> {
    let raw = STANDARD
        .decode(value.trim())
        .map_err(|e| CoderunError::Protocol(format!("PAYLOAD is not base64: {e}")))?;
    decode_submission(&raw)
}

/// Read one length-prefixed frame; `None` on a clean end of stream
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(CoderunError::Protocol(format!(
            "frame of {len} bytes exceeds limit of {MAX_FRAME_LEN}"
        )));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

/// Write one length-prefixed frame
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(CoderunError::Protocol(format!(
            "frame of {} bytes exceeds limit of {MAX_FRAME_LEN}",
            payload.len()
        )));
    }
    #[allow(clippy::cast_possible_truncation)]
    let len = (payload.len() as u32).to_be_bytes();
    writer.write_all(&len).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::submission::Language;

    #[test]
    fn payload_env_decodes_backend_submission() {
        let json = r#"{"code":"package main","language":"go","tests":[
            {"id":"t1","input":"1 2","expectedOutput":"3","isHidden":false},
            {"id":"t2","input":"2 2","expectedOutput":"4","isHidden":true,"hint":"sum both"}
        ]}"#;
        let encoded = STANDARD.encode(json);
        let sub = decode_payload_env(&format!("{encoded}\n")).unwrap();

        assert_eq!(sub.language, Language::Go);
        assert_eq!(sub.source, "package main");
        assert!(sub.is_graded());
        assert_eq!(sub.tests[0].stdin.as_deref(), Some("1 2"));
        assert_eq!(sub.tests[0].expected_stdout, "3");
        assert!(sub.tests[1].hidden);
        assert_eq!(sub.tests[1].hint.as_deref(), Some("sum both"));
    }

    #[test]
    fn payload_env_rejects_garbage() {
        assert!(matches!(
            decode_payload_env("%%%"),
            Err(CoderunError::Protocol(_))
        ));
        let not_json = STANDARD.encode("hello");
        assert!(decode_payload_env(&not_json).is_err());
    }

    #[test]
    fn unknown_language_is_a_protocol_error() {
        let err = decode_submission(br#"{"language":"cobol","source":""}"#).unwrap_err();
        assert!(matches!(err, CoderunError::Protocol(_)));
    }

    #[test]
    fn requests_are_tagged() {
        let ping: Request = decode(br#"{"type":"Ping"}"#).unwrap();
        assert!(matches!(ping, Request::Ping));

        let exec: Request = decode(br#"{"type":"Execute","language":"go","source":"package main"}"#).unwrap();
        assert!(matches!(exec, Request::Execute(s) if s.language == Language::Go));

        let json = String::from_utf8(encode(&Response::Pong).unwrap()).unwrap();
        assert_eq!(json, r#"{"type":"Pong"}"#);
    }

    #[tokio::test]
    async fn frames_survive_a_stream() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        write_frame(&mut client, b"first").await.unwrap();
        write_frame(&mut client, b"").await.unwrap();
        drop(client);

        assert_eq!(read_frame(&mut server).await.unwrap().unwrap(), b"first");
        assert_eq!(read_frame(&mut server).await.unwrap().unwrap(), b"");
        assert!(read_frame(&mut server).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_frame_is_refused() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let len = u32::try_from(MAX_FRAME_LEN + 1).unwrap().to_be_bytes();
        client.write_all(&len).await.unwrap();
        assert!(matches!(
            read_frame(&mut server).await,
            Err(CoderunError::Protocol(_))
        ));
    }
}
