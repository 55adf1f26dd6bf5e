//! Framed messages exchanged between the engine and its minions.
//!
//! A frame is a 4-byte big-endian payload length followed by a `bincode`
//! payload. Both the blocking side (minions) and the async side (engine)
//! share the same encoding.

use std::io::{ErrorKind, Read, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::harness::TestSpec;
use crate::coverage::CoverageResult;
use crate::model::CodeUnitName;
use crate::mutation::{DetectionStatus, MutationIdentifier, StatusTestPair};

/// Largest accepted payload.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Framing and codec failures.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// IO failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Payload could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),
    /// Declared payload length above [`MAX_FRAME_LEN`].
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    FrameTooLarge(usize),
}

/// Minion process exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitCode {
    /// Normal completion.
    Ok,
    /// Heap exhausted.
    OutOfMemory,
    /// Unclassified failure.
    UnknownError,
    /// Minion gave up on a test.
    Timeout,
    /// The test harness misbehaved.
    TestPluginIssue,
}

impl ExitCode {
    /// Process exit status for this code.
    pub fn code(self) -> i32 {
        match self {
            Self::Ok => 0,
            Self::OutOfMemory => 11,
            Self::UnknownError => 13,
            Self::Timeout => 14,
            Self::TestPluginIssue => 16,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Ok),
            11 => Some(Self::OutOfMemory),
            13 => Some(Self::UnknownError),
            14 => Some(Self::Timeout),
            16 => Some(Self::TestPluginIssue),
            _ => None,
        }
    }

    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }

    /// Status given to a mutant that was running when the minion exited
    /// with this code. `None` for a normal exit.
    pub fn status(self) -> Option<DetectionStatus> {
        match self {
            Self::Ok => None,
            Self::OutOfMemory => Some(DetectionStatus::MemoryError),
            Self::Timeout => Some(DetectionStatus::TimedOut),
            Self::UnknownError | Self::TestPluginIssue => Some(DetectionStatus::RunError),
        }
    }
}

/// Mutant plus the tests to run against it, in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutantAssignment {
    pub id: MutationIdentifier,
    pub tests: Vec<TestSpec>,
}

/// One analysis unit handed to a mutation minion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitAssignment {
    pub unit_id: u64,
    pub mutants: Vec<MutantAssignment>,
    pub full_matrix: bool,
}

/// A code unit and its probe lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentedUnit {
    pub name: CodeUnitName,
    pub lines: Vec<u32>,
}

/// Work handed to a coverage minion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageAssignment {
    pub units: Vec<InstrumentedUnit>,
    pub tests: Vec<TestSpec>,
}

/// Engine to minion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParentMessage {
    Assign(UnitAssignment),
    CoverageAssign(CoverageAssignment),
}

/// Minion to engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MinionMessage {
    /// The minion is about to run tests against `id`.
    Describe { id: MutationIdentifier },
    /// Verdict for `id`.
    Report {
        id: MutationIdentifier,
        pair: StatusTestPair,
    },
    /// Coverage of one test.
    CoverageResult(CoverageResult),
    /// Last message before the minion exits.
    Done { exit: ExitCode },
}

fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, ProtocolError> {
    let payload = bincode::serialize(message)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

fn check_len(header: [u8; 4]) -> Result<usize, ProtocolError> {
    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(len));
    }
    Ok(len)
}

/// Write one frame and flush.
pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, message: &T) -> Result<(), ProtocolError> {
    writer.write_all(&encode(message)?)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame. `Ok(None)` when the peer closed the stream.
pub fn read_frame<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<Option<T>, ProtocolError> {
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let mut payload = vec![0u8; check_len(header)?];
    reader.read_exact(&mut payload)?;
    Ok(Some(bincode::deserialize(&payload)?))
}

/// Async counterpart of [`write_frame`].
pub async fn write_frame_async<W, T>(writer: &mut W, message: &T) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    writer.write_all(&encode(message)?).await?;
    writer.flush().await?;
    Ok(())
}

/// Async counterpart of [`read_frame`].
pub async fn read_frame_async<R, T>(reader: &mut R) -> Result<Option<T>, ProtocolError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(err) if err.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let mut payload = vec![0u8; check_len(header)?];
    reader.read_exact(&mut payload).await?;
    Ok(Some(bincode::deserialize(&payload)?))
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn frames_carry_length_prefix_and_read_back() {
        let message = MinionMessage::Report {
            id: MutationIdentifier::new("a.A", "m", 1, "OP"),
            pair: StatusTestPair::killed_by(1, "t"),
        };
        let mut buf = Vec::new();
        write_frame(&mut buf, &message).expect("frame should write");
        let declared = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        assert_eq!(declared, buf.len() - 4);

        let mut reader = Cursor::new(buf);
        let decoded: Option<MinionMessage> = read_frame(&mut reader).expect("frame should read");
        assert_eq!(decoded, Some(message));
        let eof: Option<MinionMessage> = read_frame(&mut reader).expect("eof should be clean");
        assert_eq!(eof, None);
    }

    #[test]
    fn oversized_header_is_rejected() {
        let mut bytes = ((MAX_FRAME_LEN + 1) as u32).to_be_bytes().to_vec();
        bytes.extend_from_slice(&[0; 8]);
        let err = read_frame::<_, MinionMessage>(&mut Cursor::new(bytes))
            .expect_err("oversized frame should be rejected");
        assert!(matches!(err, ProtocolError::FrameTooLarge(_)));
    }

    #[test]
    fn truncated_payload_is_an_error() {
        let mut bytes = 10u32.to_be_bytes().to_vec();
        bytes.extend_from_slice(&[1, 2, 3]);
        assert!(read_frame::<_, MinionMessage>(&mut Cursor::new(bytes)).is_err());
    }

    #[test]
    fn exit_codes_map_to_statuses() {
        assert_eq!(ExitCode::Ok.status(), None);
        assert_eq!(
            ExitCode::OutOfMemory.status(),
            Some(DetectionStatus::MemoryError)
        );
        assert_eq!(ExitCode::Timeout.status(), Some(DetectionStatus::TimedOut));
        assert_eq!(
            ExitCode::TestPluginIssue.status(),
            Some(DetectionStatus::RunError)
        );
        for code in [ExitCode::Ok, ExitCode::OutOfMemory, ExitCode::UnknownError, ExitCode::Timeout, ExitCode::TestPluginIssue] {
            assert_eq!(ExitCode::from_code(code.code()), Some(code));
        }
        assert_eq!(ExitCode::from_code(1), None);
    }

    #[tokio::test]
    async fn async_and_blocking_framing_agree() {
        let message = ParentMessage::Assign(UnitAssignment {
            unit_id: 7,
            mutants: vec![MutantAssignment {
                id: MutationIdentifier::new("a.A", "m", 0, "OP"),
                tests: vec![TestSpec::new("t", "true")],
            }],
            full_matrix: true,
        });
        let mut buf = Vec::new();
        write_frame_async(&mut buf, &message)
            .await
            .expect("async frame should write");

        let decoded: Option<ParentMessage> =
            read_frame(&mut Cursor::new(buf)).expect("blocking read should decode");
        assert_eq!(decoded, Some(message));
    }
}
