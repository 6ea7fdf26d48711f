//! Task protocol message schemas and encoding.
//!
//! Everything host, dispatcher, and daemons exchange travels inside the
//! crc32c frame from [`crate::transport::frame`]. Hot-path envelopes
//! (task, reply, control) are hand-rolled little-endian binary; the
//! configuration-bearing handshake frames are JSON, where schema
//! evolution matters more than bytes.

use bytes::Buf;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::serial::SerialConfig;
use crate::tls::TlsMaterial;

pub const PROTOCOL_VERSION: u32 = 1;

/// In-band instruction to a daemon to terminate cleanly after its
/// current task. Fixed 27-byte payload so it is recognizable without
/// decoding.
pub const EXIT_SENTINEL: &[u8; 27] = b"XTMEXIT:drain-and-shutdown\0";

const TAG_HELLO: u8 = 0x01;
const TAG_TASK: u8 = 0x02;
const TAG_REPLY: u8 = 0x03;
const TAG_CONTROL: u8 = 0x04;
const TAG_CONTROL_REPLY: u8 = 0x05;
const TAG_HANDSHAKE: u8 = 0x06;
const TAG_HANDSHAKE_REPLY: u8 = 0x07;

const CONTROL_REPLY_STATUS: u8 = 0;
const CONTROL_REPLY_CANCELLED: u8 = 1;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("message truncated")]
    Truncated,
    #[error("unknown message tag {0:#04x}")]
    UnknownTag(u8),
    #[error("unknown reply status {0}")]
    UnknownStatus(u8),
    #[error("unknown control reply kind {0}")]
    UnknownControlReply(u8),
    #[error("trailing bytes after message")]
    TrailingBytes,
    #[error("handshake json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Outcome of a task as carried on the wire. The connection-reset code
/// is 19, which is also the error code surfaced to the collecting
/// client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplyStatus {
    Ok = 0,
    UserError = 1,
    Cancelled = 2,
    Timeout = 3,
    ConnectionReset = 19,
}

impl ReplyStatus {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Result<Self, ProtoError> {
        match code {
            0 => Ok(ReplyStatus::Ok),
            1 => Ok(ReplyStatus::UserError),
            2 => Ok(ReplyStatus::Cancelled),
            3 => Ok(ReplyStatus::Timeout),
            19 => Ok(ReplyStatus::ConnectionReset),
            other => Err(ProtoError::UnknownStatus(other)),
        }
    }
}

/// Sent by a daemon immediately after dialing in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hello {
    /// Stable identifier reported in connect/disconnect events.
    pub daemon_id: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskEnvelope {
    pub task_id: u32,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyEnvelope {
    pub task_id: u32,
    pub status: ReplyStatus,
    pub payload: Vec<u8>,
}

/// Host → dispatcher command: `(0, 0)` queries status, `(task_id, 0)`
/// cancels before dispatch, `(task_id, 1)` force-cancels an executing
/// task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlFrame {
    pub cmd: u32,
    pub flag: u32,
}

impl ControlFrame {
    pub const STATUS: ControlFrame = ControlFrame { cmd: 0, flag: 0 };

    pub fn cancel(task_id: u32, force: bool) -> Self {
        ControlFrame {
            cmd: task_id,
            flag: u32::from(force),
        }
    }

    pub fn is_status(&self) -> bool {
        self.cmd == 0
    }

    pub fn is_force(&self) -> bool {
        self.flag != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub connections: u32,
    pub awaiting: u32,
    pub executing: u32,
    /// Signed daemon ids: `+id` connect, `-id` disconnect, since the
    /// previous status query.
    pub events: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlReply {
    Status(StatusReport),
    Cancelled(bool),
}

/// Configuration pushed to the dispatcher after it dials the host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Handshake {
    /// Capability names daemons preload before serving tasks.
    #[serde(default)]
    pub preload: Vec<String>,
    #[serde(default)]
    pub tls: Option<TlsMaterial>,
    #[serde(default)]
    pub tls_password: Option<String>,
    #[serde(default)]
    pub serial: SerialConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandshakeReply {
    /// Resolved daemon dial-in URL (wildcard port already substituted).
    pub daemon_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Hello(Hello),
    Task(TaskEnvelope),
    Reply(ReplyEnvelope),
    Control(ControlFrame),
    ControlReply(ControlReply),
    Handshake(Box<Handshake>),
    HandshakeReply(HandshakeReply),
    Exit,
}

pub fn encode(msg: &Message) -> Result<Vec<u8>, ProtoError> {
    let mut out = Vec::new();
    match msg {
        Message::Hello(hello) => {
            out.push(TAG_HELLO);
            match hello.daemon_id {
                Some(id) => {
                    out.push(1);
                    out.extend_from_slice(&id.to_le_bytes());
                }
                None => out.push(0),
            }
        }
        Message::Task(task) => {
            out.push(TAG_TASK);
            out.extend_from_slice(&task.task_id.to_le_bytes());
            put_bytes(&mut out, &task.payload);
        }
        Message::Reply(reply) => {
            out.push(TAG_REPLY);
            out.extend_from_slice(&reply.task_id.to_le_bytes());
            out.push(reply.status.code());
            put_bytes(&mut out, &reply.payload);
        }
        Message::Control(control) => {
            out.push(TAG_CONTROL);
            out.extend_from_slice(&control.cmd.to_le_bytes());
            out.extend_from_slice(&control.flag.to_le_bytes());
        }
        Message::ControlReply(reply) => {
            out.push(TAG_CONTROL_REPLY);
            match reply {
                ControlReply::Status(report) => {
                    out.push(CONTROL_REPLY_STATUS);
                    out.extend_from_slice(&report.connections.to_le_bytes());
                    out.extend_from_slice(&report.awaiting.to_le_bytes());
                    out.extend_from_slice(&report.executing.to_le_bytes());
                    let count =
                        u32::try_from(report.events.len()).map_err(|_| ProtoError::Truncated)?;
                    out.extend_from_slice(&count.to_le_bytes());
                    for event in &report.events {
                        out.extend_from_slice(&event.to_le_bytes());
                    }
                }
                ControlReply::Cancelled(hit) => {
                    out.push(CONTROL_REPLY_CANCELLED);
                    out.push(u8::from(*hit));
                }
            }
        }
        Message::Handshake(handshake) => {
            out.push(TAG_HANDSHAKE);
            out.extend_from_slice(&serde_json::to_vec(handshake)?);
        }
        Message::HandshakeReply(reply) => {
            out.push(TAG_HANDSHAKE_REPLY);
            out.extend_from_slice(&serde_json::to_vec(reply)?);
        }
        Message::Exit => {
            out.extend_from_slice(EXIT_SENTINEL);
        }
    }
    Ok(out)
}

pub fn decode(payload: &[u8]) -> Result<Message, ProtoError> {
    if payload == EXIT_SENTINEL {
        return Ok(Message::Exit);
    }

    let mut buf = payload;
    let tag = get_u8(&mut buf)?;
    let msg = match tag {
        TAG_HELLO => {
            let has_id = get_u8(&mut buf)?;
            let daemon_id = if has_id != 0 {
                Some(get_u32(&mut buf)?)
            } else {
                None
            };
            Message::Hello(Hello { daemon_id })
        }
        TAG_TASK => {
            let task_id = get_u32(&mut buf)?;
            let payload = get_bytes(&mut buf)?;
            Message::Task(TaskEnvelope { task_id, payload })
        }
        TAG_REPLY => {
            let task_id = get_u32(&mut buf)?;
            let status = ReplyStatus::from_code(get_u8(&mut buf)?)?;
            let payload = get_bytes(&mut buf)?;
            Message::Reply(ReplyEnvelope {
                task_id,
                status,
                payload,
            })
        }
        TAG_CONTROL => {
            let cmd = get_u32(&mut buf)?;
            let flag = get_u32(&mut buf)?;
            Message::Control(ControlFrame { cmd, flag })
        }
        TAG_CONTROL_REPLY => {
            let kind = get_u8(&mut buf)?;
            match kind {
                CONTROL_REPLY_STATUS => {
                    let connections = get_u32(&mut buf)?;
                    let awaiting = get_u32(&mut buf)?;
                    let executing = get_u32(&mut buf)?;
                    let count = get_u32(&mut buf)? as usize;
                    let mut events = Vec::with_capacity(count.min(4096));
                    for _ in 0..count {
                        events.push(get_i64(&mut buf)?);
                    }
                    Message::ControlReply(ControlReply::Status(StatusReport {
                        connections,
                        awaiting,
                        executing,
                        events,
                    }))
                }
                CONTROL_REPLY_CANCELLED => {
                    let hit = get_u8(&mut buf)? != 0;
                    Message::ControlReply(ControlReply::Cancelled(hit))
                }
                other => return Err(ProtoError::UnknownControlReply(other)),
            }
        }
        TAG_HANDSHAKE => {
            let handshake: Handshake = serde_json::from_slice(buf)?;
            return Ok(Message::Handshake(Box::new(handshake)));
        }
        TAG_HANDSHAKE_REPLY => {
            let reply: HandshakeReply = serde_json::from_slice(buf)?;
            return Ok(Message::HandshakeReply(reply));
        }
        other => return Err(ProtoError::UnknownTag(other)),
    };

    if buf.has_remaining() {
        return Err(ProtoError::TrailingBytes);
    }
    Ok(msg)
}

fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    let len = bytes.len() as u32;
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(bytes);
}

fn get_u8(buf: &mut &[u8]) -> Result<u8, ProtoError> {
    if buf.remaining() < 1 {
        return Err(ProtoError::Truncated);
    }
    Ok(buf.get_u8())
}

fn get_u32(buf: &mut &[u8]) -> Result<u32, ProtoError> {
    if buf.remaining() < 4 {
        return Err(ProtoError::Truncated);
    }
    Ok(buf.get_u32_le())
}

fn get_i64(buf: &mut &[u8]) -> Result<i64, ProtoError> {
    if buf.remaining() < 8 {
        return Err(ProtoError::Truncated);
    }
    Ok(buf.get_i64_le())
}

fn get_bytes(buf: &mut &[u8]) -> Result<Vec<u8>, ProtoError> {
    let len = get_u32(buf)? as usize;
    if buf.remaining() < len {
        return Err(ProtoError::Truncated);
    }
    let bytes = buf[..len].to_vec();
    buf.advance(len);
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: Message) -> Message {
        let bytes = encode(&msg).unwrap();
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded, msg);
        decoded
    }

    #[test]
    fn exit_sentinel_is_exactly_27_bytes() {
        assert_eq!(EXIT_SENTINEL.len(), 27);
        assert_eq!(encode(&Message::Exit).unwrap(), EXIT_SENTINEL.to_vec());
        assert_eq!(decode(EXIT_SENTINEL).unwrap(), Message::Exit);
    }

    #[test]
    fn task_and_reply_envelopes() {
        roundtrip(Message::Task(TaskEnvelope {
            task_id: 7,
            payload: b"sleep 50".to_vec(),
        }));
        roundtrip(Message::Reply(ReplyEnvelope {
            task_id: 7,
            status: ReplyStatus::UserError,
            payload: b"boom".to_vec(),
        }));
    }

    #[test]
    fn connection_reset_status_is_code_19() {
        assert_eq!(ReplyStatus::ConnectionReset.code(), 19);
        assert_eq!(
            ReplyStatus::from_code(19).unwrap(),
            ReplyStatus::ConnectionReset
        );
        assert!(matches!(
            ReplyStatus::from_code(7),
            Err(ProtoError::UnknownStatus(7))
        ));
    }

    #[test]
    fn control_frames() {
        assert!(ControlFrame::STATUS.is_status());
        let cancel = ControlFrame::cancel(42, false);
        assert!(!cancel.is_status());
        assert!(!cancel.is_force());
        assert!(ControlFrame::cancel(42, true).is_force());

        roundtrip(Message::Control(cancel));
        roundtrip(Message::ControlReply(ControlReply::Cancelled(true)));
        roundtrip(Message::ControlReply(ControlReply::Status(StatusReport {
            connections: 2,
            awaiting: 1,
            executing: 2,
            events: vec![3, -3, 5],
        })));
    }

    #[test]
    fn hello_with_and_without_id() {
        roundtrip(Message::Hello(Hello { daemon_id: None }));
        roundtrip(Message::Hello(Hello { daemon_id: Some(9) }));
    }

    #[test]
    fn handshake_frames_are_json() {
        let handshake = Handshake {
            preload: vec!["compress".into()],
            tls: None,
            tls_password: None,
            serial: SerialConfig::default(),
        };
        let bytes = encode(&Message::Handshake(Box::new(handshake.clone()))).unwrap();
        // Tag byte, then a JSON object a future version can extend.
        assert_eq!(bytes[1], b'{');
        assert_eq!(
            decode(&bytes).unwrap(),
            Message::Handshake(Box::new(handshake))
        );

        roundtrip(Message::HandshakeReply(HandshakeReply {
            daemon_url: "tcp://127.0.0.1:40123".into(),
        }));
    }

    #[test]
    fn truncated_and_trailing_inputs_are_rejected() {
        let bytes = encode(&Message::Task(TaskEnvelope {
            task_id: 1,
            payload: b"abc".to_vec(),
        }))
        .unwrap();
        assert!(matches!(
            decode(&bytes[..bytes.len() - 1]),
            Err(ProtoError::Truncated)
        ));

        let mut padded = bytes.clone();
        padded.push(0);
        assert!(matches!(decode(&padded), Err(ProtoError::TrailingBytes)));

        assert!(matches!(decode(&[0xee]), Err(ProtoError::UnknownTag(0xee))));
    }
}
