// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Syscall envelopes and typed request/response schema
//!
//! On the channel every message is an [`Envelope`]:
//!
//! - request: `{ "type": "kernel.syscall.<name>", "data": [token, correlationId, ...args] }`
//! - response: `{ "type": "kernel.syscall.<name>", "data": [correlationId, outcome] }`
//!
//! `processInit` requests carry only `[token, correlationId]`. Envelopes are
//! decoded into closed enums here so the kernel never sees untyped arguments.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ProtoError, SyscallError};
use crate::types::{AccessFlag, ByteCount, Fd, OpenType, StatusFlag};

pub const SYSCALL_PREFIX: &str = "kernel.syscall.";

/// Raw message as it travels over the channel
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Vec<Value>,
}

impl Envelope {
    pub fn new(name: SyscallName, data: Vec<Value>) -> Self {
        Self {
            kind: format!("{}{}", SYSCALL_PREFIX, name.as_str()),
            data,
        }
    }

    /// Extract the syscall name from the `type` field
    pub fn syscall_name(&self) -> Result<SyscallName, ProtoError> {
        let name = self
            .kind
            .strip_prefix(SYSCALL_PREFIX)
            .ok_or_else(|| ProtoError::NotASyscall(self.kind.clone()))?;
        name.parse()
    }

    /// Build a response envelope for the given correlation id
    pub fn response<T: Serialize>(
        name: SyscallName,
        correlation_id: u64,
        outcome: &Outcome<T>,
    ) -> Result<Self, ProtoError> {
        Ok(Self::new(
            name,
            vec![Value::from(correlation_id), serde_json::to_value(outcome)?],
        ))
    }
}

/// Closed set of syscalls
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SyscallName {
    ProcessInit,
    Open,
    Close,
    Read,
    Write,
    Opendir,
    Readdir,
    Exec,
}

impl SyscallName {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyscallName::ProcessInit => "processInit",
            SyscallName::Open => "open",
            SyscallName::Close => "close",
            SyscallName::Read => "read",
            SyscallName::Write => "write",
            SyscallName::Opendir => "opendir",
            SyscallName::Readdir => "readdir",
            SyscallName::Exec => "exec",
        }
    }
}

impl std::fmt::Display for SyscallName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SyscallName {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processInit" => Ok(SyscallName::ProcessInit),
            "open" => Ok(SyscallName::Open),
            "close" => Ok(SyscallName::Close),
            "read" => Ok(SyscallName::Read),
            "write" => Ok(SyscallName::Write),
            "opendir" => Ok(SyscallName::Opendir),
            "readdir" => Ok(SyscallName::Readdir),
            "exec" => Ok(SyscallName::Exec),
            other => Err(ProtoError::UnknownSyscall(other.to_string())),
        }
    }
}

/// Typed syscall arguments
#[derive(Clone, Debug, PartialEq)]
pub enum SyscallRequest {
    Open {
        path: String,
        access: AccessFlag,
        status: StatusFlag,
        kind: OpenType,
    },
    Close {
        handle: Fd,
    },
    Read {
        handle: Fd,
        count: ByteCount,
        offset: u64,
    },
    Write {
        handle: Fd,
        buffer: Vec<u8>,
        count: ByteCount,
        offset: u64,
    },
    Opendir {
        path: String,
    },
    Readdir {
        handle: Fd,
    },
    Exec {
        path: String,
        args: Vec<String>,
        env: Vec<(String, String)>,
    },
}

impl SyscallRequest {
    pub fn name(&self) -> SyscallName {
        match self {
            SyscallRequest::Open { .. } => SyscallName::Open,
            SyscallRequest::Close { .. } => SyscallName::Close,
            SyscallRequest::Read { .. } => SyscallName::Read,
            SyscallRequest::Write { .. } => SyscallName::Write,
            SyscallRequest::Opendir { .. } => SyscallName::Opendir,
            SyscallRequest::Readdir { .. } => SyscallName::Readdir,
            SyscallRequest::Exec { .. } => SyscallName::Exec,
        }
    }

    fn arguments(&self) -> Result<Vec<Value>, serde_json::Error> {
        use serde_json::to_value as v;
        Ok(match self {
            SyscallRequest::Open {
                path,
                access,
                status,
                kind,
            } => vec![v(path)?, v(access)?, v(status)?, v(kind)?],
            SyscallRequest::Close { handle } => vec![v(handle)?],
            SyscallRequest::Read {
                handle,
                count,
                offset,
            } => vec![v(handle)?, v(count)?, v(offset)?],
            SyscallRequest::Write {
                handle,
                buffer,
                count,
                offset,
            } => vec![v(handle)?, v(buffer)?, v(count)?, v(offset)?],
            SyscallRequest::Opendir { path } => vec![v(path)?],
            SyscallRequest::Readdir { handle } => vec![v(handle)?],
            SyscallRequest::Exec { path, args, env } => vec![v(path)?, v(args)?, v(env)?],
        })
    }

    /// Wrap the request in an envelope addressed with the caller's token
    pub fn to_envelope(&self, token: &str, correlation_id: u64) -> Result<Envelope, ProtoError> {
        let mut data = vec![Value::from(token), Value::from(correlation_id)];
        data.extend(self.arguments()?);
        Ok(Envelope::new(self.name(), data))
    }

    fn decode(name: SyscallName, args: &[Value]) -> Result<Self, ProtoError> {
        let a = Arguments {
            syscall: name.as_str(),
            values: args,
        };
        Ok(match name {
            SyscallName::Open => SyscallRequest::Open {
                path: a.get(0)?,
                access: a.get(1)?,
                status: a.get(2)?,
                kind: a.get(3)?,
            },
            SyscallName::Close => SyscallRequest::Close { handle: a.get(0)? },
            SyscallName::Read => SyscallRequest::Read {
                handle: a.get(0)?,
                count: a.get(1)?,
                offset: a.get(2)?,
            },
            SyscallName::Write => SyscallRequest::Write {
                handle: a.get(0)?,
                buffer: a.get(1)?,
                count: a.get(2)?,
                offset: a.get(3)?,
            },
            SyscallName::Opendir => SyscallRequest::Opendir { path: a.get(0)? },
            SyscallName::Readdir => SyscallRequest::Readdir { handle: a.get(0)? },
            SyscallName::Exec => SyscallRequest::Exec {
                path: a.get(0)?,
                args: a.get_or_default(1)?,
                env: a.get_or_default(2)?,
            },
            SyscallName::ProcessInit => {
                return Err(ProtoError::UnknownSyscall(name.as_str().to_string()));
            }
        })
    }
}

/// Positional argument accessor with per-index error reporting
struct Arguments<'a> {
    syscall: &'static str,
    values: &'a [Value],
}

impl Arguments<'_> {
    fn get<T: DeserializeOwned>(&self, index: usize) -> Result<T, ProtoError> {
        let value = self.values.get(index).ok_or(ProtoError::MissingArgument {
            syscall: self.syscall,
            index,
        })?;
        serde_json::from_value(value.clone()).map_err(|source| ProtoError::InvalidArgument {
            syscall: self.syscall,
            index,
            source,
        })
    }

    fn get_or_default<T: DeserializeOwned + Default>(&self, index: usize) -> Result<T, ProtoError> {
        match self.values.get(index) {
            None | Some(Value::Null) => Ok(T::default()),
            Some(_) => self.get(index),
        }
    }
}

/// A decoded kernel-bound message
#[derive(Clone, Debug, PartialEq)]
pub enum InboundPacket {
    /// Bootstrap handshake announcing an execution context
    ProcessInit { token: String, correlation_id: u64 },
    Syscall {
        token: String,
        correlation_id: u64,
        request: SyscallRequest,
    },
}

/// Leading fields every kernel-bound message carries before its arguments
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PacketHeader {
    pub name: SyscallName,
    pub token: String,
    pub correlation_id: u64,
}

impl PacketHeader {
    pub fn decode(envelope: &Envelope) -> Result<Self, ProtoError> {
        let name = envelope.syscall_name()?;
        let header = Arguments {
            syscall: name.as_str(),
            values: &envelope.data,
        };
        Ok(Self {
            name,
            token: header.get(0)?,
            correlation_id: header.get(1)?,
        })
    }
}

impl InboundPacket {
    pub fn decode(envelope: &Envelope) -> Result<Self, ProtoError> {
        let header = PacketHeader::decode(envelope)?;
        Self::decode_with_header(header, envelope)
    }

    /// Decode the arguments of a message whose header is already known
    pub fn decode_with_header(header: PacketHeader, envelope: &Envelope) -> Result<Self, ProtoError> {
        let PacketHeader {
            name,
            token,
            correlation_id,
        } = header;
        match name {
            SyscallName::ProcessInit => Ok(InboundPacket::ProcessInit {
                token,
                correlation_id,
            }),
            other => {
                let args = envelope.data.get(2..).unwrap_or(&[]);
                Ok(InboundPacket::Syscall {
                    token,
                    correlation_id,
                    request: SyscallRequest::decode(other, args)?,
                })
            }
        }
    }

    pub fn correlation_id(&self) -> u64 {
        match self {
            InboundPacket::ProcessInit { correlation_id, .. } => *correlation_id,
            InboundPacket::Syscall { correlation_id, .. } => *correlation_id,
        }
    }
}

/// Build the bootstrap envelope sent by a freshly created context
pub fn process_init_envelope(token: &str, correlation_id: u64) -> Envelope {
    Envelope::new(
        SyscallName::ProcessInit,
        vec![Value::from(token), Value::from(correlation_id)],
    )
}

/// Success payload or wire error
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome<T> {
    Ok(T),
    Err(SyscallError),
}

impl<T> Outcome<T> {
    pub fn into_result(self) -> Result<T, SyscallError> {
        match self {
            Outcome::Ok(value) => Ok(value),
            Outcome::Err(error) => Err(error),
        }
    }
}

impl<T> From<Result<T, SyscallError>> for Outcome<T> {
    fn from(result: Result<T, SyscallError>) -> Self {
        match result {
            Ok(value) => Outcome::Ok(value),
            Err(error) => Outcome::Err(error),
        }
    }
}

/// A decoded context-bound response, payload still untyped until the caller
/// applies the type it expects for its own pending call
#[derive(Clone, Debug, PartialEq)]
pub struct ResponsePacket {
    pub name: SyscallName,
    pub correlation_id: u64,
    pub payload: Value,
}

impl ResponsePacket {
    pub fn decode(envelope: &Envelope) -> Result<Self, ProtoError> {
        let name = envelope.syscall_name()?;
        let header = Arguments {
            syscall: name.as_str(),
            values: &envelope.data,
        };
        Ok(Self {
            name,
            correlation_id: header.get(0)?,
            payload: envelope.data.get(1).cloned().unwrap_or(Value::Null),
        })
    }

    pub fn outcome<T: DeserializeOwned>(self) -> Result<Outcome<T>, ProtoError> {
        Ok(serde_json::from_value(self.payload)?)
    }
}
