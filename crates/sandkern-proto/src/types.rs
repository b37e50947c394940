// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Shared value types exchanged across the syscall boundary

use serde::{Deserialize, Serialize};

/// Process-local file descriptor index
pub type Fd = u32;

pub const STDIN: Fd = 0;
pub const STDOUT: Fd = 1;
pub const STDERR: Fd = 2;

/// Process identifier
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Pid(pub u32);

impl Pid {
    pub fn as_usize(&self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for Pid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Access requested when opening a descriptor
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AccessFlag {
    #[default]
    None,
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl AccessFlag {
    pub fn allows_read(&self) -> bool {
        matches!(self, AccessFlag::ReadOnly | AccessFlag::ReadWrite)
    }

    pub fn allows_write(&self) -> bool {
        matches!(self, AccessFlag::WriteOnly | AccessFlag::ReadWrite)
    }

    /// Derive the access flag granted by an entry's attribute tuple
    pub fn from_attributes(attributes: Attributes) -> Self {
        match (attributes.read, attributes.write) {
            (true, true) => AccessFlag::ReadWrite,
            (true, false) => AccessFlag::ReadOnly,
            (false, true) => AccessFlag::WriteOnly,
            (false, false) => AccessFlag::None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StatusFlag {
    #[default]
    Normal,
    Append,
    Create,
}

/// How `open` materializes the entry behind a descriptor
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OpenType {
    #[default]
    Normal,
    Functional,
    Virtual,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryType {
    Directory,
    File,
    FunctionalFile,
}

/// Operation named by an `OperationInaccessible` failure
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Read,
    Write,
    Execute,
    Create,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::Read => write!(f, "read"),
            Operation::Write => write!(f, "write"),
            Operation::Execute => write!(f, "execute"),
            Operation::Create => write!(f, "create"),
        }
    }
}

/// Read, write, execute
///
/// Serialized as a 3-tuple of booleans.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "(bool, bool, bool)", into = "(bool, bool, bool)")]
pub struct Attributes {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
}

impl Attributes {
    pub const ALL: Attributes = Attributes::new(true, true, true);
    pub const READ_EXECUTE: Attributes = Attributes::new(true, false, true);
    pub const READ_WRITE: Attributes = Attributes::new(true, true, false);

    pub const fn new(read: bool, write: bool, execute: bool) -> Self {
        Self {
            read,
            write,
            execute,
        }
    }
}

impl From<(bool, bool, bool)> for Attributes {
    fn from((read, write, execute): (bool, bool, bool)) -> Self {
        Self::new(read, write, execute)
    }
}

impl From<Attributes> for (bool, bool, bool) {
    fn from(a: Attributes) -> Self {
        (a.read, a.write, a.execute)
    }
}

impl std::fmt::Display for Attributes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}{}{}",
            if self.read { 'R' } else { '-' },
            if self.write { 'W' } else { '-' },
            if self.execute { 'X' } else { '-' }
        )
    }
}

/// Value snapshot of a filesystem entry as returned by `readdir`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryInfo {
    #[serde(rename = "type")]
    pub kind: EntryType,
    pub name: String,
    pub attributes: Attributes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entries: Option<Vec<EntryInfo>>,
}

/// Reply payload of `processInit`: the confirmed pid and launch parameters
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessLaunch {
    pub pid: Pid,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

/// Byte count argument of `read`/`write`; `-1` on the wire means "all available"
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum ByteCount {
    All,
    Exactly(usize),
}

impl ByteCount {
    /// Clamp the count against an available length
    pub fn within(&self, available: usize) -> usize {
        match self {
            ByteCount::All => available,
            ByteCount::Exactly(n) => (*n).min(available),
        }
    }
}

impl TryFrom<i64> for ByteCount {
    type Error = String;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            -1 => Ok(ByteCount::All),
            n if n >= 0 => Ok(ByteCount::Exactly(n as usize)),
            n => Err(format!("invalid byte count: {}", n)),
        }
    }
}

impl From<ByteCount> for i64 {
    fn from(count: ByteCount) -> Self {
        match count {
            ByteCount::All => -1,
            ByteCount::Exactly(n) => n as i64,
        }
    }
}
