use super::codec::ProtocolError;
use std::fmt;

/// Request command codes. Client and worker must agree on these values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Command {
    /// `key` → bool. On a map-set, tests the key; on a triple set takes
    /// `first, second, third`.
    Contains = 1,
    /// `key, value` → bool (map-set only).
    ContainsEntry = 2,
    IsEmpty = 3,
    /// `key` (sets), `key, value` (map-sets) or three fields (triple sets)
    /// → bool, true when newly added.
    Add = 4,
    /// Records, flattened into fields → number of newly added records.
    AddAll = 5,
    /// `key`, `key, value` or three fields → bool.
    Remove = 6,
    Clear = 7,
    Size = 8,
    /// `key` → stream of values (map-set only).
    Get = 9,
    /// Stream of every record on the shard. A triple set accepts a one- or
    /// two-field prefix.
    Scan = 10,
    /// Serialized membership filter, or no argument when the shard has none.
    Filter = 11,
    /// `path, approx_records, false_positive_rate` → bool.
    Load = 12,
    Ping = 13,
    /// `record…` → bool, true when the shard dropped anything (dynamic sets).
    RetainAll = 14,
    /// Acknowledged, then the shard stops serving.
    Kill = 255,
}

impl Command {
    pub fn code(self) -> u32 {
        self as u32
    }
}

impl TryFrom<u32> for Command {
    type Error = u32;

    fn try_from(code: u32) -> Result<Self, Self::Error> {
        let command = match code {
            1 => Command::Contains,
            2 => Command::ContainsEntry,
            3 => Command::IsEmpty,
            4 => Command::Add,
            5 => Command::AddAll,
            6 => Command::Remove,
            7 => Command::Clear,
            8 => Command::Size,
            9 => Command::Get,
            10 => Command::Scan,
            11 => Command::Filter,
            12 => Command::Load,
            13 => Command::Ping,
            14 => Command::RetainAll,
            255 => Command::Kill,
            other => return Err(other),
        };
        Ok(command)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.code())
    }
}

/// Response acknowledgment codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum AckCode {
    Ok = 10,
    Stream = 11,
    Error = 12,
}

impl AckCode {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            10 => Some(AckCode::Ok),
            11 => Some(AckCode::Stream),
            12 => Some(AckCode::Error),
            _ => None,
        }
    }
}

/// A decoded client request. The raw code is kept so a worker can answer
/// unknown commands without dropping the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub code: u32,
    pub args: Vec<String>,
}

impl Request {
    pub fn new(command: Command, args: Vec<String>) -> Self {
        Self {
            code: command.code(),
            args,
        }
    }

    pub fn bare(command: Command) -> Self {
        Self::new(command, Vec::new())
    }

    pub fn command(&self) -> Result<Command, u32> {
        Command::try_from(self.code)
    }
}

/// A single (non-streaming) response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub ack: AckCode,
    pub args: Vec<Vec<u8>>,
}

impl Response {
    pub fn ok(args: Vec<Vec<u8>>) -> Self {
        Self {
            ack: AckCode::Ok,
            args,
        }
    }

    pub fn empty() -> Self {
        Self::ok(Vec::new())
    }

    pub fn from_bool(value: bool) -> Self {
        Self::ok(vec![value.to_string().into_bytes()])
    }

    pub fn from_u64(value: u64) -> Self {
        Self::ok(vec![value.to_string().into_bytes()])
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ack: AckCode::Error,
            args: vec![message.into().into_bytes()],
        }
    }

    /// Expects exactly `count` arguments.
    pub fn expect_args(&self, count: usize) -> Result<(), ProtocolError> {
        if self.args.len() != count {
            return Err(ProtocolError::ArgCount {
                expected: count,
                got: self.args.len(),
            });
        }
        Ok(())
    }

    pub fn text(&self, index: usize) -> Result<&str, ProtocolError> {
        let raw = self.args.get(index).ok_or(ProtocolError::ArgCount {
            expected: index + 1,
            got: self.args.len(),
        })?;
        std::str::from_utf8(raw).map_err(|_| ProtocolError::InvalidUtf8)
    }

    pub fn as_bool(&self) -> Result<bool, ProtocolError> {
        self.expect_args(1)?;
        match self.text(0)? {
            "true" => Ok(true),
            "false" => Ok(false),
            other => Err(ProtocolError::BadValue(format!("expected a boolean, got {:?}", other))),
        }
    }

    pub fn as_u64(&self) -> Result<u64, ProtocolError> {
        self.expect_args(1)?;
        let text = self.text(0)?;
        text.parse::<u64>()
            .map_err(|_| ProtocolError::BadValue(format!("expected an integer, got {:?}", text)))
    }
}
