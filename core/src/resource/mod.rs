//! Resource catalog — identities, descriptors, entities, and the list
//!
//! A resource is identified by a 32-bit id whose upper 16 bits carry the
//! originating peer's client id and whose lower 16 bits are a per-peer
//! counter. Id 0 is the `Anonymous` sentinel for locally derived resources
//! that have not been globally registered yet.

pub mod core;
pub mod entity;
pub mod list;
mod standalone;

pub use self::core::ResCore;
pub use entity::Resource;
pub use list::{ResDelegate, ResList};

use crate::wire::WireError;
use std::fmt;
use thiserror::Error;

/// Globally unique resource id: `client_id << 16 | index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResId(pub u32);

impl ResId {
    /// Sentinel for derived resources that are not globally registered yet.
    pub const ANONYMOUS: ResId = ResId(0);

    pub fn new(client: u16, index: u16) -> Self {
        ResId(u32::from(client) << 16 | u32::from(index))
    }

    /// Originating peer's client id (upper 16 bits).
    pub fn client(self) -> u16 {
        (self.0 >> 16) as u16
    }

    /// Per-peer counter (lower 16 bits).
    pub fn index(self) -> u16 {
        (self.0 & 0xffff) as u16
    }

    pub fn is_anonymous(self) -> bool {
        self == Self::ANONYMOUS
    }
}

impl fmt::Display for ResId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.client(), self.index())
    }
}

/// Resource type; governs materialization policy and loadability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResType {
    /// Only valid in default-constructed cores
    #[default]
    Null,
    Scenario,
    Dynamic,
    Player,
    Definitions,
    /// Never announced as loadable
    System,
    Material,
}

impl ResType {
    pub fn wire_name(self) -> &'static str {
        match self {
            ResType::Null => "",
            ResType::Scenario => "Scenario",
            ResType::Dynamic => "Dynamic",
            ResType::Player => "Player",
            ResType::Definitions => "Definitions",
            ResType::System => "System",
            ResType::Material => "Material",
        }
    }

    pub fn from_wire_name(name: &str) -> Result<Self, WireError> {
        match name {
            "" => Ok(ResType::Null),
            "Scenario" => Ok(ResType::Scenario),
            "Dynamic" => Ok(ResType::Dynamic),
            "Player" => Ok(ResType::Player),
            "Definitions" => Ok(ResType::Definitions),
            "System" => Ok(ResType::System),
            "Material" => Ok(ResType::Material),
            other => Err(WireError::Corrupt(format!("unknown resource type {other:?}"))),
        }
    }
}

impl fmt::Display for ResType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResType::Null => "Null",
            other => other.wire_name(),
        })
    }
}

/// Resource subsystem errors
#[derive(Debug, Error)]
pub enum ResError {
    #[error("corrupt wire data: {0}")]
    Corrupt(#[from] WireError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("archive error: {0}")]
    Archive(String),

    #[error("artifact size {size} exceeds load limit {max}")]
    Oversize { size: u64, max: u64 },

    #[error("checksum mismatch: expected {expected:08x}, got {got:08x}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("resource id space exhausted")]
    IdExhaustion,

    #[error("resource is not loadable")]
    Unloadable,

    #[error("timed out")]
    Timeout,

    #[error("resource has been removed")]
    Removed,

    #[error("no free temporary file name for {0:?}")]
    TempNameExhausted(String),

    #[error("invalid operation: {0}")]
    Invalid(&'static str),

    #[error("standalone creation failed: {0}")]
    Standalone(String),
}

impl From<zip::result::ZipError> for ResError {
    fn from(err: zip::result::ZipError) -> Self {
        match err {
            zip::result::ZipError::Io(io) => ResError::Io(io),
            other => ResError::Archive(other.to_string()),
        }
    }
}
