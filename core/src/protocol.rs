//! Transfer protocol packets
//!
//! Five packet kinds converge every peer toward complete possession:
//! Discover announces which resource ids a peer knows, Status carries a
//! holder's chunk map, Derive announces a freshly registered derivation,
//! Request asks one peer for one chunk, and Data delivers the bytes.
//!
//! Framing: one kind byte followed by the named-field payload.

use crate::chunks::ChunkMap;
use crate::resource::{ResCore, ResId};
use crate::wire::{Reader, WireError, Writer};

/// Packet kind tag (first byte of every encoded packet)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PktKind {
    Discover = 0x01,
    Status = 0x02,
    Derive = 0x03,
    Request = 0x04,
    Data = 0x05,
}

impl PktKind {
    pub fn from_u8(value: u8) -> Result<Self, WireError> {
        match value {
            0x01 => Ok(PktKind::Discover),
            0x02 => Ok(PktKind::Status),
            0x03 => Ok(PktKind::Derive),
            0x04 => Ok(PktKind::Request),
            0x05 => Ok(PktKind::Data),
            other => Err(WireError::UnknownPacket(other)),
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Set of resource ids the sender knows about
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PktDiscover {
    pub ids: Vec<ResId>,
}

impl PktDiscover {
    pub fn contains(&self, id: ResId) -> bool {
        self.ids.contains(&id)
    }

    fn encode(&self, w: &mut Writer) {
        w.uint("DisIDCnt", self.ids.len() as u64, 0);
        for id in &self.ids {
            w.uint("DisID", u64::from(id.0), u64::MAX);
        }
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, WireError> {
        let cnt = r.uint("DisIDCnt", 0)? as usize;
        let mut ids = Vec::with_capacity(cnt.min(1024));
        for _ in 0..cnt {
            ids.push(ResId(r.uint("DisID", u64::MAX)? as u32));
        }
        Ok(Self { ids })
    }
}

/// `(resId, chunkMap)` — a holder's possession state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PktStatus {
    pub res_id: ResId,
    pub chunks: ChunkMap,
}

impl PktStatus {
    fn encode(&self, w: &mut Writer) {
        w.uint("ResID", u64::from(self.res_id.0), 0);
        self.chunks.encode(w);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, WireError> {
        let res_id = ResId(r.uint("ResID", 0)? as u32);
        let chunks = ChunkMap::decode(r)?;
        Ok(Self { res_id, chunks })
    }
}

/// `(resId, chunkIndex)` — ask a peer for one chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PktRequest {
    pub res_id: ResId,
    pub chunk: u32,
}

impl PktRequest {
    fn encode(&self, w: &mut Writer) {
        w.uint("ResID", u64::from(self.res_id.0), 0);
        w.uint("Chunk", u64::from(self.chunk), u64::MAX);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            res_id: ResId(r.uint("ResID", 0)? as u32),
            chunk: r.uint("Chunk", u64::MAX)? as u32,
        })
    }
}

/// `(resId, chunkIndex, bytes)` — one chunk of resource data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResChunk {
    pub res_id: ResId,
    pub chunk: u32,
    pub data: Vec<u8>,
}

impl ResChunk {
    fn encode(&self, w: &mut Writer) {
        w.uint("ResID", u64::from(self.res_id.0), 0);
        w.uint("Chunk", u64::from(self.chunk), u64::MAX);
        w.bytes("Data", &self.data);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            res_id: ResId(r.uint("ResID", 0)? as u32),
            chunk: r.uint("Chunk", u64::MAX)? as u32,
            data: r.bytes("Data")?,
        })
    }
}

/// A framed resource packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResPacket {
    Discover(PktDiscover),
    Status(PktStatus),
    Derive(ResCore),
    Request(PktRequest),
    Data(ResChunk),
}

impl ResPacket {
    pub fn kind(&self) -> PktKind {
        match self {
            ResPacket::Discover(_) => PktKind::Discover,
            ResPacket::Status(_) => PktKind::Status,
            ResPacket::Derive(_) => PktKind::Derive,
            ResPacket::Request(_) => PktKind::Request,
            ResPacket::Data(_) => PktKind::Data,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::new();
        match self {
            ResPacket::Discover(pkt) => pkt.encode(&mut w),
            ResPacket::Status(pkt) => pkt.encode(&mut w),
            ResPacket::Derive(core) => core.encode(&mut w),
            ResPacket::Request(pkt) => pkt.encode(&mut w),
            ResPacket::Data(chunk) => chunk.encode(&mut w),
        }
        let mut buf = Vec::with_capacity(1);
        buf.push(self.kind().as_u8());
        buf.extend_from_slice(&w.into_bytes());
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, WireError> {
        let (&kind, rest) = data.split_first().ok_or(WireError::BufferTooShort {
            need: 1,
            got: 0,
        })?;
        let mut r = Reader::new(rest);
        match PktKind::from_u8(kind)? {
            PktKind::Discover => Ok(ResPacket::Discover(PktDiscover::decode(&mut r)?)),
            PktKind::Status => Ok(ResPacket::Status(PktStatus::decode(&mut r)?)),
            PktKind::Derive => Ok(ResPacket::Derive(ResCore::decode(&mut r)?)),
            PktKind::Request => Ok(ResPacket::Request(PktRequest::decode(&mut r)?)),
            PktKind::Data => Ok(ResPacket::Data(ResChunk::decode(&mut r)?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ResType;

    fn roundtrip(pkt: &ResPacket) -> ResPacket {
        ResPacket::from_bytes(&pkt.to_bytes()).unwrap()
    }

    #[test]
    fn test_kind_bytes() {
        assert_eq!(PktKind::Discover.as_u8(), 0x01);
        assert_eq!(PktKind::Data.as_u8(), 0x05);
        assert_eq!(PktKind::from_u8(0x04).unwrap(), PktKind::Request);
        assert!(matches!(
            PktKind::from_u8(0x7f),
            Err(WireError::UnknownPacket(0x7f))
        ));
    }

    #[test]
    fn test_discover_roundtrip() {
        let pkt = ResPacket::Discover(PktDiscover {
            ids: vec![ResId::new(1, 1), ResId::new(1, 2), ResId::new(3, 9)],
        });
        assert_eq!(roundtrip(&pkt), pkt);
    }

    #[test]
    fn test_discover_empty() {
        let pkt = ResPacket::Discover(PktDiscover::default());
        assert_eq!(roundtrip(&pkt), pkt);
    }

    #[test]
    fn test_status_roundtrip() {
        let mut chunks = ChunkMap::incomplete(12);
        chunks.add_range(0, 3);
        chunks.add_chunk(7);
        let pkt = ResPacket::Status(PktStatus {
            res_id: ResId::new(2, 4),
            chunks,
        });
        assert_eq!(roundtrip(&pkt), pkt);
    }

    #[test]
    fn test_derive_roundtrip() {
        let mut core = ResCore::new(ResType::Dynamic, ResId::new(1, 8), "state.dat", 5, "");
        core.set_derived(ResId::new(1, 5));
        core.set_loadable(4096, 0xfeed);
        let pkt = ResPacket::Derive(core);
        assert_eq!(roundtrip(&pkt), pkt);
    }

    #[test]
    fn test_request_roundtrip() {
        let pkt = ResPacket::Request(PktRequest {
            res_id: ResId::new(1, 1),
            chunk: 0,
        });
        assert_eq!(roundtrip(&pkt), pkt);
    }

    #[test]
    fn test_data_roundtrip() {
        let pkt = ResPacket::Data(ResChunk {
            res_id: ResId::new(1, 1),
            chunk: 2,
            data: vec![0xaa; 1000],
        });
        assert_eq!(roundtrip(&pkt), pkt);
    }

    #[test]
    fn test_empty_buffer_rejected() {
        assert!(ResPacket::from_bytes(&[]).is_err());
    }

    #[test]
    fn test_truncated_packet_rejected() {
        let pkt = ResPacket::Data(ResChunk {
            res_id: ResId::new(1, 1),
            chunk: 0,
            data: vec![1, 2, 3, 4],
        });
        let bytes = pkt.to_bytes();
        assert!(ResPacket::from_bytes(&bytes[..bytes.len() - 3]).is_err());
    }
}
