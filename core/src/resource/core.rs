//! Resource core — the announce-time descriptor and canonical wire identity
//!
//! Two resources with identical file CRC are considered bit-equal. The
//! `loadable` flag gates the presence of size, file CRC, and chunk size on
//! the wire; the contents CRC is a content-only hash that survives
//! repackaging and is what remote peers match local files against.

use super::{ResId, ResType};
use crate::config::DEFAULT_CHUNK_SIZE;
use crate::wire::{Reader, WireError, Writer};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResCore {
    res_type: ResType,
    id: ResId,
    der_id: Option<ResId>,
    loadable: bool,
    file_size: u32,
    file_crc: u32,
    chunk_size: u32,
    contents_crc: u32,
    file_sha: Option<[u8; 20]>,
    filename: String,
    author: String,
}

impl Default for ResCore {
    fn default() -> Self {
        Self {
            res_type: ResType::Null,
            id: ResId::ANONYMOUS,
            der_id: None,
            loadable: false,
            file_size: 0,
            file_crc: 0,
            chunk_size: DEFAULT_CHUNK_SIZE,
            contents_crc: 0,
            file_sha: None,
            filename: String::new(),
            author: String::new(),
        }
    }
}

impl ResCore {
    pub fn new(
        res_type: ResType,
        id: ResId,
        filename: &str,
        contents_crc: u32,
        author: &str,
    ) -> Self {
        Self {
            res_type,
            id,
            contents_crc,
            filename: filename.to_owned(),
            author: author.to_owned(),
            ..Self::default()
        }
    }

    pub fn res_type(&self) -> ResType {
        self.res_type
    }

    pub fn id(&self) -> ResId {
        self.id
    }

    pub fn set_id(&mut self, id: ResId) {
        self.id = id;
    }

    pub fn der_id(&self) -> Option<ResId> {
        self.der_id
    }

    /// Record derivation lineage for an anonymous resource.
    pub fn set_derived(&mut self, parent: ResId) {
        self.der_id = Some(parent);
    }

    pub fn is_loadable(&self) -> bool {
        self.loadable
    }

    /// Mark the resource loadable and record the standalone's size and CRC.
    pub fn set_loadable(&mut self, size: u32, crc: u32) {
        self.loadable = true;
        self.file_size = size;
        self.file_crc = crc;
    }

    pub fn file_size(&self) -> u32 {
        self.file_size
    }

    pub fn file_crc(&self) -> u32 {
        self.file_crc
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// Chunk size used once this core is announced; ignores zero.
    pub fn set_chunk_size(&mut self, chunk_size: u32) {
        if chunk_size != 0 {
            self.chunk_size = chunk_size;
        }
    }

    pub fn contents_crc(&self) -> u32 {
        self.contents_crc
    }

    pub fn set_contents_crc(&mut self, crc: u32) {
        self.contents_crc = crc;
    }

    pub fn file_sha(&self) -> Option<&[u8; 20]> {
        self.file_sha.as_ref()
    }

    pub fn set_file_sha(&mut self, sha: [u8; 20]) {
        self.file_sha = Some(sha);
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn author(&self) -> &str {
        &self.author
    }

    pub fn is_anonymous(&self) -> bool {
        self.id.is_anonymous()
    }

    /// Number of chunks of the standalone at this core's chunk size.
    pub fn chunk_cnt(&self) -> u32 {
        if !self.loadable || self.file_size == 0 {
            return 0;
        }
        (self.file_size - 1) / self.chunk_size + 1
    }

    /// Byte length of chunk `chunk`; the last chunk may be short.
    pub fn chunk_len(&self, chunk: u32) -> u32 {
        let offset = u64::from(chunk) * u64::from(self.chunk_size);
        u64::from(self.file_size)
            .saturating_sub(offset)
            .min(u64::from(self.chunk_size)) as u32
    }

    pub fn encode(&self, w: &mut Writer) {
        w.str("Type", self.res_type.wire_name(), "");
        w.uint("ID", u64::from(self.id.0), 0);
        if let Some(der) = self.der_id {
            w.uint("DerID", u64::from(der.0), 0);
        }
        w.uint("Loadable", u64::from(self.loadable), 1);
        if self.loadable {
            w.uint("FileSize", u64::from(self.file_size), 0);
            w.uint("FileCRC", u64::from(self.file_crc), 0);
            w.uint("ChunkSize", u64::from(self.chunk_size), u64::from(DEFAULT_CHUNK_SIZE));
        }
        w.uint("ContentsCRC", u64::from(self.contents_crc), 0);
        if let Some(sha) = &self.file_sha {
            let mut hex = String::with_capacity(40);
            for byte in sha {
                hex.push_str(&format!("{byte:02x}"));
            }
            w.str("FileSHA", &hex, "");
        }
        w.str("Filename", &net_filename(&self.filename), "");
        w.str("Author", &net_filename(&self.author), "");
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, WireError> {
        let res_type = ResType::from_wire_name(&r.str("Type", "")?)?;
        let id = ResId(r.uint("ID", 0)? as u32);
        let der_raw = r.uint("DerID", 0)? as u32;
        let der_id = (der_raw != 0).then_some(ResId(der_raw));
        let loadable = r.uint("Loadable", 1)? != 0;
        let (file_size, file_crc, chunk_size) = if loadable {
            let size = r.uint("FileSize", 0)? as u32;
            let crc = r.uint("FileCRC", 0)? as u32;
            let chunk = r.uint("ChunkSize", u64::from(DEFAULT_CHUNK_SIZE))? as u32;
            if chunk == 0 {
                return Err(WireError::Corrupt("zero chunk size".into()));
            }
            (size, crc, chunk)
        } else {
            (0, 0, DEFAULT_CHUNK_SIZE)
        };
        let contents_crc = r.uint("ContentsCRC", 0)? as u32;
        let sha_hex = r.str("FileSHA", "")?;
        let file_sha = if sha_hex.is_empty() {
            None
        } else {
            Some(parse_sha_hex(&sha_hex)?)
        };
        let filename = net_filename(&r.str("Filename", "")?);
        let author = net_filename(&r.str("Author", "")?);
        Ok(Self {
            res_type,
            id,
            der_id,
            loadable,
            file_size,
            file_crc,
            chunk_size,
            contents_crc,
            file_sha,
            filename,
            author,
        })
    }
}

/// Normalize a filename for the wire: forward slashes only, no parent
/// traversal, no leading separator.
fn net_filename(name: &str) -> String {
    let slashed = name.replace('\\', "/");
    let mut parts: Vec<&str> = slashed
        .split('/')
        .filter(|p| !p.is_empty() && *p != "." && *p != "..")
        .collect();
    if parts.is_empty() {
        parts.push("");
    }
    parts.join("/")
}

fn parse_sha_hex(hex: &str) -> Result<[u8; 20], WireError> {
    if hex.len() != 40 {
        return Err(WireError::Corrupt("bad SHA-1 length".into()));
    }
    let mut out = [0u8; 20];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[2 * i..2 * i + 2], 16)
            .map_err(|_| WireError::Corrupt("bad SHA-1 hex".into()))?;
    }
    Ok(out)
}
