//! Resource entity — one in-flight or completed resource
//!
//! An entity owns its on-disk artifact, its chunk map, the per-peer
//! availability maps, and the outstanding load slots. Lifecycle:
//! fresh → local-complete (installed from disk) or loading (allocated from
//! a remote announcement) → complete / removed.
//!
//! All mutable state lives in one guarded cell (`ResInner`); its mutex is
//! the per-entity file lock that serializes materialization, chunk reads,
//! chunk writes, and temp-file renaming. Cross-entity operations never
//! take two of these locks.

use super::list::Shared;
use super::standalone;
use super::{ResCore, ResError, ResId, ResType};
use crate::archive;
use crate::chunks::ChunkMap;
use crate::protocol::{PktRequest, PktStatus, ResChunk, ResPacket};
use crate::transport::Connection;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

/// A peer's advertised chunk map for this resource.
#[derive(Debug)]
pub(super) struct PeerChunks {
    pub(super) client: u16,
    pub(super) chunks: ChunkMap,
}

/// One outstanding chunk request.
#[derive(Debug)]
pub(super) struct LoadSlot {
    pub(super) chunk: u32,
    pub(super) by_client: u16,
    pub(super) started: Instant,
}

/// The guarded mutable portion of a resource entity.
#[derive(Debug)]
pub(super) struct ResInner {
    pub(super) core: ResCore,
    pub(super) file: PathBuf,
    pub(super) standalone: Option<PathBuf>,
    pub(super) temp_file: bool,
    pub(super) standalone_failed: bool,
    pub(super) dirty: bool,
    pub(super) local: bool,
    pub(super) loading: bool,
    pub(super) last_req: Option<Instant>,
    pub(super) chunks: ChunkMap,
    pub(super) peer_chunks: Vec<PeerChunks>,
    pub(super) loads: Vec<LoadSlot>,
    pub(super) discover_start: Option<Instant>,
}

impl ResInner {
    fn fresh() -> Self {
        Self {
            core: ResCore::default(),
            file: PathBuf::new(),
            standalone: None,
            temp_file: false,
            standalone_failed: false,
            dirty: false,
            local: false,
            loading: false,
            last_req: None,
            chunks: ChunkMap::default(),
            peer_chunks: Vec::new(),
            loads: Vec::new(),
            discover_start: None,
        }
    }
}

#[derive(Debug)]
pub struct Resource {
    shared: Weak<Shared>,
    removed: AtomicBool,
    inner: Mutex<ResInner>,
}

impl Resource {
    pub(crate) fn new(shared: &Arc<Shared>) -> Arc<Resource> {
        Arc::new(Resource {
            shared: Arc::downgrade(shared),
            removed: AtomicBool::new(false),
            inner: Mutex::new(ResInner::fresh()),
        })
    }

    fn shared(&self) -> Result<Arc<Shared>, ResError> {
        self.shared.upgrade().ok_or(ResError::Removed)
    }

    // -- getters ----------------------------------------------------------

    pub fn id(&self) -> ResId {
        self.inner.lock().core.id()
    }

    pub fn res_type(&self) -> ResType {
        self.inner.lock().core.res_type()
    }

    /// Snapshot of the current core.
    pub fn core(&self) -> ResCore {
        self.inner.lock().core.clone()
    }

    /// Originating peer of this resource's id.
    pub fn client(&self) -> u16 {
        self.id().client()
    }

    pub fn der_id(&self) -> Option<ResId> {
        self.inner.lock().core.der_id()
    }

    pub fn is_anonymous(&self) -> bool {
        self.inner.lock().core.is_anonymous()
    }

    pub fn is_loading(&self) -> bool {
        self.inner.lock().loading
    }

    /// Not in a transfer: installed locally or finished loading.
    pub fn is_complete(&self) -> bool {
        !self.is_loading()
    }

    pub fn is_local(&self) -> bool {
        self.inner.lock().local
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.inner.lock().dirty
    }

    pub fn file_path(&self) -> PathBuf {
        self.inner.lock().file.clone()
    }

    pub fn standalone_path(&self) -> Option<PathBuf> {
        self.inner.lock().standalone.clone()
    }

    pub(crate) fn last_req_time(&self) -> Option<Instant> {
        self.inner.lock().last_req
    }

    pub(crate) fn clear_last_req(&self) {
        self.inner.lock().last_req = None;
    }

    pub(crate) fn change_id(&self, id: ResId) {
        self.inner.lock().core.set_id(id);
    }

    /// Schedule for removal; the list reaps after the grace window.
    pub fn remove(&self) {
        self.removed.store(true, Ordering::Release);
    }

    /// Loaded chunks over total chunks, as advertised by `client`.
    pub fn client_progress(&self, client: u16) -> Option<(u32, u32)> {
        let inner = self.inner.lock();
        let peer = inner.peer_chunks.iter().find(|p| p.client == client)?;
        Some((peer.chunks.present_chunk_cnt(), inner.chunks.chunk_cnt()))
    }

    // -- installation -----------------------------------------------------

    /// Install a local file (or packaged archive) as this resource.
    pub fn set_by_file(
        &self,
        path: &Path,
        temp: bool,
        res_type: ResType,
        id: ResId,
        name: Option<&str>,
    ) -> Result<(), ResError> {
        let shared = self.shared()?;
        let mut inner = self.inner.lock();
        let res_name = match name {
            Some(n) => n.to_owned(),
            None => default_res_name(&shared, path),
        };
        let mut core = if path.is_dir() || archive::is_archive(path) {
            let contents = archive::contents_crc(path)?;
            let author = archive::archive_comment(path).unwrap_or_default();
            ResCore::new(res_type, id, &res_name, contents, &author)
        } else {
            if !path.is_file() {
                return Err(ResError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("{} not found", path.display()),
                )));
            }
            let crc = archive::file_crc(path)?;
            ResCore::new(res_type, id, &res_name, crc, "")
        };
        core.set_chunk_size(shared.config.tunables.chunk_size);
        tracing::trace!(
            "resource: complete {}:{} is file {} ({})",
            id,
            res_name,
            path.display(),
            if temp { "temp" } else { "static" }
        );
        inner.core = core;
        inner.file = path.to_owned();
        inner.standalone = None;
        inner.dirty = true;
        inner.temp_file = temp;
        inner.standalone_failed = false;
        inner.last_req = Some(Instant::now());
        inner.loading = false;
        inner.local = true;
        inner.peer_chunks.clear();
        inner.loads.clear();
        self.removed.store(false, Ordering::Release);
        Ok(())
    }

    /// Try to locate a local copy matching a remote announcement. Probes the
    /// announced path, then the bare filename, then sibling directories of
    /// the exe path up to the configured recursion depth. A candidate is
    /// accepted only when its contents CRC matches; the announced core then
    /// replaces the locally computed one.
    pub fn set_by_core(&self, core: &ResCore) -> bool {
        let Ok(shared) = self.shared() else {
            return false;
        };
        self.try_by_core(&shared, core, None, 0)
    }

    fn try_by_core(
        &self,
        shared: &Arc<Shared>,
        core: &ResCore,
        as_filename: Option<PathBuf>,
        recursion: u32,
    ) -> bool {
        let rel = as_filename.unwrap_or_else(|| native_path(core.filename()));
        let candidate = if rel.is_absolute() {
            rel
        } else {
            shared.config.network.exe_path.join(rel)
        };
        if self
            .set_by_file(
                &candidate,
                false,
                core.res_type(),
                core.id(),
                Some(core.filename()),
            )
            .is_ok()
        {
            let matches = self.inner.lock().core.contents_crc() == core.contents_crc();
            if matches {
                {
                    let mut inner = self.inner.lock();
                    inner.core = core.clone();
                    inner.dirty = true;
                }
                // probe the standalone; a failure here only means the copy
                // is not binary compatible yet
                let _ = self.get_standalone(false, false);
                return true;
            }
        }
        let max_recursion = shared.config.network.max_res_search_recursion;
        // search for the filename without its folder prefix
        if recursion == 0 && core.filename().contains('/') {
            if let Some(bare) = Path::new(core.filename()).file_name() {
                // pass the recursion limit so the bare attempt does not walk
                if self.try_by_core(shared, core, Some(PathBuf::from(bare)), max_recursion) {
                    return true;
                }
            }
        }
        // walk sibling directories, no deeper than configured
        if recursion >= max_recursion {
            return false;
        }
        let search_root = if recursion == 0 {
            shared.config.network.exe_path.clone()
        } else {
            strip_rel_suffix(&candidate, core.filename())
        };
        let Ok(entries) = fs::read_dir(&search_root) else {
            return false;
        };
        for entry in entries.flatten() {
            let dir = entry.path();
            if !dir.is_dir() || dir.extension().is_some() {
                continue;
            }
            if same_path(&dir, &shared.config.network.work_path) {
                continue;
            }
            let sub = dir.join(native_path(core.filename()));
            if self.try_by_core(shared, core, Some(sub), recursion + 1) {
                return true;
            }
        }
        false
    }

    /// Allocate a temp file and start loading the announced resource.
    pub fn set_load(&self, core: &ResCore) -> Result<(), ResError> {
        if !core.is_loadable() {
            return Err(ResError::Unloadable);
        }
        let shared = self.shared()?;
        let file = shared.find_temp_res_filename(core.filename())?;
        tracing::trace!(
            "resource: loading {}:{} to file {}",
            core.id(),
            core.filename(),
            file.display()
        );
        let mut inner = self.inner.lock();
        inner.core = core.clone();
        inner.chunks.set_incomplete(core.chunk_cnt());
        // the load target is the standalone; the result is going to be
        // binary compatible
        inner.standalone = Some(file.clone());
        inner.file = file;
        inner.dirty = false;
        inner.temp_file = true;
        inner.standalone_failed = false;
        inner.last_req = Some(Instant::now());
        inner.loading = true;
        inner.local = false;
        inner.peer_chunks.clear();
        inner.loads.clear();
        // no discovery yet
        inner.discover_start = None;
        self.removed.store(false, Ordering::Release);
        Ok(())
    }

    fn set_derived(
        &self,
        name: &str,
        path: &Path,
        temp: bool,
        res_type: ResType,
        parent: ResId,
    ) -> Result<(), ResError> {
        let mut inner = self.inner.lock();
        let mut core = ResCore::new(res_type, ResId::ANONYMOUS, name, 0, "");
        core.set_derived(parent);
        inner.core = core;
        inner.file = path.to_owned();
        inner.standalone = None;
        inner.dirty = false;
        inner.temp_file = temp;
        inner.standalone_failed = false;
        inner.last_req = Some(Instant::now());
        inner.loading = false;
        inner.local = true;
        // no chunk data: anonymous resources are very likely to change;
        // wait for the finish_derive call
        inner.chunks = ChunkMap::default();
        Ok(())
    }

    // -- derivation -------------------------------------------------------

    /// Snapshot the artifact before a local mutation. The current entity
    /// switches to the snapshot; the returned anonymous entity owns the
    /// original path the caller is about to change, with this resource
    /// recorded as its parent.
    pub fn derive(&self) -> Result<Arc<Resource>, ResError> {
        // a loading resource has nothing stable to snapshot
        if self.is_loading() {
            return Err(ResError::Invalid("cannot derive a loading resource"));
        }
        let shared = self.shared()?;
        let (org_file, org_temp, name, res_type, id);
        {
            let mut inner = self.inner.lock();
            org_file = inner.file.clone();
            org_temp = inner.temp_file;
            name = inner.core.filename().to_owned();
            res_type = inner.core.res_type();
            id = inner.core.id();

            match inner.standalone.clone() {
                Some(sa) if sa != inner.file => {
                    // standalone exists elsewhere: it is the snapshot
                    inner.file = sa;
                    inner.temp_file = true;
                }
                _ => {
                    let file_name = org_file
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_else(|| name.clone());
                    let fresh = shared.find_temp_res_filename(&file_name)?;
                    archive::copy_item(&org_file, &fresh)?;
                    if inner.standalone.is_some() {
                        inner.standalone = Some(fresh.clone());
                    }
                    inner.file = fresh;
                    inner.temp_file = true;
                }
            }
        }
        tracing::info!(
            "resource: deriving from {}:{}, original at {}",
            id,
            name,
            org_file.display()
        );
        let derived = Resource::new(&shared);
        derived.set_derived(&name, &org_file, org_temp, res_type, id)?;
        shared.add(Arc::clone(&derived));
        Ok(derived)
    }

    /// Register a mutated anonymous resource under a fresh id and announce
    /// the derivation.
    pub fn finish_derive(&self) -> Result<(), ResError> {
        let shared = self.shared()?;
        let (der_id, name, file, temp, res_type);
        {
            let inner = self.inner.lock();
            if !inner.core.is_anonymous() {
                return Err(ResError::Invalid("resource is not anonymous"));
            }
            der_id = inner.core.der_id();
            name = inner.core.filename().to_owned();
            file = inner.file.clone();
            temp = inner.temp_file;
            res_type = inner.core.res_type();
        }
        let id = shared.next_res_id()?;
        self.set_by_file(&file, temp, res_type, id, Some(&name))?;
        self.get_standalone(true, false)?;
        let core = {
            let mut inner = self.inner.lock();
            if let Some(parent) = der_id {
                inner.core.set_derived(parent);
            }
            // derivation is dirty business
            inner.dirty = true;
            inner.core.clone()
        };
        shared.io.broadcast_msg(&ResPacket::Derive(core));
        Ok(())
    }

    /// Attach a remote Derive announcement to this anonymous entity. The
    /// contents CRC is deliberately not checked; derivation is synchronized
    /// by the game control flow.
    pub fn finish_derive_remote(&self, core: &ResCore) -> bool {
        let mut inner = self.inner.lock();
        if !inner.core.is_anonymous() {
            return false;
        }
        inner.core = core.clone();
        // assume the resource is complete
        let cnt = inner.core.chunk_cnt();
        inner.chunks.set_complete(cnt);
        true
    }

    // -- standalone -------------------------------------------------------

    /// Materialize the canonical single-file artifact. In authoring mode
    /// (`set_official`) the computed size and CRC are written into the
    /// core; otherwise they must match it.
    pub fn get_standalone(
        &self,
        set_official: bool,
        allow_unloadable: bool,
    ) -> Result<PathBuf, ResError> {
        let shared = self.shared()?;
        let mut inner = self.inner.lock();
        standalone::get_standalone(&mut inner, &shared, set_official, allow_unloadable)
    }

    /// Whether the standalone exists and matches the official checksum, so
    /// chunks may be served to peers.
    pub fn is_binary_compatible(&self) -> bool {
        let Ok(shared) = self.shared() else {
            return false;
        };
        let mut inner = self.inner.lock();
        if inner.standalone.is_some() {
            return true;
        }
        if inner.file.is_dir() {
            // if the directory were packed now, creation order and metadata
            // would not match the announcer's archive
            return false;
        }
        standalone::get_standalone(&mut inner, &shared, false, false).is_ok()
    }

    /// Compute and cache the standalone's SHA-1 in the core.
    pub fn calculate_sha(&self) -> Result<(), ResError> {
        if self.inner.lock().core.file_sha().is_some() {
            return Ok(());
        }
        let path = self
            .get_standalone(false, false)
            .unwrap_or_else(|_| self.file_path());
        let sha = archive::file_sha1(&path)?;
        self.inner.lock().core.set_file_sha(sha);
        Ok(())
    }

    // -- protocol ---------------------------------------------------------

    /// Unicast or broadcast this resource's chunk map. Broadcasting clears
    /// the dirty flag.
    pub fn send_status(&self, to: Option<&dyn Connection>) -> bool {
        let Ok(shared) = self.shared() else {
            return false;
        };
        let pkt = {
            let mut inner = self.inner.lock();
            if to.is_none() {
                inner.dirty = false;
            }
            ResPacket::Status(PktStatus {
                res_id: inner.core.id(),
                chunks: inner.chunks.clone(),
            })
        };
        match to {
            Some(conn) => conn.send(&pkt).is_ok(),
            None => shared.io.broadcast_msg(&pkt),
        }
    }

    /// Serialize chunk `chunk` and send it over the peer's data connection.
    pub fn send_chunk(&self, chunk: u32, to_client: u16) -> bool {
        let Ok(shared) = self.shared() else {
            return false;
        };
        let pkt = {
            let mut inner = self.inner.lock();
            let Some(path) = inner.standalone.clone() else {
                return false;
            };
            if chunk >= inner.core.chunk_cnt() {
                return false;
            }
            inner.last_req = Some(Instant::now());
            let offset = u64::from(chunk) * u64::from(inner.core.chunk_size());
            let len = inner.core.chunk_len(chunk) as usize;
            let mut data = vec![0u8; len];
            let read = (|| -> std::io::Result<()> {
                let mut file = fs::File::open(&path)?;
                file.seek(SeekFrom::Start(offset))?;
                file.read_exact(&mut data)
            })();
            if let Err(err) = read {
                tracing::error!(
                    "could not read chunk {} of resource file {}: {}",
                    chunk,
                    path.display(),
                    err
                );
                return false;
            }
            ResPacket::Data(ResChunk {
                res_id: inner.core.id(),
                chunk,
                data,
            })
        };
        // the rare use of the data connection
        let Some(conn) = shared.io.data_connection(to_client) else {
            return false;
        };
        conn.send(&pkt).is_ok()
    }

    /// A peer asked who holds this resource; answer with our status.
    pub fn on_discover(&self, by: &dyn Connection) {
        if !self.is_binary_compatible() {
            return;
        }
        self.inner.lock().last_req = Some(Instant::now());
        self.send_status(Some(by));
    }

    /// A peer announced its chunk map for this resource.
    pub fn on_status(&self, chunks: &ChunkMap, by: &dyn Connection) {
        let Ok(shared) = self.shared() else {
            return;
        };
        let mut inner = self.inner.lock();
        // a source exists: reset the discover timeout
        inner.discover_start = None;
        if chunks.chunk_cnt() != inner.chunks.chunk_cnt() {
            return;
        }
        let client = by.client_id();
        match inner.peer_chunks.iter_mut().find(|p| p.client == client) {
            Some(peer) => peer.chunks = chunks.clone(),
            None => inner.peer_chunks.push(PeerChunks {
                client,
                chunks: chunks.clone(),
            }),
        }
        if inner.loading {
            let avail = chunks.clone();
            let _ = self.start_load_locked(&mut inner, &shared, client, &avail);
        }
    }

    /// A chunk of data arrived.
    pub fn on_chunk(&self, chunk: &ResChunk) {
        let Ok(shared) = self.shared() else {
            return;
        };
        let completed = {
            let mut inner = self.inner.lock();
            if !inner.loading || chunk.res_id != inner.core.id() {
                return;
            }
            let offset = u64::from(chunk.chunk) * u64::from(inner.core.chunk_size());
            if offset + chunk.data.len() as u64 > u64::from(inner.core.file_size()) {
                tracing::trace!(
                    "res: {} bytes at offset {} exceeds expected size of {}",
                    chunk.data.len(),
                    offset,
                    inner.core.file_size()
                );
                return;
            }
            let write = (|| -> std::io::Result<()> {
                let mut file = OpenOptions::new()
                    .write(true)
                    .create(true)
                    .open(&inner.file)?;
                file.seek(SeekFrom::Start(offset))?;
                file.write_all(&chunk.data)
            })();
            if let Err(err) = write {
                // the slot times out and the chunk is re-requested
                tracing::error!(
                    "res: could not write chunk {} to {}: {}",
                    chunk.chunk,
                    inner.file.display(),
                    err
                );
                return;
            }
            inner.chunks.add_chunk(chunk.chunk);
            inner.dirty = true;
            // discard duplicate requests for this chunk at other peers
            inner.loads.retain(|slot| slot.chunk != chunk.chunk);
            if inner.chunks.is_complete() {
                self.end_load_locked(&mut inner)
            } else {
                self.start_new_loads_locked(&mut inner, &shared);
                None
            }
        };
        if let Some(id) = completed {
            shared.notify_res_complete(id);
        }
    }

    /// Periodic load tick. Returns false when the entity should be removed
    /// (no sources appeared within the discover timeout).
    pub fn do_load(&self) -> bool {
        let Ok(shared) = self.shared() else {
            return true;
        };
        let completed = {
            let mut inner = self.inner.lock();
            if !inner.loading {
                return true;
            }
            if inner.chunks.is_complete() {
                // zero-chunk resources complete without any data packets
                self.end_load_locked(&mut inner)
            } else if !inner.loads.is_empty() {
                let timeout = shared.config.tunables.load_timeout;
                let before = inner.loads.len();
                inner.loads.retain(|slot| slot.started.elapsed() < timeout);
                if inner.loads.len() < before {
                    self.start_new_loads_locked(&mut inner, &shared);
                }
                None
            } else {
                if let Some(start) = inner.discover_start {
                    if start.elapsed() > shared.config.tunables.discover_timeout {
                        return false;
                    }
                }
                None
            }
        };
        if let Some(id) = completed {
            shared.notify_res_complete(id);
        }
        true
    }

    /// Called before a Discover broadcast; arms the discover timeout on
    /// loading entities.
    pub fn needs_discover(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.loading && inner.discover_start.is_none() {
            inner.discover_start = Some(Instant::now());
        }
        true
    }

    // -- load scheduling --------------------------------------------------

    /// Finish loading: verify the artifact against the core. On success the
    /// caller must notify the returned id outside the entity lock.
    fn end_load_locked(&self, inner: &mut ResInner) -> Option<ResId> {
        inner.loads.clear();
        inner.peer_chunks.clear();
        inner.discover_start = None;
        inner.loading = false;
        let verified = (|| -> Result<(), ResError> {
            let size = fs::metadata(&inner.file)?.len();
            if size != u64::from(inner.core.file_size()) {
                return Err(ResError::Standalone(format!(
                    "size {} does not match announced {}",
                    size,
                    inner.core.file_size()
                )));
            }
            let crc = archive::file_crc(&inner.file)?;
            if crc != inner.core.file_crc() {
                return Err(ResError::ChecksumMismatch {
                    expected: inner.core.file_crc(),
                    got: crc,
                });
            }
            Ok(())
        })();
        match verified {
            Ok(()) => Some(inner.core.id()),
            Err(err) => {
                tracing::error!(
                    "resource {} failed verification after load: {}",
                    inner.core.filename(),
                    err
                );
                self.removed.store(true, Ordering::Release);
                None
            }
        }
    }

    fn start_new_loads_locked(&self, inner: &mut ResInner, shared: &Shared) {
        if inner.peer_chunks.is_empty() {
            return;
        }
        // visit peers in a fresh shuffled order for fairness
        let mut order: Vec<usize> = (0..inner.peer_chunks.len()).collect();
        order.shuffle(&mut rand::thread_rng());
        let mut usable = vec![true; inner.peer_chunks.len()];
        while inner.loads.len() < shared.config.tunables.max_load {
            let before = inner.loads.len();
            for &i in &order {
                if !usable[i] {
                    continue;
                }
                let client = inner.peer_chunks[i].client;
                let avail = inner.peer_chunks[i].chunks.clone();
                if self.start_load_locked(inner, shared, client, &avail).is_err() {
                    usable[i] = false;
                    continue;
                }
                if inner.loads.len() > before {
                    break;
                }
            }
            if inner.loads.len() == before {
                break;
            }
        }
    }

    /// Try to start one load from a peer. `Ok` even when nothing was
    /// started (caps reached, no candidate); `Err` only on a connection
    /// failure, which disqualifies the peer for this round.
    fn start_load_locked(
        &self,
        inner: &mut ResInner,
        shared: &Shared,
        from_client: u16,
        available: &ChunkMap,
    ) -> Result<(), ()> {
        if inner.loads.len() >= shared.config.tunables.max_load {
            return Ok(());
        }
        let at_client = inner
            .loads
            .iter()
            .filter(|slot| slot.by_client == from_client)
            .count();
        if at_client >= shared.config.tunables.max_load_per_peer_per_file {
            return Ok(());
        }
        if available.chunk_cnt() != inner.chunks.chunk_cnt() {
            return Ok(());
        }
        let in_flight: Vec<u32> = inner.loads.iter().map(|slot| slot.chunk).collect();
        let Some(chunk) =
            inner
                .chunks
                .pick_retrieval(available, &in_flight, &mut rand::thread_rng())
        else {
            return Ok(());
        };
        if chunk >= inner.core.chunk_cnt() {
            return Ok(());
        }
        let Some(conn) = shared.io.msg_connection(from_client) else {
            return Err(());
        };
        conn.send(&ResPacket::Request(PktRequest {
            res_id: inner.core.id(),
            chunk,
        }))
        .map_err(|_| ())?;
        tracing::trace!(
            "res: requesting chunk {} of {}:{} from client {}",
            chunk,
            inner.core.id(),
            inner.core.filename(),
            from_client
        );
        inner.loads.push(LoadSlot {
            chunk,
            by_client: from_client,
            started: Instant::now(),
        });
        Ok(())
    }
}

impl Drop for Resource {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if inner.temp_file && inner.file.is_file() {
            if let Err(err) = fs::remove_file(&inner.file) {
                tracing::error!("could not delete temporary resource file: {}", err);
            }
        }
        if let Some(sa) = &inner.standalone {
            if sa != &inner.file && sa.is_file() {
                if let Err(err) = fs::remove_file(sa) {
                    tracing::error!("could not delete temporary resource file: {}", err);
                }
            }
        }
    }
}

/// Default resource name: path relative to the exe path, network slashes.
fn default_res_name(shared: &Shared, path: &Path) -> String {
    let rel = path
        .strip_prefix(&shared.config.network.exe_path)
        .unwrap_or(path);
    rel.to_string_lossy().replace('\\', "/")
}

/// Map a network filename onto a native relative path.
fn native_path(filename: &str) -> PathBuf {
    filename.split('/').collect()
}

/// Drop the trailing components of `candidate` that spell `filename`,
/// yielding the directory the candidate was formed in.
fn strip_rel_suffix(candidate: &Path, filename: &str) -> PathBuf {
    let depth = Path::new(filename)
        .components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .count();
    let mut out = candidate.to_path_buf();
    for _ in 0..depth {
        out.pop();
    }
    out
}

fn same_path(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(ca), Ok(cb)) => ca == cb,
        _ => a == b,
    }
}
