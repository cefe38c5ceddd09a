//! Resource list — the catalog of all resources known to this peer
//!
//! The list owns every entity through strong references; packet handlers
//! and the tick take transient clones. Readers traverse under the shared
//! catalog lock; insert and the reaper take it exclusively, so dropping a
//! reaped entity can never race a handler still using it.

use super::entity::Resource;
use super::{ResCore, ResError, ResId, ResType};
use crate::config::Config;
use crate::protocol::{PktDiscover, ResPacket};
use crate::transport::{Connection, NetIo};
use parking_lot::{Mutex, RwLock};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

/// Game-facing completion callback.
pub trait ResDelegate: Send + Sync {
    /// A loading resource verified and transitioned to complete.
    fn on_res_complete(&self, res: &Arc<Resource>);
}

struct IdAlloc {
    client: u16,
    next: u32,
}

/// State shared between the list and its entities (weak back-pointers).
pub(crate) struct Shared {
    pub(crate) config: Config,
    pub(crate) io: Arc<dyn NetIo>,
    delegate: RwLock<Option<Arc<dyn ResDelegate>>>,
    catalog: RwLock<Vec<Arc<Resource>>>,
    /// Held in addition to the catalog lock during insert
    insert_lock: Mutex<()>,
    /// Id allocation never blocks catalog readers
    ids: Mutex<IdAlloc>,
}

impl Shared {
    pub(crate) fn get_res(&self, id: ResId) -> Option<Arc<Resource>> {
        self.catalog
            .read()
            .iter()
            .find(|res| res.id() == id)
            .cloned()
    }

    pub(crate) fn add(&self, res: Arc<Resource>) {
        let _add = self.insert_lock.lock();
        self.catalog.write().push(res);
    }

    /// Allocate the next free id within the local client's 16-bit window,
    /// wrapping on exhaustion and skipping occupied slots.
    pub(crate) fn next_res_id(&self) -> Result<ResId, ResError> {
        let mut ids = self.ids.lock();
        let window = u32::from(ids.client) << 16;
        if ids.next & 0xffff_0000 != window {
            ids.next = window;
        }
        for _ in 0..=0xffff_u32 {
            let candidate = ResId(window | (ids.next & 0xffff));
            ids.next = window | (ids.next.wrapping_add(1) & 0xffff);
            if candidate.is_anonymous() {
                continue;
            }
            if self.get_res(candidate).is_none() {
                return Ok(candidate);
            }
        }
        Err(ResError::IdExhaustion)
    }

    /// Allocate a fresh temp file in the network work directory. The
    /// requested name is sanitized to `[A-Za-z0-9./]`; collisions walk
    /// `_2`..`_999` before the extension.
    pub(crate) fn find_temp_res_filename(&self, filename: &str) -> Result<PathBuf, ResError> {
        let safe: String = filename
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '.' || c == '/' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        let mut base = safe.rsplit('/').next().unwrap_or_default();
        if base.is_empty() {
            base = "res";
        }
        let target = self.config.network.work_path.join(base);
        if create_new(&target) {
            return Ok(target);
        }
        let (stem, ext) = match base.rfind('.') {
            Some(dot) => base.split_at(dot),
            None => (base, ""),
        };
        for i in 2..1000 {
            let candidate = self
                .config
                .network
                .work_path
                .join(format!("{stem}_{i}{ext}"));
            if create_new(&candidate) {
                return Ok(candidate);
            }
        }
        Err(ResError::TempNameExhausted(filename.to_owned()))
    }

    /// Completion hook: log and hand the entity to the game's delegate.
    pub(crate) fn notify_res_complete(&self, id: ResId) {
        let Some(res) = self.get_res(id) else {
            return;
        };
        tracing::info!("{} received", res.core().filename());
        let delegate = self.delegate.read().clone();
        if let Some(delegate) = delegate {
            delegate.on_res_complete(&res);
        }
    }
}

fn create_new(path: &Path) -> bool {
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .is_ok()
}

/// The catalog, keyed by resource id.
pub struct ResList {
    shared: Arc<Shared>,
    last_discover: Mutex<Option<Instant>>,
    last_status: Mutex<Option<Instant>>,
}

impl ResList {
    /// Create the catalog and the network work directory. Fails when the
    /// work path exists as a non-directory.
    pub fn new(config: Config, client_id: u16, io: Arc<dyn NetIo>) -> Result<Self, ResError> {
        let work = &config.network.work_path;
        if work.exists() && !work.is_dir() {
            return Err(ResError::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("network path {} blocked by a file", work.display()),
            )));
        }
        fs::create_dir_all(work)?;
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                io,
                delegate: RwLock::new(None),
                catalog: RwLock::new(Vec::new()),
                insert_lock: Mutex::new(()),
                ids: Mutex::new(IdAlloc {
                    client: client_id,
                    next: u32::from(client_id) << 16,
                }),
            }),
            last_discover: Mutex::new(None),
            last_status: Mutex::new(None),
        })
    }

    pub fn set_delegate(&self, delegate: Option<Arc<dyn ResDelegate>>) {
        *self.shared.delegate.write() = delegate;
    }

    pub fn local_client_id(&self) -> u16 {
        self.shared.ids.lock().client
    }

    /// Retarget all locally-owned resource ids after a client id
    /// reassignment.
    pub fn set_local_id(&self, client_id: u16) {
        let mut ids = self.shared.ids.lock();
        let old = ids.client;
        if old == client_id {
            return;
        }
        let delta = (((i64::from(client_id) - i64::from(old)) << 16) & 0xffff_ffff) as u32;
        ids.client = client_id;
        ids.next = ids.next.wrapping_add(delta);
        for res in self.shared.catalog.read().iter() {
            let id = res.id();
            if !id.is_anonymous() && id.client() == old {
                res.change_id(ResId(id.0.wrapping_add(delta)));
            }
        }
    }

    // -- lookup -----------------------------------------------------------

    pub fn get_res(&self, id: ResId) -> Option<Arc<Resource>> {
        self.shared.get_res(id)
    }

    /// Find a non-anonymous resource by its on-disk path, optionally
    /// restricted to locally-owned entries.
    pub fn get_res_by_file(&self, path: &Path, local_only: bool) -> Option<Arc<Resource>> {
        let local_client = self.local_client_id();
        self.shared
            .catalog
            .read()
            .iter()
            .find(|res| {
                !res.is_anonymous()
                    && res.file_path() == path
                    && (!local_only || res.client() == local_client)
            })
            .cloned()
    }

    /// Lowest id >= `id` among non-removed entries; catalog iteration for
    /// the game.
    pub fn get_next_res(&self, id: ResId) -> Option<Arc<Resource>> {
        let catalog = self.shared.catalog.read();
        let mut best: Option<&Arc<Resource>> = None;
        for res in catalog.iter() {
            if res.is_removed() || res.id() < id {
                continue;
            }
            if best.map_or(true, |b| b.id() > res.id()) {
                best = Some(res);
            }
        }
        best.cloned()
    }

    // -- installation -----------------------------------------------------

    /// Install a local file or directory, materialize it, and catalog it.
    pub fn add_by_file(
        &self,
        path: &Path,
        temp: bool,
        res_type: ResType,
        id: Option<ResId>,
        name: Option<&str>,
        allow_unloadable: bool,
    ) -> Result<Arc<Resource>, ResError> {
        // already in list?
        if let Some(res) = self.get_res_by_file(path, false) {
            return Ok(res);
        }
        let id = match id {
            Some(id) => id,
            None => self.shared.next_res_id()?,
        };
        let res = Resource::new(&self.shared);
        res.set_by_file(path, temp, res_type, id, name)?;
        // system files never create a standalone; they must not be
        // announced loadable
        if res_type != ResType::System {
            if let Err(err) = res.get_standalone(true, allow_unloadable) {
                if !allow_unloadable {
                    return Err(err);
                }
                tracing::warn!(
                    "{} marked unloadable: {}",
                    res.core().filename(),
                    err
                );
            }
        }
        self.shared.add(Arc::clone(&res));
        Ok(res)
    }

    /// Match a remote announcement against local files; when no local copy
    /// exists and `load` is set, allocate a loading entity instead.
    pub fn add_by_core(&self, core: &ResCore, load: bool) -> Result<Arc<Resource>, ResError> {
        if let Some(res) = self.get_res(core.id()) {
            return Ok(res);
        }
        let res = Resource::new(&self.shared);
        if !res.set_by_core(core) {
            if load {
                return self.add_load(core);
            }
            return Err(ResError::Invalid("no local copy of announced resource"));
        }
        tracing::info!("found identical {}; not loading", core.filename());
        self.shared.add(Arc::clone(&res));
        Ok(res)
    }

    /// Allocate a loading entity for an announced core.
    pub fn add_load(&self, core: &ResCore) -> Result<Arc<Resource>, ResError> {
        if !core.is_loadable() {
            tracing::error!("cannot load {} (marked unloadable)", core.filename());
            return Err(ResError::Unloadable);
        }
        let res = Resource::new(&self.shared);
        res.set_load(core)?;
        tracing::info!("loading {}...", core.filename());
        self.shared.add(Arc::clone(&res));
        Ok(res)
    }

    /// Mark every resource owned by `client_id` for removal.
    pub fn remove_at_client(&self, client_id: u16) {
        for res in self.shared.catalog.read().iter() {
            if res.client() == client_id {
                res.remove();
            }
        }
    }

    /// Shut the catalog down: every entity is released and its temp files
    /// deleted once the last transient reference drops.
    pub fn clear(&self) {
        let mut catalog = self.shared.catalog.write();
        for res in catalog.iter() {
            res.remove();
            res.clear_last_req();
        }
        catalog.clear();
        *self.last_discover.lock() = None;
        *self.last_status.lock() = None;
    }

    // -- protocol ---------------------------------------------------------

    /// A peer connected: let it know what we have.
    pub fn on_client_connect(&self, conn: &dyn Connection) {
        self.send_discover(Some(conn));
    }

    /// Broadcast (or unicast) the set of resource ids we know about.
    pub fn send_discover(&self, to: Option<&dyn Connection>) -> bool {
        let ids: Vec<ResId> = {
            let catalog = self.shared.catalog.read();
            catalog
                .iter()
                .filter(|res| !res.is_removed())
                .map(|res| res.id())
                .collect()
        };
        if ids.is_empty() {
            return false;
        }
        let pkt = ResPacket::Discover(PktDiscover { ids });
        match to {
            Some(conn) => conn.send(&pkt).is_ok(),
            None => {
                *self.last_discover.lock() = Some(Instant::now());
                self.shared.io.broadcast_msg(&pkt)
            }
        }
    }

    /// Decode and dispatch a framed packet. Parse failures are logged and
    /// the packet dropped; the connection is left alone.
    pub fn handle_packet_bytes(&self, data: &[u8], conn: &dyn Connection) {
        match ResPacket::from_bytes(data) {
            Ok(pkt) => self.handle_packet(&pkt, conn),
            Err(err) => tracing::warn!(
                "dropping corrupt resource packet from client {}: {}",
                conn.client_id(),
                err
            ),
        }
    }

    /// Dispatch one inbound packet.
    pub fn handle_packet(&self, pkt: &ResPacket, conn: &dyn Connection) {
        match pkt {
            ResPacket::Discover(dis) => {
                if !conn.is_open() {
                    return;
                }
                // answer for everything of ours the sender asked about
                let matching: Vec<Arc<Resource>> = {
                    let catalog = self.shared.catalog.read();
                    catalog
                        .iter()
                        .filter(|res| dis.contains(res.id()))
                        .cloned()
                        .collect()
                };
                for res in matching {
                    res.on_discover(conn);
                }
            }
            ResPacket::Status(status) => {
                if !conn.is_open() {
                    return;
                }
                if let Some(res) = self.get_res(status.res_id) {
                    res.on_status(&status.chunks, conn);
                }
            }
            ResPacket::Derive(core) => {
                let Some(der_id) = core.der_id() else {
                    return;
                };
                // attach to any anonymous entity with a matching parent
                let snapshot: Vec<Arc<Resource>> =
                    self.shared.catalog.read().iter().cloned().collect();
                for res in snapshot {
                    if res.is_anonymous() && res.der_id() == Some(der_id) {
                        res.finish_derive_remote(core);
                    }
                }
            }
            ResPacket::Request(req) => {
                if let Some(res) = self.get_res(req.res_id) {
                    if res.is_binary_compatible() {
                        res.send_chunk(req.chunk, conn.client_id());
                    }
                }
            }
            ResPacket::Data(chunk) => {
                if let Some(res) = self.get_res(chunk.res_id) {
                    res.on_chunk(chunk);
                }
            }
        }
    }

    /// Periodic tick: drive loads, broadcast Discover and Status on their
    /// cadences, and reap removed entries past the grace window.
    pub fn on_timer(&self) {
        let snapshot: Vec<Arc<Resource>> = self.shared.catalog.read().iter().cloned().collect();

        // do loads, check timeouts
        for res in &snapshot {
            if res.is_loading() && !res.is_removed() && !res.do_load() {
                tracing::error!("{} load failed (no sources)", res.core().filename());
                res.remove();
            }
        }

        // discovery time?
        let discover_due = {
            let last = self.last_discover.lock();
            last.map_or(true, |t| {
                t.elapsed() >= self.shared.config.tunables.discover_interval
            })
        };
        if discover_due {
            let mut needed = false;
            for res in &snapshot {
                if !res.is_removed() {
                    needed |= res.needs_discover();
                }
            }
            if needed {
                self.send_discover(None);
            }
        }

        // status update?
        let status_due = {
            let last = self.last_status.lock();
            last.map_or(true, |t| {
                t.elapsed() >= self.shared.config.tunables.status_interval
            })
        };
        if status_due {
            let mut sent = false;
            for res in &snapshot {
                if res.is_dirty() && !res.is_removed() {
                    sent |= res.send_status(None);
                }
            }
            *self.last_status.lock() = if sent { Some(Instant::now()) } else { None };
        }

        // reap: safe to drop strong references once the exclusive lock is
        // held, as no handler can still be traversing
        let delete_after = self.shared.config.tunables.res_delete_time;
        self.shared.catalog.write().retain(|res| {
            let stale = res
                .last_req_time()
                .map_or(true, |t| t.elapsed() > delete_after);
            !(res.is_removed() && stale)
        });
    }

    /// Aggregate transfer progress of `client_id` across the catalog, as a
    /// 0..=100 percentage.
    pub fn get_client_progress(&self, client_id: u16) -> u32 {
        let mut present_sum: u64 = 0;
        let mut cnt_sum: u64 = 0;
        for res in self.shared.catalog.read().iter() {
            if res.is_removed() {
                continue;
            }
            if let Some((present, cnt)) = res.client_progress(client_id) {
                present_sum += u64::from(present);
                cnt_sum += u64::from(cnt);
            }
        }
        if cnt_sum == 0 {
            100
        } else {
            (present_sum * 100 / cnt_sum) as u32
        }
    }

    #[cfg(test)]
    pub(crate) fn shared_for_tests(&self) -> &Arc<Shared> {
        &self.shared
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackHub;
    use std::fs;
    use tempfile::tempdir;

    fn make_list(dir: &Path, client: u16) -> (ResList, LoopbackHub) {
        let hub = LoopbackHub::new();
        let io = hub.endpoint(client);
        let mut config = Config::default();
        config.network.work_path = dir.join(format!("net{client}"));
        config.network.exe_path = dir.to_path_buf();
        (ResList::new(config, client, io).unwrap(), hub)
    }

    #[test]
    fn test_init_creates_work_dir() {
        let dir = tempdir().unwrap();
        let (_list, _hub) = make_list(dir.path(), 1);
        assert!(dir.path().join("net1").is_dir());
    }

    #[test]
    fn test_init_fails_on_blocked_path() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("blocked"), b"file").unwrap();
        let hub = LoopbackHub::new();
        let io = hub.endpoint(1);
        let mut config = Config::default();
        config.network.work_path = dir.path().join("blocked");
        assert!(ResList::new(config, 1, io).is_err());
    }

    #[test]
    fn test_next_res_id_window_and_skip() {
        let dir = tempdir().unwrap();
        let (list, _hub) = make_list(dir.path(), 3);
        let first = list.shared_for_tests().next_res_id().unwrap();
        let second = list.shared_for_tests().next_res_id().unwrap();
        assert_eq!(first.client(), 3);
        assert_eq!(second.client(), 3);
        assert_eq!(second.index(), first.index() + 1);
    }

    #[test]
    fn test_next_res_id_skips_anonymous_for_client_zero() {
        let dir = tempdir().unwrap();
        let (list, _hub) = make_list(dir.path(), 0);
        let id = list.shared_for_tests().next_res_id().unwrap();
        assert!(!id.is_anonymous());
        assert_eq!(id, ResId::new(0, 1));
    }

    #[test]
    fn test_add_by_file_dedupes_by_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("once.bin");
        fs::write(&path, b"only once").unwrap();
        let (list, _hub) = make_list(dir.path(), 1);

        let a = list
            .add_by_file(&path, false, ResType::Dynamic, None, None, false)
            .unwrap();
        let b = list
            .add_by_file(&path, false, ResType::Dynamic, None, None, false)
            .unwrap();
        assert_eq!(a.id(), b.id());
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_get_res_and_next_res() {
        let dir = tempdir().unwrap();
        let (list, _hub) = make_list(dir.path(), 1);
        for name in ["a.bin", "b.bin", "c.bin"] {
            let path = dir.path().join(name);
            fs::write(&path, name.as_bytes()).unwrap();
            list.add_by_file(&path, false, ResType::Dynamic, None, None, false)
                .unwrap();
        }
        let first = list.get_next_res(ResId::new(1, 0)).unwrap();
        assert_eq!(first.id(), ResId::new(1, 0));
        let second = list.get_next_res(ResId::new(1, 2)).unwrap();
        assert_eq!(second.id(), ResId::new(1, 2));
        assert!(list.get_next_res(ResId::new(1, 3)).is_none());
        assert!(list.get_res(ResId::new(1, 2)).is_some());
        assert!(list.get_res(ResId::new(2, 1)).is_none());
    }

    #[test]
    fn test_set_local_id_retargets_ids() {
        let dir = tempdir().unwrap();
        let (list, _hub) = make_list(dir.path(), 1);
        let path = dir.path().join("mine.bin");
        fs::write(&path, b"mine").unwrap();
        let res = list
            .add_by_file(&path, false, ResType::Dynamic, None, None, false)
            .unwrap();
        let old_index = res.id().index();

        list.set_local_id(7);
        assert_eq!(res.id(), ResId::new(7, old_index));
        assert_eq!(list.local_client_id(), 7);
        // allocation continues in the new window
        let next = list.shared_for_tests().next_res_id().unwrap();
        assert_eq!(next.client(), 7);
        // lookups under the new id resolve
        assert!(list.get_res(ResId::new(7, old_index)).is_some());
        assert!(list.get_res(ResId::new(1, old_index)).is_none());
    }

    #[test]
    fn test_temp_name_sanitization_and_collisions() {
        let dir = tempdir().unwrap();
        let (list, _hub) = make_list(dir.path(), 1);
        let shared = list.shared_for_tests();

        let first = shared.find_temp_res_filename("Sp icy:Name.dat").unwrap();
        assert_eq!(
            first.file_name().unwrap().to_string_lossy(),
            "Sp_icy_Name.dat"
        );
        let second = shared.find_temp_res_filename("Sp~icy?Name.dat").unwrap();
        assert_eq!(
            second.file_name().unwrap().to_string_lossy(),
            "Sp_icy_Name_2.dat"
        );
        let third = shared.find_temp_res_filename("Sp#icy!Name.dat").unwrap();
        assert_eq!(
            third.file_name().unwrap().to_string_lossy(),
            "Sp_icy_Name_3.dat"
        );
    }

    #[test]
    fn test_temp_name_uses_last_path_component() {
        let dir = tempdir().unwrap();
        let (list, _hub) = make_list(dir.path(), 1);
        let path = list
            .shared_for_tests()
            .find_temp_res_filename("Maps/Forest.zip")
            .unwrap();
        assert_eq!(path.file_name().unwrap().to_string_lossy(), "Forest.zip");
        assert!(path.starts_with(dir.path().join("net1")));
    }

    #[test]
    fn test_remove_at_client_and_reap() {
        let dir = tempdir().unwrap();
        let (list, _hub) = make_list(dir.path(), 1);
        let path = dir.path().join("gone.bin");
        fs::write(&path, b"gone").unwrap();
        let res = list
            .add_by_file(&path, false, ResType::Dynamic, None, None, false)
            .unwrap();
        let id = res.id();

        list.remove_at_client(1);
        assert!(res.is_removed());
        // still cataloged inside the grace window
        list.on_timer();
        assert!(list.get_res(id).is_some());

        // wipe the request time; the next tick reaps
        res.clear_last_req();
        list.on_timer();
        assert!(list.get_res(id).is_none());
    }

    #[test]
    fn test_clear_empties_catalog() {
        let dir = tempdir().unwrap();
        let (list, _hub) = make_list(dir.path(), 1);
        let path = dir.path().join("x.bin");
        fs::write(&path, b"x").unwrap();
        list.add_by_file(&path, false, ResType::Dynamic, None, None, false)
            .unwrap();
        list.clear();
        assert!(list.get_next_res(ResId::new(0, 0)).is_none());
    }

    #[test]
    fn test_discover_broadcast_on_timer() {
        let dir = tempdir().unwrap();
        let (list, hub) = make_list(dir.path(), 1);
        let _peer = hub.endpoint(2);
        let path = dir.path().join("announce.bin");
        fs::write(&path, b"announce").unwrap();
        list.add_by_file(&path, false, ResType::Dynamic, None, None, false)
            .unwrap();

        list.on_timer();
        let got = hub.drain(2);
        let discover = got.iter().any(|(from, pkt)| {
            *from == 1 && matches!(pkt, Ok(ResPacket::Discover(d)) if !d.ids.is_empty())
        });
        assert!(discover);
    }

    #[test]
    fn test_corrupt_packet_is_dropped() {
        let dir = tempdir().unwrap();
        let (list, hub) = make_list(dir.path(), 1);
        let _peer = hub.endpoint(2);
        let path = dir.path().join("safe.bin");
        fs::write(&path, b"safe").unwrap();
        list.add_by_file(&path, false, ResType::Dynamic, None, None, false)
            .unwrap();

        let conn = crate::transport::LoopbackConn::inbound(&hub, 2, 1);
        list.handle_packet_bytes(&[0xff, 0x00, 0x17], conn.as_ref());
        list.handle_packet_bytes(&[], conn.as_ref());
        // nothing sent back, nothing removed
        assert_eq!(hub.pending(2), 0);
        assert!(list.get_next_res(ResId::new(0, 0)).is_some());
    }

    #[test]
    fn test_progress_empty_catalog_is_complete() {
        let dir = tempdir().unwrap();
        let (list, _hub) = make_list(dir.path(), 1);
        assert_eq!(list.get_client_progress(9), 100);
    }
}
