//! End-to-end transfer scenarios over the loopback hub.

use netres_core::{
    Config, LoopbackHub, ResDelegate, ResId, ResList, ResPacket, ResType, Resource, Tunables,
};
use netres_core::transport::LoopbackConn;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn make_peer(
    root: &Path,
    hub: &LoopbackHub,
    client: u16,
    tune: impl FnOnce(&mut Tunables),
) -> ResList {
    let exe = root.join(format!("peer{client}"));
    fs::create_dir_all(&exe).unwrap();
    let mut config = Config::default();
    config.network.exe_path = exe.clone();
    config.network.work_path = exe.join("Network");
    tune(&mut config.tunables);
    ResList::new(config, client, hub.endpoint(client)).unwrap()
}

fn fast(tunables: &mut Tunables) {
    tunables.chunk_size = 4096;
    tunables.discover_interval = Duration::ZERO;
    tunables.status_interval = Duration::ZERO;
}

/// Deliver every queued packet until the network is quiescent.
fn pump(hub: &LoopbackHub, peers: &[(u16, &ResList)]) {
    loop {
        let mut any = false;
        for &(client, list) in peers {
            for (from, pkt) in hub.drain(client) {
                let pkt = pkt.expect("corrupt packet on loopback");
                let conn = LoopbackConn::inbound(hub, from, client);
                list.handle_packet(&pkt, conn.as_ref());
                any = true;
            }
        }
        if !any {
            return;
        }
    }
}

#[derive(Default)]
struct CompletionLog(Mutex<Vec<ResId>>);

impl ResDelegate for CompletionLog {
    fn on_res_complete(&self, res: &Arc<Resource>) {
        self.0.lock().unwrap().push(res.id());
    }
}

fn test_payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[test]
fn test_two_peer_transfer() {
    let dir = tempfile::tempdir().unwrap();
    let hub = LoopbackHub::new();
    let list_a = make_peer(dir.path(), &hub, 1, fast);
    let list_b = make_peer(dir.path(), &hub, 2, fast);
    let log = Arc::new(CompletionLog::default());
    list_b.set_delegate(Some(log.clone() as Arc<dyn ResDelegate>));

    // A installs a 10000-byte loose file: 3 chunks at 4096
    let payload = test_payload(10_000);
    let path = dir.path().join("peer1/level.bin");
    fs::write(&path, &payload).unwrap();
    let res_a = list_a
        .add_by_file(&path, false, ResType::Scenario, None, None, false)
        .unwrap();
    let core = res_a.core();
    assert_eq!(core.chunk_cnt(), 3);

    // B receives the announcement with an empty catalog
    let res_b = list_b.add_by_core(&core, true).unwrap();
    assert!(res_b.is_loading());

    for _ in 0..10 {
        list_a.on_timer();
        list_b.on_timer();
        pump(&hub, &[(1, &list_a), (2, &list_b)]);
        if !res_b.is_loading() {
            break;
        }
    }

    assert!(!res_b.is_loading());
    assert!(!res_b.is_removed());
    assert_eq!(fs::read(res_b.file_path()).unwrap(), payload);
    assert_eq!(log.0.lock().unwrap().as_slice(), &[core.id()]);

    // B's status broadcasts give A the full availability picture
    list_b.on_timer();
    pump(&hub, &[(1, &list_a), (2, &list_b)]);
    assert_eq!(list_a.get_client_progress(2), 100);
}

#[test]
fn test_three_peer_parallelism_respects_caps() {
    let dir = tempfile::tempdir().unwrap();
    let hub = LoopbackHub::new();
    let tune = |t: &mut Tunables| {
        t.chunk_size = 64;
        t.max_load = 4;
        t.max_load_per_peer_per_file = 2;
        t.discover_interval = Duration::ZERO;
        t.status_interval = Duration::ZERO;
    };
    let list_a = make_peer(dir.path(), &hub, 1, tune);
    let list_b = make_peer(dir.path(), &hub, 2, tune);
    let list_c = make_peer(dir.path(), &hub, 3, tune);

    // A and C hold the full resource
    let payload = test_payload(64 * 16);
    let path_a = dir.path().join("peer1/pack.bin");
    let path_c = dir.path().join("peer3/pack.bin");
    fs::write(&path_a, &payload).unwrap();
    fs::write(&path_c, &payload).unwrap();
    let res_a = list_a
        .add_by_file(&path_a, false, ResType::Definitions, None, None, false)
        .unwrap();
    let core = res_a.core();
    list_c.add_by_core(&core, false).unwrap();

    let res_b = list_b.add_by_core(&core, true).unwrap();
    assert!(res_b.is_loading());

    // process packets one at a time, mirroring B's outstanding requests
    let mut outstanding = [0i32; 2]; // [to A, to C]
    let mut served = [0u32; 2];
    let lists: [(u16, &ResList); 3] = [(1, &list_a), (2, &list_b), (3, &list_c)];
    for _ in 0..100 {
        list_a.on_timer();
        list_b.on_timer();
        list_c.on_timer();
        loop {
            let mut any = false;
            for &(client, list) in &lists {
                for (from, pkt) in hub.drain(client) {
                    let pkt = pkt.expect("corrupt packet");
                    match (&pkt, from, client) {
                        (ResPacket::Request(_), 2, 1) => outstanding[0] += 1,
                        (ResPacket::Request(_), 2, 3) => outstanding[1] += 1,
                        (ResPacket::Data(_), 1, 2) => {
                            outstanding[0] -= 1;
                            served[0] += 1;
                        }
                        (ResPacket::Data(_), 3, 2) => {
                            outstanding[1] -= 1;
                            served[1] += 1;
                        }
                        _ => {}
                    }
                    assert!(outstanding[0] <= 2, "more than 2 outstanding at one source");
                    assert!(outstanding[1] <= 2, "more than 2 outstanding at one source");
                    assert!(
                        outstanding[0] + outstanding[1] <= 4,
                        "more than MaxLoad outstanding"
                    );
                    let conn = LoopbackConn::inbound(&hub, from, client);
                    list.handle_packet(&pkt, conn.as_ref());
                    any = true;
                }
            }
            if !any {
                break;
            }
        }
        if !res_b.is_loading() {
            break;
        }
    }

    assert!(!res_b.is_loading());
    assert!(!res_b.is_removed());
    assert_eq!(fs::read(res_b.file_path()).unwrap(), payload);
    // both sources contributed
    assert!(served[0] > 0 && served[1] > 0);
    assert_eq!(served[0] + served[1], 16);
}

#[test]
fn test_request_timeout_falls_back_to_other_source() {
    let dir = tempfile::tempdir().unwrap();
    let hub = LoopbackHub::new();
    let tune = |t: &mut Tunables| {
        t.chunk_size = 128;
        t.load_timeout = Duration::from_millis(30);
        t.discover_interval = Duration::ZERO;
        t.status_interval = Duration::ZERO;
    };
    let list_a = make_peer(dir.path(), &hub, 1, tune);
    let list_b = make_peer(dir.path(), &hub, 2, tune);
    let list_c = make_peer(dir.path(), &hub, 3, tune);

    let payload = test_payload(128 * 8);
    for peer in [1u16, 3] {
        let path = dir.path().join(format!("peer{peer}/map.bin"));
        fs::write(&path, &payload).unwrap();
    }
    let res_a = list_a
        .add_by_file(
            &dir.path().join("peer1/map.bin"),
            false,
            ResType::Material,
            None,
            None,
            false,
        )
        .unwrap();
    let core = res_a.core();
    list_c.add_by_core(&core, false).unwrap();
    let res_b = list_b.add_by_core(&core, true).unwrap();

    // let B learn both sources and send its first requests
    list_b.on_timer();
    // discover reaches A and C; their statuses queue at B
    for &(client, list) in &[(1u16, &list_a), (3u16, &list_c)] {
        for (from, pkt) in hub.drain(client) {
            let pkt = pkt.unwrap();
            let conn = LoopbackConn::inbound(&hub, from, client);
            list.handle_packet(&pkt, conn.as_ref());
        }
    }
    // B starts one load at each source
    pump(&hub, &[(2, &list_b)]);

    // A drops off with a request still pending; that slot must expire and
    // the chunk be re-requested from C
    hub.disconnect(1);

    for _ in 0..20 {
        list_b.on_timer();
        pump(&hub, &[(2, &list_b), (3, &list_c)]);
        if !res_b.is_loading() {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }

    assert!(!res_b.is_loading());
    assert!(!res_b.is_removed());
    assert_eq!(fs::read(res_b.file_path()).unwrap(), payload);
}

#[test]
fn test_zero_byte_resource_completes_without_data() {
    let dir = tempfile::tempdir().unwrap();
    let hub = LoopbackHub::new();
    let list_a = make_peer(dir.path(), &hub, 1, fast);
    let list_b = make_peer(dir.path(), &hub, 2, fast);

    let path = dir.path().join("peer1/empty.bin");
    fs::write(&path, b"").unwrap();
    let res_a = list_a
        .add_by_file(&path, false, ResType::Dynamic, None, None, false)
        .unwrap();
    let core = res_a.core();
    assert_eq!(core.chunk_cnt(), 0);

    let res_b = list_b.add_by_core(&core, true).unwrap();
    list_b.on_timer();
    assert!(!res_b.is_loading());
    assert!(!res_b.is_removed());
    assert_eq!(fs::metadata(res_b.file_path()).unwrap().len(), 0);
}

#[test]
fn test_unreachable_source_times_out_and_removes() {
    let dir = tempfile::tempdir().unwrap();
    let hub = LoopbackHub::new();
    let tune = |t: &mut Tunables| {
        t.chunk_size = 128;
        t.discover_timeout = Duration::from_millis(20);
        t.discover_interval = Duration::ZERO;
        t.status_interval = Duration::ZERO;
    };
    let list_b = make_peer(dir.path(), &hub, 2, tune);

    // announcement for a resource nobody will ever serve
    let mut core = netres_core::ResCore::new(
        ResType::Scenario,
        ResId::new(1, 1),
        "ghost.bin",
        0x1234,
        "",
    );
    core.set_loadable(1024, 0x5678);
    let res_b = list_b.add_by_core(&core, true).unwrap();
    assert!(res_b.is_loading());

    list_b.on_timer(); // arms the discover timer
    std::thread::sleep(Duration::from_millis(30));
    list_b.on_timer();
    assert!(res_b.is_removed());
}
