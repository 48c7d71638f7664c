//! End-to-end session scenarios over the in-memory transport.
//!
//! Each test wires real devices (engine loops, chunk stores on tempdirs,
//! watchdogs) together with linked memory connections and drives the
//! public API the way an embedding UI would.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use quadio_core::transport::memory::{link as memory_link, Endpoint, MemoryConnection};
use quadio_core::{
    ChannelMode, ConnectionType, Device, EngineConfig, EngineEvent, EventBridge, EventEmitter,
    LinkKind, LinkMeta, Message, NullSink, PeerConnection, PeerEvent, PlayerStateTag,
    PreloadEvent, TransferEvent, WireFrame,
};

static CONN_SEQ: AtomicUsize = AtomicUsize::new(0);

struct TestDevice {
    device: Arc<Device>,
    events: Arc<EventBridge>,
    _staging: tempfile::TempDir,
}

fn spawn_device(label: &str) -> TestDevice {
    spawn_device_with(label, EngineConfig::default())
}

fn spawn_device_with(label: &str, mut config: EngineConfig) -> TestDevice {
    let staging = tempfile::tempdir().unwrap();
    config.staging_dir = Some(staging.path().to_path_buf());
    let events = EventBridge::new(512);
    let device = Device::new(
        label,
        config,
        Arc::new(NullSink::new()),
        Arc::clone(&events) as Arc<dyn EventEmitter>,
    )
    .unwrap();
    device.start();
    TestDevice {
        device,
        events,
        _staging: staging,
    }
}

/// Connects a guest to a hosting device. Returns (host_side, guest_side).
fn connect(host: &TestDevice, guest: &TestDevice) -> (Arc<MemoryConnection>, Arc<MemoryConnection>) {
    let seq = CONN_SEQ.fetch_add(1, Ordering::Relaxed);
    let (host_side, guest_side) = memory_link(
        Endpoint {
            conn_id: format!("conn-{seq}-h"),
            meta: LinkMeta {
                peer_id: guest.device.id().to_string(),
                kind: LinkKind::Control,
            },
            inbox: host.device.inbox_sender(),
        },
        Endpoint {
            conn_id: format!("conn-{seq}-g"),
            meta: LinkMeta {
                peer_id: host.device.id().to_string(),
                kind: LinkKind::Control,
            },
            inbox: guest.device.inbox_sender(),
        },
    );
    guest
        .device
        .join_session(Arc::clone(&guest_side) as Arc<dyn PeerConnection>);
    (host_side, guest_side)
}

/// Links two guests with a data-relay connection (downstream dials
/// upstream after ASSIGN_DATA_SOURCE).
fn connect_relay(
    upstream: &TestDevice,
    downstream: &TestDevice,
) -> (Arc<MemoryConnection>, Arc<MemoryConnection>) {
    let seq = CONN_SEQ.fetch_add(1, Ordering::Relaxed);
    let (up_side, down_side) = memory_link(
        Endpoint {
            conn_id: format!("relay-{seq}-up"),
            meta: LinkMeta {
                peer_id: downstream.device.id().to_string(),
                kind: LinkKind::DataRelay,
            },
            inbox: upstream.device.inbox_sender(),
        },
        Endpoint {
            conn_id: format!("relay-{seq}-down"),
            meta: LinkMeta {
                peer_id: upstream.device.id().to_string(),
                kind: LinkKind::DataRelay,
            },
            inbox: downstream.device.inbox_sender(),
        },
    );
    downstream
        .device
        .attach_upstream_data(Arc::clone(&down_side) as Arc<dyn PeerConnection>);
    (up_side, down_side)
}

/// Waits until `guests` peers passed the candidate-pair probe; broadcast
/// media only flows to peers confirmed LAN-local, so hosts must wait out
/// the probe window before a track change reaches anyone.
async fn wait_probed(host: &TestDevice, guests: usize) {
    wait_until("guests probed local", Duration::from_secs(4), || {
        host.device
            .device_entries()
            .iter()
            .filter(|d| d.connection_type == Some(ConnectionType::Local))
            .count()
            == guests
    })
    .await;
}

async fn wait_until<F>(what: &str, timeout: Duration, mut f: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if f() {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for: {what}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn track_bytes(len: usize, seed: u8) -> Bytes {
    Bytes::from((0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect::<Vec<u8>>())
}

// ─────────────────────────────────────────────────────────────────────────────
// S1: two-guest happy path
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn two_guest_happy_path_syncs_playback() {
    let host = spawn_device("Host");
    let g1 = spawn_device("Guest 1");
    let g2 = spawn_device("Guest 2");

    let code = host.device.host_session(|_| false).unwrap();
    assert_eq!(code.len(), 6);

    connect(&host, &g1);
    connect(&host, &g2);
    wait_until("both guests admitted", Duration::from_secs(2), || {
        host.device.device_entries().len() == 3
    })
    .await;
    wait_probed(&host, 2).await;

    // 160 KiB track: 10 chunks of 16 KiB.
    let source = track_bytes(160 * 1024, 1);
    host.device
        .add_local_file("t1.wav", "Track 1", "audio/wav", source.clone());
    host.device.play_track(0).await;

    for guest in [&g1, &g2] {
        wait_until("guest staged and playing", Duration::from_secs(3), || {
            guest.device.state_tag() == PlayerStateTag::PlayingAudio
        })
        .await;
        assert_eq!(guest.device.track_blob(0).unwrap(), source);
    }

    // A sync round converges guest position onto the host clock.
    tokio::time::sleep(Duration::from_millis(300)).await;
    g1.device.request_resync();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let drift = (g1.device.position() - host.device.position()).abs();
    assert!(drift < 0.2, "post-resync drift {drift}s");
    assert_eq!(host.device.state_tag(), PlayerStateTag::PlayingAudio);
}

// ─────────────────────────────────────────────────────────────────────────────
// S2: recovery after stall
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn watchdog_recovers_lost_chunks() {
    let host = spawn_device("Host");
    let g1 = spawn_device("Guest 1");

    host.device.host_session(|_| false).unwrap();
    let (host_side, _guest_side) = connect(&host, &g1);
    wait_until("guest admitted", Duration::from_secs(2), || {
        host.device.device_entries().len() == 2
    })
    .await;

    wait_probed(&host, 1).await;
    let mut transfer_events = g1.events.subscribe();

    // Headers cross, every media chunk is lost.
    host_side.set_drop_media(true);
    let source = track_bytes(50 * 16 * 1024, 2); // 50 chunks
    host.device
        .add_local_file("t2.wav", "Track 2", "audio/wav", source.clone());
    host.device.play_track(0).await;

    // Heal the link once the transfer is definitely underway.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    host_side.set_drop_media(false);

    // The chunk watchdog notices zero progress within ~5 s and asks the
    // host to resend; the resumed stream completes the file.
    wait_until("guest staged after recovery", Duration::from_secs(15), || {
        g1.device.track_blob(0).map(|b| b == source).unwrap_or(false)
    })
    .await;

    let mut recovered = false;
    while let Ok(event) = transfer_events.try_recv() {
        if matches!(
            event,
            EngineEvent::Transfer(TransferEvent::RecoveryRequested { .. })
        ) {
            recovered = true;
        }
    }
    assert!(recovered, "recovery request was issued");
    assert_eq!(g1.device.state_tag(), PlayerStateTag::PlayingAudio);
}

// ─────────────────────────────────────────────────────────────────────────────
// S3: session preemption
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn newer_session_preempts_older_broadcast() {
    let host = spawn_device("Host");
    let g1 = spawn_device("Guest 1");

    host.device.host_session(|_| false).unwrap();
    connect(&host, &g1);
    wait_until("guest admitted", Duration::from_secs(2), || {
        host.device.device_entries().len() == 2
    })
    .await;

    wait_probed(&host, 1).await;

    let big = track_bytes(100 * 16 * 1024, 3); // 100 chunks
    let second = track_bytes(8 * 16 * 1024, 4);
    host.device
        .add_local_file("big.wav", "Big", "audio/wav", big);
    host.device
        .add_local_file("second.wav", "Second", "audio/wav", second.clone());

    // Operator picks a new track while the first broadcast is in flight.
    host.device.play_track(0).await;
    host.device.play_track(1).await;

    wait_until("guest converges on track 1", Duration::from_secs(5), || {
        g1.device.current_track_index() == 1
            && g1
                .device
                .track_blob(1)
                .map(|b| b == second)
                .unwrap_or(false)
    })
    .await;
    wait_until("guest plays the new session", Duration::from_secs(3), || {
        g1.device.state_tag() == PlayerStateTag::PlayingAudio
    })
    .await;
}

// ─────────────────────────────────────────────────────────────────────────────
// S4: preload hit on track change
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn preload_hit_changes_track_with_zero_transfer() {
    let host = spawn_device("Host");
    let g1 = spawn_device("Guest 1");

    host.device.host_session(|_| false).unwrap();
    connect(&host, &g1);
    wait_until("guest admitted", Duration::from_secs(2), || {
        host.device.device_entries().len() == 2
    })
    .await;

    wait_probed(&host, 1).await;

    let first = track_bytes(4 * 16 * 1024, 5);
    let second = track_bytes(6 * 16 * 1024, 6);
    host.device
        .add_local_file("a.wav", "A", "audio/wav", first);
    host.device
        .add_local_file("b.wav", "B", "audio/wav", second.clone());

    let mut preload_events = g1.events.subscribe();
    host.device.play_track(0).await;

    // The preload debounce (500 ms) then the background transfer stage
    // track 1 on the guest.
    wait_until("preload ready on guest", Duration::from_secs(5), || {
        loop {
            match preload_events.try_recv() {
                Ok(EngineEvent::Preload(PreloadEvent::Ready { index: 1 })) => return true,
                Ok(_) => continue,
                Err(_) => return false,
            }
        }
    })
    .await;

    // Give the PRELOAD_ACK a moment to land on the host, then change
    // track to the cached index: no new media transfer.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let mut transfer_events = g1.events.subscribe();
    host.device.play_track(1).await;

    wait_until("guest switched to track 1", Duration::from_secs(3), || {
        g1.device.current_track_index() == 1
            && g1.device.state_tag() == PlayerStateTag::PlayingAudio
    })
    .await;
    assert_eq!(g1.device.track_blob(1).unwrap(), second);

    while let Ok(event) = transfer_events.try_recv() {
        if let EngineEvent::Transfer(TransferEvent::Progress { name, .. }) = event {
            assert_ne!(name, "b.wav", "cached track must not re-transfer");
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// S5: late join mid-play
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn late_joiner_bootstraps_to_live_position() {
    let host = spawn_device("Host");

    host.device.host_session(|_| false).unwrap();
    let source = track_bytes(10 * 16 * 1024, 7);
    host.device
        .add_local_file("live.wav", "Live", "audio/wav", source.clone());
    host.device
        .add_external_stream("radio", "Radio", "ext-1");
    host.device.play_track(0).await;

    // Host has been playing for a while before the guest shows up.
    tokio::time::sleep(Duration::from_millis(1200)).await;

    let g3 = spawn_device("Guest 3");
    g3.device.set_channel_mode(ChannelMode::Center);
    connect(&host, &g3);

    wait_until("late joiner playing", Duration::from_secs(5), || {
        g3.device.state_tag() == PlayerStateTag::PlayingAudio
    })
    .await;

    // Bootstrap carried playlist and repeat state.
    assert_eq!(g3.device.playlist_len(), 2);
    assert_eq!(g3.device.current_track_index(), 0);
    assert_eq!(g3.device.track_blob(0).unwrap(), source);

    // One sync round converges the clocks.
    g3.device.request_resync();
    tokio::time::sleep(Duration::from_millis(300)).await;
    let drift = (g3.device.position() - host.device.position()).abs();
    assert!(drift < 0.2, "late joiner drift {drift}s");
    assert!(host.device.position() > 1.0);
}

// ─────────────────────────────────────────────────────────────────────────────
// S6: relay catch-up
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn relayed_guest_receives_through_upstream_peer() {
    let host = spawn_device_with(
        "Host",
        EngineConfig {
            max_direct_data_peers: 1,
            ..Default::default()
        },
    );
    let ga = spawn_device("Guest A");
    let gb = spawn_device("Guest B");

    host.device.host_session(|_| false).unwrap();
    connect(&host, &ga);
    wait_until("guest A admitted", Duration::from_secs(2), || {
        host.device.device_entries().len() == 2
    })
    .await;
    wait_probed(&host, 1).await;

    let mut gb_events = gb.events.subscribe();
    connect(&host, &gb);
    wait_until("guest B told to relay", Duration::from_secs(2), || loop {
        match gb_events.try_recv() {
            Ok(EngineEvent::Peer(PeerEvent::DataSourceAssigned { .. })) => return true,
            Ok(_) => continue,
            Err(_) => return false,
        }
    })
    .await;

    let (_up_side, down_side) = connect_relay(&ga, &gb);

    // B asks before A has anything: FILE_WAIT, then live forwarding covers
    // the whole file once the host starts sending.
    down_side
        .send(WireFrame::control(Message::RequestCurrentFile {
            name: None,
            index: None,
        }))
        .expect("relay request send");
    tokio::time::sleep(Duration::from_millis(100)).await;

    let source = track_bytes(12 * 16 * 1024, 8);
    host.device
        .add_local_file("relay.wav", "Relay", "audio/wav", source.clone());
    host.device.play_track(0).await;

    wait_until("A staged the file", Duration::from_secs(5), || {
        ga.device.track_blob(0).map(|b| b == source).unwrap_or(false)
    })
    .await;
    wait_until("B staged via relay", Duration::from_secs(10), || {
        gb.device.track_blob(0).map(|b| b == source).unwrap_or(false)
    })
    .await;
    assert_eq!(gb.device.state_tag(), PlayerStateTag::PlayingAudio);
}

// ─────────────────────────────────────────────────────────────────────────────
// Invariants
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn leave_session_clears_timers_links_and_state() {
    let host = spawn_device("Host");
    let g1 = spawn_device("Guest 1");

    host.device.host_session(|_| false).unwrap();
    let (_host_side, guest_side) = connect(&host, &g1);
    wait_until("guest admitted", Duration::from_secs(2), || {
        host.device.device_entries().len() == 2
    })
    .await;

    wait_probed(&host, 1).await;
    let source = track_bytes(4 * 16 * 1024, 9);
    host.device
        .add_local_file("t.wav", "T", "audio/wav", source);
    host.device.play_track(0).await;
    wait_until("guest playing", Duration::from_secs(3), || {
        g1.device.state_tag() == PlayerStateTag::PlayingAudio
    })
    .await;

    g1.device.leave_session().await;
    assert_eq!(g1.device.active_timer_count(), 0, "no orphaned timers");
    assert_eq!(g1.device.state_tag(), PlayerStateTag::Idle);
    assert!(!guest_side.is_open(), "transport connection closed");

    // The host notices the guest is gone.
    wait_until("host releases the slot", Duration::from_secs(2), || {
        host.device.device_entries().len() == 1
    })
    .await;
}

#[tokio::test]
async fn kicked_guest_detaches_cleanly() {
    let host = spawn_device("Host");
    let g1 = spawn_device("Guest 1");

    host.device.host_session(|_| false).unwrap();
    connect(&host, &g1);
    wait_until("guest admitted", Duration::from_secs(2), || {
        host.device.device_entries().len() == 2
    })
    .await;

    let guest_id = g1.device.id().to_string();
    host.device.kick_peer(&guest_id);

    wait_until("guest self-disconnects", Duration::from_secs(3), || {
        g1.device.state_tag() == PlayerStateTag::Idle
            && g1.device.active_timer_count() == 0
    })
    .await;
}

#[tokio::test]
async fn fourth_guest_gets_session_full() {
    let host = spawn_device("Host");
    host.device.host_session(|_| false).unwrap();

    let guests: Vec<TestDevice> = (0..3).map(|i| spawn_device(&format!("G{i}"))).collect();
    for guest in &guests {
        connect(&host, guest);
    }
    wait_until("three guests admitted", Duration::from_secs(2), || {
        host.device.device_entries().len() == 4
    })
    .await;

    let g4 = spawn_device("G4");
    let mut g4_events = g4.events.subscribe();
    connect(&host, &g4);

    wait_until("fourth guest rejected", Duration::from_secs(2), || loop {
        match g4_events.try_recv() {
            Ok(EngineEvent::Peer(PeerEvent::SessionFull)) => return true,
            Ok(_) => continue,
            Err(_) => return false,
        }
    })
    .await;
    assert_eq!(host.device.device_entries().len(), 4);
}

#[tokio::test]
async fn operator_gate_ignores_unauthorized_requests() {
    let host = spawn_device("Host");
    let g1 = spawn_device("Guest 1");

    host.device.host_session(|_| false).unwrap();
    connect(&host, &g1);
    wait_until("guest admitted", Duration::from_secs(2), || {
        host.device.device_entries().len() == 2
    })
    .await;

    wait_probed(&host, 1).await;
    let source = track_bytes(4 * 16 * 1024, 10);
    host.device
        .add_local_file("t.wav", "T", "audio/wav", source);
    host.device.play_track(0).await;
    wait_until("host playing", Duration::from_secs(2), || {
        host.device.state_tag() == PlayerStateTag::PlayingAudio
    })
    .await;

    // Without the operator flag the pause request is dropped.
    g1.device.pause().await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(host.device.state_tag(), PlayerStateTag::PlayingAudio);

    // Granting the flag makes the same request effective.
    host.device.set_peer_operator(g1.device.id(), true);
    tokio::time::sleep(Duration::from_millis(200)).await;
    g1.device.pause().await;
    wait_until("host paused by operator", Duration::from_secs(2), || {
        host.device.state_tag() == PlayerStateTag::Paused
    })
    .await;
}
