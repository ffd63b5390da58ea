//! Integration tests: a source and a sink session driven through the public
//! API, over the in-memory link and over loopback TCP.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use cast_session::channel::memory::MemoryConnection;
use cast_session::channel::tcp::TcpConnection;
use cast_session::channel::Connection;
use cast_session::protocol::feature;
use cast_session::session::event;
use cast_session::{
    CastError, CastMode, ConnectionRegistry, DeviceRegistry, DeviceState, EventCode, LinkType,
    MirrorRenderer, ModuleType, RemoteDevice, Session, SessionConfig, SessionListener,
    SessionRole, SessionState, StreamManager,
};
use parking_lot::Mutex;

const SOURCE_ID: &str = "phone";
const SINK_ID: &str = "tv";

#[derive(Default)]
struct Recorder {
    states: Mutex<Vec<(DeviceState, String, EventCode)>>,
    events: Mutex<Vec<(i32, String)>>,
}

impl Recorder {
    fn saw(&self, state: DeviceState, code: EventCode) -> bool {
        self.states
            .lock()
            .iter()
            .any(|(s, _, c)| *s == state && *c == code)
    }

    fn saw_event(&self, event_id: i32) -> Option<String> {
        self.events
            .lock()
            .iter()
            .find(|(id, _)| *id == event_id)
            .map(|(_, json)| json.clone())
    }
}

impl SessionListener for Recorder {
    fn on_device_state(&self, state: DeviceState, device_id: &str, event_code: EventCode) {
        self.states
            .lock()
            .push((state, device_id.to_string(), event_code));
    }

    fn on_event(&self, event_id: i32, json: &str) {
        self.events.lock().push((event_id, json.to_string()));
    }
}

#[derive(Default)]
struct Screen {
    playback: Mutex<Vec<bool>>,
}

impl MirrorRenderer for Screen {
    fn set_surface(&self, _surface: &str) {}

    fn on_playback(&self, playing: bool) {
        self.playback.lock().push(playing);
    }

    fn on_media_data(&self, _module: ModuleType, _data: &[u8]) {}
}

#[derive(Default)]
struct Player {
    actions: Mutex<Vec<String>>,
    render_ready: Mutex<bool>,
}

impl StreamManager for Player {
    fn player_capability(&self) -> String {
        "h264,aac".to_string()
    }

    fn on_peer_action(&self, action: &str) {
        self.actions.lock().push(action.to_string());
    }

    fn on_render_ready(&self) {
        *self.render_ready.lock() = true;
    }

    fn on_stream_data(&self, _data: &[u8]) {}
}

fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(10));
    }
}

fn registry(connection: Arc<dyn Connection>) -> ConnectionRegistry {
    let registry = ConnectionRegistry::new();
    registry.register(LinkType::Tcp, connection);
    registry
}

fn devices(peer_id: &str) -> Arc<DeviceRegistry> {
    let devices = DeviceRegistry::new();
    devices.add(RemoteDevice::new(peer_id, "127.0.0.1", LinkType::Tcp), true);
    Arc::new(devices)
}

fn config(role: SessionRole, local_id: &str) -> SessionConfig {
    let mut config = SessionConfig::new(role, local_id);
    config.local_device.ip_address = "127.0.0.1".to_string();
    config.listener_wait = Duration::from_millis(200);
    config.local_params.features = [feature::CUSTOM_PARAMS, feature::RENDER_READY]
        .into_iter()
        .collect();
    config
}

struct Pair {
    source: Session,
    source_events: Arc<Recorder>,
    sink: Session,
    sink_events: Arc<Recorder>,
}

/// Start a source, hand its consult data to a sink and connect both.
fn connect(
    source_config: SessionConfig,
    source_link: Arc<dyn Connection>,
    sink_link: Arc<dyn Connection>,
) -> Pair {
    let source = Session::new(source_config, registry(source_link), devices(SINK_ID))
        .expect("source session");
    let source_events = Arc::new(Recorder::default());
    source.register_listener(1, source_events.clone());
    source.add_device(SINK_ID).expect("source add_device");

    wait_until("consult data", || source.session_properties().is_some());
    let consult = source.consult_data().expect("consult data");

    let sink = Session::new(
        config(SessionRole::Sink, SINK_ID),
        registry(sink_link),
        devices(SOURCE_ID),
    )
    .expect("sink session");
    let sink_events = Arc::new(Recorder::default());
    sink.register_listener(2, sink_events.clone());
    sink.set_session_properties_json(&consult)
        .expect("consult json");
    sink.add_device(SOURCE_ID).expect("sink add_device");

    Pair {
        source,
        source_events,
        sink,
        sink_events,
    }
}

#[test]
fn memory_link_connect_play_and_teardown() {
    let link: Arc<dyn Connection> = Arc::new(MemoryConnection::new());
    let pair = connect(config(SessionRole::Source, SOURCE_ID), link.clone(), link);

    wait_until("both paused", || {
        pair.source.state() == SessionState::Paused && pair.sink.state() == SessionState::Paused
    });
    assert_eq!(pair.sink.session_id(), pair.source.session_id());
    assert_eq!(
        pair.sink.device(SOURCE_ID).map(|d| d.state),
        Some(DeviceState::Paused)
    );

    pair.source.play().unwrap();
    wait_until("both playing", || {
        pair.source.state() == SessionState::Playing && pair.sink.state() == SessionState::Playing
    });

    pair.source.remove_device(SINK_ID).unwrap();
    wait_until("both disconnected", || {
        pair.source.state() == SessionState::Disconnected
            && pair.sink.state() == SessionState::Disconnected
    });
    assert!(pair.source_events.saw(DeviceState::Disconnected, EventCode::None));
    assert!(
        pair.sink_events
            .saw(DeviceState::Disconnected, EventCode::PeerDisconnected)
    );
    assert!(pair.source.device_ids().is_empty());
}

#[test]
fn tcp_link_connects_and_releases() {
    let pair = connect(
        config(SessionRole::Source, SOURCE_ID),
        Arc::new(TcpConnection::new()),
        Arc::new(TcpConnection::new()),
    );

    wait_until("both paused over tcp", || {
        pair.source.state() == SessionState::Paused && pair.sink.state() == SessionState::Paused
    });

    let Pair {
        source,
        sink,
        sink_events,
        ..
    } = pair;
    drop(source);
    wait_until("sink disconnected", || {
        sink.state() == SessionState::Disconnected
    });
    assert!(sink_events.saw(DeviceState::Disconnected, EventCode::PeerDisconnected));
}

#[test]
fn mirror_player_follows_playback() {
    let link: Arc<dyn Connection> = Arc::new(MemoryConnection::new());
    let pair = connect(config(SessionRole::Source, SOURCE_ID), link.clone(), link);
    let screen = Arc::new(Screen::default());
    let player = pair.sink.create_mirror_player(screen.clone());

    wait_until("sink paused", || pair.sink.state() == SessionState::Paused);
    player.play().unwrap();
    wait_until("source playing", || {
        pair.source.state() == SessionState::Playing
    });
    wait_until("sink playing", || pair.sink.state() == SessionState::Playing);
    assert_eq!(screen.playback.lock().last(), Some(&true));

    player.release();
    assert!(matches!(player.play(), Err(CastError::InvalidRequest(_))));
}

#[test]
fn stream_mode_carries_actions_and_render_ready() {
    let link: Arc<dyn Connection> = Arc::new(MemoryConnection::new());
    let mut source_config = config(SessionRole::Source, SOURCE_ID);
    source_config.cast_mode = CastMode::Stream;
    let pair = connect(source_config, link.clone(), link);
    let manager = Arc::new(Player::default());
    pair.source.set_stream_manager(Some(manager.clone()));

    wait_until("both streaming", || {
        pair.source.state() == SessionState::Stream && pair.sink.state() == SessionState::Stream
    });
    assert_eq!(pair.sink.cast_mode(), CastMode::Stream);

    pair.sink.send_stream_action(r#"{"action":"seek"}"#).unwrap();
    wait_until("peer action", || !manager.actions.lock().is_empty());
    assert_eq!(*manager.actions.lock(), vec![r#"{"action":"seek"}"#.to_string()]);
    assert_eq!(
        pair.source_events.saw_event(event::STREAM_ACTION).as_deref(),
        Some(r#"{"action":"seek"}"#)
    );

    pair.sink
        .send_stream_action(cast_session::session::RENDER_READY_ACTION)
        .unwrap();
    wait_until("render ready", || *manager.render_ready.lock());
    assert!(pair.source_events.saw_event(event::RENDER_READY).is_some());
}

#[test]
fn add_device_without_listener_fails() {
    let mut config = config(SessionRole::Source, SOURCE_ID);
    config.listener_wait = Duration::from_millis(20);
    let session = Session::new(
        config,
        registry(Arc::new(MemoryConnection::new())),
        devices(SINK_ID),
    )
    .unwrap();

    assert!(matches!(
        session.add_device(SINK_ID),
        Err(CastError::NoListener)
    ));
    assert_eq!(session.state(), SessionState::Disconnected);
}

#[test]
fn add_device_rejects_bad_requests() {
    let mut sink_config = config(SessionRole::Sink, SINK_ID);
    sink_config.properties_wait = Duration::from_millis(20);
    let sink = Session::new(
        sink_config,
        registry(Arc::new(MemoryConnection::new())),
        devices(SOURCE_ID),
    )
    .unwrap();
    sink.register_listener(1, Arc::new(Recorder::default()));

    assert!(matches!(
        sink.add_device(""),
        Err(CastError::InvalidRequest(_))
    ));
    assert!(matches!(
        sink.add_device("unknown"),
        Err(CastError::DeviceNotFound(_))
    ));
    assert!(matches!(
        sink.add_device(SOURCE_ID),
        Err(CastError::PropertiesTimeout)
    ));
}

#[test]
fn connect_timeout_reports_connection_failed() {
    let mut config = config(SessionRole::Source, SOURCE_ID);
    config.connect_timeout = Duration::from_millis(100);
    let source = Session::new(
        config,
        registry(Arc::new(MemoryConnection::new())),
        devices(SINK_ID),
    )
    .unwrap();
    let events = Arc::new(Recorder::default());
    source.register_listener(1, events.clone());

    source.add_device(SINK_ID).unwrap();
    wait_until("connect timeout", || {
        events.saw(DeviceState::Disconnected, EventCode::ConnectionFailed)
    });
    wait_until("disconnected", || {
        source.state() == SessionState::Disconnected
    });
    assert!(source.session_properties().is_none());
}

#[test]
fn released_session_rejects_messages() {
    let session = Session::new(
        config(SessionRole::Source, SOURCE_ID),
        registry(Arc::new(MemoryConnection::new())),
        devices(SINK_ID),
    )
    .unwrap();
    let other = session.clone();

    session.release();
    assert!(matches!(other.play(), Err(CastError::SessionClosed)));
}
