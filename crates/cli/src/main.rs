use std::io;
use std::sync::Arc;
use std::time::Duration;

use cast_session::channel::tcp::TcpConnection;
use cast_session::protocol::{FeatureSet, feature};
use cast_session::{
    CastMode, ConnectionRegistry, DeviceRegistry, DeviceState, EventCode, LinkType, ModuleType,
    MirrorRenderer, RemoteDevice, Session, SessionConfig, SessionListener, SessionProperties,
    SessionRole,
};
use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "cast-session",
    about = "Run one end of a cast session over TCP"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Listen for a sink and print the consult data to hand it
    Source {
        #[command(flatten)]
        common: Common,
        /// Cast mode to propose
        #[arg(long, default_value = "mirror")]
        mode: CastMode,
        /// Offer a remote-control channel
        #[arg(long)]
        remote_control: bool,
    },
    /// Connect to a source using its consult data
    Sink {
        #[command(flatten)]
        common: Common,
        /// Consult data JSON printed by the source
        #[arg(long)]
        consult: String,
    },
}

#[derive(Args)]
struct Common {
    /// This device's id
    #[arg(long)]
    device_id: String,
    /// The peer's device id
    #[arg(long)]
    peer_id: String,
    /// Local address to listen on
    #[arg(long, default_value = "")]
    bind_ip: String,
    /// Peer address, when the consult data does not carry one
    #[arg(long, default_value = "127.0.0.1")]
    peer_ip: String,
    /// Seconds to wait for the connect to complete
    #[arg(long, default_value_t = 60)]
    timeout: u64,
}

struct Printer;

impl SessionListener for Printer {
    fn on_device_state(&self, state: DeviceState, device_id: &str, event_code: EventCode) {
        match event_code {
            EventCode::None => println!("{device_id}: {state}"),
            code => println!("{device_id}: {state} ({})", code.code()),
        }
    }

    fn on_event(&self, event_id: i32, json: &str) {
        println!("event {event_id}: {json}");
    }
}

struct LogRenderer;

impl MirrorRenderer for LogRenderer {
    fn set_surface(&self, surface: &str) {
        tracing::info!(surface, "surface set");
    }

    fn on_playback(&self, playing: bool) {
        tracing::info!(playing, "playback");
    }

    fn on_media_data(&self, module: ModuleType, data: &[u8]) {
        tracing::debug!(?module, len = data.len(), "media");
    }
}

fn config(role: SessionRole, common: &Common) -> SessionConfig {
    let mut config = SessionConfig::new(role, &common.device_id);
    config.local_device.ip_address = common.bind_ip.clone();
    config.link_type = LinkType::Tcp;
    config.connect_timeout = Duration::from_secs(common.timeout);
    config
}

fn run(cli: Cli) -> cast_session::Result<()> {
    let registry = ConnectionRegistry::new();
    registry.register(LinkType::Tcp, Arc::new(TcpConnection::new()));
    let devices = DeviceRegistry::new();

    let (session, peer_id) = match cli.command {
        Command::Source {
            common,
            mode,
            remote_control,
        } => {
            let mut config = config(SessionRole::Source, &common);
            config.cast_mode = mode;
            let mut features: FeatureSet = [feature::CUSTOM_PARAMS, feature::RENDER_READY]
                .into_iter()
                .collect();
            if remote_control {
                features.insert(feature::REMOTE_CONTROL);
            }
            config.local_params.features = features;

            // Untrusted, so the consult data is reported as an event.
            devices.add(
                RemoteDevice::new(&common.peer_id, &common.peer_ip, LinkType::Tcp),
                false,
            );
            let session = Session::new(config, registry, Arc::new(devices))?;
            (session, common.peer_id)
        }
        Command::Sink { common, consult } => {
            let properties = SessionProperties::from_json(&consult)?;
            let mut config = config(SessionRole::Sink, &common);
            config.local_params.features = [
                feature::CUSTOM_PARAMS,
                feature::RENDER_READY,
                feature::REMOTE_CONTROL,
            ]
            .into_iter()
            .collect();

            let peer_ip = match properties.ip_address.as_str() {
                "" | "0.0.0.0" => common.peer_ip.clone(),
                ip => ip.to_string(),
            };
            devices.add(
                RemoteDevice::new(&common.peer_id, &peer_ip, LinkType::Tcp),
                true,
            );
            let session = Session::new(config, registry, Arc::new(devices))?;
            session.set_session_properties(properties);
            (session, common.peer_id)
        }
    };

    session.register_listener(std::process::id(), Arc::new(Printer));
    let player = session.create_mirror_player(Arc::new(LogRenderer));
    session.add_device(&peer_id)?;

    println!(
        "session {} ({:?}), press Enter to stop",
        session.session_id_string(),
        session.role()
    );
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;

    player.release();
    session.release();
    Ok(())
}

fn main() {
    tracing_subscriber::fmt::init();

    if let Err(e) = run(Cli::parse()) {
        eprintln!("cast-session: {e}");
        std::process::exit(1);
    }
}
