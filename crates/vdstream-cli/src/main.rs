use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tracing::{debug, error, info, warn};

use vdstream_core::{
    GatewayApi, GatewayConfig, GatewayConnector, IceServer, SessionConfig, SessionInfo,
    SessionRequest, SettingsStore, StaticConnector, StreamError, StreamEvent,
    StreamEventListener, StreamSession,
};

#[derive(Parser)]
#[command(name = "vdstream", about = "Stream a remote instance over WebRTC")]
struct Cli {
    /// Gateway configuration file (YAML).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding persisted device preferences.
    #[arg(long, global = true, default_value = ".vdstream")]
    data_dir: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Open a session and log its events until Ctrl-C.
    Connect {
        /// Create a session for this application through the gateway.
        #[arg(long, conflicts_with = "signaling_url")]
        app: Option<String>,

        /// Join an existing session at this signaling URL instead.
        #[arg(long)]
        signaling_url: Option<String>,

        #[arg(long, default_value = "direct")]
        session_id: String,

        /// STUN/TURN URLs for a direct session.
        #[arg(long = "ice-server")]
        ice_servers: Vec<String>,

        #[arg(long)]
        microphone: Option<bool>,

        #[arg(long)]
        camera: Option<bool>,

        #[arg(long)]
        speaker: Option<bool>,
    },
    /// List the applications the gateway can launch.
    Apps,
    /// Show or change persisted device preferences.
    Settings {
        #[arg(long)]
        microphone: Option<bool>,

        #[arg(long)]
        camera: Option<bool>,

        #[arg(long)]
        speaker: Option<bool>,
    },
}

fn init_logging() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                    tracing_subscriber::EnvFilter::new(
                        "vdstream_core=debug,vdstream_webrtc=info,vdstream_cli=info",
                    )
                }),
            )
            .init();
    });
}

/// Logs session events and remembers the fatal error, if any.
#[derive(Default)]
struct LogListener {
    fatal: Mutex<Option<StreamError>>,
}

impl StreamEventListener for LogListener {
    fn on_event(&self, event: StreamEvent) {
        match event {
            StreamEvent::StateChanged(state) => info!("state: {}", state.as_str()),
            StreamEvent::Ready => info!("session ready"),
            StreamEvent::Closed => info!("session closed"),
            StreamEvent::Error(e) if e.is_fatal() => {
                error!("session failed: {e}");
                *self.fatal.lock().unwrap_or_else(|p| p.into_inner()) = Some(e);
            }
            StreamEvent::Error(e) => warn!("{e}"),
            StreamEvent::MessageReceived { kind, data } => info!("message {kind}: {data}"),
            StreamEvent::StatsUpdated(stats) => match serde_json::to_string(&stats) {
                Ok(json) => debug!("stats: {json}"),
                Err(e) => debug!("stats not serializable: {e}"),
            },
            StreamEvent::ImeVisibilityChanged(visible) => info!("ime visible: {visible}"),
            StreamEvent::RemoteSettings {
                device_type,
                foreground_activity,
            } => info!(
                "remote settings: device_type={:?} foreground_activity={:?}",
                device_type, foreground_activity
            ),
        }
    }
}

fn gateway_api(config: Option<&PathBuf>) -> anyhow::Result<GatewayApi> {
    let config = GatewayConfig::load(config.map(|p| p.as_path()))?;
    if !config.gateway_enabled() {
        bail!("no gateway connected: set gateway-url and gateway-token");
    }
    Ok(GatewayApi::from_config(&config)?)
}

async fn connect(
    cli_config: Option<&PathBuf>,
    settings: &SettingsStore,
    app: Option<String>,
    signaling_url: Option<String>,
    session_id: String,
    ice_servers: Vec<String>,
    overrides: (Option<bool>, Option<bool>, Option<bool>),
) -> anyhow::Result<()> {
    let (microphone, camera, speaker) = overrides;
    let mut config = settings.get().session_config(SessionConfig::default());
    if let Some(microphone) = microphone {
        config.enable_microphone = microphone;
    }
    if let Some(camera) = camera {
        config.enable_camera = camera;
    }
    if let Some(speaker) = speaker {
        config.enable_speaker = speaker;
    }
    info!(
        "devices: speaker={} microphone={} camera={}",
        config.enable_speaker, config.enable_microphone, config.enable_camera
    );

    let listener = Arc::new(LogListener::default());
    let session = StreamSession::new(config, vdstream_webrtc::default_session_deps());
    session.add_listener(listener.clone());

    match (app, signaling_url) {
        (Some(app), _) => {
            let api = gateway_api(cli_config)?;
            session.connect(Arc::new(GatewayConnector::new(api, SessionRequest::new(app))));
        }
        (None, Some(url)) => {
            let info = SessionInfo {
                id: session_id,
                signaling_url: url,
                ice_servers: if ice_servers.is_empty() {
                    Vec::new()
                } else {
                    vec![IceServer {
                        urls: ice_servers,
                        username: None,
                        credential: None,
                    }]
                },
            };
            session.connect(Arc::new(StaticConnector::new(info)));
        }
        (None, None) => bail!("either --app or --signaling-url is required"),
    }

    tokio::select! {
        _ = session.wait_finished() => {}
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for Ctrl-C")?;
            info!("interrupted, stopping session");
            session.stop();
            session.wait_finished().await;
        }
    }

    let fatal = listener.fatal.lock().unwrap_or_else(|p| p.into_inner()).take();
    match fatal {
        Some(e) => Err(e).context("session ended with an error"),
        None => Ok(()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let cli = Cli::parse();
    let settings = SettingsStore::new(&cli.data_dir);

    match cli.command {
        Command::Connect {
            app,
            signaling_url,
            session_id,
            ice_servers,
            microphone,
            camera,
            speaker,
        } => {
            connect(
                cli.config.as_ref(),
                &settings,
                app,
                signaling_url,
                session_id,
                ice_servers,
                (microphone, camera, speaker),
            )
            .await
        }
        Command::Apps => {
            let api = gateway_api(cli.config.as_ref())?;
            for app in api.list_applications().await? {
                match app.description {
                    Some(description) => println!("{}\t{}", app.name, description),
                    None => println!("{}", app.name),
                }
            }
            Ok(())
        }
        Command::Settings {
            microphone,
            camera,
            speaker,
        } => {
            if let Some(enabled) = microphone {
                settings.set_microphone_enabled(enabled);
            }
            if let Some(enabled) = camera {
                settings.set_camera_enabled(enabled);
            }
            if let Some(enabled) = speaker {
                settings.set_speaker_enabled(enabled);
            }
            println!("{}", serde_json::to_string_pretty(&settings.get())?);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_requires_a_target_flag_set() {
        let cli = Cli::try_parse_from(["vdstream", "connect", "--app", "game"]).unwrap();
        match cli.command {
            Command::Connect { app, signaling_url, .. } => {
                assert_eq!(app.as_deref(), Some("game"));
                assert!(signaling_url.is_none());
            }
            _ => panic!("expected connect"),
        }
    }

    #[test]
    fn app_and_signaling_url_conflict() {
        let parsed = Cli::try_parse_from([
            "vdstream",
            "connect",
            "--app",
            "game",
            "--signaling-url",
            "wss://example.org/ws",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn device_overrides_parse_as_bools() {
        let cli = Cli::try_parse_from([
            "vdstream",
            "connect",
            "--signaling-url",
            "wss://example.org/ws",
            "--microphone",
            "true",
            "--ice-server",
            "stun:stun.example.org:3478",
        ])
        .unwrap();
        match cli.command {
            Command::Connect {
                microphone,
                ice_servers,
                ..
            } => {
                assert_eq!(microphone, Some(true));
                assert_eq!(ice_servers.len(), 1);
            }
            _ => panic!("expected connect"),
        }
    }

    #[test]
    fn listener_keeps_only_fatal_errors() {
        let listener = LogListener::default();
        listener.on_event(StreamEvent::Error(StreamError::DeviceAccess("busy".into())));
        assert!(listener.fatal.lock().unwrap().is_none());
        listener.on_event(StreamEvent::Error(StreamError::ConnectionLost));
        assert_eq!(
            *listener.fatal.lock().unwrap(),
            Some(StreamError::ConnectionLost)
        );
    }
}
