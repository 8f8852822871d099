use clap::Parser;
use qkdmsg::config::{self, Config};
use qkdmsg::contacts::StaticContacts;
use qkdmsg::crypto::{Aes256GcmCipher, Ed25519Authenticator, MessageAuthenticator};
use qkdmsg::error::AppError;
use qkdmsg::key_ledger::KeyMaterialLedger;
use qkdmsg::keygen::{ChannelKeygenSink, KeygenEvent};
use qkdmsg::messaging::MessagingFacade;
use qkdmsg::network::{Authenticity, ContentKind, MessageHandler, SessionEvent, SessionRegistry};
use qkdmsg::shutdown::ShutdownManager;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "qkdmsgd")]
#[command(about = "Peer messaging daemon with one-time key material", long_about = None)]
struct Args {
    #[arg(short, long, default_value = "qkdmsg.toml")]
    config: PathBuf,

    /// Override network.listen_port
    #[arg(long)]
    listen_port: Option<u16>,

    /// Connect to this contact on startup (repeatable)
    #[arg(long = "connect", value_name = "NAME")]
    connect: Vec<String>,

    #[arg(short, long)]
    verbose: bool,

    #[arg(long)]
    generate_config: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if args.generate_config {
        match Config::default().save_to_file(&args.config) {
            Ok(()) => {
                println!("✅ Generated default config at: {}", args.config.display());
                return;
            }
            Err(e) => {
                eprintln!("❌ Failed to generate config: {}", e);
                std::process::exit(1);
            }
        }
    }

    let mut config = match Config::load_or_create(&args.config) {
        Ok(cfg) => {
            println!("✓ Loaded configuration from {}", args.config.display());
            cfg
        }
        Err(e) => {
            eprintln!("❌ Failed to load config: {}", e);
            std::process::exit(1);
        }
    };
    if let Some(port) = args.listen_port {
        config.network.listen_port = port;
    }
    if let Err(e) = config.validate() {
        eprintln!("❌ {}", e);
        std::process::exit(1);
    }

    let _log_guard = match setup_logging(&config.logging, args.verbose) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("❌ {}", e);
            std::process::exit(1);
        }
    };

    let version = env!("CARGO_PKG_VERSION");
    let git_hash = option_env!("GIT_HASH").unwrap_or("unknown");
    tracing::info!("🚀 qkdmsgd v{} ({}) as {}", version, git_hash, config.node.name);

    if let Err(e) = run(config, args.connect).await {
        tracing::error!("❌ {}", e);
        std::process::exit(1);
    }
}

async fn run(config: Config, connect: Vec<String>) -> Result<(), AppError> {
    let contacts = Arc::new(StaticContacts::new(config.contact_list()?));
    tracing::info!("📇 {} contact(s) loaded", contacts.len());

    let authenticator: Option<Arc<dyn MessageAuthenticator>> =
        if config.security.signing_key.trim().is_empty() {
            tracing::warn!("⚠️ No signing key configured; outgoing messages are unsigned");
            None
        } else {
            let auth = Ed25519Authenticator::from_hex_seed(
                &config.security.signing_key,
                contacts.clone(),
            )?;
            tracing::info!("🔐 Signing as {}", auth.public_key_hex());
            let auth: Arc<dyn MessageAuthenticator> = Arc::new(auth);
            Some(auth)
        };

    let ledger = Arc::new(load_key_material(&config)?);
    let cipher = Arc::new(Aes256GcmCipher);

    let mut shutdown_manager = ShutdownManager::default();
    let (keygen_sink, keygen_rx) = ChannelKeygenSink::channel();
    shutdown_manager.register_task(tokio::spawn(log_keygen_events(
        keygen_rx,
        shutdown_manager.token(),
    )));

    let handler = Arc::new(MessageHandler::new(
        ledger.clone(),
        authenticator.clone(),
        cipher.clone(),
        Arc::new(keygen_sink),
        config.security.require_signatures,
    ));
    let registry = SessionRegistry::new(config.session_config(), handler, contacts.clone());
    let facade = Arc::new(
        MessagingFacade::new(registry.clone(), ledger, authenticator, cipher)
            .with_confirm_timeout(config.confirm_timeout()),
    );

    shutdown_manager.register_task(tokio::spawn(log_session_events(
        registry.subscribe(),
        facade.clone(),
        shutdown_manager.token(),
    )));

    let bound = registry
        .start_listener(
            &config.network.listen_address,
            config.network.listen_port,
            config.network.advertise_address(),
        )
        .await?;
    tracing::info!(
        "📡 Listening on {} (advertised as {}:{})",
        bound,
        config.network.advertise_address(),
        bound.port()
    );

    // Contacts we do not dial are expected to dial us
    for contact in &config.contacts {
        if connect.contains(&contact.name) {
            continue;
        }
        if let Err(e) = registry.listen(&contact.name, None) {
            tracing::warn!("⚠️ Cannot wait for {}: {}", contact.name, e);
        }
    }
    for name in &connect {
        match registry.connect_contact(name).await {
            Ok(_) => tracing::info!("✅ Connected to {}", name),
            Err(e) => tracing::warn!("❌ Could not connect to {}: {}", name, e),
        }
    }

    shutdown_manager.wait_for_signal().await;
    registry.shutdown().await;
    Ok(())
}

fn load_key_material(config: &Config) -> Result<KeyMaterialLedger, AppError> {
    let ledger = KeyMaterialLedger::new();
    for material in &config.key_material {
        let path = config.key_material_path(material);
        let buffer = std::fs::read(&path).map_err(|source| AppError::KeyMaterialFile {
            peer: material.peer.clone(),
            path: path.display().to_string(),
            source,
        })?;
        let len = buffer.len();
        ledger.insert(&material.peer, buffer, material.initiative)?;
        tracing::info!("🔑 Loaded {} bytes of key material for {}", len, material.peer);
    }
    Ok(ledger)
}

async fn log_session_events(
    mut events: broadcast::Receiver<SessionEvent>,
    facade: Arc<MessagingFacade>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return,
            event = events.recv() => event,
        };
        match event {
            Ok(SessionEvent::StateChanged { peer, state }) => {
                tracing::info!("🔄 {} is now {}", peer, state);
            }
            Ok(SessionEvent::MessageQueued { peer, .. }) => {
                while let Ok(Some(message)) = facade.read_next(&peer) {
                    let trust = match message.authenticity {
                        Authenticity::Verified => "verified",
                        Authenticity::Unsigned => "unsigned",
                        Authenticity::Unverified => "accepted unverified",
                    };
                    match &message.kind {
                        ContentKind::Text => tracing::info!(
                            "💬 {} ({}): {}",
                            peer,
                            trust,
                            message.text().unwrap_or_default()
                        ),
                        ContentKind::File { filename } => tracing::info!(
                            "📁 {} ({}) sent {} ({} bytes)",
                            peer,
                            trust,
                            filename,
                            message.content.len()
                        ),
                    }
                }
            }
            Ok(SessionEvent::MessageHeld { peer, id }) => {
                tracing::warn!(
                    "🔒 Message {} from {} held: no public key to verify it",
                    id,
                    peer
                );
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!("⚠️ Event log lagged, {} event(s) missed", missed);
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

async fn log_keygen_events(
    mut rx: mpsc::UnboundedReceiver<KeygenEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return,
            event = rx.recv() => event,
        };
        match event {
            Some(event) => tracing::info!(
                "🔑 Key generation message {:?} from {} ({} bytes)",
                event.kind(),
                event.peer,
                event.message.content().len()
            ),
            None => return,
        }
    }
}

fn setup_logging(
    config: &config::LoggingConfig,
    verbose: bool,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>, AppError> {
    use tracing_subscriber::fmt::writer::BoxMakeWriter;
    use tracing_subscriber::{fmt, EnvFilter};

    let level = if verbose { "trace" } else { config.level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let (writer, guard, ansi) = if config.output == "file" {
        let path = PathBuf::from(&config.file_path);
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "qkdmsgd.log".to_string());
        std::fs::create_dir_all(&dir)?;
        let appender = tracing_appender::rolling::daily(dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);
        (BoxMakeWriter::new(non_blocking), Some(guard), false)
    } else {
        (BoxMakeWriter::new(std::io::stdout), None, true)
    };

    // journald adds its own timestamps
    let is_systemd =
        std::env::var("JOURNAL_STREAM").is_ok() || std::env::var("INVOCATION_ID").is_ok();

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    let short_hostname = hostname.split('.').next().unwrap_or(&hostname).to_string();

    let builder = fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(ansi)
        .with_target(false)
        .with_thread_ids(false);

    let result = match config.format.as_str() {
        "json" => builder.json().try_init(),
        _ if is_systemd => builder.without_time().compact().try_init(),
        "compact" => builder
            .with_timer(CustomTimer {
                hostname: short_hostname,
            })
            .compact()
            .try_init(),
        _ => builder
            .with_timer(CustomTimer {
                hostname: short_hostname,
            })
            .try_init(),
    };
    result.map_err(|e| AppError::Logging(e.to_string()))?;
    Ok(guard)
}

// UTC time plus short hostname
struct CustomTimer {
    hostname: String,
}

impl tracing_subscriber::fmt::time::FormatTime for CustomTimer {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        let now = chrono::Utc::now();
        // "2026-03-10 18:09:43.150 [server1]"
        write!(
            w,
            "{}.{:03} [{}]",
            now.format("%Y-%m-%d %H:%M:%S"),
            now.timestamp_subsec_millis(),
            self.hostname
        )
    }
}
