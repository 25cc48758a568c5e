//! Callwire CLI Application
//!
//! Runs scripted calls between in-process coordinators so the call
//! lifecycle can be watched end to end without a signaling server.

use anyhow::{bail, Context, Result};
use callwire_core::loopback::LoopbackHub;
use callwire_core::prelude::*;
use callwire_core::sim::{SimulatedTransportFactory, SyntheticMediaSource};
use clap::{Parser, Subcommand, ValueEnum};
use rand::Rng;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// How long a connected demo call stays up before hanging up
const TALK_TIME: Duration = Duration::from_millis(500);

/// Give up on a scenario step after this long
const STEP_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Local user identity (e.g., "amber-falcon")
    #[arg(short, long, env = "CALLWIRE_IDENTITY")]
    identity: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a scripted call against an in-process peer
    Demo {
        /// Which call flow to run
        #[arg(long, value_enum, default_value = "accept")]
        scenario: Scenario,

        /// Place a video call instead of audio only
        #[arg(long)]
        video: bool,

        /// Coordinator configuration (JSON)
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Print the default configuration as JSON
    Config,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Scenario {
    /// Peer answers, caller hangs up
    Accept,
    /// Peer declines
    Reject,
    /// Caller gives up before the peer answers
    Cancel,
    /// Peer is already ringing for someone else
    Busy,
    /// Peer answers, then hangs up
    Hangup,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("callwire=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Demo {
            scenario,
            video,
            config,
        } => {
            let identity = cli.identity.unwrap_or_else(generate_random_identity);
            println!("🔗 Using identity: {}", identity);
            let config = load_config(config)?;
            let kind = if video {
                MediaKind::Video
            } else {
                MediaKind::Audio
            };
            run_demo(&identity, scenario, kind, config).await?;
        }
        Commands::Config => {
            let json = serde_json::to_string_pretty(&CoordinatorConfig::default())?;
            println!("{}", json);
        }
    }

    Ok(())
}

fn load_config(path: Option<PathBuf>) -> Result<CoordinatorConfig> {
    match path {
        Some(path) => CoordinatorConfig::from_json_file(&path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => Ok(CoordinatorConfig::default()),
    }
}

/// One participant in the demo
struct Participant {
    user: UserId,
    calls: CallHandle,
    events: broadcast::Receiver<CallEvent>,
}

impl Participant {
    fn spawn(hub: &LoopbackHub, name: &str, config: &CoordinatorConfig) -> Result<Self> {
        let user = UserId::new(name);
        let channel = hub.connect(user.clone(), Some(name.to_string()));
        let coordinator = CallCoordinator::builder(
            user.clone(),
            Arc::new(SignalingHandler::new(channel)),
            Arc::new(SyntheticMediaSource::new()),
            Arc::new(SimulatedTransportFactory::new()),
        )
        .with_config(config.clone())
        .build()?;

        let calls = coordinator.handle();
        let events = coordinator.subscribe_events();
        tokio::spawn(coordinator.run());
        Ok(Self {
            user,
            calls,
            events,
        })
    }

    /// Print events until one matches `done`
    async fn until<F>(&mut self, mut done: F) -> Result<CallEvent>
    where
        F: FnMut(&CallEvent) -> bool,
    {
        let user = self.user.clone();
        let wait = async {
            loop {
                match self.events.recv().await {
                    Ok(event) => {
                        print_event(&user, &event);
                        if done(&event) {
                            return Ok(event);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(user = %user, skipped, "Event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        bail!("{} stopped before the expected event", user);
                    }
                }
            }
        };
        tokio::time::timeout(STEP_TIMEOUT, wait)
            .await
            .with_context(|| format!("{} timed out", user))?
    }

    /// Print whatever is already queued
    fn drain(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            print_event(&self.user, &event);
        }
    }

    async fn incoming(&mut self) -> Result<CallSession> {
        match self
            .until(|e| matches!(e, CallEvent::IncomingCall { .. }))
            .await?
        {
            CallEvent::IncomingCall { session } => Ok(session),
            _ => bail!("expected an incoming call"),
        }
    }

    async fn ended(&mut self) -> Result<EndReason> {
        match self
            .until(|e| matches!(e, CallEvent::CallEnded { .. }))
            .await?
        {
            CallEvent::CallEnded { reason, .. } => Ok(reason),
            _ => bail!("expected the call to end"),
        }
    }

    async fn connected(&mut self) -> Result<()> {
        self.until(|e| matches!(e, CallEvent::Connected { .. }))
            .await
            .map(|_| ())
    }
}

async fn run_demo(
    identity: &str,
    scenario: Scenario,
    kind: MediaKind,
    config: CoordinatorConfig,
) -> Result<()> {
    let peer_name = if identity == "bob" { "robin" } else { "bob" };
    let hub = LoopbackHub::new();
    let mut local = Participant::spawn(&hub, identity, &config)?;
    let mut peer = Participant::spawn(&hub, peer_name, &config)?;
    let conversation = ConversationId::new(format!("demo-{}", rand::thread_rng().gen::<u32>()));

    println!("🎬 Scenario {:?}: {} → {} ({})", scenario, local.user, peer.user, kind);

    // A third party keeps the peer ringing for the busy flow
    let mut intruder = if scenario == Scenario::Busy {
        let mut carol = Participant::spawn(&hub, "carol", &config)?;
        carol
            .calls
            .start_call(
                ConversationId::new("demo-side"),
                peer.user.clone(),
                MediaKind::Audio,
            )
            .await?;
        peer.incoming().await?;
        carol.drain();
        Some(carol)
    } else {
        None
    };

    let call_id = local
        .calls
        .start_call(conversation, peer.user.clone(), kind)
        .await?;
    println!("📞 Call placed with ID: {}", call_id);

    match scenario {
        Scenario::Accept | Scenario::Hangup => {
            peer.incoming().await?;
            peer.calls.accept_call(call_id).await?;
            local.connected().await?;
            peer.connected().await?;
            println!("✅ Connected, talking for {:?}", TALK_TIME);
            tokio::time::sleep(TALK_TIME).await;

            if scenario == Scenario::Accept {
                local.calls.end_call().await?;
            } else {
                peer.calls.end_call().await?;
            }
        }
        Scenario::Reject => {
            peer.incoming().await?;
            peer.calls.reject_call().await?;
        }
        Scenario::Cancel => {
            peer.incoming().await?;
            local.calls.cancel_call().await?;
        }
        Scenario::Busy => {
            peer.until(|e| matches!(e, CallEvent::BusyRejected { .. }))
                .await?;
        }
    }

    let reason = local.ended().await?;
    if scenario != Scenario::Busy {
        peer.ended().await?;
    }
    println!("📴 Call ended: {}", reason);

    local.calls.shutdown().await;
    peer.calls.shutdown().await;
    if let Some(carol) = intruder.as_mut() {
        carol.calls.shutdown().await;
        carol.drain();
    }
    peer.drain();
    Ok(())
}

fn print_event(user: &UserId, event: &CallEvent) {
    match event {
        CallEvent::CallPlaced { session } => {
            println!("[{}] calling {}", user, session.peer_user_id);
        }
        CallEvent::IncomingCall { session } => println!(
            "[{}] incoming {} call from {}",
            user,
            session.media_kind,
            session
                .peer_display_name
                .as_deref()
                .unwrap_or(session.peer_user_id.as_str())
        ),
        CallEvent::CallAccepted { .. } => println!("[{}] call accepted", user),
        CallEvent::Connected { .. } => println!("[{}] media connected", user),
        CallEvent::ConnectionStateChanged { state, .. } => {
            tracing::debug!(user = %user, ?state, "Connection state changed");
        }
        CallEvent::RemoteStream { stream, .. } => println!(
            "[{}] remote stream {} with {} track(s)",
            user,
            stream.id,
            stream.tracks.len()
        ),
        CallEvent::LocalMediaChanged {
            audio_enabled,
            video_enabled,
            ..
        } => println!(
            "[{}] microphone {} camera {}",
            user,
            on_off(*audio_enabled),
            on_off(*video_enabled)
        ),
        CallEvent::RemoteMediaChanged {
            audio_muted,
            video_enabled,
            ..
        } => println!(
            "[{}] peer media changed (muted: {:?}, video: {:?})",
            user, audio_muted, video_enabled
        ),
        CallEvent::BusyRejected { caller_id, .. } => {
            println!("[{}] busy, turned away {}", user, caller_id);
        }
        CallEvent::CallEnded { session, reason } => {
            let duration = session
                .duration()
                .map(|d| format!(" after {}ms", d.num_milliseconds()))
                .unwrap_or_default();
            println!("[{}] call ended ({}){}", user, reason, duration);
        }
    }
}

fn on_off(enabled: bool) -> &'static str {
    if enabled {
        "on"
    } else {
        "off"
    }
}

fn generate_random_identity() -> String {
    const WORDS: &[&str] = &[
        "amber", "birch", "cedar", "delta", "ember", "falcon", "garnet", "harbor", "indigo",
        "juniper", "kestrel", "lumen", "maple", "nimbus", "onyx", "pebble", "quartz", "raven",
        "sable", "tundra", "umber", "vale", "willow", "yarrow", "zephyr",
    ];

    let mut rng = rand::thread_rng();
    format!(
        "{}-{}",
        WORDS[rng.gen_range(0..WORDS.len())],
        WORDS[rng.gen_range(0..WORDS.len())]
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_random_identity_shape() {
        let identity = generate_random_identity();
        let parts: Vec<&str> = identity.split('-').collect();
        assert_eq!(parts.len(), 2);
        assert!(parts.iter().all(|p| !p.is_empty()));
    }

    #[test]
    fn test_demo_arguments() {
        let cli = Cli::try_parse_from([
            "callwire",
            "--identity",
            "dana",
            "demo",
            "--scenario",
            "busy",
            "--video",
        ])
        .unwrap();
        assert_eq!(cli.identity.as_deref(), Some("dana"));
        match cli.command {
            Commands::Demo {
                scenario,
                video,
                config,
            } => {
                assert_eq!(scenario, Scenario::Busy);
                assert!(video);
                assert!(config.is_none());
            }
            Commands::Config => panic!("expected demo"),
        }
    }

    #[test]
    fn test_unknown_scenario_rejected() {
        assert!(Cli::try_parse_from(["callwire", "demo", "--scenario", "glare"]).is_err());
    }

    #[tokio::test]
    async fn test_reject_scenario_runs() {
        let config = CoordinatorConfig {
            gathering_timeout_ms: 500,
            ..Default::default()
        };
        run_demo("dana", Scenario::Reject, MediaKind::Audio, config)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_busy_scenario_runs() {
        run_demo("dana", Scenario::Busy, MediaKind::Audio, CoordinatorConfig::default())
            .await
            .unwrap();
    }
}
