// Engine configuration.
//
// Everything comes from FIELDSTATION_* environment variables with sane
// defaults, the same way the bind address and ffmpeg path always have.
// Timing knobs live here too so tests can shrink them.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::transcode::TranscodeSettings;

/// Visual effect run by the controller on every channel change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransitionEffect {
    None,
    #[default]
    Short,
    Long,
}

impl TransitionEffect {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Some(Self::None),
            "short" => Some(Self::Short),
            "long" => Some(Self::Long),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub bind: SocketAddr,
    pub stations_path: PathBuf,
    pub schedule_dir: PathBuf,
    pub ffmpeg: String,
    pub transition: TransitionEffect,
    /// Clip shown mid-transition by the long effect.
    pub static_clip: PathBuf,
    /// Optional file polled for JSON tune commands. Read and truncated on
    /// every poll.
    pub command_file: Option<PathBuf>,
    pub player: PlayerTiming,
    pub transcode: TranscodeSettings,
}

/// Timing of the playout loop.
#[derive(Debug, Clone)]
pub struct PlayerTiming {
    /// How often a dwelling slot checks for a channel change.
    pub poll_interval: Duration,
    /// Rest after a failed slot before trying again.
    pub failure_backoff: Duration,
    /// How long the guide channel shows before re-entering the loop.
    pub guide_dwell: Duration,
    /// Delay between transition effect steps.
    pub effect_step: Duration,
    /// Bounded wait for an encoder to exit after being signalled.
    pub kill_timeout: Duration,
}

impl Default for PlayerTiming {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
            failure_backoff: Duration::from_secs(1),
            guide_dwell: Duration::from_secs(30),
            effect_step: Duration::from_millis(100),
            kill_timeout: Duration::from_secs(3),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

impl EngineConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let bind: SocketAddr = env_or("FIELDSTATION_BIND", "0.0.0.0:9191").parse()?;

        let transition_raw = env_or("FIELDSTATION_TRANSITION", "short");
        let transition = TransitionEffect::parse(&transition_raw).unwrap_or_else(|| {
            tracing::warn!("unknown transition '{transition_raw}', using short");
            TransitionEffect::Short
        });

        let ffmpeg = env_or("FIELDSTATION_FFMPEG", "ffmpeg");

        let mut transcode = TranscodeSettings::default();
        transcode.root = PathBuf::from(env_or("FIELDSTATION_HLS_DIR", "hls_output"));

        Ok(Self {
            bind,
            stations_path: PathBuf::from(env_or("FIELDSTATION_STATIONS", "runtime/stations.json")),
            schedule_dir: PathBuf::from(env_or("FIELDSTATION_SCHEDULE_DIR", "json_schedules")),
            ffmpeg,
            transition,
            static_clip: PathBuf::from(env_or("FIELDSTATION_STATIC_CLIP", "runtime/static.mp4")),
            command_file: std::env::var("FIELDSTATION_CHANNEL_COMMANDS")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from),
            player: PlayerTiming::default(),
            transcode,
        })
    }
}
