// One active channel's playback.
//
// A `ChannelPlayer` lives exactly as long as its channel is tuned. It asks
// the resolver what is on air, records it as "now playing", then dwells for
// the remaining on-air time while polling the channel signal. It owns at
// most one encoder: the live feed opened by `/live`.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use time::PrimitiveDateTime;
use tokio::process::ChildStdout;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::CatalogSet;
use crate::channel::{ChannelChange, ChannelSignal};
use crate::config::PlayerTiming;
use crate::encoder::{EncodeJob, EncoderHandle, EncoderLauncher, InputSource, OutputMode};
use crate::error::{EngineError, EngineResult};
use crate::reception::ReceptionStatus;
use crate::schedule::{PlanEntry, ScheduleResolver};
use crate::station::StationConfig;
use crate::status::{format_progress, PlayStatus, StatusSnapshot};

pub const GUIDE_STREAM_URL: &str = "/hls/guide/playlist.m3u8";

#[derive(Debug, Clone, PartialEq)]
pub enum PlayOutcome {
    Success,
    Failed,
    ChannelChangeRequested(ChannelChange),
}

/// Everything a player needs that outlives any single channel.
pub struct PlayerContext {
    pub resolver: Arc<ScheduleResolver>,
    pub catalogs: Arc<CatalogSet>,
    pub launcher: Arc<dyn EncoderLauncher>,
    pub signal: Arc<ChannelSignal>,
    pub reception: Arc<parking_lot::Mutex<ReceptionStatus>>,
    pub status_tx: broadcast::Sender<StatusSnapshot>,
    pub timing: PlayerTiming,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone)]
struct NowPlaying {
    source: InputSource,
    path: String,
    stream_url: String,
    title: String,
    duration: f64,
    /// Seconds into the entry when it went on air.
    offset: f64,
    /// Position in the media file at `since` (offset plus skip).
    start_at: f64,
    since: Instant,
}

impl NowPlaying {
    fn elapsed(&self) -> f64 {
        self.since.elapsed().as_secs_f64()
    }

    fn input(&self) -> InputSource {
        match &self.source {
            InputSource::File { path, .. } => InputSource::file(path, self.start_at + self.elapsed()),
            other => other.clone(),
        }
    }
}

pub struct ChannelPlayer {
    station: StationConfig,
    index: usize,
    ctx: Arc<PlayerContext>,
    now: parking_lot::Mutex<Option<NowPlaying>>,
    live_feed: tokio::sync::Mutex<Option<EncoderHandle>>,
}

impl ChannelPlayer {
    pub fn new(station: StationConfig, index: usize, ctx: Arc<PlayerContext>) -> Self {
        Self {
            station,
            index,
            ctx,
            now: parking_lot::Mutex::new(None),
            live_feed: tokio::sync::Mutex::new(None),
        }
    }

    pub fn station(&self) -> &StationConfig {
        &self.station
    }

    fn hls_url(&self) -> String {
        format!("/hls/channel_{}/playlist.m3u8", self.station.channel_number)
    }

    /// Play whatever the schedule has on air at `now`, through to the end of
    /// its block plan.
    pub async fn play_slot(&self, now: PrimitiveDateTime) -> PlayOutcome {
        let point = self.ctx.resolver.resolve(&self.station.network_name, now);
        if !point.is_playable() {
            debug!(
                "{}: nothing playable at {now} (placeholder: {})",
                self.station.network_name,
                point.is_placeholder()
            );
            return PlayOutcome::Failed;
        }

        for (i, entry) in point.plan.iter().enumerate().skip(point.index) {
            let offset = if i == point.index { point.offset } else { 0.0 };
            if entry.duration <= 0.0 {
                warn!(
                    "{}: {} has no duration, skipping slot",
                    self.station.network_name, entry.path
                );
                return PlayOutcome::Failed;
            }
            if !entry.is_stream && !Path::new(&entry.path).is_file() {
                warn!("{}: missing content {}", self.station.network_name, entry.path);
                return PlayOutcome::Failed;
            }

            self.put_on_air(entry, offset);
            let remaining = Duration::from_secs_f64((entry.duration - offset).max(0.0));
            if let Some(change) = self.dwell(remaining).await {
                return PlayOutcome::ChannelChangeRequested(change);
            }
            if self.ctx.cancel.is_cancelled() {
                break;
            }
        }
        PlayOutcome::Success
    }

    fn put_on_air(&self, entry: &PlanEntry, offset: f64) {
        let start_at = offset + entry.skip.max(0.0);
        let (source, stream_url) = if entry.is_stream {
            (InputSource::Remote(entry.path.clone()), entry.path.clone())
        } else {
            (InputSource::file(&entry.path, start_at), self.hls_url())
        };
        let title = self
            .ctx
            .catalogs
            .for_station(&self.station.network_name)
            .title_for(&entry.path);

        info!(
            "{} ch{}: {} at {:.1}s",
            self.station.network_name, self.station.channel_number, title, start_at
        );
        self.set_now_playing(NowPlaying {
            source,
            path: entry.path.clone(),
            stream_url,
            title,
            duration: entry.duration,
            offset,
            start_at,
            since: Instant::now(),
        });
    }

    fn set_now_playing(&self, now: NowPlaying) {
        *self.now.lock() = Some(now);
        self.publish(false);
    }

    /// Guide channel: show the synthetic guide for one dwell interval.
    pub async fn show_guide(&self) -> PlayOutcome {
        let showing_guide = self
            .now
            .lock()
            .as_ref()
            .is_some_and(|n| n.source == InputSource::Guide);
        if !showing_guide {
            self.set_now_playing(NowPlaying {
                source: InputSource::Guide,
                path: "guide".into(),
                stream_url: GUIDE_STREAM_URL.into(),
                title: "Channel Guide".into(),
                duration: 0.0,
                offset: 0.0,
                start_at: 0.0,
                since: Instant::now(),
            });
        }
        match self.dwell(self.ctx.timing.guide_dwell).await {
            Some(change) => PlayOutcome::ChannelChangeRequested(change),
            None => PlayOutcome::Success,
        }
    }

    /// Put the station's standby image on air. Returns false when the station
    /// has none configured.
    pub fn show_standby(&self) -> bool {
        let Some(image) = self.station.standby_image.clone() else {
            return false;
        };
        info!("{}: showing standby image {}", self.station.network_name, image.display());
        self.set_now_playing(NowPlaying {
            source: InputSource::Image(image.clone()),
            path: image.display().to_string(),
            stream_url: self.hls_url(),
            title: "Please Stand By".into(),
            duration: 0.0,
            offset: 0.0,
            start_at: 0.0,
            since: Instant::now(),
        });
        true
    }

    /// Sleep for `total`, polling for a channel change every poll interval
    /// and letting reception recover. Returns early on a change or on
    /// shutdown.
    async fn dwell(&self, total: Duration) -> Option<ChannelChange> {
        let deadline = Instant::now() + total;
        loop {
            if let Some(change) = self.ctx.signal.take(self.index).await {
                debug!("{}: channel change {change:?}", self.station.network_name);
                return Some(change);
            }
            self.ctx.reception.lock().improve(None);

            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let step = self.ctx.timing.poll_interval.min(deadline - now);
            tokio::select! {
                _ = self.ctx.cancel.cancelled() => return None,
                _ = tokio::time::sleep(step) => {}
            }
        }
    }

    pub fn current_path(&self) -> Option<String> {
        self.now.lock().as_ref().map(|n| n.path.clone())
    }

    pub fn current_title(&self) -> String {
        self.now
            .lock()
            .as_ref()
            .map(|n| n.title.clone())
            .unwrap_or_default()
    }

    pub fn current_stream_url(&self) -> Option<String> {
        self.now.lock().as_ref().map(|n| n.stream_url.clone())
    }

    /// What an encoder should read to show this channel right now.
    pub fn current_input(&self) -> Option<InputSource> {
        self.now.lock().as_ref().map(NowPlaying::input)
    }

    fn progress(&self) -> String {
        self.now
            .lock()
            .as_ref()
            .map(|n| format_progress(n.offset + n.elapsed(), n.duration))
            .unwrap_or_else(|| "n/a".into())
    }

    pub fn snapshot(&self, stuck: bool) -> StatusSnapshot {
        let status = if stuck {
            PlayStatus::Stuck
        } else if self.station.is_guide() {
            PlayStatus::Guide
        } else {
            PlayStatus::Playing
        };
        StatusSnapshot {
            channel: self.station.channel_number as i64,
            name: self.station.network_name.clone(),
            title: self.current_title(),
            stream_url: self.current_stream_url(),
            reception_quality: self.ctx.reception.lock().quality(),
            status,
            progress: self.progress(),
        }
    }

    pub fn publish(&self, stuck: bool) {
        // No subscribers is fine.
        let _ = self.ctx.status_tx.send(self.snapshot(stuck));
    }

    /// Start a continuous fragmented-MP4 encoder for what is on air now,
    /// replacing any previous live feed.
    pub async fn open_live_feed(&self) -> EngineResult<ChildStdout> {
        let input = self
            .current_input()
            .ok_or_else(|| EngineError::StreamNotFound("nothing on air".into()))?;
        input.check_available()?;

        let mut slot = self.live_feed.lock().await;
        if let Some(mut old) = slot.take() {
            old.terminate(self.ctx.timing.kill_timeout).await;
        }

        let job = EncodeJob {
            label: format!("live/ch{}", self.station.channel_number),
            input,
            output: OutputMode::Pipe,
            video_filter: self.ctx.reception.lock().video_filter(),
        };
        let mut handle = self
            .ctx
            .launcher
            .launch(&job)
            .map_err(|e| EngineError::EncoderStart(format!("{e:#}")))?;
        let stdout = handle
            .take_stdout()
            .ok_or_else(|| EngineError::EncoderStart("encoder has no stdout".into()))?;
        *slot = Some(handle);
        Ok(stdout)
    }

    /// Stop the live feed (if any) and forget what was playing.
    pub async fn shutdown(&self) {
        if let Some(mut handle) = self.live_feed.lock().await.take() {
            handle.terminate(self.ctx.timing.kill_timeout).await;
        }
        if let Some(path) = self.current_path() {
            debug!("{}: stopped {path}", self.station.network_name);
        }
        *self.now.lock() = None;
    }
}
