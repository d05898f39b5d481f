// On-demand HLS transcode sessions.
//
// One session per stream id, each owning at most one encoder writing a
// rolling playlist + segments into its own directory. The session map is
// guarded by a single short-lived lock; encoder start/stop happens outside
// it under the session's own lock so slow ffmpeg start-up never serializes
// unrelated streams. A reaper task retires sessions nobody has asked for
// within the idle threshold.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::OwnedMutexGuard;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::encoder::{EncodeJob, EncoderHandle, EncoderLauncher, InputSource, OutputMode};
use crate::error::{EngineError, EngineResult};

pub const PLAYLIST_NAME: &str = "playlist.m3u8";

#[derive(Debug, Clone)]
pub struct TranscodeSettings {
    /// Parent of every session's output directory.
    pub root: PathBuf,
    pub segment_time: u32,
    pub playlist_size: u32,
    pub idle_threshold: Duration,
    pub reap_interval: Duration,
    pub playlist_wait_attempts: u32,
    pub playlist_wait_step: Duration,
    pub kill_timeout: Duration,
}

impl Default for TranscodeSettings {
    fn default() -> Self {
        Self {
            root: PathBuf::from("hls_output"),
            segment_time: 2,
            playlist_size: 5,
            idle_threshold: Duration::from_secs(5 * 60),
            reap_interval: Duration::from_secs(30),
            playlist_wait_attempts: 10,
            playlist_wait_step: Duration::from_millis(500),
            kill_timeout: Duration::from_secs(3),
        }
    }
}

type EncoderSlot = Arc<tokio::sync::Mutex<Option<EncoderHandle>>>;

pub struct StreamSession {
    id: String,
    instance: Uuid,
    input: InputSource,
    output_dir: PathBuf,
    playlist_path: PathBuf,
    encoder: EncoderSlot,
    last_access: parking_lot::Mutex<Instant>,
    active: AtomicBool,
}

impl StreamSession {
    fn new(id: &str, input: InputSource, root: &Path) -> Self {
        let output_dir = root.join(id);
        let playlist_path = output_dir.join(PLAYLIST_NAME);
        Self {
            id: id.to_string(),
            instance: Uuid::new_v4(),
            input,
            output_dir,
            playlist_path,
            encoder: Arc::new(tokio::sync::Mutex::new(None)),
            last_access: parking_lot::Mutex::new(Instant::now()),
            active: AtomicBool::new(true),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Distinguishes successive sessions created for the same id.
    pub fn instance(&self) -> Uuid {
        self.instance
    }

    pub fn input(&self) -> &InputSource {
        &self.input
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn touch(&self) {
        *self.last_access.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_access.lock().elapsed()
    }

    pub async fn encoder_pid(&self) -> Option<u32> {
        self.encoder.lock().await.as_ref().and_then(|h| h.pid())
    }
}

impl fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSession")
            .field("id", &self.id)
            .field("instance", &self.instance)
            .field("input", &self.input)
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}

enum Lookup {
    Existing(Arc<StreamSession>),
    Fresh {
        session: Arc<StreamSession>,
        slot: OwnedMutexGuard<Option<EncoderHandle>>,
        retired: Option<Arc<StreamSession>>,
    },
}

pub struct StreamTranscodeManager {
    sessions: parking_lot::Mutex<HashMap<String, Arc<StreamSession>>>,
    settings: TranscodeSettings,
    launcher: Arc<dyn EncoderLauncher>,
}

impl StreamTranscodeManager {
    pub fn new(settings: TranscodeSettings, launcher: Arc<dyn EncoderLauncher>) -> Self {
        Self {
            sessions: parking_lot::Mutex::new(HashMap::new()),
            settings,
            launcher,
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn session(&self, id: &str) -> Option<Arc<StreamSession>> {
        self.sessions.lock().get(id).cloned()
    }

    pub fn sessions(&self) -> Vec<Arc<StreamSession>> {
        self.sessions.lock().values().cloned().collect()
    }

    /// Return the live session for `id`, starting one if needed.
    ///
    /// A repeat call only refreshes the access time. A session whose encoder
    /// has died is restarted; one that was started for different content is
    /// retired and replaced. On error nothing is left registered.
    pub async fn get_or_create_stream(
        &self,
        id: &str,
        input: InputSource,
    ) -> EngineResult<Arc<StreamSession>> {
        validate_stream_id(id)?;
        input.check_available()?;

        loop {
            match self.lookup(id, &input)? {
                Lookup::Fresh {
                    session,
                    mut slot,
                    retired,
                } => {
                    if let Some(old) = retired {
                        info!("retiring stream {} ({}): input changed", old.id, old.instance);
                        self.terminate_session(&old).await;
                    }
                    if let Err(e) = self.start_encoder(&session, &mut slot).await {
                        session.active.store(false, Ordering::Release);
                        self.deregister(&session);
                        return Err(e);
                    }
                    return Ok(session);
                }
                Lookup::Existing(session) => {
                    let mut slot = session.encoder.clone().lock_owned().await;
                    if !session.is_active() {
                        // Reaped or retired while we waited.
                        continue;
                    }
                    let alive = slot.as_mut().is_some_and(|h| !h.has_exited());
                    if !alive {
                        if let Some(mut dead) = slot.take() {
                            warn!(
                                "stream {}: encoder exited ({}), restarting",
                                session.id,
                                dead.last_error().unwrap_or_else(|| "no error output".into())
                            );
                            dead.terminate(self.settings.kill_timeout).await;
                        }
                        if let Err(e) = self.start_encoder(&session, &mut slot).await {
                            session.active.store(false, Ordering::Release);
                            self.deregister(&session);
                            return Err(e);
                        }
                    }
                    session.touch();
                    return Ok(session);
                }
            }
        }
    }

    fn lookup(&self, id: &str, input: &InputSource) -> EngineResult<Lookup> {
        let mut sessions = self.sessions.lock();
        if let Some(existing) = sessions.get(id) {
            if existing.input.same_content(input) {
                return Ok(Lookup::Existing(existing.clone()));
            }
        }

        let retired = sessions.remove(id);
        if let Some(old) = &retired {
            old.active.store(false, Ordering::Release);
        }
        let session = Arc::new(StreamSession::new(id, input.clone(), &self.settings.root));
        let slot = session
            .encoder
            .clone()
            .try_lock_owned()
            .map_err(|_| EngineError::Internal(format!("stream {id}: new session already locked")))?;
        sessions.insert(id.to_string(), session.clone());
        Ok(Lookup::Fresh {
            session,
            slot,
            retired,
        })
    }

    /// Remove `session` from the map, unless a newer session has taken its id.
    fn deregister(&self, session: &StreamSession) {
        let mut sessions = self.sessions.lock();
        if sessions
            .get(&session.id)
            .is_some_and(|s| s.instance == session.instance)
        {
            sessions.remove(&session.id);
        }
    }

    async fn start_encoder(
        &self,
        session: &StreamSession,
        slot: &mut Option<EncoderHandle>,
    ) -> EngineResult<()> {
        tokio::fs::create_dir_all(&session.output_dir).await?;
        // A playlist left from an earlier encoder would end the wait early.
        let _ = tokio::fs::remove_file(&session.playlist_path).await;

        let job = EncodeJob {
            label: format!("hls/{}", session.id),
            input: session.input.clone(),
            output: OutputMode::Segmented {
                playlist: session.playlist_path.clone(),
                segment_time: self.settings.segment_time,
                list_size: self.settings.playlist_size,
            },
            video_filter: None,
        };
        let mut handle = self
            .launcher
            .launch(&job)
            .map_err(|e| EngineError::EncoderStart(format!("{e:#}")))?;

        let mut ready = false;
        for _ in 0..self.settings.playlist_wait_attempts {
            if tokio::fs::try_exists(&session.playlist_path)
                .await
                .unwrap_or(false)
            {
                ready = true;
                break;
            }
            if handle.has_exited() {
                let reason = handle
                    .last_error()
                    .unwrap_or_else(|| "encoder exited before writing a playlist".into());
                handle.terminate(self.settings.kill_timeout).await;
                return Err(EngineError::EncoderStart(reason));
            }
            tokio::time::sleep(self.settings.playlist_wait_step).await;
        }
        if !ready {
            warn!(
                "stream {}: playlist not ready after {} checks, serving anyway",
                session.id, self.settings.playlist_wait_attempts
            );
        }

        info!(
            "stream {} started ({}, pid {:?}) from {}",
            session.id,
            session.instance,
            handle.pid(),
            session.input.describe()
        );
        *slot = Some(handle);
        session.touch();
        Ok(())
    }

    fn active_session(&self, id: &str) -> EngineResult<Arc<StreamSession>> {
        let session = self
            .session(id)
            .ok_or_else(|| EngineError::StreamNotFound(id.to_string()))?;
        session.touch();
        Ok(session)
    }

    pub async fn serve_playlist(&self, id: &str) -> EngineResult<Bytes> {
        let session = self.active_session(id)?;
        read_stream_file(&session.playlist_path, id).await
    }

    pub async fn serve_segment(&self, id: &str, name: &str) -> EngineResult<Bytes> {
        if name.is_empty() || name.contains(['/', '\\']) || name.contains("..") {
            return Err(EngineError::InvalidRequest(format!("bad segment name: {name}")));
        }
        let session = self.active_session(id)?;
        read_stream_file(&session.output_dir.join(name), id).await
    }

    /// Retire every session idle past the threshold. Returns how many went.
    pub async fn reap_idle(&self) -> usize {
        let threshold = self.settings.idle_threshold;
        let expired: Vec<Arc<StreamSession>> = {
            let mut sessions = self.sessions.lock();
            let ids: Vec<String> = sessions
                .iter()
                .filter(|(_, s)| s.idle_for() >= threshold)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };

        for session in &expired {
            info!(
                "reaping idle stream {} ({}), idle {:?}",
                session.id,
                session.instance,
                session.idle_for()
            );
            self.terminate_session(session).await;
        }
        expired.len()
    }

    pub fn spawn_reaper(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(self.settings.reap_interval);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {
                        let reaped = self.reap_idle().await;
                        if reaped > 0 {
                            debug!("reaper: {reaped} stream(s) retired, {} left", self.session_count());
                        }
                    }
                }
            }
            debug!("reaper stopped");
        })
    }

    /// Terminate every session. Used on engine shutdown.
    pub async fn shutdown(&self) {
        let all: Vec<Arc<StreamSession>> = self.sessions.lock().drain().map(|(_, s)| s).collect();
        for session in &all {
            self.terminate_session(session).await;
        }
        if !all.is_empty() {
            info!("stopped {} stream session(s)", all.len());
        }
    }

    async fn terminate_session(&self, session: &StreamSession) {
        session.active.store(false, Ordering::Release);
        let mut slot = session.encoder.lock().await;
        if let Some(mut handle) = slot.take() {
            handle.terminate(self.settings.kill_timeout).await;
        }
    }
}

fn validate_stream_id(id: &str) -> EngineResult<()> {
    let ok = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if ok {
        Ok(())
    } else {
        Err(EngineError::InvalidRequest(format!("bad stream id: {id}")))
    }
}

async fn read_stream_file(path: &Path, id: &str) -> EngineResult<Bytes> {
    match tokio::fs::read(path).await {
        Ok(data) => Ok(Bytes::from(data)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(EngineError::StreamNotFound(
            format!("{id}/{}", path.file_name().and_then(|n| n.to_str()).unwrap_or("?")),
        )),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::process::Stdio;
    use std::sync::atomic::AtomicUsize;
    use tokio::process::Command;

    /// Writes a playlist and one segment, then idles in `sleep`.
    #[derive(Default)]
    pub(crate) struct FakeLauncher {
        pub(crate) spawns: AtomicUsize,
    }

    impl EncoderLauncher for FakeLauncher {
        fn launch(&self, job: &EncodeJob) -> anyhow::Result<EncoderHandle> {
            self.spawns.fetch_add(1, Ordering::SeqCst);
            if let OutputMode::Segmented { playlist, .. } = &job.output {
                std::fs::write(playlist, "#EXTM3U\n#EXTINF:2.0,\nsegment_000.ts\n")?;
                if let Some(dir) = playlist.parent() {
                    std::fs::write(dir.join("segment_000.ts"), b"\x47fake")?;
                }
            }
            let child = Command::new("sleep")
                .arg("30")
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()?;
            Ok(EncoderHandle::from_child(job.label.clone(), child))
        }
    }

    /// An encoder that complains and dies immediately.
    struct BrokenLauncher;

    impl EncoderLauncher for BrokenLauncher {
        fn launch(&self, job: &EncodeJob) -> anyhow::Result<EncoderHandle> {
            let child = Command::new("sh")
                .args(["-c", "echo 'Unknown encoder libx264' >&2; exit 1"])
                .stderr(Stdio::piped())
                .spawn()?;
            Ok(EncoderHandle::from_child(job.label.clone(), child))
        }
    }

    pub(crate) fn quick_settings(root: &Path) -> TranscodeSettings {
        TranscodeSettings {
            root: root.to_path_buf(),
            idle_threshold: Duration::from_millis(200),
            reap_interval: Duration::from_millis(50),
            playlist_wait_attempts: 50,
            playlist_wait_step: Duration::from_millis(10),
            kill_timeout: Duration::from_secs(1),
            ..TranscodeSettings::default()
        }
    }

    fn setup() -> (tempfile::TempDir, Arc<FakeLauncher>, StreamTranscodeManager, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let media = dir.path().join("news.mp4");
        std::fs::write(&media, b"not really video").unwrap();
        let launcher = Arc::new(FakeLauncher::default());
        let manager =
            StreamTranscodeManager::new(quick_settings(&dir.path().join("hls")), launcher.clone());
        (dir, launcher, manager, media)
    }

    #[tokio::test]
    async fn repeat_requests_share_one_encoder() {
        let (_dir, launcher, manager, media) = setup();

        let first = manager
            .get_or_create_stream("channel_3", InputSource::file(&media, 12.0))
            .await
            .unwrap();
        let second = manager
            .get_or_create_stream("channel_3", InputSource::file(&media, 40.0))
            .await
            .unwrap();

        assert_eq!(first.instance(), second.instance());
        assert_eq!(first.encoder_pid().await, second.encoder_pid().await);
        assert!(first.encoder_pid().await.is_some());
        assert_eq!(launcher.spawns.load(Ordering::SeqCst), 1);

        let playlist = manager.serve_playlist("channel_3").await.unwrap();
        assert!(playlist.starts_with(b"#EXTM3U"));
        let segment = manager.serve_segment("channel_3", "segment_000.ts").await.unwrap();
        assert_eq!(&segment[..], b"\x47fake");

        manager.shutdown().await;
        assert_eq!(manager.session_count(), 0);
    }

    #[tokio::test]
    async fn concurrent_first_requests_spawn_once() {
        let (_dir, launcher, manager, _media) = setup();

        let (a, b) = tokio::join!(
            manager.get_or_create_stream("guide", InputSource::Guide),
            manager.get_or_create_stream("guide", InputSource::Guide),
        );
        assert_eq!(a.unwrap().instance(), b.unwrap().instance());
        assert_eq!(launcher.spawns.load(Ordering::SeqCst), 1);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn missing_input_leaves_no_session() {
        let (dir, launcher, manager, _media) = setup();

        let err = manager
            .get_or_create_stream("channel_4", InputSource::file(dir.path().join("gone.mp4"), 0.0))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InputNotFound(_)));
        assert_eq!(manager.session_count(), 0);
        assert_eq!(launcher.spawns.load(Ordering::SeqCst), 0);
        assert!(matches!(
            manager.serve_playlist("channel_4").await,
            Err(EngineError::StreamNotFound(_))
        ));
    }

    #[tokio::test]
    async fn encoder_dying_at_start_is_reported_and_not_registered() {
        let dir = tempfile::tempdir().unwrap();
        let manager = StreamTranscodeManager::new(quick_settings(dir.path()), Arc::new(BrokenLauncher));

        let err = manager
            .get_or_create_stream("placeholder", InputSource::Placeholder)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::EncoderStart(_)));
        assert_eq!(manager.session_count(), 0);
    }

    #[tokio::test]
    async fn idle_session_is_reaped_and_recreated() {
        let (_dir, launcher, manager, media) = setup();

        let first = manager
            .get_or_create_stream("channel_3", InputSource::file(&media, 0.0))
            .await
            .unwrap();
        assert_eq!(manager.reap_idle().await, 0);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(manager.reap_idle().await, 1);
        assert_eq!(manager.session_count(), 0);
        assert!(!first.is_active());
        assert_eq!(first.encoder_pid().await, None);

        let second = manager
            .get_or_create_stream("channel_3", InputSource::file(&media, 0.0))
            .await
            .unwrap();
        assert_ne!(first.instance(), second.instance());
        assert_eq!(launcher.spawns.load(Ordering::SeqCst), 2);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn reaper_task_retires_idle_sessions() {
        let (_dir, _launcher, manager, _media) = setup();
        let manager = Arc::new(manager);
        let cancel = CancellationToken::new();
        let reaper = manager.clone().spawn_reaper(cancel.clone());

        manager
            .get_or_create_stream("guide", InputSource::Guide)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(manager.session_count(), 0);

        cancel.cancel();
        reaper.await.unwrap();
    }

    #[tokio::test]
    async fn access_keeps_session_alive() {
        let (_dir, _launcher, manager, _media) = setup();
        manager
            .get_or_create_stream("guide", InputSource::Guide)
            .await
            .unwrap();
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            manager.serve_playlist("guide").await.unwrap();
        }
        assert_eq!(manager.reap_idle().await, 0);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn changed_input_retires_old_session() {
        let (dir, launcher, manager, media) = setup();
        let other = dir.path().join("movie.mp4");
        std::fs::write(&other, b"x").unwrap();

        let first = manager
            .get_or_create_stream("channel_3", InputSource::file(&media, 0.0))
            .await
            .unwrap();
        let second = manager
            .get_or_create_stream("channel_3", InputSource::file(&other, 0.0))
            .await
            .unwrap();

        assert!(!first.is_active());
        assert_eq!(first.encoder_pid().await, None);
        assert_eq!(second.input(), &InputSource::file(&other, 0.0));
        assert_eq!(launcher.spawns.load(Ordering::SeqCst), 2);
        assert_eq!(manager.session_count(), 1);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn exited_encoder_is_restarted() {
        let (_dir, launcher, manager, _media) = setup();
        let session = manager
            .get_or_create_stream("guide", InputSource::Guide)
            .await
            .unwrap();
        if let Some(handle) = session.encoder.lock().await.as_mut() {
            handle.terminate(Duration::from_secs(1)).await;
        }

        let again = manager
            .get_or_create_stream("guide", InputSource::Guide)
            .await
            .unwrap();
        assert_eq!(again.instance(), session.instance());
        assert!(again.encoder_pid().await.is_some());
        assert_eq!(launcher.spawns.load(Ordering::SeqCst), 2);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn rejects_path_traversal() {
        let (_dir, _launcher, manager, _media) = setup();
        assert!(matches!(
            manager.serve_segment("guide", "../secret").await,
            Err(EngineError::InvalidRequest(_))
        ));
        assert!(matches!(
            manager.get_or_create_stream("../etc", InputSource::Guide).await,
            Err(EngineError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn session_debug_names_the_stream() {
        let (_dir, _launcher, manager, _media) = setup();
        let session = manager
            .get_or_create_stream("guide", InputSource::Guide)
            .await
            .unwrap();
        let shown = format!("{session:?}");
        assert!(shown.contains("\"guide\""), "{shown}");
        assert!(shown.contains("active: true"), "{shown}");
        manager.shutdown().await;
    }
}
