// The playout loop.
//
// `decide` is the whole transition table as a pure function of loop state
// and the last outcome. `ChannelController::run` is the driver: it asks the
// current player for an outcome, applies the decision (retune, back off,
// show standby) and publishes status. API handlers only ever see
// `ControllerShared`.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::channel::{ChannelChange, ChannelSignal, TuneCommand};
use crate::config::TransitionEffect;
use crate::encoder::InputSource;
use crate::error::{EngineError, EngineResult};
use crate::player::{ChannelPlayer, PlayOutcome, PlayerContext};
use crate::reception::ReceptionStatus;
use crate::schedule::local_now;
use crate::station::StationLineup;
use crate::status::StatusSnapshot;

/// Consecutive failures before the standby image goes up.
pub const STANDBY_AFTER_FAILURES: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopState {
    pub index: usize,
    pub stuck: u32,
    pub standby_shown: bool,
}

impl LoopState {
    pub fn tuned(index: usize) -> Self {
        Self {
            index,
            stuck: 0,
            standby_shown: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Retune(usize),
    Continue,
    Backoff { show_standby: bool },
}

/// Lineup index a change leads to from `current`, if it names a real channel.
pub fn apply_change(lineup: &StationLineup, current: usize, change: &ChannelChange) -> Option<usize> {
    match change {
        ChannelChange::Command(TuneCommand::Up) => Some(lineup.step(current, true)),
        ChannelChange::Command(TuneCommand::Down) => Some(lineup.step(current, false)),
        ChannelChange::Command(TuneCommand::Direct { channel }) => lineup.index_from_channel(*channel),
        ChannelChange::Jump(index) => (*index < lineup.len()).then_some(*index),
    }
}

pub fn decide(state: LoopState, outcome: &PlayOutcome, lineup: &StationLineup) -> (LoopState, Action) {
    match outcome {
        PlayOutcome::ChannelChangeRequested(change) => match apply_change(lineup, state.index, change) {
            Some(index) => (LoopState::tuned(index), Action::Retune(index)),
            None => (state, Action::Continue),
        },
        PlayOutcome::Failed => {
            let stuck = state.stuck.saturating_add(1);
            let show_standby = stuck >= STANDBY_AFTER_FAILURES
                && !state.standby_shown
                && lineup.at(state.index).standby_image.is_some();
            (
                LoopState {
                    index: state.index,
                    stuck,
                    standby_shown: state.standby_shown || show_standby,
                },
                Action::Backoff { show_standby },
            )
        }
        PlayOutcome::Success => (LoopState::tuned(state.index), Action::Continue),
    }
}

/// Controller state readable from request handlers.
pub struct ControllerShared {
    lineup: Arc<StationLineup>,
    signal: Arc<ChannelSignal>,
    current_index: AtomicUsize,
    stuck: AtomicU32,
    player: parking_lot::RwLock<Option<Arc<ChannelPlayer>>>,
    interstitial: parking_lot::Mutex<Option<PathBuf>>,
    status_tx: broadcast::Sender<StatusSnapshot>,
}

impl ControllerShared {
    pub fn new(
        lineup: Arc<StationLineup>,
        signal: Arc<ChannelSignal>,
        status_tx: broadcast::Sender<StatusSnapshot>,
    ) -> Self {
        Self {
            current_index: AtomicUsize::new(signal.requested_index()),
            lineup,
            signal,
            stuck: AtomicU32::new(0),
            player: parking_lot::RwLock::new(None),
            interstitial: parking_lot::Mutex::new(None),
            status_tx,
        }
    }

    pub fn current_index(&self) -> usize {
        self.current_index.load(Ordering::Acquire)
    }

    pub fn current_player(&self) -> Option<Arc<ChannelPlayer>> {
        self.player.read().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusSnapshot> {
        self.status_tx.subscribe()
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        match self.current_player() {
            Some(player) => player.snapshot(self.stuck.load(Ordering::Acquire) > 0),
            None => StatusSnapshot::stopped(),
        }
    }

    pub fn publish(&self) {
        let _ = self.status_tx.send(self.snapshot());
    }

    /// Queue a tune request. Returns the channel number it lands on once
    /// the commands queued ahead of it have been applied.
    pub fn request(&self, command: TuneCommand) -> EngineResult<u32> {
        match command {
            TuneCommand::Up | TuneCommand::Down => {
                let ahead = self.signal.push(command);
                let target = ahead
                    .iter()
                    .chain([&command])
                    .fold(self.current_index(), |index, cmd| {
                        apply_change(&self.lineup, index, &ChannelChange::Command(*cmd))
                            .unwrap_or(index)
                    });
                Ok(self.lineup.at(target).channel_number)
            }
            TuneCommand::Direct { channel } => {
                let index = self
                    .lineup
                    .index_from_channel(channel)
                    .ok_or(EngineError::ChannelNotFound(channel))?;
                self.signal.request_index(index);
                Ok(channel)
            }
        }
    }

    /// Encoder input for `channel_<number>`: the tuned channel's content at
    /// its current position, otherwise the placeholder card.
    pub fn stream_input(&self, channel_number: u32) -> InputSource {
        let Some(player) = self.current_player() else {
            return InputSource::Placeholder;
        };
        if player.station().channel_number != channel_number {
            return InputSource::Placeholder;
        }
        if let Some(clip) = self.interstitial.lock().clone() {
            return InputSource::file(clip, 0.0);
        }
        player.current_input().unwrap_or(InputSource::Placeholder)
    }
}

pub struct ChannelController {
    shared: Arc<ControllerShared>,
    ctx: Arc<PlayerContext>,
    transition: TransitionEffect,
    static_clip: PathBuf,
}

impl ChannelController {
    pub fn new(
        shared: Arc<ControllerShared>,
        ctx: Arc<PlayerContext>,
        transition: TransitionEffect,
        static_clip: PathBuf,
    ) -> Self {
        Self {
            shared,
            ctx,
            transition,
            static_clip,
        }
    }

    /// Run until the context's cancellation token fires.
    pub async fn run(self, start_index: usize) {
        let cancel = self.ctx.cancel.clone();
        let lineup = self.shared.lineup.clone();
        let mut state = LoopState::tuned(start_index.min(lineup.len() - 1));
        let mut player = self.tune(self.ctx.signal.requested_index(), state.index);

        while !cancel.is_cancelled() {
            let outcome = match self.ctx.signal.take(state.index).await {
                Some(change) => PlayOutcome::ChannelChangeRequested(change),
                None if player.station().is_guide() => player.show_guide().await,
                None => player.play_slot(local_now()).await,
            };
            if cancel.is_cancelled() {
                break;
            }

            // The jump request this outcome answers, if any.
            let consumed = match &outcome {
                PlayOutcome::ChannelChangeRequested(ChannelChange::Jump(requested)) => *requested,
                _ => state.index,
            };
            let (next, action) = decide(state, &outcome, &lineup);
            state = next;
            self.shared.stuck.store(state.stuck, Ordering::Release);

            match action {
                Action::Retune(index) => {
                    *self.shared.player.write() = None;
                    player.shutdown().await;
                    self.run_transition().await;
                    player = self.tune(consumed, index);
                }
                Action::Continue => {
                    if let PlayOutcome::ChannelChangeRequested(change) = &outcome {
                        warn!("ignoring change to unknown channel: {change:?}");
                        self.ctx.signal.settle(consumed, state.index);
                    }
                }
                Action::Backoff { show_standby } => {
                    if show_standby {
                        player.show_standby();
                    }
                    debug!(
                        "{}: slot failed ({} in a row), backing off",
                        player.station().network_name,
                        state.stuck
                    );
                    player.publish(true);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.ctx.timing.failure_backoff) => {}
                    }
                }
            }
        }

        *self.shared.player.write() = None;
        player.shutdown().await;
        self.shared.stuck.store(0, Ordering::Release);
        self.shared.publish();
        info!("controller stopped");
    }

    fn tune(&self, consumed: usize, index: usize) -> Arc<ChannelPlayer> {
        let station = self.shared.lineup.at(index).clone();
        info!(
            "tuned to channel {} ({})",
            station.channel_number, station.network_name
        );
        self.ctx.signal.settle(consumed, index);
        self.shared.current_index.store(index, Ordering::Release);
        self.shared.stuck.store(0, Ordering::Release);

        let player = Arc::new(ChannelPlayer::new(station, index, self.ctx.clone()));
        *self.shared.player.write() = Some(player.clone());
        player.publish(false);
        player
    }

    /// Step reception with `f` until it reports done, pausing between steps.
    async fn ramp(&self, mut f: impl FnMut(&mut ReceptionStatus) -> bool) {
        loop {
            let done = f(&mut *self.ctx.reception.lock());
            if done || !self.pause().await {
                break;
            }
        }
    }

    /// One effect step. False when shutting down.
    async fn pause(&self) -> bool {
        tokio::select! {
            _ = self.ctx.cancel.cancelled() => false,
            _ = tokio::time::sleep(self.ctx.timing.effect_step) => true,
        }
    }

    async fn degrade_until_degraded(&self, step: Option<f64>) {
        self.ramp(|r| {
            if r.is_degraded() {
                return true;
            }
            r.degrade(step);
            false
        })
        .await;
    }

    async fn run_transition(&self) {
        match self.transition {
            TransitionEffect::None => {}
            TransitionEffect::Short => self.degrade_until_degraded(Some(0.2)).await,
            TransitionEffect::Long => {
                self.degrade_until_degraded(None).await;
                if self.static_clip.is_file() {
                    *self.shared.interstitial.lock() = Some(self.static_clip.clone());
                } else {
                    debug!("static clip {} missing, skipping", self.static_clip.display());
                }
                self.ramp(|r| {
                    if r.is_perfect() {
                        return true;
                    }
                    r.improve(None);
                    false
                })
                .await;
                self.degrade_until_degraded(None).await;
                *self.shared.interstitial.lock() = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CatalogSet;
    use crate::config::PlayerTiming;
    use crate::player::tests::{context, context_with_timing, quick_timing};
    use crate::schedule::tests::{block, entry};
    use crate::schedule::ScheduleResolver;
    use crate::station::tests::station;
    use crate::station::NetworkType;
    use crate::status::PlayStatus;
    use std::collections::HashMap;
    use std::time::Duration;

    fn lineup_with_standby() -> StationLineup {
        let mut nbc = station("NBC", 3);
        nbc.standby_image = Some("runtime/standby.png".into());
        StationLineup::new(vec![station("Guide", 1), nbc, station("PBS", 9)]).unwrap()
    }

    #[test]
    fn change_requests_retune_and_reset() {
        let lineup = lineup_with_standby();
        let stuck = LoopState {
            index: 1,
            stuck: 5,
            standby_shown: true,
        };

        let up = PlayOutcome::ChannelChangeRequested(ChannelChange::Command(TuneCommand::Up));
        assert_eq!(decide(stuck, &up, &lineup), (LoopState::tuned(2), Action::Retune(2)));

        let wrap = decide(LoopState::tuned(2), &up, &lineup);
        assert_eq!(wrap.1, Action::Retune(0));

        let down = PlayOutcome::ChannelChangeRequested(ChannelChange::Command(TuneCommand::Down));
        assert_eq!(decide(LoopState::tuned(0), &down, &lineup).1, Action::Retune(2));

        let direct = PlayOutcome::ChannelChangeRequested(ChannelChange::Command(
            TuneCommand::Direct { channel: 9 },
        ));
        assert_eq!(decide(stuck, &direct, &lineup).1, Action::Retune(2));

        let jump = PlayOutcome::ChannelChangeRequested(ChannelChange::Jump(0));
        assert_eq!(decide(stuck, &jump, &lineup).1, Action::Retune(0));
    }

    #[test]
    fn unknown_channel_keeps_state() {
        let lineup = lineup_with_standby();
        let state = LoopState {
            index: 1,
            stuck: 1,
            standby_shown: false,
        };
        for change in [
            ChannelChange::Command(TuneCommand::Direct { channel: 42 }),
            ChannelChange::Jump(17),
        ] {
            let outcome = PlayOutcome::ChannelChangeRequested(change);
            assert_eq!(decide(state, &outcome, &lineup), (state, Action::Continue));
        }
    }

    #[test]
    fn standby_goes_up_exactly_once_per_streak() {
        let lineup = lineup_with_standby();
        let mut state = LoopState::tuned(1);
        let mut shown = Vec::new();
        for _ in 0..5 {
            let (next, action) = decide(state, &PlayOutcome::Failed, &lineup);
            state = next;
            shown.push(action == Action::Backoff { show_standby: true });
        }
        assert_eq!(shown, [false, true, false, false, false]);
        assert_eq!(state.stuck, 5);

        let (state, action) = decide(state, &PlayOutcome::Success, &lineup);
        assert_eq!(action, Action::Continue);
        assert_eq!(state, LoopState::tuned(1));

        let (state, _) = decide(state, &PlayOutcome::Failed, &lineup);
        let (_, action) = decide(state, &PlayOutcome::Failed, &lineup);
        assert_eq!(action, Action::Backoff { show_standby: true });
    }

    #[test]
    fn no_standby_image_means_plain_backoff() {
        let lineup = lineup_with_standby();
        let mut state = LoopState::tuned(2);
        for _ in 0..4 {
            let (next, action) = decide(state, &PlayOutcome::Failed, &lineup);
            assert_eq!(action, Action::Backoff { show_standby: false });
            state = next;
        }
    }

    struct Harness {
        shared: Arc<ControllerShared>,
        ctx: Arc<crate::player::PlayerContext>,
        task: tokio::task::JoinHandle<()>,
    }

    impl Harness {
        fn start(lineup: StationLineup, resolver: ScheduleResolver, transition: TransitionEffect) -> Self {
            let lineup = Arc::new(lineup);
            let signal = Arc::new(ChannelSignal::new(0, None));
            let ctx = context(resolver, CatalogSet::default(), signal.clone());
            let shared = Arc::new(ControllerShared::new(lineup, signal, ctx.status_tx.clone()));
            let controller =
                ChannelController::new(shared.clone(), ctx.clone(), transition, PathBuf::from("/nonexistent/static.mp4"));
            let task = tokio::spawn(controller.run(0));
            Self { shared, ctx, task }
        }

        async fn stop(self) {
            self.ctx.cancel.cancel();
            tokio::time::timeout(Duration::from_secs(2), self.task)
                .await
                .expect("controller should stop promptly")
                .unwrap();
            assert_eq!(self.shared.snapshot().status, PlayStatus::Stopped);
        }
    }

    fn airing_now(name: &str, path: &str) -> ScheduleResolver {
        let now = local_now();
        ScheduleResolver::new(HashMap::from([(
            name.to_string(),
            vec![block(
                now - time::Duration::minutes(10),
                now + time::Duration::minutes(50),
                vec![entry(path, 3600.0)],
            )],
        )]))
    }

    #[tokio::test]
    async fn guide_then_channel_up_tunes_next_station() {
        let dir = tempfile::tempdir().unwrap();
        let media = dir.path().join("news.mp4");
        std::fs::write(&media, b"x").unwrap();
        let path = media.display().to_string();

        let mut guide = station("Guide", 1);
        guide.network_type = NetworkType::Guide;
        let lineup = StationLineup::new(vec![guide, station("NBC", 3)]).unwrap();
        let harness = Harness::start(lineup, airing_now("NBC", &path), TransitionEffect::None);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let status = harness.shared.snapshot();
        assert_eq!(status.status, PlayStatus::Guide);
        assert_eq!(status.channel, 1);

        assert_eq!(harness.shared.request(TuneCommand::Up).unwrap(), 3);
        tokio::time::sleep(Duration::from_millis(200)).await;

        let status = harness.shared.snapshot();
        assert_eq!(status.channel, 3);
        assert_eq!(status.status, PlayStatus::Playing);
        assert_eq!(harness.shared.current_index(), 1);
        let player = harness.shared.current_player().unwrap();
        assert_eq!(player.current_path().as_deref(), Some(path.as_str()));
        assert!(matches!(
            harness.shared.stream_input(3),
            InputSource::File { start_at, .. } if start_at >= 590.0
        ));
        assert_eq!(harness.shared.stream_input(1), InputSource::Placeholder);

        harness.stop().await;
    }

    #[tokio::test]
    async fn missing_content_falls_back_to_standby() {
        let mut nbc = station("NBC", 3);
        nbc.standby_image = Some("runtime/standby.png".into());
        let lineup = StationLineup::new(vec![nbc]).unwrap();
        let harness = Harness::start(
            lineup,
            airing_now("NBC", "/definitely/missing.mp4"),
            TransitionEffect::None,
        );

        tokio::time::sleep(Duration::from_millis(300)).await;
        let player = harness.shared.current_player().unwrap();
        assert_eq!(player.current_path().as_deref(), Some("runtime/standby.png"));
        assert_eq!(harness.shared.snapshot().status, PlayStatus::Stuck);

        harness.stop().await;
    }

    #[tokio::test]
    async fn direct_request_to_unknown_channel_is_rejected() {
        let lineup = StationLineup::new(vec![station("NBC", 3)]).unwrap();
        let harness = Harness::start(lineup, ScheduleResolver::default(), TransitionEffect::None);
        assert!(matches!(
            harness.shared.request(TuneCommand::Direct { channel: 99 }),
            Err(EngineError::ChannelNotFound(99))
        ));
        harness.stop().await;
    }

    #[tokio::test]
    async fn direct_tune_during_a_transition_is_honoured() {
        let lineup = Arc::new(
            StationLineup::new(vec![station("NBC", 3), station("CBS", 5), station("PBS", 9)]).unwrap(),
        );
        let signal = Arc::new(ChannelSignal::new(0, None));
        let timing = PlayerTiming {
            effect_step: Duration::from_millis(100),
            ..quick_timing()
        };
        let ctx = context_with_timing(ScheduleResolver::default(), CatalogSet::default(), signal.clone(), timing);
        let shared = Arc::new(ControllerShared::new(lineup, signal, ctx.status_tx.clone()));
        let controller = ChannelController::new(
            shared.clone(),
            ctx.clone(),
            TransitionEffect::Long,
            PathBuf::from("/nonexistent/static.mp4"),
        );
        let task = tokio::spawn(controller.run(0));
        let harness = Harness { shared, ctx, task };

        assert_eq!(harness.shared.request(TuneCommand::Up).unwrap(), 5);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(harness.shared.request(TuneCommand::Direct { channel: 9 }).unwrap(), 9);

        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert_eq!(harness.shared.current_index(), 2);
        assert_eq!(harness.shared.snapshot().channel, 9);

        harness.stop().await;
    }

    #[tokio::test]
    async fn back_to_back_steps_report_where_each_lands() {
        let lineup = Arc::new(
            StationLineup::new(vec![station("NBC", 3), station("CBS", 5), station("PBS", 9)]).unwrap(),
        );
        let signal = Arc::new(ChannelSignal::new(0, None));
        let (status_tx, _) = broadcast::channel(4);
        let shared = ControllerShared::new(lineup, signal, status_tx);

        assert_eq!(shared.request(TuneCommand::Up).unwrap(), 5);
        assert_eq!(shared.request(TuneCommand::Up).unwrap(), 9);
        assert_eq!(shared.request(TuneCommand::Down).unwrap(), 5);
    }

    #[tokio::test]
    async fn unknown_jump_is_dropped_not_retried() {
        let lineup = StationLineup::new(vec![station("NBC", 3)]).unwrap();
        let harness = Harness::start(lineup, ScheduleResolver::default(), TransitionEffect::None);
        harness.ctx.signal.request_index(7);
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(harness.ctx.signal.requested_index(), 0);
        assert_eq!(harness.shared.current_index(), 0);
        harness.stop().await;
    }

    #[tokio::test]
    async fn transitions_leave_reception_degraded() {
        let lineup = Arc::new(StationLineup::new(vec![station("NBC", 3)]).unwrap());
        let dir = tempfile::tempdir().unwrap();
        let clip = dir.path().join("static.mp4");
        std::fs::write(&clip, b"x").unwrap();

        for effect in [TransitionEffect::Short, TransitionEffect::Long] {
            let signal = Arc::new(ChannelSignal::new(0, None));
            let ctx = context(ScheduleResolver::default(), CatalogSet::default(), signal.clone());
            let shared = Arc::new(ControllerShared::new(lineup.clone(), signal, ctx.status_tx.clone()));
            let controller = ChannelController::new(shared.clone(), ctx.clone(), effect, clip.clone());

            controller.run_transition().await;
            assert!(ctx.reception.lock().is_degraded(), "{effect:?}");
            assert!(shared.interstitial.lock().is_none());
        }
    }
}
