//! Playback controller: the state machine coordinating stream sources, audio
//! output, and the video presenter.
//!
//! The controller is the single shared mutable root. It owns both stream
//! sources, the audio output, and the sink handle; components never hold
//! back-references and report outward through the observers registered here.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;

use crate::audio_clock::AudioClock;
use crate::audio_output::AudioOutput;
use crate::error::PlayerError;
use crate::frame::MediaKind;
use crate::presenter::{presenter_loop, PresenterContext};
use crate::renderer::{FrameSink, WindowHandle};
use crate::stream_source::{StreamInfo, StreamSource};

/// Frame-step fallback when the container reports no frame rate.
const DEFAULT_STEP_SECONDS: f64 = 0.040;

/// Player lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PlayerState {
    /// Opened or idle; nothing is being decoded or presented
    Stopped = 0,
    /// Decoding and presenting
    Playing = 1,
    /// Workers idle, position held
    Paused = 2,
    /// Unrecoverable failure; only close/open leaves this state
    Error = 3,
}

impl PlayerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => PlayerState::Playing,
            2 => PlayerState::Paused,
            3 => PlayerState::Error,
            _ => PlayerState::Stopped,
        }
    }

    /// Whether `self -> to` is a legal transition of the state machine.
    pub fn can_transition(self, to: PlayerState) -> bool {
        match (self, to) {
            // Any state may stop or fail.
            (_, PlayerState::Stopped) | (_, PlayerState::Error) => true,
            (PlayerState::Stopped, PlayerState::Playing) => true,
            (PlayerState::Playing, PlayerState::Paused) => true,
            (PlayerState::Paused, PlayerState::Playing) => true,
            _ => false,
        }
    }
}

/// Observer of presentation progress: `(current_us, duration_us)`.
pub type TimestampObserver = Box<dyn Fn(i64, i64) + Send + Sync>;
/// Observer of player state transitions.
pub type StateObserver = Box<dyn Fn(PlayerState) + Send + Sync>;

/// State shared with the presenter thread.
pub(crate) struct PlayerShared {
    state: AtomicU8,
    is_running: AtomicBool,
    last_presented_us: AtomicI64,
    clock: Mutex<Option<Arc<AudioClock>>>,
    timestamp_observer: Mutex<Option<TimestampObserver>>,
    state_observer: Mutex<Option<StateObserver>>,
}

impl PlayerShared {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(PlayerState::Stopped as u8),
            is_running: AtomicBool::new(false),
            last_presented_us: AtomicI64::new(0),
            clock: Mutex::new(None),
            timestamp_observer: Mutex::new(None),
            state_observer: Mutex::new(None),
        }
    }

    pub(crate) fn state(&self) -> PlayerState {
        PlayerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Stores the new state and notifies the observer on actual transitions.
    pub(crate) fn set_state(&self, new_state: PlayerState) {
        let previous = self.state.swap(new_state as u8, Ordering::AcqRel);
        if previous != new_state as u8 {
            if let Some(observer) = &*self.state_observer.lock() {
                observer(new_state);
            }
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }

    pub(crate) fn stop_running(&self) {
        self.is_running.store(false, Ordering::Release);
    }

    fn start_running(&self) {
        self.is_running.store(true, Ordering::Release);
    }

    pub(crate) fn audio_clock_us(&self) -> i64 {
        self.clock.lock().as_ref().map(|c| c.value_us()).unwrap_or(0)
    }

    fn set_clock(&self, clock: Option<Arc<AudioClock>>) {
        *self.clock.lock() = clock;
    }

    /// Records the presented PTS and invokes the timestamp observer.
    pub(crate) fn publish_timestamp(&self, pts_us: i64, duration_us: i64) {
        self.last_presented_us.store(pts_us, Ordering::Release);
        if let Some(observer) = &*self.timestamp_observer.lock() {
            observer(pts_us, duration_us);
        }
    }

    fn last_presented_us(&self) -> i64 {
        self.last_presented_us.load(Ordering::Acquire)
    }
}

/// The media player.
///
/// Open a file, then drive playback with [`play`](Self::play) /
/// [`pause`](Self::pause) / [`seek`](Self::seek) / [`stop`](Self::stop).
/// Dropping the player closes everything.
pub struct Player {
    video: Option<Arc<StreamSource>>,
    audio: Option<Arc<StreamSource>>,
    audio_out: Option<AudioOutput>,
    sink: Arc<dyn FrameSink>,
    shared: Arc<PlayerShared>,
    presenter: Option<JoinHandle<()>>,
    duration_us: i64,
}

impl Player {
    /// Creates a player presenting into `sink`.
    pub fn new(sink: Arc<dyn FrameSink>) -> Self {
        Self {
            video: None,
            audio: None,
            audio_out: None,
            sink,
            shared: Arc::new(PlayerShared::new()),
            presenter: None,
            duration_us: 0,
        }
    }

    /// Opens `path`, initializing one stream source per media kind, the
    /// audio output, and the presenter thread. Requires state Stopped; on
    /// failure every partial initialization is rolled back and the player
    /// stays Stopped, so the caller may retry with another path. Success
    /// also leaves the player Stopped.
    pub fn open(&mut self, path: &str) -> Result<(), PlayerError> {
        if self.shared.state() != PlayerState::Stopped {
            return Err(PlayerError::InvalidArgument(
                "open requires the player to be stopped".to_string(),
            ));
        }
        self.release_pipeline();

        let video = match StreamSource::open(path, MediaKind::Video) {
            Ok(source) => Some(Arc::new(source)),
            Err(e) => {
                tracing::error!("failed to open video stream: {e}");
                return Err(e);
            }
        };
        // A missing audio stream is not an error; playback proceeds silent
        // with the clock pinned at zero.
        let audio = match StreamSource::open(path, MediaKind::Audio) {
            Ok(source) => Some(Arc::new(source)),
            Err(e) => {
                tracing::info!("continuing without audio: {e}");
                None
            }
        };

        let audio_out = match &audio {
            Some(source) => match AudioOutput::new(Arc::clone(source)) {
                Ok(out) => Some(out),
                Err(e) => {
                    tracing::error!("audio output initialization failed: {e}");
                    if let Some(v) = &video {
                        v.close();
                    }
                    if let Some(a) = &audio {
                        a.close();
                    }
                    return Err(e);
                }
            },
            None => None,
        };

        if let Some(source) = &video {
            let StreamInfo::Video { width, height, .. } = *source.info() else {
                return Err(PlayerError::Internal("video source without video info".into()));
            };
            if let Err(e) = self.sink.start(width, height) {
                tracing::error!("frame sink failed to start: {e}");
                if let Some(mut out) = audio_out {
                    out.stop();
                }
                source.close();
                if let Some(a) = &audio {
                    a.close();
                }
                return Err(e);
            }
        }

        self.duration_us = video
            .as_ref()
            .map(|s| s.duration_us())
            .filter(|&d| d > 0)
            .or_else(|| audio.as_ref().map(|s| s.duration_us()))
            .unwrap_or(0);

        self.shared
            .set_clock(audio_out.as_ref().map(|out| out.clock()));
        self.video = video;
        self.audio = audio;
        self.audio_out = audio_out;

        self.spawn_presenter();
        self.shared.set_state(PlayerState::Stopped);
        tracing::info!("player opened {path}, duration {:.3}s", self.duration());
        Ok(())
    }

    fn spawn_presenter(&mut self) {
        let Some(video) = &self.video else {
            return;
        };
        self.shared.start_running();
        let ctx = PresenterContext {
            shared: Arc::clone(&self.shared),
            video: Arc::clone(video),
            audio: self.audio.clone(),
            sink: Arc::clone(&self.sink),
            duration_us: self.duration_us,
        };
        self.presenter = Some(thread::spawn(move || presenter_loop(ctx)));
    }

    /// Re-arms the presenter if its thread exited on its own (end of
    /// playback) so another play() can present again.
    fn ensure_presenter(&mut self) {
        let finished = self
            .presenter
            .as_ref()
            .map(|handle| handle.is_finished())
            .unwrap_or(self.video.is_some());
        if finished {
            if let Some(handle) = self.presenter.take() {
                let _ = handle.join();
            }
            self.spawn_presenter();
        }
    }

    /// Starts playback. From Paused this resumes; from Error it fails.
    pub fn play(&mut self) -> Result<(), PlayerError> {
        match self.shared.state() {
            PlayerState::Playing => return Ok(()),
            PlayerState::Paused => {
                self.resume();
                return Ok(());
            }
            PlayerState::Error => {
                return Err(PlayerError::InvalidArgument(
                    "player is in error state".to_string(),
                ));
            }
            PlayerState::Stopped => {}
        }

        if self.video.is_none() {
            self.shared.set_state(PlayerState::Error);
            return Err(PlayerError::InvalidArgument(
                "no media opened".to_string(),
            ));
        }

        tracing::info!("starting playback");

        // A previous stop() released the device; bring the output back.
        if self.audio_out.is_none() {
            if let Some(source) = &self.audio {
                let out = AudioOutput::new(Arc::clone(source))?;
                self.shared.set_clock(Some(out.clock()));
                self.audio_out = Some(out);
            }
        }
        self.ensure_presenter();

        if let Some(audio) = &self.audio {
            audio.start();
        }
        if let Some(out) = &self.audio_out {
            out.resume();
        }
        if let Some(video) = &self.video {
            video.start();
        }

        self.shared.set_state(PlayerState::Playing);
        Ok(())
    }

    /// Pauses playback; the presenter idles and the device goes silent.
    pub fn pause(&mut self) {
        if self.shared.state() != PlayerState::Playing {
            return;
        }
        tracing::info!("pausing playback");
        if let Some(video) = &self.video {
            video.pause();
        }
        if let Some(audio) = &self.audio {
            audio.pause();
        }
        if let Some(out) = &self.audio_out {
            out.pause();
        }
        self.shared.set_state(PlayerState::Paused);
    }

    /// Resumes from Paused.
    pub fn resume(&mut self) {
        if self.shared.state() != PlayerState::Paused {
            return;
        }
        tracing::info!("resuming playback");
        if let Some(audio) = &self.audio {
            audio.resume();
        }
        if let Some(video) = &self.video {
            video.resume();
        }
        if let Some(out) = &self.audio_out {
            out.resume();
        }
        self.shared.set_state(PlayerState::Playing);
    }

    /// Stops playback and releases the audio device. Idempotent.
    pub fn stop(&mut self) {
        if self.shared.state() == PlayerState::Stopped && self.audio_out.is_none() {
            return;
        }
        tracing::info!("stopping playback");
        if let Some(mut out) = self.audio_out.take() {
            out.stop();
        }
        self.shared.set_clock(None);
        if let Some(audio) = &self.audio {
            audio.stop();
        }
        if let Some(video) = &self.video {
            video.stop();
        }
        self.sink.clear_frames();
        self.shared.set_state(PlayerState::Stopped);
    }

    /// Seeks to `seconds` (clamped to `[0, duration]`). Leaves the player
    /// Paused; call [`play`](Self::play) to resume.
    pub fn seek(&mut self, seconds: f64) -> Result<(), PlayerError> {
        self.pause();

        let clamped = seconds.clamp(0.0, self.duration());
        let target_us = (clamped * 1_000_000.0) as i64;
        tracing::info!("seeking to {:.3}s", clamped);

        if let Some(out) = &self.audio_out {
            out.reset_clock(target_us);
        }

        if let Some(video) = &self.video {
            video.seek(target_us)?;
        }
        if let Some(audio) = &self.audio {
            audio.seek(target_us)?;
        }

        // The next presented frame republishes; until then report the target.
        self.shared.publish_timestamp(target_us, self.duration_us);
        Ok(())
    }

    /// Advances a single frame while Paused by seeking one frame interval
    /// forward.
    pub fn step_frame(&mut self) -> Result<(), PlayerError> {
        if self.shared.state() != PlayerState::Paused {
            return Err(PlayerError::InvalidArgument(
                "frame stepping requires the player to be paused".to_string(),
            ));
        }
        let frame_rate = self.video.as_ref().map(|v| v.frame_rate()).unwrap_or(0.0);
        let step = if frame_rate > 0.0 {
            1.0 / frame_rate
        } else {
            DEFAULT_STEP_SECONDS
        };
        self.seek(self.current_timestamp() + step)
    }

    /// Stops and releases everything and joins all threads. Idempotent.
    pub fn close(&mut self) {
        tracing::info!("closing player");
        self.stop();
        self.release_pipeline();
        self.shared.set_state(PlayerState::Stopped);
    }

    fn release_pipeline(&mut self) {
        self.shared.stop_running();
        if let Some(handle) = self.presenter.take() {
            let _ = handle.join();
        }
        if let Some(mut out) = self.audio_out.take() {
            out.stop();
        }
        self.shared.set_clock(None);
        self.sink.stop();
        self.sink.clear_frames();
        if let Some(video) = self.video.take() {
            video.close();
        }
        if let Some(audio) = self.audio.take() {
            audio.close();
        }
        self.duration_us = 0;
        self.shared.last_presented_us.store(0, Ordering::Release);
    }

    /// Current playback position in seconds: the audio clock when audio has
    /// advanced, else the last presented video PTS, else zero.
    pub fn current_timestamp(&self) -> f64 {
        if self.audio.is_some() {
            let clock_us = self.shared.audio_clock_us();
            if clock_us > 0 {
                return clock_us as f64 / 1_000_000.0;
            }
        }
        if self.video.is_some() {
            let last = self.shared.last_presented_us();
            if last > 0 {
                return last as f64 / 1_000_000.0;
            }
        }
        0.0
    }

    /// Media duration in seconds (video stream's, else audio's, else 0).
    pub fn duration(&self) -> f64 {
        self.duration_us as f64 / 1_000_000.0
    }

    /// Current state.
    pub fn state(&self) -> PlayerState {
        self.shared.state()
    }

    /// True when playback ran to the end: player Stopped with every opened
    /// stream at EOF.
    pub fn is_finished(&self) -> bool {
        if self.video.is_none() && self.audio.is_none() {
            return false;
        }
        self.shared.state() == PlayerState::Stopped
            && self.video.as_ref().map(|v| v.is_eof()).unwrap_or(true)
            && self.audio.as_ref().map(|a| a.is_eof()).unwrap_or(true)
    }

    /// Sets the playback volume (normalized, clamped to [0, 1]).
    pub fn set_volume(&self, norm: f64) {
        if let Some(out) = &self.audio_out {
            out.set_volume(norm);
        }
    }

    /// Current volume, 0 when no audio output exists.
    pub fn volume(&self) -> f64 {
        self.audio_out.as_ref().map(|out| out.volume()).unwrap_or(0.0)
    }

    /// Registers the timestamp observer, invoked on the presenter thread for
    /// every presented frame. Must not block.
    pub fn set_timestamp_observer(&self, observer: TimestampObserver) {
        *self.shared.timestamp_observer.lock() = Some(observer);
    }

    /// Registers the state observer, invoked on whichever thread performs a
    /// transition. Must not block.
    pub fn set_state_observer(&self, observer: StateObserver) {
        *self.shared.state_observer.lock() = Some(observer);
    }

    /// The presentation window handle.
    pub fn window(&self) -> WindowHandle {
        self.sink.window()
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::HeadlessSink;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn state_machine_legality() {
        use PlayerState::*;
        // Enumerated legal transitions.
        assert!(Stopped.can_transition(Playing));
        assert!(Playing.can_transition(Paused));
        assert!(Paused.can_transition(Playing));
        for from in [Stopped, Playing, Paused, Error] {
            assert!(from.can_transition(Stopped));
            assert!(from.can_transition(Error));
        }
        // Illegal ones.
        assert!(!Stopped.can_transition(Paused));
        assert!(!Error.can_transition(Playing));
        assert!(!Error.can_transition(Paused));
        assert!(!Paused.can_transition(Paused));
    }

    #[test]
    fn fresh_player_reports_defaults() {
        let player = Player::new(Arc::new(HeadlessSink::new()));
        assert_eq!(player.state(), PlayerState::Stopped);
        assert_eq!(player.current_timestamp(), 0.0);
        assert_eq!(player.duration(), 0.0);
        assert!(!player.is_finished(), "nothing opened means not finished");
        assert_eq!(player.volume(), 0.0);
    }

    #[test]
    fn open_missing_file_fails_and_stays_stopped() {
        let mut player = Player::new(Arc::new(HeadlessSink::new()));
        let err = player.open("/does/not/exist.mp4").unwrap_err();
        assert!(matches!(err, PlayerError::OpenFailed(_)));
        assert_eq!(player.state(), PlayerState::Stopped);
    }

    #[test]
    fn play_without_open_enters_error_and_refuses() {
        let mut player = Player::new(Arc::new(HeadlessSink::new()));
        assert!(player.play().is_err());
        assert_eq!(player.state(), PlayerState::Error);
        // Further plays are refused while in Error.
        assert!(player.play().is_err());
    }

    #[test]
    fn pause_and_resume_are_noops_in_wrong_states() {
        let mut player = Player::new(Arc::new(HeadlessSink::new()));
        player.pause();
        assert_eq!(player.state(), PlayerState::Stopped);
        player.resume();
        assert_eq!(player.state(), PlayerState::Stopped);
    }

    #[test]
    fn close_is_idempotent() {
        let mut player = Player::new(Arc::new(HeadlessSink::new()));
        player.close();
        player.close();
        assert_eq!(player.state(), PlayerState::Stopped);
    }

    #[test]
    fn state_observer_fires_only_on_transitions() {
        let player = Player::new(Arc::new(HeadlessSink::new()));
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        player.set_state_observer(Box::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        player.shared.set_state(PlayerState::Error);
        player.shared.set_state(PlayerState::Error);
        player.shared.set_state(PlayerState::Stopped);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn timestamp_observer_receives_published_values() {
        let player = Player::new(Arc::new(HeadlessSink::new()));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        player.set_timestamp_observer(Box::new(move |pts, dur| {
            sink.lock().push((pts, dur));
        }));

        player.shared.publish_timestamp(1_000_000, 10_000_000);
        player.shared.publish_timestamp(2_000_000, 10_000_000);
        assert_eq!(
            &*seen.lock(),
            &[(1_000_000, 10_000_000), (2_000_000, 10_000_000)]
        );
        assert_eq!(player.shared.last_presented_us(), 2_000_000);
    }
}
