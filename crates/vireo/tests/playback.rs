//! End-to-end playback scenarios.
//!
//! These run against real media and the default audio device, so they are
//! ignored by default. Point `VIREO_TEST_MEDIA` at a short file with one
//! video and one audio stream (a few seconds of 30fps video with 48kHz
//! stereo works well) and run:
//!
//! ```sh
//! VIREO_TEST_MEDIA=sample.mp4 cargo test -p vireo -- --ignored
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use vireo::{HeadlessSink, Player, PlayerState};

fn media_path() -> String {
    std::env::var("VIREO_TEST_MEDIA").expect("set VIREO_TEST_MEDIA to a sample media file")
}

fn open_player() -> (Player, Arc<HeadlessSink>) {
    let sink = Arc::new(HeadlessSink::new());
    let mut player = Player::new(sink.clone());
    player.open(&media_path()).expect("open sample media");
    (player, sink)
}

fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    false
}

#[test]
#[ignore = "requires VIREO_TEST_MEDIA and an audio device"]
fn plays_to_the_end() {
    let (mut player, sink) = open_player();
    let duration = player.duration();
    assert!(duration > 0.0);

    player.play().unwrap();
    assert_eq!(player.state(), PlayerState::Playing);

    let finished = wait_until(Duration::from_secs_f64(duration + 5.0), || {
        player.is_finished()
    });
    assert!(finished, "playback did not finish in time");
    assert_eq!(player.state(), PlayerState::Stopped);
    assert!(player.current_timestamp() >= duration - 0.5);
    assert!(sink.frames_enqueued() > 0, "no frames reached the sink");

    player.close();
}

#[test]
#[ignore = "requires VIREO_TEST_MEDIA and an audio device"]
fn pause_holds_the_clock() {
    let (mut player, _sink) = open_player();
    player.play().unwrap();
    std::thread::sleep(Duration::from_millis(1000));

    player.pause();
    assert_eq!(player.state(), PlayerState::Paused);
    let at_pause = player.current_timestamp();
    std::thread::sleep(Duration::from_millis(500));
    let still = player.current_timestamp();
    assert!(
        (still - at_pause).abs() <= 0.020,
        "timestamp drifted {at_pause} -> {still} while paused"
    );

    player.resume();
    std::thread::sleep(Duration::from_millis(500));
    assert!(
        player.current_timestamp() > still + 0.3,
        "timestamp did not advance after resume"
    );

    player.close();
}

#[test]
#[ignore = "requires VIREO_TEST_MEDIA and an audio device"]
fn seek_back_restarts_from_target() {
    let (mut player, _sink) = open_player();
    player.play().unwrap();

    wait_until(Duration::from_secs(8), || player.current_timestamp() >= 2.0);

    player.seek(1.0).unwrap();
    player.play().unwrap();

    let settled = wait_until(Duration::from_millis(600), || {
        let t = player.current_timestamp();
        (1.0..1.5).contains(&t)
    });
    assert!(settled, "timestamp was {}", player.current_timestamp());

    player.close();
}

#[test]
#[ignore = "requires VIREO_TEST_MEDIA and an audio device"]
fn seek_targets_are_clamped() {
    let (mut player, _sink) = open_player();
    let duration = player.duration();

    player.seek(-3.0).expect("negative seek clamps to zero");
    assert!(player.current_timestamp() <= 0.5);

    player
        .seek(duration + 100.0)
        .expect("overlong seek clamps to duration");

    player.close();
}
