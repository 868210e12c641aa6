//! Command-line front end: open a file, play it to the end, and render
//! playback progress to stdout. SIGINT stops playback gracefully.

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use vireo::{HeadlessSink, Player, PlayerState};

#[derive(Parser)]
#[command(name = "vireo", version, about = "Play a local media file")]
struct Args {
    /// Media file to play
    file: PathBuf,

    /// Initial volume, normalized to [0, 1]
    #[arg(long, default_value_t = 1.0)]
    volume: f64,

    /// Start playback at this position, in seconds
    #[arg(long)]
    start: Option<f64>,
}

fn format_timestamp(us: i64) -> String {
    let total_secs = us / 1_000_000;
    format!(
        "{:02}:{:02}:{:02}",
        total_secs / 3600,
        (total_secs / 60) % 60,
        total_secs % 60
    )
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("vireo=info".parse().expect("static directive")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let Some(path) = args.file.to_str().map(str::to_owned) else {
        eprintln!("error: file path is not valid UTF-8");
        return ExitCode::FAILURE;
    };

    let (quit_tx, quit_rx) = crossbeam_channel::bounded::<()>(1);
    {
        let quit_tx = quit_tx.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            let _ = quit_tx.try_send(());
        }) {
            eprintln!("error: could not install signal handler: {e}");
            return ExitCode::FAILURE;
        }
    }

    let sink = Arc::new(HeadlessSink::new());
    let mut player = Player::new(sink);

    if let Err(e) = player.open(&path) {
        eprintln!("error: {e}");
        return ExitCode::FAILURE;
    }

    player.set_timestamp_observer(Box::new(|current_us, duration_us| {
        print!(
            "\r{} / {}",
            format_timestamp(current_us),
            format_timestamp(duration_us)
        );
        let _ = std::io::stdout().flush();
    }));

    let failed = Arc::new(AtomicBool::new(false));
    {
        let failed = Arc::clone(&failed);
        let quit_tx = quit_tx.clone();
        player.set_state_observer(Box::new(move |state| {
            if state == PlayerState::Error {
                failed.store(true, Ordering::Release);
                let _ = quit_tx.try_send(());
            }
        }));
    }

    player.set_volume(args.volume);
    if let Some(start) = args.start {
        if let Err(e) = player.seek(start) {
            eprintln!("error: {e}");
            player.close();
            return ExitCode::FAILURE;
        }
    }

    if let Err(e) = player.play() {
        eprintln!("error: {e}");
        player.close();
        return ExitCode::FAILURE;
    }

    loop {
        if player.is_finished() {
            tracing::info!("playback finished");
            break;
        }
        if player.window().close_requested() {
            break;
        }
        match quit_rx.recv_timeout(Duration::from_millis(100)) {
            Ok(()) | Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
        }
    }

    println!();
    player.close();

    if failed.load(Ordering::Acquire) {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_render_as_hms() {
        assert_eq!(format_timestamp(0), "00:00:00");
        assert_eq!(format_timestamp(61_000_000), "00:01:01");
        assert_eq!(format_timestamp(3_661_000_000), "01:01:01");
    }
}
