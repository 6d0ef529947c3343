//! Host runtime.
//!
//! Provides device enumeration and the interactive play loop.

use std::io::BufRead;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, select};
use talkbook_engine::{
    ContentItem, PlayableBook, PlayerContext, SharedStatus, list_devices as engine_devices,
};

use crate::bookmark::JsonPositionStore;
use crate::config::HostConfig;
use crate::manifest::BookManifest;

/// Offset applied by the forward and rewind commands.
const SEEK_STEP_MS: i64 = 15_000;
const TICK: Duration = Duration::from_millis(500);

enum Event {
    /// A stdin line, `None` once stdin is closed.
    Line(Option<String>),
    Interrupted,
    Tick,
}

/// One keyboard command of the play loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    PlayPause,
    Stop,
    Next,
    Previous,
    Forward,
    Rewind,
    Faster,
    Slower,
    Louder,
    Quieter,
    Quit,
}

impl Command {
    pub fn parse(line: &str) -> Option<Self> {
        let cmd = match line.trim() {
            "p" => Self::PlayPause,
            "s" => Self::Stop,
            "n" => Self::Next,
            "b" => Self::Previous,
            "f" => Self::Forward,
            "r" => Self::Rewind,
            "+" => Self::Faster,
            "-" => Self::Slower,
            "]" => Self::Louder,
            "[" => Self::Quieter,
            "q" => Self::Quit,
            _ => return None,
        };
        Some(cmd)
    }
}

/// List output devices and print them to stdout.
pub fn list_devices() -> Result<()> {
    let devices = engine_devices().context("enumerate output devices")?;
    if devices.is_empty() {
        println!("no output devices");
    }
    for dev in devices {
        let marker = if dev.is_default { "*" } else { " " };
        println!(
            "{marker} {} ({}-{} Hz)",
            dev.name, dev.min_rate, dev.max_rate
        );
    }
    Ok(())
}

/// Play the book in `manifest` until the user quits or the book ends.
pub fn run_play(
    config: HostConfig,
    manifest: &Path,
    speed: Option<f32>,
    sleep: Option<Duration>,
) -> Result<()> {
    let manifest = BookManifest::load(manifest)?;
    let store = Arc::new(JsonPositionStore::for_book(&config.bookmark_dir, manifest.id()));
    tracing::info!(bookmark = ?store.path(), "bookmark file");

    let speed_step = config.player.speed_step;
    let volume_step = config.player.volume_step;
    let status = SharedStatus::shared();
    let ctx = PlayerContext::new(config.player).with_observer(status.clone());
    let book = PlayableBook::open(manifest, ctx, store);
    if book.player().fragment_count() == 0 {
        anyhow::bail!("no playable resources in {:?}", book.item().name());
    }

    let player = book.player();
    if let Some(speed) = speed {
        player.set_speed(speed);
    }
    player.set_timer_duration(sleep);

    let (quit_tx, quit_rx) = crossbeam_channel::bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = quit_tx.try_send(());
    })
    .context("install Ctrl-C handler")?;
    let lines = spawn_stdin_reader();

    println!("{}", book.item().name());
    println!("keys: p play/pause, s stop, n/b next/previous, f/r +/-15s, +/- speed, ]/[ volume, q quit");
    book.play_pause()?;

    let mut stopped_by_user = false;
    let mut last_index = None;
    loop {
        let event = select! {
            recv(lines) -> line => Event::Line(line.ok()),
            recv(quit_rx) -> _ => Event::Interrupted,
            default(TICK) => Event::Tick,
        };
        match event {
            Event::Line(None) => {
                tracing::info!("stdin closed");
                break;
            }
            Event::Line(Some(line)) => match Command::parse(&line) {
                Some(Command::Quit) => break,
                Some(cmd) => {
                    stopped_by_user =
                        cmd == Command::Stop || (stopped_by_user && cmd != Command::PlayPause);
                    if let Err(e) = apply(&book, cmd, speed_step, volume_step) {
                        tracing::warn!(?cmd, "command failed: {e}");
                    }
                    print_status(&book);
                }
                None if line.trim().is_empty() => {}
                None => println!("unknown command: {}", line.trim()),
            },
            Event::Interrupted => {
                tracing::info!("interrupted");
                break;
            }
            Event::Tick => {}
        }

        let snapshot = status.snapshot();
        if snapshot.playing && last_index != Some(snapshot.fragment_index) {
            last_index = Some(snapshot.fragment_index);
            print_status(&book);
        }
        if !player.is_playing() && !stopped_by_user {
            println!("end of book");
            break;
        }
    }

    book.close().context("save position")?;
    Ok(())
}

fn apply(
    book: &PlayableBook<BookManifest>,
    cmd: Command,
    speed_step: f32,
    volume_step: f32,
) -> talkbook_engine::Result<()> {
    let player = book.player();
    match cmd {
        Command::PlayPause => book.play_pause()?,
        Command::Stop => book.stop(),
        Command::Next => book.next_fragment()?,
        Command::Previous => book.previous_fragment()?,
        Command::Forward => book.change_offset(SEEK_STEP_MS)?,
        Command::Rewind => book.change_offset(-SEEK_STEP_MS)?,
        Command::Faster => {
            player.change_speed(speed_step);
        }
        Command::Slower => {
            player.change_speed(-speed_step);
        }
        Command::Louder => {
            player.change_volume(volume_step);
        }
        Command::Quieter => {
            player.change_volume(-volume_step);
        }
        Command::Quit => {}
    }
    Ok(())
}

fn print_status(book: &PlayableBook<BookManifest>) {
    let status = book.status();
    let state = match (status.playing, status.paused) {
        (true, true) => "paused",
        (true, false) => "playing",
        (false, _) => "stopped",
    };
    println!(
        "[{}/{}] {} {} / {} speed {:.2}x volume {:.0}%",
        status.fragment_index + 1,
        status.fragment_count,
        state,
        format_ms(status.elapsed_ms.unwrap_or(0)),
        status.duration_ms.map(format_ms).unwrap_or_else(|| "--:--".to_string()),
        status.speed,
        book.player().volume() * 100.0,
    );
}

fn format_ms(ms: u64) -> String {
    let secs = ms / 1000;
    if secs >= 3600 {
        format!("{}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
    } else {
        format!("{:02}:{:02}", secs / 60, secs % 60)
    }
}

fn spawn_stdin_reader() -> Receiver<String> {
    let (tx, rx) = crossbeam_channel::unbounded();
    thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}
