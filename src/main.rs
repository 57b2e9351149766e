//! Headless session runner.
//!
//! Connects to a host, streams, and logs session events until the stream
//! terminates or Ctrl-C. The GUI shell embeds `lumen_streamer` as a
//! library instead of using this binary.

use std::process::ExitCode;

use log::{error, info};
use tokio::sync::mpsc;

use lumen_streamer::app::{
    RecoveryHint, Session, SessionEvent, StreamParams, StreamSettings, TransportPreference,
};
use lumen_streamer::utils;

struct Args {
    base_url: String,
    host_id: u32,
    app_id: u32,
    transport: TransportPreference,
    canvas: bool,
}

fn parse_args() -> Option<Args> {
    let mut positional = Vec::new();
    let mut transport = TransportPreference::Auto;
    let mut canvas = false;

    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--websocket" => transport = TransportPreference::WebSocket,
            "--webrtc" => transport = TransportPreference::WebRtc,
            "--canvas" => canvas = true,
            _ => positional.push(arg),
        }
    }

    if positional.len() != 3 {
        return None;
    }

    Some(Args {
        base_url: positional[0].clone(),
        host_id: positional[1].parse().ok()?,
        app_id: positional[2].parse().ok()?,
        transport,
        canvas,
    })
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = utils::init_logging_with_console();

    let Some(args) = parse_args() else {
        eprintln!("usage: lumen-streamer <base-url> <host-id> <app-id> [--websocket|--webrtc] [--canvas]");
        return ExitCode::FAILURE;
    };

    let mut settings = StreamSettings::load().unwrap_or_default();
    if args.canvas {
        settings.canvas_renderer = true;
    }

    let params = StreamParams::new(args.host_id, args.app_id);
    let (event_tx, mut event_rx) = mpsc::channel::<SessionEvent>(64);

    let session = Session::new(args.base_url, params, settings, args.transport, event_tx);
    let shutdown = session.shutdown_handle();

    // Event printer.
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            match event {
                SessionEvent::StateChanged(state) => info!("state: {state:?}"),
                SessionEvent::StageStarting { stage } => info!("stage starting: {stage}"),
                SessionEvent::StageComplete { stage } => info!("stage complete: {stage}"),
                SessionEvent::StageFailed { stage, error_code } => {
                    error!("stage {stage} failed with code {error_code}")
                }
                SessionEvent::Diagnostic { line, hint } => match hint {
                    RecoveryHint::Fatal => error!("{line}"),
                    RecoveryHint::Recover => info!("{line}"),
                },
                SessionEvent::ServerMessage(text) => info!("Server: {text}"),
                SessionEvent::AppUpdated(app) => info!("app updated: {app}"),
                SessionEvent::ShowScreenKeyboard => info!("show screen keyboard"),
                SessionEvent::HideScreenKeyboard => info!("hide screen keyboard"),
                SessionEvent::Stats(stats) => info!(
                    "{} {:.1} fps, {:.1} Mbps, rtt {:.1} ms, {} dropped",
                    stats.format_resolution(),
                    stats.fps,
                    stats.bitrate_mbps,
                    stats.rtt_ms,
                    stats.frames_dropped
                ),
            }
        }
    });

    // Ctrl-C stops the session cleanly.
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            shutdown.shutdown().await;
        }
    });

    match session.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("session failed: {err}");
            ExitCode::FAILURE
        }
    }
}
