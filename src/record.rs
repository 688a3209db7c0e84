//! The `record` subcommand: the live recording pipeline.
//!
//! Owns every component for the session: audio capture feeds a send loop,
//! a recv loop turns server events into transcript output, and the
//! sidecars (heartbeat, meeting detector, plugins, dead-air watchdog)
//! interleave metadata through the shared writer. Transport failures and
//! dead air recycle the connection with backoff; signals drive
//! pause/resume, diagnostics, and shutdown.

use anyhow::{anyhow, Context, Result};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::Mutex as TokioMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::audio::{self, AudioCapture};
use crate::config::{Config, Trigger};
use crate::diagnostics::Tracker;
use crate::meetings::{self, MeetingDetector, MeetingEvent, MeetingKind};
use crate::plugins::{ExecutionContext, PluginRunner};
use crate::processor::{Options as ProcessorOptions, PostProcessor};
use crate::stt::messages::InboundEvent;
use crate::stt::SttClient;
use crate::timestamp;
use crate::writer::{FileWriter, MetadataWriter, MultiWriter};

/// Where the SIGQUIT diagnostic snapshot lands.
const DIAGNOSTIC_PATH: &str = "./diagnostic-info.txt";

type Frames = Arc<TokioMutex<mpsc::Receiver<Vec<f32>>>>;

/// Run a recording session until shutdown. `output_override` bypasses the
/// directory + filename-template resolution.
pub async fn run(cfg: Config, output_override: Option<PathBuf>) -> Result<()> {
    let tracker = Arc::new(Tracker::new());
    let shutdown = CancellationToken::new();

    spawn_shutdown_signals(shutdown.clone())?;

    let output_path = match output_override {
        Some(path) => path,
        None => cfg.output_path(timestamp::now_naive()),
    };

    let file_writer = FileWriter::new(&output_path)
        .with_context(|| format!("Failed to create output file {}", output_path.display()))?;
    let writer = Arc::new(MultiWriter::new(
        file_writer,
        Some(Box::new(std::io::stdout())),
    ));

    let plugin_runner = Arc::new(PluginRunner::new(
        cfg.metadata.plugins.clone(),
        writer.clone(),
        cfg.debug,
    ));

    if plugin_runner.has_trigger(Trigger::OnStart) {
        debug!("executing on_start plugins");
        let ctx = ExecutionContext {
            output_file: output_path.clone(),
            ..Default::default()
        };
        plugin_runner.execute(Trigger::OnStart, &ctx).await;
    }

    let post = Arc::new(StdMutex::new(PostProcessor::new(ProcessorOptions {
        pause_threshold: Duration::from_secs_f64(cfg.pause_threshold),
        ..Default::default()
    })));

    let mut capture = AudioCapture::new(cfg.device_index, cfg.gain);

    eprintln!("Connecting to {}...", cfg.server_url);
    let client = Arc::new(
        SttClient::connect(&cfg.server_url, &cfg.api_key)
            .await
            .context("Failed to connect to server")?,
    );
    tracker.set_connected(true, &cfg.server_url);

    eprintln!("Connected. Transcribing to: {}", output_path.display());
    eprintln!("Press Ctrl+Z to pause/resume, Ctrl+\\ for diagnostics, Ctrl+C to stop.\n");

    if cfg.metadata.heartbeat_interval > 0 {
        let interval = Duration::from_secs(cfg.metadata.heartbeat_interval);
        tokio::spawn(run_heartbeat(
            writer.clone() as Arc<dyn MetadataWriter>,
            interval,
            shutdown.child_token(),
        ));
    }

    if plugin_runner.has_trigger(Trigger::Periodic) {
        debug!("starting periodic plugins");
        plugin_runner.clone().start_periodic(ExecutionContext {
            output_file: output_path.clone(),
            ..Default::default()
        });
    }

    if cfg.metadata.zoom_detection || cfg.metadata.meet_detection {
        spawn_meeting_detection(
            &cfg,
            output_path.clone(),
            writer.clone(),
            plugin_runner.clone(),
            shutdown.child_token(),
        );
    }

    capture
        .start()
        .context("Failed to initialize audio capture")?;
    let frames: Frames = Arc::new(TokioMutex::new(capture.take_frames()?));

    let paused = Arc::new(AtomicBool::new(false));
    let reconnecting = Arc::new(AtomicBool::new(false));

    spawn_pause_signal(paused.clone(), tracker.clone(), shutdown.child_token())?;
    spawn_diagnostic_signal(tracker.clone(), shutdown.child_token())?;

    let (dead_air_tx, mut dead_air_rx) = mpsc::channel::<()>(1);
    if cfg.dead_air_reset > 0.0 {
        spawn_dead_air_watchdog(
            Duration::from_secs_f64(cfg.dead_air_reset),
            tracker.clone(),
            paused.clone(),
            reconnecting.clone(),
            dead_air_tx,
            shutdown.child_token(),
        );
    }

    let workers = WorkerContext {
        client: client.clone(),
        frames,
        post,
        writer: writer.clone(),
        tracker: tracker.clone(),
        paused,
        reconnecting: reconnecting.clone(),
        debug: cfg.debug,
    };

    let (mut worker_done, mut worker_err_rx) = start_workers(&workers);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                eprintln!("\nStopping...");
                break;
            }
            Some(()) = dead_air_rx.recv() => {
                match reconnect_session(
                    "[WARN] Dead air detected; reconnecting...",
                    &cfg,
                    &workers,
                    &shutdown,
                    &worker_done,
                )
                .await
                {
                    Some(next) => (worker_done, worker_err_rx) = next,
                    None => break,
                }
            }
            Some(err) = worker_err_rx.recv() => {
                match reconnect_session(
                    &format!("Connection error: {err}"),
                    &cfg,
                    &workers,
                    &shutdown,
                    &worker_done,
                )
                .await
                {
                    Some(next) => (worker_done, worker_err_rx) = next,
                    None => break,
                }
            }
        }
    }

    // Clean shutdown: sidecars observe the token; release everything else.
    shutdown.cancel();
    plugin_runner.stop_periodic();
    worker_done.cancel();
    capture.close();
    if let Err(e) = client.close().await {
        warn!(error = %e, "failed to close connection");
    }

    if let Err(e) = writer.write("\n") {
        warn!(error = %e, "failed to write final newline");
    }
    if let Err(e) = writer.flush() {
        warn!(error = %e, "failed to flush output");
    }

    eprintln!("Transcript saved to: {}", output_path.display());
    Ok(())
}

/// Everything the send/recv worker pair needs; survives reconnects.
struct WorkerContext {
    client: Arc<SttClient>,
    frames: Frames,
    post: Arc<StdMutex<PostProcessor>>,
    writer: Arc<MultiWriter>,
    tracker: Arc<Tracker>,
    paused: Arc<AtomicBool>,
    reconnecting: Arc<AtomicBool>,
    debug: bool,
}

fn start_workers(ctx: &WorkerContext) -> (CancellationToken, mpsc::Receiver<anyhow::Error>) {
    let done = CancellationToken::new();
    let (err_tx, err_rx) = mpsc::channel::<anyhow::Error>(2);

    // Send loop: frames off the audio queue onto the wire.
    {
        let done = done.clone();
        let err_tx = err_tx.clone();
        let client = ctx.client.clone();
        let frames = ctx.frames.clone();
        let tracker = ctx.tracker.clone();
        let paused = ctx.paused.clone();
        let reconnecting = ctx.reconnecting.clone();
        tokio::spawn(async move {
            let mut frames = frames.lock().await;
            loop {
                tokio::select! {
                    _ = done.cancelled() => return,
                    frame = frames.recv() => {
                        let Some(frame) = frame else { return };
                        tracker.record_audio_level(audio::rms(&frame));

                        if paused.load(Ordering::SeqCst) || reconnecting.load(Ordering::SeqCst) {
                            tracker.record_chunk_dropped();
                            continue;
                        }

                        if let Err(e) = client.send_audio(&frame).await {
                            tracker.record_send_error(&e.to_string());
                            if !client.is_closed() {
                                let _ = err_tx.try_send(anyhow!("send error: {e}"));
                            }
                            return;
                        }
                        tracker.record_chunk_sent();
                    }
                }
            }
        });
    }

    // Recv loop: server events into the transcript.
    {
        let done = done.clone();
        let client = ctx.client.clone();
        let post = ctx.post.clone();
        let writer = ctx.writer.clone();
        let tracker = ctx.tracker.clone();
        let debug = ctx.debug;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = done.cancelled() => return,
                    msg = client.receive() => {
                        match msg {
                            Ok(event) => handle_event(event, &post, &writer, &tracker, debug),
                            Err(e) => {
                                tracker.record_recv_error(&e.to_string());
                                if !client.is_closed() {
                                    let _ = err_tx.try_send(anyhow!("receive error: {e}"));
                                }
                                return;
                            }
                        }
                    }
                }
            }
        });
    }

    (done, err_rx)
}

/// Dispatch one decoded server event.
pub(crate) fn handle_event(
    event: InboundEvent,
    post: &StdMutex<PostProcessor>,
    writer: &MultiWriter,
    tracker: &Tracker,
    debug: bool,
) {
    match event {
        InboundEvent::Word { text } => {
            let output = post.lock().expect("processor lock poisoned").process_word(&text);
            tracker.record_word(&text, !output.is_empty());
            if !output.is_empty() {
                if let Err(e) = writer.write(&output) {
                    warn!(error = %e, "failed to write transcript output");
                }
            }
        }
        InboundEvent::Step { prs } => {
            let end_of_turn = prs.is_end_of_turn();
            tracker.record_step(end_of_turn);
            if end_of_turn {
                if debug {
                    debug!("end of turn detected");
                }
                let output = post
                    .lock()
                    .expect("processor lock poisoned")
                    .process_end_of_turn();
                if !output.is_empty() {
                    if let Err(e) = writer.write(&output) {
                        warn!(error = %e, "failed to write transcript output");
                    }
                }
            }
        }
        InboundEvent::EndWord { .. } => tracker.record_end_word(),
        InboundEvent::Ready => {
            tracker.record_ready();
            if debug {
                debug!("server ready");
            }
        }
        InboundEvent::Error { message } => {
            tracker.record_server_error(&message);
            eprintln!("[SERVER ERROR] {message}");
        }
        InboundEvent::Marker { .. } => tracker.record_marker(),
        InboundEvent::Unknown { msg_type, .. } => tracker.record_unknown(&msg_type),
    }
}

/// Recycle the connection after a worker error or dead air. Returns the new
/// worker generation, or `None` when the session is shutting down.
async fn reconnect_session(
    reason: &str,
    cfg: &Config,
    workers: &WorkerContext,
    shutdown: &CancellationToken,
    worker_done: &CancellationToken,
) -> Option<(CancellationToken, mpsc::Receiver<anyhow::Error>)> {
    eprintln!("\n{reason}");

    workers.reconnecting.store(true, Ordering::SeqCst);
    workers.tracker.set_reconnecting(true);
    workers.tracker.set_connected(false, &cfg.server_url);

    worker_done.cancel();

    eprintln!("Attempting to reconnect...");
    let result = workers
        .client
        .reconnect(shutdown, |attempt, delay| {
            eprintln!("  Reconnection attempt {attempt} (waiting {delay:?})...");
        })
        .await;

    if let Err(e) = result {
        if !shutdown.is_cancelled() {
            eprintln!("Reconnection failed: {e}");
        }
        return None;
    }

    eprintln!("Reconnected successfully.");
    workers.tracker.set_connected(true, &cfg.server_url);
    workers.tracker.reset_dead_air_tracking();

    workers.reconnecting.store(false, Ordering::SeqCst);
    workers.tracker.set_reconnecting(false);

    Some(start_workers(workers))
}

/// Write `%% time:` lines: one immediately, then on every tick.
pub(crate) async fn run_heartbeat(
    writer: Arc<dyn MetadataWriter>,
    interval: Duration,
    cancel: CancellationToken,
) {
    write_heartbeat(writer.as_ref());

    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => write_heartbeat(writer.as_ref()),
        }
    }
}

fn write_heartbeat(writer: &dyn MetadataWriter) {
    let line = format!("%% time: {}\n", timestamp::now_stamp());
    if let Err(e) = writer.write_metadata(&line) {
        warn!(error = %e, "failed to write heartbeat metadata");
    }
}

fn spawn_meeting_detection(
    cfg: &Config,
    output_path: PathBuf,
    writer: Arc<MultiWriter>,
    plugin_runner: Arc<PluginRunner>,
    cancel: CancellationToken,
) {
    let (events_tx, mut events_rx) = mpsc::channel::<MeetingEvent>(8);

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = MeetingDetector::new(events_tx).run(cancel).await {
                debug!(error = %e, "meeting detection error");
            }
        });
    }

    let zoom_enabled = cfg.metadata.zoom_detection;
    let meet_enabled = cfg.metadata.meet_detection;
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                event = events_rx.recv() => {
                    let Some(event) = event else { return };
                    handle_meeting_event(
                        event,
                        zoom_enabled,
                        meet_enabled,
                        &output_path,
                        writer.as_ref(),
                        &plugin_runner,
                    );
                }
            }
        }
    });
}

fn handle_meeting_event(
    event: MeetingEvent,
    zoom_enabled: bool,
    meet_enabled: bool,
    output_path: &std::path::Path,
    writer: &MultiWriter,
    plugin_runner: &Arc<PluginRunner>,
) {
    let enabled = |kind: MeetingKind| match kind {
        MeetingKind::Zoom => zoom_enabled,
        MeetingKind::Meet => meet_enabled,
    };

    match event {
        MeetingEvent::Started(info) => {
            if enabled(info.kind) {
                let ts = timestamp::now_stamp();
                let line = match info.kind {
                    MeetingKind::Zoom => format!("%% meeting started: {ts} zoom\n"),
                    MeetingKind::Meet => {
                        if !info.title.is_empty() {
                            format!(
                                "%% meeting started: {ts} meet/{}\n%% meeting title: {}\n",
                                info.code, info.title
                            )
                        } else if !info.code.is_empty() {
                            format!("%% meeting started: {ts} meet/{}\n", info.code)
                        } else {
                            format!("%% meeting started: {ts} meet\n")
                        }
                    }
                };
                if let Err(e) = writer.write_metadata(&line) {
                    warn!(error = %e, "failed to write meeting start metadata");
                }
            }

            if plugin_runner.has_trigger(Trigger::OnMeetingStart) {
                let runner = plugin_runner.clone();
                let ctx = ExecutionContext {
                    output_file: output_path.to_path_buf(),
                    meeting_kind: Some(info.kind),
                    meeting_code: info.code,
                    meeting_title: info.title,
                    meeting_duration: None,
                };
                tokio::spawn(async move {
                    runner.execute(Trigger::OnMeetingStart, &ctx).await;
                });
            }
        }
        MeetingEvent::Ended { kind, duration } => {
            if enabled(kind) {
                let ts = timestamp::now_stamp();
                let mins = meetings::round_to_minutes(duration);
                let line = format!("%% meeting ended: {ts} {kind} (duration: {mins}m)\n");
                if let Err(e) = writer.write_metadata(&line) {
                    warn!(error = %e, "failed to write meeting end metadata");
                }
            }

            if plugin_runner.has_trigger(Trigger::OnMeetingEnd) {
                let runner = plugin_runner.clone();
                let ctx = ExecutionContext {
                    output_file: output_path.to_path_buf(),
                    meeting_kind: Some(kind),
                    meeting_code: String::new(),
                    meeting_title: String::new(),
                    meeting_duration: Some(duration),
                };
                tokio::spawn(async move {
                    runner.execute(Trigger::OnMeetingEnd, &ctx).await;
                });
            }
        }
    }
}

fn spawn_dead_air_watchdog(
    threshold: Duration,
    tracker: Arc<Tracker>,
    paused: Arc<AtomicBool>,
    reconnecting: Arc<AtomicBool>,
    dead_air_tx: mpsc::Sender<()>,
    cancel: CancellationToken,
) {
    let interval = (threshold / 2)
        .min(Duration::from_secs(1))
        .max(Duration::from_millis(100));

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    if paused.load(Ordering::SeqCst) || reconnecting.load(Ordering::SeqCst) {
                        continue;
                    }
                    if tracker.is_dead_air(threshold) {
                        // 1-slot channel coalesces repeated detections.
                        let _ = dead_air_tx.try_send(());
                    }
                }
            }
        }
    });
}

fn spawn_shutdown_signals(shutdown: CancellationToken) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt =
        signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let mut terminate =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

    tokio::spawn(async move {
        tokio::select! {
            _ = interrupt.recv() => {}
            _ = terminate.recv() => {}
        }
        shutdown.cancel();
    });

    Ok(())
}

fn spawn_pause_signal(
    paused: Arc<AtomicBool>,
    tracker: Arc<Tracker>,
    cancel: CancellationToken,
) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut tstp = signal(SignalKind::from_raw(libc::SIGTSTP))
        .context("Failed to install SIGTSTP handler")?;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tstp.recv() => {
                    let now_paused = !paused.load(Ordering::SeqCst);
                    paused.store(now_paused, Ordering::SeqCst);
                    tracker.set_paused(now_paused);
                    if now_paused {
                        eprintln!("\n[PAUSED] Press Ctrl+Z to resume");
                    } else {
                        eprintln!("[RESUMED]");
                    }
                }
            }
        }
    });

    Ok(())
}

fn spawn_diagnostic_signal(tracker: Arc<Tracker>, cancel: CancellationToken) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut quit = signal(SignalKind::quit()).context("Failed to install SIGQUIT handler")?;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = quit.recv() => {
                    match tracker.dump_to_file(DIAGNOSTIC_PATH) {
                        Ok(()) => eprintln!("\n[DIAG] Diagnostic info written to {DIAGNOSTIC_PATH}"),
                        Err(e) => eprintln!("\n[DIAG] Failed to write diagnostics: {e}"),
                    }
                }
            }
        }
    });

    Ok(())
}

#[cfg(test)]
#[path = "record_test.rs"]
mod tests;
