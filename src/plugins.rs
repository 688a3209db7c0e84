//! External plugin execution at lifecycle events.
//!
//! Plugins are shell commands whose stdout lines become `%% <name>: ...`
//! metadata. A misbehaving plugin is logged and never aborts the session.

use futures_util::future::join_all;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{PluginConfig, Trigger, DEFAULT_PLUGIN_TIMEOUT_SECS};
use crate::meetings::MeetingKind;
use crate::writer::MetadataWriter;

/// Session context exposed to plugins through environment variables.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    pub output_file: PathBuf,
    pub meeting_kind: Option<MeetingKind>,
    pub meeting_code: String,
    pub meeting_title: String,
    /// Only set for `on_meeting_end`.
    pub meeting_duration: Option<Duration>,
}

/// Executes configured plugins at their lifecycle triggers.
pub struct PluginRunner {
    plugins: Vec<PluginConfig>,
    writer: Arc<dyn MetadataWriter>,
    debug: bool,
    periodic: Mutex<Option<CancellationToken>>,
}

impl PluginRunner {
    pub fn new(plugins: Vec<PluginConfig>, writer: Arc<dyn MetadataWriter>, debug: bool) -> Self {
        Self {
            plugins,
            writer,
            debug,
            periodic: Mutex::new(None),
        }
    }

    /// True when any plugin is attached to `trigger`.
    pub fn has_trigger(&self, trigger: Trigger) -> bool {
        self.plugins.iter().any(|p| p.trigger == trigger)
    }

    /// Run every plugin matching `trigger`, in parallel, waiting for all of
    /// them. Failures are logged per plugin and swallowed.
    pub async fn execute(&self, trigger: Trigger, ctx: &ExecutionContext) {
        join_all(
            self.plugins
                .iter()
                .filter(|p| p.trigger == trigger)
                .map(|plugin| self.execute_plugin(plugin, trigger, ctx)),
        )
        .await;
    }

    /// Start a ticker per periodic plugin. Plugins with a non-positive
    /// interval are skipped with a debug note.
    pub fn start_periodic(self: Arc<Self>, ctx: ExecutionContext) {
        let token = CancellationToken::new();

        for plugin in &self.plugins {
            if plugin.trigger != Trigger::Periodic {
                continue;
            }
            if plugin.interval == 0 {
                if self.debug {
                    debug!(
                        plugin = %plugin.name,
                        "periodic trigger without an interval, skipping"
                    );
                }
                continue;
            }

            let runner = self.clone();
            let plugin = plugin.clone();
            let ctx = ctx.clone();
            let token = token.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(plugin.interval));
                // The first tick of a tokio interval completes immediately;
                // periodic plugins fire after the interval, not at start.
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = ticker.tick() => {
                            runner.execute_plugin(&plugin, Trigger::Periodic, &ctx).await;
                        }
                    }
                }
            });
        }

        *self.periodic.lock().expect("periodic lock poisoned") = Some(token);
    }

    /// Cancel all periodic tickers.
    pub fn stop_periodic(&self) {
        if let Some(token) = self
            .periodic
            .lock()
            .expect("periodic lock poisoned")
            .take()
        {
            token.cancel();
        }
    }

    async fn execute_plugin(&self, plugin: &PluginConfig, trigger: Trigger, ctx: &ExecutionContext) {
        let timeout = if plugin.timeout == 0 {
            Duration::from_secs(DEFAULT_PLUGIN_TIMEOUT_SECS)
        } else {
            Duration::from_secs(plugin.timeout)
        };

        let command = crate::config::expand_path(&plugin.command)
            .to_string_lossy()
            .into_owned();

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&command)
            .envs(build_env(trigger, ctx))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(plugin = %plugin.name, error = %e, "failed to start plugin");
                return;
            }
        };

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                warn!(plugin = %plugin.name, error = %e, "failed to run plugin");
                return;
            }
            Err(_) => {
                // Dropping the timed-out future kills the child.
                warn!(plugin = %plugin.name, timeout = ?timeout, "plugin timed out");
                return;
            }
        };

        let stderr_lines: Vec<&str> = std::str::from_utf8(&output.stderr)
            .unwrap_or_default()
            .lines()
            .collect();

        if !output.status.success() {
            warn!(plugin = %plugin.name, status = %output.status, "plugin exited with error");
            for line in &stderr_lines {
                warn!(plugin = %plugin.name, "stderr: {line}");
            }
            return;
        }

        if self.debug {
            for line in &stderr_lines {
                debug!(plugin = %plugin.name, "stderr: {line}");
            }
        }

        for line in std::str::from_utf8(&output.stdout).unwrap_or_default().lines() {
            if line.trim().is_empty() {
                continue;
            }
            let metadata = format!("%% {}: {}\n", plugin.name, line);
            if let Err(e) = self.writer.write_metadata(&metadata) {
                warn!(plugin = %plugin.name, error = %e, "failed to write plugin metadata");
            }
        }
    }
}

fn build_env(trigger: Trigger, ctx: &ExecutionContext) -> Vec<(String, String)> {
    let mut env = vec![
        ("LOCALSCRIBE_EVENT".to_string(), trigger.to_string()),
        (
            "LOCALSCRIBE_TIMESTAMP".to_string(),
            chrono::Local::now().to_rfc3339(),
        ),
    ];

    if !ctx.output_file.as_os_str().is_empty() {
        env.push((
            "LOCALSCRIBE_OUTPUT_FILE".to_string(),
            ctx.output_file.to_string_lossy().into_owned(),
        ));
    }

    if matches!(trigger, Trigger::OnMeetingStart | Trigger::OnMeetingEnd) {
        if let Some(kind) = ctx.meeting_kind {
            env.push(("LOCALSCRIBE_MEETING_TYPE".to_string(), kind.to_string()));
        }
        if !ctx.meeting_code.is_empty() {
            env.push((
                "LOCALSCRIBE_MEETING_CODE".to_string(),
                ctx.meeting_code.clone(),
            ));
        }
        if !ctx.meeting_title.is_empty() {
            env.push((
                "LOCALSCRIBE_MEETING_TITLE".to_string(),
                ctx.meeting_title.clone(),
            ));
        }
        if trigger == Trigger::OnMeetingEnd {
            if let Some(duration) = ctx.meeting_duration {
                env.push((
                    "LOCALSCRIBE_MEETING_DURATION".to_string(),
                    duration.as_secs().to_string(),
                ));
            }
        }
    }

    env
}

#[cfg(test)]
#[path = "plugins_test.rs"]
mod tests;
