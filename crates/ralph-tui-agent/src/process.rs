//! Process-backed agent adapter.
//!
//! Spawns the configured CLI in its own process group, forwards its
//! stdout/stderr as [`AgentEvent`]s and delivers interrupts as a
//! SIGINT to the group so the whole agent tree winds down.

use std::process::Stdio;

use async_trait::async_trait;
use command_group::{AsyncCommandGroup, AsyncGroupChild};
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{ChildStderr, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};

use ralph_tui_core::{
    AgentAdapter, AgentEnd, AgentError, AgentEvent, AgentHandle, ExecuteRequest,
};

use crate::command::CommandBuilder;
use crate::jsonl::extract_text;

/// Buffer size for the agent event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Agent adapter that runs an external CLI process per iteration.
#[derive(Debug, Clone)]
pub struct ProcessAgent {
    id: String,
    builder: CommandBuilder,
    prompt_flag: Option<String>,
    model_flag: Option<String>,
}

impl ProcessAgent {
    /// Create an adapter around an arbitrary CLI.
    ///
    /// The prompt is appended as the final positional argument unless a
    /// prompt flag is configured.
    #[must_use]
    pub fn new(id: impl Into<String>, builder: CommandBuilder) -> Self {
        Self {
            id: id.into(),
            builder,
            prompt_flag: None,
            model_flag: None,
        }
    }

    /// Adapter for Claude Code in print/stream-json mode.
    #[must_use]
    pub fn claude() -> Self {
        Self::new(
            "claude",
            CommandBuilder::new("claude").params([
                "--print",
                "--output-format",
                "stream-json",
                "--verbose",
            ]),
        )
        .with_prompt_flag("-p")
        .with_model_flag("--model")
    }

    /// Pass the prompt behind a flag instead of positionally.
    #[must_use]
    pub fn with_prompt_flag(mut self, flag: impl Into<String>) -> Self {
        self.prompt_flag = Some(flag.into());
        self
    }

    /// Flag used to forward a model override.
    #[must_use]
    pub fn with_model_flag(mut self, flag: impl Into<String>) -> Self {
        self.model_flag = Some(flag.into());
        self
    }

    fn invocation_args(&self, request: &ExecuteRequest) -> Vec<String> {
        let mut args = Vec::new();
        if let (Some(flag), Some(model)) = (&self.model_flag, &request.model) {
            args.push(flag.clone());
            args.push(model.clone());
        }
        if let Some(flag) = &self.prompt_flag {
            args.push(flag.clone());
        }
        args.push(request.prompt.clone());
        args
    }
}

#[async_trait]
impl AgentAdapter for ProcessAgent {
    fn id(&self) -> &str {
        &self.id
    }

    async fn execute(&self, request: ExecuteRequest) -> Result<AgentHandle, AgentError> {
        let parts = self.builder.build(&self.invocation_args(&request))?;
        let (program, args) = parts.into_resolved().await?;

        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .current_dir(&request.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .group_spawn()
            .map_err(|e| AgentError::SpawnFailed(format!("{}: {e}", program.display())))?;

        let stdout = child
            .inner()
            .stdout
            .take()
            .ok_or_else(|| AgentError::SpawnFailed("stdout not captured".to_string()))?;
        let stderr = child
            .inner()
            .stderr
            .take()
            .ok_or_else(|| AgentError::SpawnFailed("stderr not captured".to_string()))?;

        tracing::debug!(
            agent = %self.id,
            iteration = request.iteration,
            task = %request.task.id,
            program = %program.display(),
            "spawned agent process"
        );

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (interrupt_tx, interrupt_rx) = oneshot::channel();
        tokio::spawn(run_agent(child, stdout, stderr, events_tx, interrupt_rx));

        Ok(AgentHandle::new(events_rx, interrupt_tx))
    }
}

/// Reader loop: forward output lines until both streams close, honor
/// interrupts, then reap the child and emit the terminal event.
async fn run_agent(
    mut child: AsyncGroupChild,
    stdout: ChildStdout,
    stderr: ChildStderr,
    events_tx: mpsc::Sender<AgentEvent>,
    interrupt_rx: oneshot::Receiver<()>,
) {
    let mut stdout_lines = BufReader::new(stdout).lines();
    let mut stderr_lines = BufReader::new(stderr).lines();
    let mut stdout_open = true;
    let mut stderr_open = true;
    let mut interrupt_armed = true;
    let mut interrupted = false;
    let mut interrupt_rx = interrupt_rx;

    while stdout_open || stderr_open {
        tokio::select! {
            line = next_line(&mut stdout_lines), if stdout_open => match line {
                Some(line) => forward_stdout(&events_tx, line).await,
                None => stdout_open = false,
            },
            line = next_line(&mut stderr_lines), if stderr_open => match line {
                Some(line) => {
                    let _ = events_tx.send(AgentEvent::Stderr(line + "\n")).await;
                }
                None => stderr_open = false,
            },
            res = &mut interrupt_rx, if interrupt_armed => {
                interrupt_armed = false;
                if res.is_ok() {
                    interrupted = true;
                    signal_interrupt(&mut child).await;
                }
            }
        }
    }

    let exit_code = match child.wait().await {
        Ok(status) => status.code(),
        Err(e) => {
            tracing::error!("failed to reap agent process: {e}");
            None
        }
    };

    let _ = events_tx
        .send(AgentEvent::End(AgentEnd {
            exit_code,
            interrupted,
        }))
        .await;
}

async fn next_line<R>(lines: &mut Lines<BufReader<R>>) -> Option<String>
where
    R: tokio::io::AsyncRead + Unpin,
{
    match lines.next_line().await {
        Ok(line) => line,
        Err(e) => {
            tracing::debug!("agent stream read error: {e}");
            None
        }
    }
}

async fn forward_stdout(events_tx: &mpsc::Sender<AgentEvent>, line: String) {
    let trimmed = line.trim_start();
    if trimmed.starts_with('{') {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
            if value.is_object() {
                if let Some(text) = extract_text(&value) {
                    let _ = events_tx.send(AgentEvent::Stdout(text + "\n")).await;
                }
                let _ = events_tx.send(AgentEvent::Jsonl(value)).await;
                return;
            }
        }
    }
    let _ = events_tx.send(AgentEvent::Stdout(line + "\n")).await;
}

async fn signal_interrupt(child: &mut AsyncGroupChild) {
    #[cfg(unix)]
    {
        use command_group::{Signal, UnixChildExt};
        if let Err(e) = child.signal(Signal::SIGINT) {
            tracing::warn!("failed to signal agent process group: {e}");
            let _ = child.kill().await;
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.kill().await;
    }
}
