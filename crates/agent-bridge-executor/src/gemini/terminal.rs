//! Terminals the agent runs through `terminal/*` reverse requests.

use std::{
    collections::HashMap,
    path::Path,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use serde_json::{Value, json};
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    sync::watch,
};

use super::acp::{CreateTerminalParams, ReplyError, resolve_path};
use crate::process::{self, ExitInfo, ProcessHandle};

#[derive(Debug, Default)]
struct OutputBuffer {
    text: String,
    limit: Option<usize>,
    truncated: bool,
}

impl OutputBuffer {
    /// Append, dropping the oldest output once past the byte limit.
    fn push(&mut self, chunk: &str) {
        self.text.push_str(chunk);
        let Some(limit) = self.limit else {
            return;
        };
        if self.text.len() <= limit {
            return;
        }
        let mut cut = self.text.len() - limit;
        while !self.text.is_char_boundary(cut) {
            cut += 1;
        }
        self.text.drain(..cut);
        self.truncated = true;
    }
}

struct Terminal {
    output: Arc<Mutex<OutputBuffer>>,
    exit: watch::Receiver<Option<ExitInfo>>,
    handle: ProcessHandle,
}

fn exit_status(exit: &ExitInfo) -> Value {
    json!({"exitCode": exit.code, "signal": exit.signal})
}

fn lock(output: &Mutex<OutputBuffer>) -> MutexGuard<'_, OutputBuffer> {
    output.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Terminals of one driver span, keyed by the id handed to the agent.
#[derive(Default)]
pub struct TerminalManager {
    next_id: AtomicU64,
    terminals: Mutex<HashMap<String, Arc<Terminal>>>,
}

impl TerminalManager {
    fn table(&self) -> MutexGuard<'_, HashMap<String, Arc<Terminal>>> {
        self.terminals.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn get(&self, terminal_id: &str) -> Result<Arc<Terminal>, ReplyError> {
        self.table()
            .get(terminal_id)
            .cloned()
            .ok_or_else(|| ReplyError::invalid_params(format!("Unknown terminal: {terminal_id}")))
    }

    /// `terminal/create`: start the command and return its id.
    pub fn create(&self, cwd: &Path, p: CreateTerminalParams) -> Result<Value, ReplyError> {
        let cwd = p.cwd.as_deref().map_or_else(|| cwd.to_path_buf(), |dir| resolve_path(cwd, dir));
        let env: Vec<(String, String)> = p.env.into_iter().map(|v| (v.name, v.value)).collect();
        let (exit_tx, exit_rx) = watch::channel(None);

        let spawned = process::spawn_supervised_with_env(
            Path::new(&p.command),
            &p.args,
            &cwd,
            &env,
            move |exit| {
                exit_tx.send_replace(Some(exit));
            },
        )
        .map_err(ReplyError::internal)?;

        let output = Arc::new(Mutex::new(OutputBuffer {
            limit: p.output_byte_limit,
            ..OutputBuffer::default()
        }));
        capture(spawned.stdout, Arc::clone(&output));
        if let Some(stderr) = spawned.stderr {
            capture(stderr, Arc::clone(&output));
        }

        let terminal_id = format!("term-{}", self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        tracing::debug!(%terminal_id, command = %p.command, args = ?p.args, "Terminal created");
        self.table().insert(
            terminal_id.clone(),
            Arc::new(Terminal {
                output,
                exit: exit_rx,
                handle: spawned.handle,
            }),
        );
        Ok(json!({"terminalId": terminal_id}))
    }

    /// `terminal/output`: output so far plus exit status if finished.
    pub fn output(&self, terminal_id: &str) -> Result<Value, ReplyError> {
        let terminal = self.get(terminal_id)?;
        let exit = terminal.exit.borrow().as_ref().map(exit_status);
        let output = lock(&terminal.output);
        Ok(json!({
            "output": output.text,
            "truncated": output.truncated,
            "exitStatus": exit,
        }))
    }

    /// `terminal/wait_for_exit`.
    pub async fn wait_for_exit(&self, terminal_id: &str) -> Result<Value, ReplyError> {
        let mut exit = self.get(terminal_id)?.exit.clone();
        let status = exit
            .wait_for(Option::is_some)
            .await
            .map_err(|_| ReplyError::internal("Terminal supervisor went away"))?;
        Ok(status.as_ref().map_or(Value::Null, exit_status))
    }

    /// `terminal/kill`: stop the command but keep its output readable.
    pub fn kill(&self, terminal_id: &str) -> Result<Value, ReplyError> {
        self.get(terminal_id)?.handle.kill();
        Ok(json!({}))
    }

    /// `terminal/release`: kill and forget.
    pub fn release(&self, terminal_id: &str) -> Result<Value, ReplyError> {
        let terminal = self
            .table()
            .remove(terminal_id)
            .ok_or_else(|| ReplyError::invalid_params(format!("Unknown terminal: {terminal_id}")))?;
        terminal.handle.kill();
        Ok(json!({}))
    }

    pub fn release_all(&self) {
        let terminals: Vec<_> = self.table().drain().collect();
        for (terminal_id, terminal) in terminals {
            tracing::debug!(%terminal_id, "Releasing terminal");
            terminal.handle.kill();
        }
    }
}

fn capture<R>(mut stream: R, output: Arc<Mutex<OutputBuffer>>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; 8192];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => lock(&output).push(&String::from_utf8_lossy(&buf[..n])),
                Err(e) => {
                    tracing::debug!("Terminal output read failed: {e}");
                    break;
                }
            }
        }
    });
}
