/* -------------------------------------------------------------------------- *\
 *                |   █████╗ ██╗   ██╗██████╗  █████╗ ███████╗ |              *
 *                |  ██╔══██╗██║   ██║██╔══██╗██╔══██╗██╔════╝ |              *
 *                |  ███████║██║   ██║██████╔╝███████║█████╗   |              *
 *                |  ██╔══██║██║   ██║██╔══██╗██╔══██║██╔══╝   |              *
 *                |  ██║  ██║╚██████╔╝██║  ██║██║  ██║███████╗ |              *
 *                |  ╚═╝  ╚═╝ ╚═════╝ ╚═╝  ╚═╝╚═╝  ╚═╝╚══════╝ |              *
 *                +--------------------------------------------+              *
 *                                                                            *
 *                         Distributed Systems Runtime                        *
 * -------------------------------------------------------------------------- *
 * Copyright 2022 - 2024, the aurae contributors                              *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! Exec sessions.

use super::StreamError;
use crate::container::ContainerIo;
use crate::engine::{Engine, ExecSpec};
use nix::sys::signal::Signal;
use std::path::Path;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::unix::pipe;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Exit code reported when the process was terminated by the timeout
/// path with no observed code.
pub const UNKNOWN_EXIT_CODE: i32 = 255;

/// How long output copiers get to drain after the process exits.
const IO_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Client streams for an exec session.
pub struct ExecIo {
    pub stdin: Option<Box<dyn AsyncRead + Send + Unpin>>,
    pub stdout: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    pub stderr: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    /// Terminal size updates `(height, width)`; zero-sized updates are
    /// ignored.
    pub resize: Option<mpsc::Receiver<(u16, u16)>>,
}

impl std::fmt::Debug for ExecIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecIo").finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecParams {
    pub cmd: Vec<String>,
    pub terminal: bool,
    /// Zero waits indefinitely.
    pub timeout: Duration,
}

/// Runs a process inside the container and waits for its exit code.
///
/// A positive timeout cancels the exec with SIGKILL and reports
/// [`StreamError::ExecTimeout`].
pub async fn exec_in_container(
    engine: Arc<dyn Engine>,
    container_state_dir: &Path,
    container_id: &str,
    params: ExecParams,
    io: ExecIo,
) -> Result<i32, StreamError> {
    let exec_id = Uuid::new_v4().simple().to_string();
    let io_dir = container_state_dir.join("exec").join(&exec_id);
    let fifos =
        ContainerIo::new(&io_dir, params.terminal, io.stdin.is_some())?;

    let spec = ExecSpec {
        cmd: params.cmd.clone(),
        env: vec![],
        working_dir: String::new(),
        terminal: params.terminal,
    };
    engine
        .create_exec(container_id, &exec_id, spec, fifos.task_io())
        .await?;

    let (copiers, keepalive) =
        wire_streams(&fifos, io.stdin, io.stdout, io.stderr)?;

    let waiter = engine.wait_exec(container_id, &exec_id).await?;
    let _status = engine.start_exec(container_id, &exec_id).await?;

    if let Some(mut resize) = io.resize {
        let engine = engine.clone();
        let container_id = container_id.to_string();
        let exec_id_for_resize = exec_id.clone();
        let _ = tokio::spawn(async move {
            while let Some((height, width)) = resize.recv().await {
                if height == 0 && width == 0 {
                    continue;
                }
                if let Err(e) = engine
                    .resize_task_pty(
                        &container_id,
                        Some(&exec_id_for_resize),
                        width,
                        height,
                    )
                    .await
                {
                    warn!("exec resize failed: {e}");
                }
            }
        });
    }

    let exit_code = if params.timeout.is_zero() {
        match waiter.await {
            Ok(exit) => exit.exit_code,
            Err(_) => UNKNOWN_EXIT_CODE,
        }
    } else {
        tokio::select! {
            observed = waiter => match observed {
                Ok(exit) => exit.exit_code,
                Err(_) => UNKNOWN_EXIT_CODE,
            },
            _ = tokio::time::sleep(params.timeout) => {
                debug!("exec {exec_id} in {container_id} timed out, killing");
                match engine
                    .kill_exec(container_id, &exec_id, Signal::SIGKILL)
                    .await
                {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => warn!("failed to kill timed out exec: {e}"),
                }
                drop(keepalive);
                cleanup(&engine, container_id, &exec_id, &io_dir).await;
                return Err(StreamError::ExecTimeout(params.timeout));
            }
        }
    };

    // Let the output copiers observe end of stream and drain.
    drop(keepalive);
    for copier in copiers {
        let _ = tokio::time::timeout(IO_DRAIN_TIMEOUT, copier).await;
    }

    cleanup(&engine, container_id, &exec_id, &io_dir).await;
    Ok(exit_code)
}

/// Synchronous exec: captures stdout/stderr into buffers.
pub async fn exec_sync(
    engine: Arc<dyn Engine>,
    container_state_dir: &Path,
    container_id: &str,
    cmd: Vec<String>,
    timeout: Duration,
) -> Result<(i32, Vec<u8>, Vec<u8>), StreamError> {
    let stdout = BufSink::new();
    let stderr = BufSink::new();
    let io = ExecIo {
        stdin: None,
        stdout: Some(Box::new(stdout.clone())),
        stderr: Some(Box::new(stderr.clone())),
        resize: None,
    };
    let params = ExecParams { cmd, terminal: false, timeout };
    let exit_code =
        exec_in_container(engine, container_state_dir, container_id, params, io)
            .await?;
    Ok((exit_code, stdout.take(), stderr.take()))
}

/// Wires the client streams to the exec FIFOs. Returns the output
/// copier tasks and the write-end keepalives that pin the FIFOs open
/// until the session drops them.
#[allow(clippy::type_complexity)]
fn wire_streams(
    fifos: &ContainerIo,
    stdin: Option<Box<dyn AsyncRead + Send + Unpin>>,
    stdout: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    stderr: Option<Box<dyn AsyncWrite + Send + Unpin>>,
) -> Result<(Vec<tokio::task::JoinHandle<()>>, Vec<pipe::Sender>), StreamError>
{
    let task_io = fifos.task_io();
    let mut copiers = vec![];
    let mut keepalive = vec![];

    if let (Some(mut reader), Some(path)) = (stdin, task_io.stdin.clone()) {
        let _ = tokio::spawn(async move {
            // The engine opens the read end when the process starts.
            let mut writer = match open_sender_with_retry(&path).await {
                Ok(writer) => writer,
                Err(e) => {
                    warn!("failed to open exec stdin: {e}");
                    return;
                }
            };
            let _ = tokio::io::copy(&mut reader, &mut writer).await;
            let _ = writer.shutdown().await;
        });
    }

    if let (Some(mut writer), Some(path)) = (stdout, task_io.stdout.clone()) {
        let mut reader = pipe::OpenOptions::new().open_receiver(&path)?;
        keepalive.push(pipe::OpenOptions::new().open_sender(&path)?);
        copiers.push(tokio::spawn(async move {
            let _ = tokio::io::copy(&mut reader, &mut writer).await;
            let _ = writer.shutdown().await;
        }));
    }

    if let (Some(mut writer), Some(path)) = (stderr, task_io.stderr.clone()) {
        let mut reader = pipe::OpenOptions::new().open_receiver(&path)?;
        keepalive.push(pipe::OpenOptions::new().open_sender(&path)?);
        copiers.push(tokio::spawn(async move {
            let _ = tokio::io::copy(&mut reader, &mut writer).await;
            let _ = writer.shutdown().await;
        }));
    }

    Ok((copiers, keepalive))
}

async fn open_sender_with_retry(
    path: &Path,
) -> std::io::Result<pipe::Sender> {
    // ENXIO until the engine opens the read end.
    for _ in 0..50 {
        match pipe::OpenOptions::new().open_sender(path) {
            Ok(sender) => return Ok(sender),
            Err(e) if e.raw_os_error() == Some(libc::ENXIO) => {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            Err(e) => return Err(e),
        }
    }
    pipe::OpenOptions::new().open_sender(path)
}

async fn cleanup(
    engine: &Arc<dyn Engine>,
    container_id: &str,
    exec_id: &str,
    io_dir: &Path,
) {
    if let Err(e) = engine.delete_exec(container_id, exec_id).await {
        debug!("exec delete: {e}");
    }
    if let Err(e) = crate::fsutil::remove_all_with_retry(io_dir).await {
        warn!("failed to remove exec io dir: {e}");
    }
}

/// An `AsyncWrite` that appends into a shared buffer; the capture sink
/// for ExecSync.
#[derive(Debug, Clone, Default)]
pub(crate) struct BufSink {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl BufSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<u8> {
        std::mem::take(&mut self.buf.lock().expect("buf sink lock"))
    }
}

impl AsyncWrite for BufSink {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        self.buf.lock().expect("buf sink lock").extend_from_slice(data);
        Poll::Ready(Ok(data.len()))
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        Poll::Ready(Ok(()))
    }
}
