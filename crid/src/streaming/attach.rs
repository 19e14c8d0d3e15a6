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

//! Attach sessions.
//!
//! Attach reuses the container's existing IO: output comes from the log
//! pump's fan-out, input goes into the stdin FIFO. Closing the attach
//! stream never terminates the container.

use super::StreamError;
use crate::container::Container;
use crate::engine::Engine;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::warn;

/// Client streams and options for an attach session.
pub struct AttachIo {
    pub stdin: Option<Box<dyn AsyncRead + Send + Unpin>>,
    pub stdout: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    pub stderr: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    pub resize: Option<mpsc::Receiver<(u16, u16)>>,
    /// Close the container's stdin once the client stream ends.
    pub stdin_once: bool,
}

impl std::fmt::Debug for AttachIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachIo").finish_non_exhaustive()
    }
}

/// Runs an attach session until the client streams close or the
/// container's output ends.
pub async fn attach_container(
    engine: Arc<dyn Engine>,
    container: &Container,
    io: AttachIo,
) -> Result<(), StreamError> {
    let container_io = container.io.clone().ok_or_else(|| {
        StreamError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "container has no io",
        ))
    })?;

    let mut session = vec![];

    if let Some(mut writer) = io.stdout {
        let mut rx = container_io.subscribe_stdout();
        session.push(tokio::spawn(async move {
            while let Ok(chunk) = rx.recv().await {
                // Empty chunk is the pump's end-of-stream marker.
                if chunk.is_empty()
                    || writer.write_all(&chunk).await.is_err()
                {
                    break;
                }
            }
            let _ = writer.shutdown().await;
        }));
    }

    if let Some(mut writer) = io.stderr {
        let mut rx = container_io.subscribe_stderr();
        session.push(tokio::spawn(async move {
            while let Ok(chunk) = rx.recv().await {
                if chunk.is_empty()
                    || writer.write_all(&chunk).await.is_err()
                {
                    break;
                }
            }
            let _ = writer.shutdown().await;
        }));
    }

    let stdin_task = io.stdin.map(|mut reader| {
        let stdin_once = io.stdin_once;
        let container_io = container_io.clone();
        tokio::spawn(async move {
            let mut writer = match container_io.open_stdin() {
                Ok(writer) => writer,
                Err(e) => {
                    warn!("attach could not open stdin: {e}");
                    return;
                }
            };
            let _ = tokio::io::copy(&mut reader, &mut writer).await;
            if stdin_once {
                let _ = writer.shutdown().await;
            }
        })
    });

    if let Some(mut resize) = io.resize {
        let engine = engine.clone();
        let container_id = container.id().to_string();
        let _ = tokio::spawn(async move {
            while let Some((height, width)) = resize.recv().await {
                if height == 0 && width == 0 {
                    continue;
                }
                if let Err(e) = engine
                    .resize_task_pty(&container_id, None, width, height)
                    .await
                {
                    warn!("attach resize failed: {e}");
                }
            }
        });
    }

    if session.is_empty() {
        // Input-only attach: the session lives as long as stdin does.
        if let Some(task) = stdin_task {
            let _ = task.await;
        }
        return Ok(());
    }

    for task in session {
        let _ = task.await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::container::testing::test_metadata;
    use crate::container::{ContainerIo, ContainerStatus};
    use crate::engine::fake::FakeEngine;
    use crate::streaming::exec::BufSink;
    use chrono::Utc;
    use std::time::Duration;
    use tokio::net::unix::pipe;

    #[tokio::test]
    async fn test_attach_mirrors_fanout_and_is_non_disruptive() {
        let dir = tempfile::tempdir().expect("tempdir");
        let io = Arc::new(
            ContainerIo::new(&dir.path().join("io"), false, false)
                .expect("io"),
        );
        let log = Arc::new(
            crate::container::crilog::LogFile::open(&dir.path().join("0.log"))
                .await
                .expect("log"),
        );
        io.start_log_pump(log).expect("pump");

        let container = Container::new(
            test_metadata("c1", "app_pod_default_u_0", "s1"),
            ContainerStatus::new(Utc::now()),
            Some(io.clone()),
        );

        let stdout = BufSink::new();
        let engine: Arc<dyn Engine> = Arc::new(FakeEngine::new());
        let session = {
            let container = container.clone();
            let stdout = stdout.clone();
            tokio::spawn(async move {
                attach_container(
                    engine,
                    &container,
                    AttachIo {
                        stdin: None,
                        stdout: Some(Box::new(stdout)),
                        stderr: None,
                        resize: None,
                        stdin_once: false,
                    },
                )
                .await
            })
        };

        // Simulate container output through the engine side of the FIFO.
        let mut writer = pipe::OpenOptions::new()
            .open_sender(io.task_io().stdout.expect("stdout"))
            .expect("sender");
        tokio::io::AsyncWriteExt::write_all(&mut writer, b"streamed\n")
            .await
            .expect("write");
        drop(writer);
        // Releasing the held write end lets the pump drain to EOF.
        io.close();

        // The attach session ends when the fan-out closes with the pump.
        let result = tokio::time::timeout(Duration::from_secs(5), session)
            .await
            .expect("session ends")
            .expect("join");
        assert!(result.is_ok());
        assert_eq!(stdout.take(), b"streamed\n".to_vec());
    }
}
