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

//! Container IO plumbing.
//!
//! The engine writes container output into FIFOs under the volatile
//! state directory; crid owns the read ends, frames the bytes into the
//! container log, and fans them out to attach subscribers. Attach never
//! steals the stream from the log.

use super::crilog::{pump_frames, LogFile, LogStream};
use crate::engine::TaskIo;
use bytes::Bytes;
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::net::unix::pipe;
use tokio::sync::broadcast;
use tracing::warn;

const FANOUT_CAPACITY: usize = 128;

/// FIFO endpoints and fan-out channels for one container (or exec).
#[derive(Debug)]
pub struct ContainerIo {
    dir: PathBuf,
    stdin: Option<PathBuf>,
    stdout: PathBuf,
    stderr: Option<PathBuf>,
    terminal: bool,
    stdout_tx: broadcast::Sender<Bytes>,
    stderr_tx: broadcast::Sender<Bytes>,
    log: Mutex<Option<Arc<LogFile>>>,
    /// Write-end handles that keep the FIFOs from reporting end of
    /// stream before the engine attaches; dropped by [`Self::close`].
    keepalive: Mutex<Vec<pipe::Sender>>,
}

impl ContainerIo {
    /// Creates the FIFO set under `dir`. With a terminal, stderr is
    /// folded into stdout. Existing FIFOs are replaced, which is how
    /// recovery rebuilds IO for a Created container.
    pub fn new(dir: &Path, terminal: bool, with_stdin: bool) -> io::Result<Self> {
        std::fs::create_dir_all(dir)?;

        let stdout = dir.join("stdout");
        make_fifo(&stdout)?;

        let stderr = if terminal {
            None
        } else {
            let path = dir.join("stderr");
            make_fifo(&path)?;
            Some(path)
        };

        let stdin = if with_stdin {
            let path = dir.join("stdin");
            make_fifo(&path)?;
            Some(path)
        } else {
            None
        };

        let (stdout_tx, _) = broadcast::channel(FANOUT_CAPACITY);
        let (stderr_tx, _) = broadcast::channel(FANOUT_CAPACITY);
        Ok(Self {
            dir: dir.to_path_buf(),
            stdin,
            stdout,
            stderr,
            terminal,
            stdout_tx,
            stderr_tx,
            log: Mutex::new(None),
            keepalive: Mutex::new(vec![]),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn terminal(&self) -> bool {
        self.terminal
    }

    pub fn has_stdin(&self) -> bool {
        self.stdin.is_some()
    }

    /// The endpoints handed to the engine.
    pub fn task_io(&self) -> TaskIo {
        TaskIo {
            stdin: self.stdin.clone(),
            stdout: Some(self.stdout.clone()),
            stderr: self.stderr.clone(),
            terminal: self.terminal,
        }
    }

    /// Opens the read ends and starts pumping frames into `log` and
    /// bytes into the attach fan-out.
    ///
    /// A write end of each pumped FIFO is held open so the pump does
    /// not observe end of stream before the engine attaches; it closes
    /// with [`Self::close`].
    pub fn start_log_pump(&self, log: Arc<LogFile>) -> io::Result<()> {
        *self.log.lock().expect("log handle lock") = Some(log.clone());
        let mut keepalive = self.keepalive.lock().expect("keepalive lock");

        let stdout = open_receiver(&self.stdout)?;
        keepalive.push(pipe::OpenOptions::new().open_sender(&self.stdout)?);
        let _ = tokio::spawn(pump_frames(
            stdout,
            LogStream::Stdout,
            log.clone(),
            self.stdout_tx.clone(),
        ));

        if let Some(stderr) = &self.stderr {
            let stderr_rx = open_receiver(stderr)?;
            keepalive.push(pipe::OpenOptions::new().open_sender(stderr)?);
            let _ = tokio::spawn(pump_frames(
                stderr_rx,
                LogStream::Stderr,
                log,
                self.stderr_tx.clone(),
            ));
        }
        Ok(())
    }

    /// Releases the held write ends so the pumps drain to end of
    /// stream. Idempotent; runs on container exit and on remove.
    pub fn close(&self) {
        self.keepalive.lock().expect("keepalive lock").clear();
    }

    /// Swaps the log writers atomically, closing the old file.
    pub async fn reopen_log(&self) -> io::Result<()> {
        let log = self.log.lock().expect("log handle lock").clone();
        match log {
            Some(log) => log.reopen().await,
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                "container log is not open",
            )),
        }
    }

    pub fn subscribe_stdout(&self) -> broadcast::Receiver<Bytes> {
        self.stdout_tx.subscribe()
    }

    pub fn subscribe_stderr(&self) -> broadcast::Receiver<Bytes> {
        self.stderr_tx.subscribe()
    }

    /// Opens the write end of stdin for an attach session.
    pub fn open_stdin(&self) -> io::Result<pipe::Sender> {
        let Some(stdin) = &self.stdin else {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "container has no stdin",
            ));
        };
        pipe::OpenOptions::new().open_sender(stdin)
    }
}

fn make_fifo(path: &Path) -> io::Result<()> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    mkfifo(path, Mode::from_bits_truncate(0o600)).map_err(|e| {
        warn!("failed to create fifo {}: {e}", path.display());
        io::Error::from_raw_os_error(e as i32)
    })
}

fn open_receiver(path: &Path) -> io::Result<pipe::Receiver> {
    pipe::OpenOptions::new().open_receiver(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::FileTypeExt;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_new_creates_fifo_set() {
        let dir = tempfile::tempdir().expect("tempdir");
        let io = ContainerIo::new(&dir.path().join("io"), false, true)
            .expect("container io");

        let task_io = io.task_io();
        for path in [
            task_io.stdin.as_ref().expect("stdin"),
            task_io.stdout.as_ref().expect("stdout"),
            task_io.stderr.as_ref().expect("stderr"),
        ] {
            let meta = std::fs::metadata(path).expect("fifo metadata");
            assert!(meta.file_type().is_fifo());
        }
    }

    #[tokio::test]
    async fn test_terminal_folds_stderr() {
        let dir = tempfile::tempdir().expect("tempdir");
        let io = ContainerIo::new(&dir.path().join("io"), true, false)
            .expect("container io");
        assert!(io.task_io().stderr.is_none());
        assert!(io.task_io().stdin.is_none());
    }

    #[tokio::test]
    async fn test_pump_writes_frames_and_fans_out() {
        let dir = tempfile::tempdir().expect("tempdir");
        let io = ContainerIo::new(&dir.path().join("io"), false, false)
            .expect("container io");
        let log_path = dir.path().join("0.log");
        let log =
            Arc::new(LogFile::open(&log_path).await.expect("open log"));

        io.start_log_pump(log).expect("start pump");
        let mut attached = io.subscribe_stdout();

        // The engine side of the stdout FIFO.
        let mut writer = pipe::OpenOptions::new()
            .open_sender(io.task_io().stdout.expect("stdout"))
            .expect("open sender");
        writer.write_all(b"hello world\n").await.expect("write");
        writer.shutdown().await.expect("shutdown");
        drop(writer);

        let seen = tokio::time::timeout(Duration::from_secs(5), attached.recv())
            .await
            .expect("fanout timely")
            .expect("fanout bytes");
        assert_eq!(&seen[..], b"hello world\n");

        // Give the pump a beat to land the frame in the file.
        for _ in 0..50 {
            let contents = tokio::fs::read_to_string(&log_path)
                .await
                .unwrap_or_default();
            if contents.contains("stdout F hello world") {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("log frame never landed");
    }

    #[tokio::test]
    async fn test_reopen_without_pump_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let io = ContainerIo::new(&dir.path().join("io"), false, false)
            .expect("container io");
        assert!(io.reopen_log().await.is_err());
    }
}
