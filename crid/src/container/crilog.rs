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

//! The CRI container log format.
//!
//! Each line is framed as `timestamp stream tag message`, where the tag
//! marks full (`F`) or partial (`P`) lines. Lines longer than
//! [`MAX_LOG_LINE_SIZE`] are split into partial frames.

use bytes::Bytes;
use chrono::{SecondsFormat, Utc};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::pipe;
use tokio::sync::{broadcast, Mutex};
use tracing::warn;

/// Longest message carried by a single frame.
pub const MAX_LOG_LINE_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl LogStream {
    pub fn as_str(self) -> &'static str {
        match self {
            LogStream::Stdout => "stdout",
            LogStream::Stderr => "stderr",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTag {
    Full,
    Partial,
}

impl LogTag {
    pub fn as_str(self) -> &'static str {
        match self {
            LogTag::Full => "F",
            LogTag::Partial => "P",
        }
    }
}

/// Splits a raw byte stream into log frames.
#[derive(Debug, Default)]
pub(crate) struct LineFramer {
    pending: Vec<u8>,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk, returning the frames it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<(LogTag, Vec<u8>)> {
        let mut frames = vec![];
        for &byte in chunk {
            if byte == b'\n' {
                frames.push((LogTag::Full, std::mem::take(&mut self.pending)));
            } else {
                self.pending.push(byte);
                if self.pending.len() >= MAX_LOG_LINE_SIZE {
                    frames.push((
                        LogTag::Partial,
                        std::mem::take(&mut self.pending),
                    ));
                }
            }
        }
        frames
    }

    /// Flushes whatever is buffered at end of stream.
    pub fn flush(&mut self) -> Option<(LogTag, Vec<u8>)> {
        if self.pending.is_empty() {
            None
        } else {
            Some((LogTag::Full, std::mem::take(&mut self.pending)))
        }
    }
}

/// The shared, atomically swappable container log file.
///
/// Reopening swaps the handle under the lock and closes the previous
/// file, so pumps keep writing without interruption.
#[derive(Debug)]
pub struct LogFile {
    path: PathBuf,
    file: Mutex<File>,
}

impl LogFile {
    pub async fn open(path: &Path) -> io::Result<Self> {
        let file = open_log(path).await?;
        Ok(Self { path: path.to_path_buf(), file: Mutex::new(file) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Swaps in a fresh handle; the previous file closes on drop.
    pub async fn reopen(&self) -> io::Result<()> {
        let fresh = open_log(&self.path).await?;
        let mut file = self.file.lock().await;
        *file = fresh;
        Ok(())
    }

    pub async fn write_frame(
        &self,
        stream: LogStream,
        tag: LogTag,
        message: &[u8],
    ) -> io::Result<()> {
        let header = format!(
            "{} {} {} ",
            Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true),
            stream.as_str(),
            tag.as_str(),
        );
        let mut file = self.file.lock().await;
        file.write_all(header.as_bytes()).await?;
        file.write_all(message).await?;
        file.write_all(b"\n").await?;
        file.flush().await
    }
}

/// Reads a FIFO until end of stream, framing bytes into `log` and
/// mirroring the raw chunks into the attach fan-out.
pub(crate) async fn pump_frames(
    mut reader: pipe::Receiver,
    stream: LogStream,
    log: Arc<LogFile>,
    fanout: broadcast::Sender<Bytes>,
) {
    let mut framer = LineFramer::new();
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let chunk = &buf[..n];
                // Nobody attached is fine.
                let _ = fanout.send(Bytes::copy_from_slice(chunk));
                for (tag, message) in framer.push(chunk) {
                    if let Err(e) =
                        log.write_frame(stream, tag, &message).await
                    {
                        warn!(
                            "failed to write {} log frame: {e}",
                            stream.as_str()
                        );
                    }
                }
            }
            Err(e) => {
                warn!("{} pump read failed: {e}", stream.as_str());
                break;
            }
        }
    }
    if let Some((tag, message)) = framer.flush() {
        if let Err(e) = log.write_frame(stream, tag, &message).await {
            warn!("failed to flush {} log frame: {e}", stream.as_str());
        }
    }
    // Empty chunk marks end of stream for attach subscribers.
    let _ = fanout.send(Bytes::new());
}

async fn open_log(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .mode(0o640)
        .open(path)
        .await
}
