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

//! Port-forward sessions.
//!
//! The session enters the sandbox's network namespace on a throwaway
//! thread, dials loopback over IPv4 (IPv6 loopback races out), and
//! pumps bytes both ways until either direction ends.

use super::StreamError;
use nix::sched::{setns, CloneFlags};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tracing::debug;

/// After one direction finishes, how long the other gets to drain.
const HALF_CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Forwards `client` to `127.0.0.1:<port>` inside the namespace pinned
/// at `netns_path`.
pub async fn port_forward<S>(
    netns_path: &str,
    port: i32,
    client: S,
) -> Result<(), StreamError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    if netns_path.is_empty() || !Path::new(netns_path).exists() {
        return Err(StreamError::NetNsClosed);
    }
    let port = u16::try_from(port).map_err(|_| {
        StreamError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("invalid port {port}"),
        ))
    })?;

    let target = connect_in_netns(netns_path.to_string(), port).await?;
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut target_read, mut target_write) = target.into_split();

    let mut to_target = tokio::spawn(async move {
        let _ = tokio::io::copy(&mut client_read, &mut target_write).await;
    });
    let mut to_client = tokio::spawn(async move {
        let _ = tokio::io::copy(&mut target_read, &mut client_write).await;
    });

    tokio::select! {
        _ = &mut to_target => {
            let _ = tokio::time::timeout(HALF_CLOSE_GRACE, &mut to_client).await;
            to_client.abort();
        }
        _ = &mut to_client => {
            let _ = tokio::time::timeout(HALF_CLOSE_GRACE, &mut to_target).await;
            to_target.abort();
        }
    }
    debug!("port-forward to {port} finished");
    Ok(())
}

/// Dials loopback from inside the namespace. The setns happens on a
/// dedicated thread that exits right after the connect; the socket
/// stays bound to the namespace it was created in.
async fn connect_in_netns(
    netns_path: String,
    port: u16,
) -> Result<TcpStream, StreamError> {
    let (tx, rx) = oneshot::channel();
    let _ = std::thread::spawn(move || {
        let result = (|| -> std::io::Result<std::net::TcpStream> {
            let netns = std::fs::File::open(&netns_path)?;
            setns(netns.as_raw_fd(), CloneFlags::CLONE_NEWNET)
                .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
            let addr = SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::LOCALHOST,
                port,
            ));
            let stream = std::net::TcpStream::connect_timeout(
                &addr,
                Duration::from_secs(10),
            )?;
            stream.set_nonblocking(true)?;
            Ok(stream)
        })();
        let _ = tx.send(result);
    });

    let stream = rx
        .await
        .map_err(|_| {
            StreamError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "netns dial thread died",
            ))
        })??;
    TcpStream::from_std(stream).map_err(StreamError::Io)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_closed_netns_refuses_to_dial() {
        let client = tokio::io::duplex(64).0;
        let err = port_forward("/nonexistent/netns/cri-x", 8080, client)
            .await
            .expect_err("closed netns");
        assert!(matches!(err, StreamError::NetNsClosed));

        let client = tokio::io::duplex(64).0;
        let err = port_forward("", 8080, client)
            .await
            .expect_err("empty netns path");
        assert!(matches!(err, StreamError::NetNsClosed));
    }

    #[tokio::test]
    async fn test_invalid_port_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("netns");
        std::fs::write(&path, b"").expect("netns file");

        let client = tokio::io::duplex(64).0;
        let err = port_forward(path.to_str().expect("utf8"), -1, client)
            .await
            .expect_err("invalid port");
        assert!(matches!(err, StreamError::Io(_)));
    }
}
