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

//! Streaming sessions: exec, attach, and port-forward.
//!
//! The request half of each operation returns a one-time URL; the
//! streaming endpoint (owned by the transport layer) redeems the token
//! and hands the client byte streams to the session runners here.

use crate::engine::EngineError;
use api::runtime::{AttachRequest, ExecRequest, PortForwardRequest};
use std::collections::HashMap;
use std::io;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tonic::Status;
use uuid::Uuid;

pub mod attach;
pub mod exec;
pub mod portforward;
pub mod tls;

pub use tls::TlsMode;

/// Redeem window for a one-time session URL.
const TOKEN_TTL: Duration = Duration::from_secs(60);
/// Bound on outstanding unredeemed sessions.
const CACHE_CAPACITY: usize = 1000;
/// Drain budget the daemon grants the stream server on shutdown.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("session token is invalid or expired")]
    InvalidToken,
    #[error("session backlog is full")]
    Backlog,
    #[error("exec timed out after {0:?}")]
    ExecTimeout(Duration),
    #[error("sandbox network namespace is closed, refusing to dial")]
    NetNsClosed,
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("stream io failure: {0}")]
    Io(#[from] io::Error),
}

impl From<StreamError> for Status {
    fn from(err: StreamError) -> Self {
        let msg = err.to_string();
        match err {
            StreamError::InvalidToken => Status::invalid_argument(msg),
            StreamError::Backlog => Status::resource_exhausted(msg),
            StreamError::ExecTimeout(_) => Status::deadline_exceeded(msg),
            StreamError::NetNsClosed => Status::failed_precondition(msg),
            StreamError::Engine(e) => match e {
                EngineError::NotFound(_) => Status::not_found(msg),
                EngineError::Unavailable(_) => Status::unavailable(msg),
                _ => Status::internal(msg),
            },
            StreamError::Io(_) => Status::internal(msg),
        }
    }
}

/// A redeemed session's parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionRequest {
    Exec(ExecRequest),
    Attach(AttachRequest),
    PortForward(PortForwardRequest),
}

impl SessionRequest {
    fn kind(&self) -> &'static str {
        match self {
            SessionRequest::Exec(_) => "exec",
            SessionRequest::Attach(_) => "attach",
            SessionRequest::PortForward(_) => "portforward",
        }
    }
}

#[derive(Debug)]
struct PendingSession {
    request: SessionRequest,
    expires_at: Instant,
    issued_at: Instant,
}

/// Issues and redeems one-time session tokens for the streaming
/// endpoint.
#[derive(Debug)]
pub struct StreamingServer {
    address: String,
    tls: TlsMode,
    sessions: Mutex<HashMap<String, PendingSession>>,
}

impl StreamingServer {
    pub fn new(address: String, tls: TlsMode) -> Self {
        Self { address, tls, sessions: Mutex::new(HashMap::new()) }
    }

    /// Registers a session and returns the URL the client redeems.
    pub fn request_url(
        &self,
        request: SessionRequest,
    ) -> Result<String, StreamError> {
        let mut sessions = self.sessions.lock().expect("session cache lock");
        let now = Instant::now();
        sessions.retain(|_, pending| pending.expires_at > now);
        if sessions.len() >= CACHE_CAPACITY {
            // Shed the oldest pending session rather than the request.
            let oldest = sessions
                .iter()
                .min_by_key(|(_, pending)| pending.issued_at)
                .map(|(token, _)| token.clone());
            match oldest {
                Some(token) => {
                    let _ = sessions.remove(&token);
                }
                None => return Err(StreamError::Backlog),
            }
        }

        let token = Uuid::new_v4().simple().to_string();
        let kind = request.kind();
        let url = format!(
            "{}://{}/{kind}/{token}",
            self.tls.scheme(),
            self.address
        );
        let _ = sessions.insert(
            token,
            PendingSession {
                request,
                expires_at: now + TOKEN_TTL,
                issued_at: now,
            },
        );
        Ok(url)
    }

    /// Consumes a token. A token redeems exactly once, within its TTL.
    pub fn redeem(&self, token: &str) -> Result<SessionRequest, StreamError> {
        let mut sessions = self.sessions.lock().expect("session cache lock");
        let pending =
            sessions.remove(token).ok_or(StreamError::InvalidToken)?;
        if pending.expires_at <= Instant::now() {
            return Err(StreamError::InvalidToken);
        }
        Ok(pending.request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn exec_request(id: &str) -> SessionRequest {
        SessionRequest::Exec(ExecRequest {
            container_id: id.to_string(),
            cmd: vec!["sh".into()],
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_url_token_redeems_once() {
        let server =
            StreamingServer::new("10.0.0.2:10010".into(), TlsMode::Disabled);
        let url = server.request_url(exec_request("c1")).expect("url");
        assert!(url.starts_with("http://10.0.0.2:10010/exec/"));

        let token = url.rsplit('/').next().expect("token");
        let request = server.redeem(token).expect("first redeem");
        assert_eq!(request, exec_request("c1"));

        assert!(matches!(
            server.redeem(token),
            Err(StreamError::InvalidToken)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokens_expire() {
        let server =
            StreamingServer::new("10.0.0.2:10010".into(), TlsMode::Disabled);
        let url = server.request_url(exec_request("c1")).expect("url");
        let token = url.rsplit('/').next().expect("token").to_string();

        tokio::time::advance(TOKEN_TTL + Duration::from_secs(1)).await;
        assert!(matches!(
            server.redeem(&token),
            Err(StreamError::InvalidToken)
        ));
    }

    #[tokio::test]
    async fn test_tls_mode_switches_scheme() {
        let server =
            StreamingServer::new("10.0.0.2:10010".into(), TlsMode::SelfSigned);
        let url = server.request_url(exec_request("c1")).expect("url");
        assert!(url.starts_with("https://"));
    }
}
