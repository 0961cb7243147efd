// Copyright 2019 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The control socket of a running supervisor.
//!
//! Every connection carries exactly one request followed by one response.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

use crate::msg::{self, Request, Response};
use crate::procs::{RunnerState, Supervisor};
use crate::Error;

pub const SOCKET_ENV: &str = "MINIUM_SOCKET";
pub const SOCKET_NAME: &str = "minium.sock";

/// `$XDG_RUNTIME_DIR/minium.sock`, falling back to `/tmp/minium.sock`
pub fn default_socket_path() -> PathBuf {
    std::env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir)
        .join(SOCKET_NAME)
}

/// Something that can answer control requests
#[async_trait]
pub trait Control: Send + Sync + 'static {
    async fn handle(&self, request: Request) -> Response;
}

#[async_trait]
impl Control for Supervisor {
    async fn handle(&self, request: Request) -> Response {
        let target = request.target().map(str::to_string);

        let applied = match (&request, target.as_deref()) {
            (Request::Start(_), None) => {
                self.start_all();
                Ok(())
            }
            (Request::Start(_), Some(name)) => self.start(name).map(drop),
            (Request::Stop(_), None) => {
                self.stop_all(None).await;
                Ok(())
            }
            (Request::Stop(_), Some(name)) => self.stop(name, None).await.map(drop),
            (Request::Restart(_), None) => {
                self.stop_all(None).await;
                self.start_all();
                Ok(())
            }
            (Request::Restart(_), Some(name)) => self.restart(name).await.map(drop),
            (Request::Status(_), _) => Ok(()),
        };

        if let Err(e) = applied {
            return Response::Error(e.to_string());
        }

        match target {
            None => Response::States(self.status().collect()),
            Some(name) => match self.state(&name) {
                Some(state) => Response::States(vec![state]),
                None => Response::Error(Error::unknown_service(&name).to_string()),
            },
        }
    }
}

/// Listens for control connections on a Unix socket
///
/// The socket file is removed again when the server is dropped.
pub struct ControlServer {
    listener: UnixListener,
    path: PathBuf,
}

impl ControlServer {
    /// Binds to `path`, replacing a stale socket left by an earlier run
    pub async fn bind(path: &Path) -> Result<Self, Error> {
        if UnixStream::connect(path).await.is_ok() {
            return Err(format!("a supervisor is already listening on {}", path.display()).into());
        }

        match std::fs::remove_file(path) {
            Ok(()) => debug!(path = %path.display(), "removed stale socket"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => (),
            Err(e) => return Err(e.into()),
        }

        let listener = UnixListener::bind(path)?;
        info!(path = %path.display(), "control socket listening");

        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accepts connections until an accept fails
    pub async fn serve<C: Control>(&self, control: Arc<C>) -> Result<(), Error> {
        loop {
            let (stream, _) = self.listener.accept().await?;
            let control = Arc::clone(&control);

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, control.as_ref()).await {
                    warn!("control connection failed: {}", e);
                }
            });
        }
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        std::fs::remove_file(&self.path)
            .map_err(|e| debug!(path = %self.path.display(), "could not remove socket: {}", e))
            .ok();
    }
}

async fn handle_connection<C: Control>(mut stream: UnixStream, control: &C) -> Result<(), Error> {
    let request: Request = msg::read_msg(&mut stream).await?;
    info!(?request, "control request");

    let response = control.handle(request).await;
    msg::write_msg(&mut stream, &response).await
}

/// Sends one request to the supervisor at `path` and waits up to `timeout` for the answer
pub async fn request(path: &Path, request: Request, timeout: Duration) -> Result<Response, Error> {
    let exchange = async {
        let mut stream = UnixStream::connect(path)
            .await
            .map_err(|e| format!("no supervisor at {}: {}", path.display(), e))?;

        msg::write_msg(&mut stream, &request).await?;
        let response: Response = msg::read_msg(&mut stream).await?;
        Ok::<_, Error>(response)
    };

    tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| Error::timeout(timeout))?
}

/// True when every state is healthy for the request that produced it
pub fn succeeded(request: &Request, states: &[RunnerState]) -> bool {
    use crate::procs::Status;

    states.iter().all(|state| match request {
        Request::Stop(_) => state.status == Status::Stopped,
        Request::Start(_) | Request::Restart(_) | Request::Status(_) => {
            state.status != Status::Crashed
        }
    })
}
