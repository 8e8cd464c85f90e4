use std::path::Path;

use tokio::net::UnixStream;

use crate::error::{QueueError, Result};
use crate::ipc::protocol::{read_frame, write_frame, Request, Response};

/// Request/response helper over the daemon socket.
pub struct IpcClient {
    stream: UnixStream,
}

impl IpcClient {
    pub async fn connect(socket_path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(socket_path)
            .await
            .map_err(|_| QueueError::DaemonUnavailable(socket_path.display().to_string()))?;
        Ok(Self { stream })
    }

    pub async fn request(&mut self, request: &Request) -> Result<Response> {
        write_frame(&mut self.stream, request).await?;
        read_frame(&mut self.stream).await
    }
}
