use std::future::Future;

use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;

use crate::ipc::protocol::{read_frame, write_frame, Request, Response};

/// Accept connections until the token is cancelled, handling each on
/// its own task. A connection carries any number of request/response
/// frames; the first malformed frame drops it, leaving core state
/// untouched.
pub async fn serve<F, Fut>(listener: UnixListener, handler: F, token: CancellationToken)
where
    F: Fn(Request) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send + 'static,
{
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        let handler = handler.clone();
                        tokio::spawn(handle_connection(stream, handler));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Accept failed");
                    }
                }
            }
        }
    }
    tracing::debug!("IPC server stopped");
}

async fn handle_connection<F, Fut>(mut stream: UnixStream, handler: F)
where
    F: Fn(Request) -> Fut,
    Fut: Future<Output = Response>,
{
    loop {
        let request: Request = match read_frame(&mut stream).await {
            Ok(request) => request,
            // EOF or garbage: either way the conversation is over.
            Err(_) => return,
        };

        let response = handler(request).await;
        if write_frame(&mut stream, &response).await.is_err() {
            return;
        }
    }
}
