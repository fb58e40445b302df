use anyhow::{Context, Result};
use repr_similarity_backend::Backend;
use repr_similarity_core::dispatcher::Dispatcher;
use std::future::Future;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::signal;
use tokio::sync::mpsc;

/// Serve JSON-lines requests read from `reader`, one response line per request on `writer`.
///
/// Returns once `reader` reaches EOF or `shutdown` resolves, after every in-flight fetch has
/// answered and every response has been flushed.
pub async fn serve<R, W, F>(
    reader: R,
    mut writer: W,
    backend: Backend,
    max_pending_requests: usize,
    shutdown: F,
) -> Result<()>
where
    R: AsyncBufRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin,
    F: Future<Output = ()> + Send + 'static,
{
    if max_pending_requests == 0 {
        anyhow::bail!("`max_pending_requests` must be > 0");
    }

    let (request_sender, request_receiver) = mpsc::channel(max_pending_requests);
    let (response_sender, mut response_receiver) = mpsc::channel(max_pending_requests);

    let dispatcher = tokio::spawn(Dispatcher::new(backend, response_sender).run(request_receiver));
    let reader = tokio::spawn(read_requests(reader, request_sender, shutdown));

    while let Some(response) = response_receiver.recv().await {
        let mut line = serde_json::to_vec(&response)?;
        line.push(b'\n');
        writer
            .write_all(&line)
            .await
            .context("Could not write response")?;
        writer.flush().await.context("Could not flush response")?;
    }

    dispatcher.await?;
    reader.await?.context("Could not read requests")?;
    Ok(())
}

async fn read_requests<R, F>(
    mut reader: R,
    request_sender: mpsc::Sender<Vec<u8>>,
    shutdown: F,
) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
    F: Future<Output = ()>,
{
    // Raw bytes, so that a line that is not UTF-8 is refused by the dispatcher
    let mut line = Vec::new();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            // Shutdown is acted on even when input never pauses
            biased;

            _ = &mut shutdown => break,
            read = reader.read_until(b'\n', &mut line) => {
                if read? == 0 {
                    tracing::info!("Input closed");
                    break;
                }
                if line.iter().all(u8::is_ascii_whitespace) {
                    line.clear();
                    continue;
                }
                if request_sender.send(std::mem::take(&mut line)).await.is_err() {
                    tracing::warn!("Dispatcher stopped, dropping input");
                    break;
                }
            }
        }
    }
    Ok(())
}

/// Shutdown signal handler
pub async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("signal received, starting graceful shutdown");
}
