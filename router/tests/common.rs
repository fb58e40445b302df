use anyhow::Result;
use repr_similarity_backend::{Backend, BackendConfig, DType};
use repr_similarity_router::serve;
use serde_json::Value;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

#[derive(Debug)]
pub struct Score(pub f32);

impl Score {
    fn is_close(&self, other: &Self, abs_tol: f32) -> bool {
        is_close::default()
            .abs_tol(abs_tol)
            .is_close(self.0, other.0)
    }
}

impl PartialEq for Score {
    fn eq(&self, other: &Self) -> bool {
        // Default tolerance for equality
        self.is_close(other, 1e-5)
    }
}

pub fn scores(value: &Value) -> Vec<Score> {
    value
        .as_array()
        .expect("similarities")
        .iter()
        .map(|v| Score(v.as_f64().expect("number") as f32))
        .collect()
}

/// Write `values` as a little-endian `f32` file and return its url
pub fn write_repr(dir: &Path, name: &str, values: &[f32]) -> Result<String> {
    let path = dir.join(name);
    let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
    std::fs::write(&path, bytes)?;
    Ok(format!("file://{}", path.display()))
}

/// A ready backend that reads `file://` urls
pub async fn backend() -> Result<Backend> {
    let backend = Backend::new(BackendConfig {
        dtype: DType::Float32,
        allow_file_urls: true,
        ..Default::default()
    })?;
    backend.wait_until_ready().await?;
    Ok(backend)
}

/// A worker served over in-memory pipes
pub struct Worker {
    input: Option<DuplexStream>,
    output: Lines<BufReader<DuplexStream>>,
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<Result<()>>,
}

impl Worker {
    pub async fn start(max_pending_requests: usize) -> Result<Self> {
        let backend = backend().await?;

        let (input, server_input) = tokio::io::duplex(64 * 1024);
        let (server_output, output) = tokio::io::duplex(64 * 1024);
        let (shutdown, shutdown_receiver) = oneshot::channel::<()>();

        let handle = tokio::spawn(serve(
            BufReader::new(server_input),
            server_output,
            backend,
            max_pending_requests,
            async move {
                let _ = shutdown_receiver.await;
            },
        ));

        Ok(Self {
            input: Some(input),
            output: BufReader::new(output).lines(),
            shutdown: Some(shutdown),
            handle,
        })
    }

    pub async fn send(&mut self, line: &str) -> Result<()> {
        self.send_bytes(line.as_bytes()).await
    }

    pub async fn send_bytes(&mut self, line: &[u8]) -> Result<()> {
        let input = self.input.as_mut().expect("input closed");
        input.write_all(line).await?;
        input.write_all(b"\n").await?;
        Ok(())
    }

    pub async fn next(&mut self) -> Result<Value> {
        let line = tokio::time::timeout(Duration::from_secs(5), self.output.next_line())
            .await??
            .ok_or_else(|| anyhow::anyhow!("output closed"))?;
        Ok(serde_json::from_str(&line)?)
    }

    /// Close the input, like an EOF on STDIN
    pub fn close(&mut self) {
        self.input.take();
    }

    /// Trigger the shutdown signal
    pub fn signal(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }

    /// Wait for the worker to stop and return whatever output is left
    pub async fn stop(mut self) -> Result<Vec<Value>> {
        tokio::time::timeout(Duration::from_secs(5), self.handle).await???;
        let mut rest = Vec::new();
        while let Some(line) = self.output.next_line().await? {
            rest.push(serde_json::from_str(&line)?);
        }
        Ok(rest)
    }
}
