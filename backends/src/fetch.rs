use crate::{BackendConfig, DType};
use repr_similarity_backend_core::{BackendError, FetchRequest, Representation};
use reqwest::Url;
use tracing::instrument;

/// Downloads and decodes representations
#[derive(Debug, Clone)]
pub struct Fetcher {
    client: reqwest::Client,
    dtype: DType,
    allow_file_urls: bool,
}

impl Fetcher {
    pub fn new(config: &BackendConfig) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.as_str())
            .build()
            .map_err(|err| BackendError::Start(format!("Could not build HTTP client: {err}")))?;

        Ok(Self {
            client,
            dtype: config.dtype,
            allow_file_urls: config.allow_file_urls,
        })
    }

    #[instrument(skip(self))]
    pub async fn fetch(&self, request: &FetchRequest) -> Result<Representation, BackendError> {
        let bytes = self.download(&request.url).await?;
        let repr = decode(&bytes, self.dtype)?;

        if let Some(shape) = request.shape {
            let expected = shape.len().ok_or_else(|| {
                BackendError::Fetch(format!(
                    "steps={}, n={}, m={} is too large",
                    shape.steps, shape.n, shape.m
                ))
            })?;
            if repr.len() != expected {
                return Err(BackendError::Fetch(format!(
                    "{} holds {} values, expected {expected} for steps={}, n={}, m={}",
                    request.url,
                    repr.len(),
                    shape.steps,
                    shape.n,
                    shape.m
                )));
            }
        }
        Ok(repr.with_shape(request.shape))
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, BackendError> {
        let parsed =
            Url::parse(url).map_err(|err| BackendError::Fetch(format!("Invalid url {url}: {err}")))?;

        match parsed.scheme() {
            "http" | "https" => {
                let response = self
                    .client
                    .get(parsed)
                    .send()
                    .await
                    .map_err(|err| BackendError::Fetch(err.to_string()))?;
                let status = response.status();
                if !status.is_success() {
                    return Err(BackendError::Fetch(format!("{url} returned HTTP {status}")));
                }
                let bytes = response
                    .bytes()
                    .await
                    .map_err(|err| BackendError::Fetch(err.to_string()))?;
                Ok(bytes.to_vec())
            }
            "file" if self.allow_file_urls => {
                let path = parsed
                    .to_file_path()
                    .map_err(|_| BackendError::Fetch(format!("Invalid file url {url}")))?;
                tokio::fs::read(&path)
                    .await
                    .map_err(|err| BackendError::Fetch(format!("Could not read {}: {err}", path.display())))
            }
            "file" => Err(BackendError::Fetch(format!(
                "file urls are disabled, start with `--allow-file-urls` to fetch {url}"
            ))),
            scheme => Err(BackendError::Fetch(format!(
                "Unsupported url scheme `{scheme}` in {url}"
            ))),
        }
    }
}

/// Decode a little-endian `f32` buffer
pub(crate) fn decode(bytes: &[u8], dtype: DType) -> Result<Representation, BackendError> {
    if bytes.len() % 4 != 0 {
        return Err(BackendError::Fetch(format!(
            "Buffer length {} is not a multiple of 4",
            bytes.len()
        )));
    }

    let values = bytes
        .chunks_exact(4)
        .map(|chunk| dtype.round(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])))
        .collect();
    Ok(Representation::new(values))
}
