use crate::protocol::{CorrelationId, ErrorType, Rejected, Request, Response, Task};
use crate::DispatchError;
use repr_similarity_backend::{Backend, BackendError, Comparison, FetchRequest, SimilarityRequest};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::instrument;

/// Relays requests to the numeric module and posts one response per request
#[derive(Debug, Clone)]
pub struct Dispatcher {
    backend: Backend,
    response_sender: mpsc::Sender<Response>,
}

impl Dispatcher {
    pub fn new(backend: Backend, response_sender: mpsc::Sender<Response>) -> Self {
        Self {
            backend,
            response_sender,
        }
    }

    /// Serve `requests` until the channel closes, then wait for every in-flight fetch.
    ///
    /// Nothing is read before the numeric module is done initializing. `calc_similarities`
    /// is answered before the next request is read, `fetch_repr` answers whenever the
    /// download completes.
    #[instrument(skip_all)]
    pub async fn run(self, mut requests: mpsc::Receiver<Vec<u8>>) {
        let ready = self.backend.wait_until_ready().await;
        match &ready {
            Ok(()) => tracing::info!("Ready"),
            Err(err) => tracing::error!("Every request will be refused: {err}"),
        }

        let mut in_flight = JoinSet::new();
        loop {
            tokio::select! {
                line = requests.recv() => match line {
                    Some(line) => self.handle(&line, &ready, &mut in_flight).await,
                    None => break,
                },
                Some(result) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(err) = result {
                        tracing::error!("Fetch task failed: {err}");
                    }
                }
            }
        }

        if !in_flight.is_empty() {
            tracing::info!("Waiting for {} in-flight fetches", in_flight.len());
        }
        while let Some(result) = in_flight.join_next().await {
            if let Err(err) = result {
                tracing::error!("Fetch task failed: {err}");
            }
        }
    }

    async fn handle(
        &self,
        line: &[u8],
        ready: &Result<(), BackendError>,
        in_flight: &mut JoinSet<()>,
    ) {
        metrics::counter!("rs_request_count").increment(1);

        let Request { id, task } = match Request::from_slice(line) {
            Ok(request) => request,
            Err(Rejected { id, error }) => return self.reject(id, error).await,
        };
        if let Err(err) = ready {
            return self.reject(id, err.clone().into()).await;
        }

        tracing::debug!("Dispatching {}", task.name());
        match task {
            Task::FetchRepr(fetch) => {
                let dispatcher = self.clone();
                in_flight.spawn(async move { dispatcher.fetch_repr(id, fetch).await });
            }
            Task::CalcSimilarities(calc) => self.calc_similarities(id, calc).await,
        }
    }

    #[instrument(skip(self))]
    async fn fetch_repr(&self, id: Option<CorrelationId>, request: FetchRequest) {
        let start_time = Instant::now();
        let in_flight = metrics::gauge!("rs_fetch_in_flight");
        in_flight.increment(1.0);
        let result = self.backend.fetch_repr(request).await;
        in_flight.decrement(1.0);

        let response = match result {
            Ok(()) => {
                metrics::histogram!("rs_fetch_duration").record(start_time.elapsed().as_secs_f64());
                metrics::counter!("rs_request_success", "task" => "fetch_repr").increment(1);
                Response::fetch_success(id)
            }
            Err(err) => {
                metrics::counter!("rs_request_failure", "err" => "fetch").increment(1);
                tracing::error!("{err}");
                Response::fetch_error(id, err.to_string())
            }
        };
        self.respond(response).await;
    }

    #[instrument(skip(self))]
    async fn calc_similarities(&self, id: Option<CorrelationId>, request: SimilarityRequest) {
        let response = match self.backend.calc_similarities(request).await {
            Ok((Comparison::Similarities(similarities), duration)) => {
                metrics::histogram!("rs_similarity_duration").record(duration.as_secs_f64());
                metrics::counter!("rs_request_success", "task" => "calc_similarities")
                    .increment(1);
                Response::similarities(id, similarities)
            }
            Ok((Comparison::Loading, _)) => {
                tracing::debug!("Representations are still loading");
                Response::loading(id)
            }
            Err(err) => {
                metrics::counter!("rs_request_failure", "err" => "similarity").increment(1);
                tracing::error!("{err}");
                Response::calc_error(id)
            }
        };
        self.respond(response).await;
    }

    async fn reject(&self, id: Option<CorrelationId>, error: DispatchError) {
        let error_type = ErrorType::from(&error);
        metrics::counter!("rs_request_failure", "err" => error_type.as_str()).increment(1);
        tracing::warn!("{error}");
        self.respond(Response::error(id, error)).await;
    }

    async fn respond(&self, response: Response) {
        if self.response_sender.send(response).await.is_err() {
            tracing::warn!("Response receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use repr_similarity_backend::{BackendConfig, DType, Fetcher, InitResult, Representation};
    use repr_similarity_backend_core::Backend as CoreBackend;
    use repr_similarity_backend_ndarray::NdarrayBackend;
    use serde_json::{json, Value};
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::oneshot;
    use tokio::task::JoinHandle;

    /// Answers every comparison with the same values
    struct FixedBackend(Vec<f32>);

    impl CoreBackend for FixedBackend {
        fn health(&self) -> Result<(), BackendError> {
            Ok(())
        }

        fn contains(&self, _key: &str) -> bool {
            true
        }

        fn insert(&mut self, _key: String, _repr: Representation) {}

        fn mark_failed(&mut self, _key: String, _reason: String) {}

        fn calc_similarities(&self, _: &SimilarityRequest) -> Result<Comparison, BackendError> {
            Ok(Comparison::Similarities(self.0.clone()))
        }
    }

    struct Harness {
        requests: mpsc::Sender<Vec<u8>>,
        responses: mpsc::Receiver<Response>,
        handle: JoinHandle<()>,
    }

    impl Harness {
        fn start(backend: Backend) -> Self {
            let (requests, request_receiver) = mpsc::channel(16);
            let (response_sender, responses) = mpsc::channel(16);
            let handle = tokio::spawn(Dispatcher::new(backend, response_sender).run(request_receiver));
            Self {
                requests,
                responses,
                handle,
            }
        }

        async fn send(&self, request: Value) {
            self.requests.send(request.to_string().into_bytes()).await.unwrap();
        }

        async fn next(&mut self) -> Value {
            let response = tokio::time::timeout(Duration::from_secs(5), self.responses.recv())
                .await
                .expect("no response in time")
                .expect("dispatcher stopped");
            serde_json::to_value(response).unwrap()
        }

        async fn stop(self) {
            drop(self.requests);
            self.handle.await.unwrap();
        }
    }

    fn config() -> BackendConfig {
        BackendConfig {
            dtype: DType::Float32,
            allow_file_urls: true,
            ..Default::default()
        }
    }

    fn backend_with(init: impl std::future::Future<Output = InitResult> + Send + 'static) -> Backend {
        Backend::from_init(Fetcher::new(&config()).unwrap(), init)
    }

    fn write_repr(dir: &Path, name: &str, values: &[f32]) -> Result<String> {
        let path = dir.join(name);
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        std::fs::write(&path, bytes)?;
        Ok(format!("file://{}", path.display()))
    }

    fn calc(id: u64, repr1: &str, repr2: &str) -> Value {
        json!({
            "version": 1,
            "id": id,
            "task": "calc_similarities",
            "data": {"func": "cosine", "repr1_str": repr1, "repr2_str": repr2, "row": 0, "col": 0}
        })
    }

    #[tokio::test]
    async fn test_requests_wait_for_initialization() {
        let (release, gate) = oneshot::channel::<()>();
        let mut harness = Harness::start(backend_with(async move {
            let _ = gate.await;
            let backend: InitResult = Ok(Box::new(NdarrayBackend::new()));
            backend
        }));

        harness.send(calc(1, "a", "b")).await;
        harness.send(json!({"id": 2, "task": "bogus", "data": {}})).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(harness.responses.try_recv().is_err());

        release.send(()).unwrap();
        assert_eq!(harness.next().await, json!({"id": 1, "data": "loading"}));
        assert_eq!(harness.next().await["id"], json!(2));
        harness.stop().await;
    }

    #[tokio::test]
    async fn test_failed_initialization_refuses_every_request() {
        let mut harness = Harness::start(backend_with(async {
            InitResult::Err(BackendError::Start("out of memory".to_string()))
        }));

        harness.send(calc(1, "a", "b")).await;
        harness
            .send(json!({"id": "f", "task": "fetch_repr", "data": {"url": "http://x/a.bin"}}))
            .await;

        for id in [json!(1), json!("f")] {
            let response = harness.next().await;
            assert_eq!(response["id"], id);
            assert_eq!(response["error"]["error_type"], json!("unavailable"));
            assert!(response["error"]["error"]
                .as_str()
                .unwrap()
                .contains("Could not start backend: out of memory"));
        }
        harness.stop().await;
    }

    #[tokio::test]
    async fn test_fetch_then_compare() -> Result<()> {
        let dir = TempDir::new()?;
        let url = write_repr(dir.path(), "a.bin", &[1.0, 0.0, 0.0, 1.0, 1.0, 1.0, -1.0, 0.0])?;
        let mut harness = Harness::start(Backend::new(config())?);

        // Fetch resolves after the comparison is answered
        harness
            .send(json!({"id": 1, "task": "fetch_repr", "data": {"url": url, "steps": 1, "n": 2, "m": 2}}))
            .await;
        harness.send(calc(2, "a", "a")).await;

        let mut responses = vec![harness.next().await, harness.next().await];
        responses.sort_by_key(|response| response["id"].as_u64());
        assert_eq!(
            responses,
            vec![
                json!({"id": 1, "data": {"status": "success"}}),
                json!({"id": 2, "data": "loading"}),
            ]
        );

        // The fetch-time shape is used when `n` and `m` are omitted
        harness.send(calc(3, &url, &url)).await;
        let response = harness.next().await;
        assert_eq!(response["id"], json!(3));
        let values: Vec<f32> = serde_json::from_value(response["data"].clone())?;
        assert_eq!(values.len(), 4);
        assert!((values[0] - 1.0).abs() < 1e-6);
        assert!((values[3] + 1.0).abs() < 1e-6);

        harness.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_similarities_are_forwarded_unmodified() {
        let values = vec![0.25, -1.0, 3.5, 0.0];
        let mut harness = Harness::start(backend_with({
            let values = values.clone();
            async move {
                let backend: InitResult = Ok(Box::new(FixedBackend(values)));
                backend
            }
        }));

        harness.send(calc(7, "a", "b")).await;
        assert_eq!(harness.next().await, json!({"id": 7, "data": values}));
        harness.stop().await;
    }

    #[tokio::test]
    async fn test_fetch_failure() -> Result<()> {
        let dir = TempDir::new()?;
        let url = write_repr(dir.path(), "a.bin", &[1.0, 2.0, 3.0])?;
        let mut harness = Harness::start(Backend::new(config())?);

        harness
            .send(json!({"id": 1, "task": "fetch_repr", "data": {"url": url, "n": 2, "m": 2}}))
            .await;
        let response = harness.next().await;
        assert_eq!(response["id"], json!(1));
        assert_eq!(response["data"]["status"], json!("error"));
        assert!(response["data"]["msg"]
            .as_str()
            .unwrap()
            .contains("holds 3 values, expected 32"));

        // A representation that failed to load is an error, not loading
        harness.send(calc(2, &url, &url)).await;
        assert_eq!(harness.next().await, json!({"id": 2, "data": "error"}));

        harness.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_oversized_shape_is_refused() -> Result<()> {
        let dir = TempDir::new()?;
        let url = write_repr(dir.path(), "a.bin", &[1.0, 0.0, 0.0, 0.0])?;
        let mut harness = Harness::start(Backend::new(config())?);

        harness
            .send(json!({"id": 1, "task": "fetch_repr", "data": {"url": url}}))
            .await;
        assert_eq!(harness.next().await, json!({"id": 1, "data": {"status": "success"}}));

        let huge = 1u64 << 33;
        harness
            .send(json!({"id": 2, "task": "calc_similarities", "data": {
                "func": "cosine", "repr1_str": url, "repr2_str": url, "row": 0, "col": 0,
                "steps": 1, "n": huge, "m": huge
            }}))
            .await;
        let response = harness.next().await;
        assert_eq!(response["id"], json!(2));
        assert_eq!(response["error"]["error_type"], json!("validation"));

        // The numeric module keeps serving
        harness
            .send(json!({"id": 3, "task": "calc_similarities", "data": {
                "func": "cosine", "repr1_str": url, "repr2_str": url, "row": 0, "col": 0,
                "steps": 1, "n": 1, "m": 4
            }}))
            .await;
        assert_eq!(harness.next().await, json!({"id": 3, "data": [1.0]}));

        harness.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_refused_requests() -> Result<()> {
        let mut harness = Harness::start(Backend::new(config())?);

        harness.send(json!({"id": 3, "task": "bogus", "data": {}})).await;
        let response = harness.next().await;
        assert_eq!(response["id"], json!(3));
        assert_eq!(response["error"]["error_type"], json!("unknown_task"));

        harness.requests.send(b"{oops".to_vec()).await?;
        let response = harness.next().await;
        assert!(response.get("id").is_none());
        assert_eq!(response["error"]["error_type"], json!("validation"));

        harness
            .send(json!({"id": "v", "version": 9, "task": "fetch_repr", "data": {"url": "a"}}))
            .await;
        let response = harness.next().await;
        assert_eq!(response["id"], json!("v"));
        assert_eq!(response["error"]["error_type"], json!("unsupported_version"));

        harness.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_in_flight_fetches_drain_on_close() -> Result<()> {
        let dir = TempDir::new()?;
        let url = write_repr(dir.path(), "a.bin", &[1.0; 4])?;
        let mut harness = Harness::start(Backend::new(config())?);

        harness
            .send(json!({"task": "fetch_repr", "data": {"url": url}}))
            .await;
        let Harness {
            requests,
            mut responses,
            handle,
        } = harness;
        drop(requests);
        handle.await?;

        let response = serde_json::to_value(responses.recv().await.unwrap())?;
        assert_eq!(response, json!({"data": {"status": "success"}}));
        assert!(responses.recv().await.is_none());
        Ok(())
    }
}
