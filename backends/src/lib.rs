mod dtype;
mod fetch;

use std::future::Future;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use repr_similarity_backend_core::Backend as CoreBackend;
use repr_similarity_backend_ndarray::NdarrayBackend;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{instrument, Span};

pub use crate::dtype::DType;
pub use crate::fetch::Fetcher;
pub use repr_similarity_backend_core::{
    BackendError, Comparison, FetchRequest, Representation, Shape, SimilarityFunction,
    SimilarityRequest, DEFAULT_STEPS,
};

/// Lifecycle of the numeric module. There is no way back from `Ready` or `Failed`.
#[derive(Debug, Clone, PartialEq)]
pub enum ModuleState {
    Uninitialized,
    Initializing,
    Ready,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Precision fetched representations are kept at
    pub dtype: DType,
    /// Accept `file://` urls in `fetch_repr`
    pub allow_file_urls: bool,
    pub user_agent: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            dtype: DType::default(),
            allow_file_urls: false,
            user_agent: format!("repr-similarity/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

pub type InitResult = Result<Box<dyn CoreBackend + Send>, BackendError>;

#[derive(Debug, Clone)]
pub struct Backend {
    /// Channel to communicate with the background thread
    backend_sender: mpsc::Sender<BackendCommand>,
    /// Module lifecycle
    state_receiver: watch::Receiver<ModuleState>,
    fetcher: Fetcher,
    _backend_thread: Arc<BackendThread>,
}

impl Backend {
    /// Start the reference numeric module. Initialization runs in the background, use
    /// [`Backend::wait_until_ready`] before sending work.
    pub fn new(config: BackendConfig) -> Result<Self, BackendError> {
        let fetcher = Fetcher::new(&config)?;
        Ok(Self::from_init(fetcher, init_backend()))
    }

    /// Start a numeric module produced by `init`. `init` is polled exactly once, on the
    /// Tokio runtime this is called from.
    pub fn from_init<F>(fetcher: Fetcher, init: F) -> Self
    where
        F: Future<Output = InitResult> + Send + 'static,
    {
        let (backend_sender, backend_receiver) = mpsc::channel(8);
        let (state_sender, state_receiver) = watch::channel(ModuleState::Uninitialized);
        let (init_sender, init_receiver) = oneshot::channel();

        let _backend_thread = Arc::new(BackendThread::new(
            init_receiver,
            backend_receiver,
            state_sender,
        ));

        tokio::spawn(async move {
            let start = Instant::now();
            let result = init.await;
            match &result {
                Ok(_) => tracing::info!("Numeric module initialized in {:?}", start.elapsed()),
                Err(err) => tracing::error!("Could not initialize numeric module: {err}"),
            }
            let _ = init_sender.send(result);
        });

        Self {
            backend_sender,
            state_receiver,
            fetcher,
            _backend_thread,
        }
    }

    pub fn state(&self) -> ModuleState {
        self.state_receiver.borrow().clone()
    }

    /// Resolves once initialization is over. Every caller observes the same outcome.
    #[instrument(skip(self))]
    pub async fn wait_until_ready(&self) -> Result<(), BackendError> {
        let mut receiver = self.state_receiver.clone();
        let state = receiver
            .wait_for(|state| matches!(state, ModuleState::Ready | ModuleState::Failed(_)))
            .await
            .map(|state| state.clone())
            .unwrap_or_else(|_| self.state());

        match state {
            ModuleState::Ready => Ok(()),
            ModuleState::Failed(reason) => Err(BackendError::Unavailable(reason)),
            state => Err(BackendError::Unavailable(format!(
                "numeric module stopped while {state:?}"
            ))),
        }
    }

    #[instrument(skip(self))]
    pub async fn health(&self) -> Result<(), BackendError> {
        let (sender, receiver) = oneshot::channel();
        self.send(BackendCommand::Health(Span::current(), sender))
            .await?;
        self.receive(receiver).await?
    }

    /// Fetch `request.url` and store it in the numeric module. Urls that are already stored
    /// are not fetched again.
    #[instrument(skip(self))]
    pub async fn fetch_repr(&self, request: FetchRequest) -> Result<(), BackendError> {
        let (sender, receiver) = oneshot::channel();
        self.send(BackendCommand::Contains(
            request.url.clone(),
            Span::current(),
            sender,
        ))
        .await?;
        if self.receive(receiver).await? {
            tracing::debug!("{} is already stored", request.url);
            return Ok(());
        }

        match self.fetcher.fetch(&request).await {
            Ok(repr) => {
                tracing::debug!("Fetched {} ({} values)", request.url, repr.len());
                self.send(BackendCommand::Insert(request.url, repr, Span::current()))
                    .await
            }
            Err(err) => {
                self.send(BackendCommand::MarkFailed(
                    request.url,
                    err.to_string(),
                    Span::current(),
                ))
                .await?;
                Err(err)
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn calc_similarities(
        &self,
        request: SimilarityRequest,
    ) -> Result<(Comparison, Duration), BackendError> {
        let (sender, receiver) = oneshot::channel();
        self.send(BackendCommand::CalcSimilarities(
            request,
            Span::current(),
            sender,
        ))
        .await?;
        self.receive(receiver).await?
    }

    async fn send(&self, command: BackendCommand) -> Result<(), BackendError> {
        match self.backend_sender.send(command).await {
            Ok(()) => Ok(()),
            Err(_) => Err(self.unavailable()),
        }
    }

    async fn receive<T>(&self, receiver: oneshot::Receiver<T>) -> Result<T, BackendError> {
        receiver.await.map_err(|_| self.unavailable())
    }

    fn unavailable(&self) -> BackendError {
        match self.state() {
            ModuleState::Failed(reason) => BackendError::Unavailable(reason),
            state => BackendError::Unavailable(format!("numeric module is not running ({state:?})")),
        }
    }
}

async fn init_backend() -> InitResult {
    let backend = tokio::task::spawn_blocking(|| {
        let backend = NdarrayBackend::new();
        CoreBackend::health(&backend).map(|_| backend)
    })
    .await
    .map_err(|err| BackendError::Start(err.to_string()))??;

    Ok(Box::new(backend))
}

#[derive(Debug)]
struct BackendThread(Option<JoinHandle<()>>);

impl BackendThread {
    fn new(
        init_receiver: oneshot::Receiver<InitResult>,
        mut backend_receiver: mpsc::Receiver<BackendCommand>,
        state_sender: watch::Sender<ModuleState>,
    ) -> Self {
        let handle = std::thread::spawn(move || {
            let _ = state_sender.send(ModuleState::Initializing);

            let mut backend = match init_receiver.blocking_recv() {
                Ok(Ok(backend)) => backend,
                Ok(Err(err)) => {
                    let _ = state_sender.send(ModuleState::Failed(err.to_string()));
                    return;
                }
                Err(_) => {
                    let _ = state_sender.send(ModuleState::Failed(
                        "initialization task was dropped".to_string(),
                    ));
                    return;
                }
            };
            let _ = state_sender.send(ModuleState::Ready);

            while let Some(cmd) = backend_receiver.blocking_recv() {
                let start = Instant::now();
                match cmd {
                    BackendCommand::Health(span, sender) => {
                        let _span = span.entered();
                        let _ = sender.send(backend.health());
                    }
                    BackendCommand::Contains(key, span, sender) => {
                        let _span = span.entered();
                        let _ = sender.send(backend.contains(&key));
                    }
                    BackendCommand::Insert(key, repr, span) => {
                        let _span = span.entered();
                        backend.insert(key, repr);
                    }
                    BackendCommand::MarkFailed(key, reason, span) => {
                        let _span = span.entered();
                        backend.mark_failed(key, reason);
                    }
                    BackendCommand::CalcSimilarities(request, span, sender) => {
                        let _span = span.entered();
                        let _ = sender.send(
                            backend
                                .calc_similarities(&request)
                                .map(|c| (c, start.elapsed())),
                        );
                    }
                };
            }
        });
        Self(Some(handle))
    }
}

impl Drop for BackendThread {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            let _ = handle.join();
        }
    }
}

enum BackendCommand {
    Health(Span, oneshot::Sender<Result<(), BackendError>>),
    Contains(String, Span, oneshot::Sender<bool>),
    Insert(String, Representation, Span),
    MarkFailed(String, String, Span),
    CalcSimilarities(
        SimilarityRequest,
        Span,
        #[allow(clippy::type_complexity)]
        oneshot::Sender<Result<(Comparison, Duration), BackendError>>,
    ),
}
