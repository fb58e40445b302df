use anyhow::Result;
use clap::Parser;
use repr_similarity_backend::DType;

/// App Configuration
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// The precision fetched representations are stored at.
    ///
    /// `float16` rounds every value through IEEE half precision, `float32` keeps them as-is.
    #[clap(default_value = "float16", long, env, value_enum)]
    dtype: DType,

    /// Allow `fetch_repr` to read `file://` urls from the local disk
    #[clap(long, env)]
    allow_file_urls: bool,

    /// The user agent sent with every representation download
    #[clap(long, env)]
    user_agent: Option<String>,

    /// The maximum amount of requests waiting to be dispatched.
    /// Once reached, no more input is read until the dispatcher catches up.
    #[clap(default_value = "512", long, env)]
    max_pending_requests: usize,

    /// Outputs the logs in JSON format (useful for telemetry)
    #[clap(long, env)]
    json_output: bool,

    // Whether or not to include the log trace through spans
    #[clap(long, env)]
    disable_spans: bool,

    /// The IP address the Prometheus exporter listens on
    #[clap(default_value = "0.0.0.0", long, env)]
    hostname: String,

    /// The Prometheus port to listen on. No exporter is started when unset.
    #[clap(long, env)]
    prometheus_port: Option<u16>,
}


fn main() -> Result<()> {
    // Pattern match configuration
    let args: Args = Args::parse();

    // Initialize logging
    repr_similarity_router::init_logging(args.json_output, args.disable_spans);

    tracing::info!("{args:?}");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let result = runtime.block_on(repr_similarity_router::run(
        args.dtype,
        args.allow_file_urls,
        args.user_agent,
        args.max_pending_requests,
        Some(args.hostname),
        args.prometheus_port,
    ));

    // A pending STDIN read never completes after a shutdown signal
    runtime.shutdown_background();
    result
}
