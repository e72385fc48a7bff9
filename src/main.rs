use shareyourfiles::args::Args;
use shareyourfiles::daemon;
use shareyourfiles::utils::paths;
use shareyourfiles::utils::sos::SignalOfStop;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::load();

    let filter = match args.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_writer(std::io::stderr)
        .init();

    paths::init(args.conf.as_deref(), args.data.as_deref());

    let sos = SignalOfStop::new();
    let sos_clone = sos.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        sos_clone.cancel();
    });

    daemon::run(args, sos).await
}
