use tokio::sync::broadcast;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub fn setup_logging(log_level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))?
        .add_directive("tokio=info".parse()?)
        .add_directive("runtime=info".parse()?);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_thread_ids(true)
                .with_thread_names(true)
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .pretty(),
        )
        .with(filter)
        .try_init()?;
    Ok(())
}

/// Collect a datagram payload into text, dropping line terminators and NULs.
///
/// The vehicle pads replies with `\r\n` and sometimes trailing zero bytes;
/// none of those carry meaning on either the command or telemetry port.
pub fn strip_noise(payload: &[u8]) -> String {
    payload
        .iter()
        .filter(|b| !matches!(b, b'\r' | b'\n' | b'\0'))
        .map(|&b| b as char)
        .collect()
}

/// Resolve once shutdown is broadcast. A channel whose sender is gone never
/// fires, so an abandoned handle cannot abort work in progress.
pub async fn shutdown_requested(shutdown: &mut broadcast::Receiver<()>) {
    if let Err(broadcast::error::RecvError::Closed) = shutdown.recv().await {
        std::future::pending::<()>().await;
    }
}

/// Route `tracing` output through the test harness so it shows up on failure.
#[cfg(test)]
pub(crate) fn init_test_logging() {
    use once_cell::sync::Lazy;

    static TRACING: Lazy<()> = Lazy::new(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new("ecodrone=debug"))
            .with_test_writer()
            .try_init();
    });
    Lazy::force(&TRACING);
}
