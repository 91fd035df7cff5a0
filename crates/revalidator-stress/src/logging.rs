use std::collections::BTreeMap;
use std::env;
use std::future::Future;
use std::io::Write;
use std::net::{SocketAddr, UdpSocket};
use std::pin::Pin;
use std::sync::Arc;

use anyhow::{Context, Result};
use revalidator_cache::config::Metrics;
use revalidator_cache::{logging, metrics};

#[derive(Debug, Default)]
pub struct Config {
    pub backtraces: bool,
    pub sentry: bool,
    pub tracing: bool,
    /// Sends metrics to a local sink that discards them.
    pub metrics: bool,
    /// Reports metrics to the configured statsd host instead, if there is one.
    pub metrics_config: Metrics,
}

#[derive(Default)]
pub struct Guard {
    sentry: Option<sentry::ClientInitGuard>,
    pub udp_sink: Option<Pin<Box<dyn Future<Output = ()> + Send>>>,
}

/// Sets up sentry, tracing and metrics for the stresstest.
///
/// # Safety
/// This may modify the environment, so it must be called before any other threads are spawned.
pub unsafe fn init(config: Config) -> Result<Guard> {
    if config.backtraces {
        // SAFETY: The caller guarantees that no other threads are running yet.
        unsafe { env::set_var("RUST_BACKTRACE", "1") };
    }

    let mut guard = Guard::default();

    if config.sentry {
        // Envelopes are produced and serialized as usual, but never leave the process.
        let transport = |_: &sentry::ClientOptions| -> Arc<dyn sentry::Transport> {
            Arc::new(NoopTransport)
        };
        guard.sentry = Some(sentry::init((
            "https://some_token@127.0.0.1/1234",
            sentry::ClientOptions {
                release: sentry::release_name!(),
                traces_sample_rate: 1.0,
                transport: Some(Arc::new(transport)),
                ..Default::default()
            },
        )));
    }

    if config.tracing {
        // we want all the tracing machinery to be active, but not spam the console,
        // so redirect everything into the void:
        logging::init_json_logging("INFO", || NoopWriter);
    }

    let Metrics {
        statsd,
        prefix,
        custom_tags,
    } = config.metrics_config;
    if config.metrics || statsd.is_some() {
        let host = match statsd {
            Some(host) => host,
            None => {
                let addr = SocketAddr::from(([127, 0, 0, 1], 0));
                let listener = UdpSocket::bind(addr).context("failed to bind metrics sink")?;
                listener.set_nonblocking(true)?;
                let socket = listener.local_addr()?;

                guard.udp_sink = Some(Box::pin(async move {
                    let Ok(listener) = tokio::net::UdpSocket::from_std(listener) else {
                        return;
                    };
                    let mut buf = Vec::with_capacity(1024);
                    loop {
                        buf.clear();
                        if listener.recv_buf(&mut buf).await.is_err() {
                            break;
                        }
                    }
                }));

                format!("127.0.0.1:{}", socket.port())
            }
        };

        // have some default tags, just to be closer to the real world config
        let mut tags = BTreeMap::new();
        tags.insert("host".into(), "stresstest".into());
        tags.insert("env".into(), "stresstest".into());
        tags.extend(custom_tags);

        metrics::configure_statsd(&prefix, host, tags)?;
    }

    Ok(guard)
}

struct NoopTransport;
impl sentry::Transport for NoopTransport {
    fn send_envelope(&self, envelope: sentry::Envelope) {
        std::hint::black_box(envelope);
    }
}

struct NoopWriter;
impl Write for NoopWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        // try to prevent the compiler from optimizing away all the formatting code:
        let buf = std::hint::black_box(buf);

        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
