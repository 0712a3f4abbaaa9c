// src/server.rs
use crate::config::ServerConfig;
use crate::error::ServeResult;
use crate::metrics::ServerMetrics;
use crate::reactor::Reactor;
use crate::syscalls;
use std::net::SocketAddr;
use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Cloneable switch that stops a running [`Server`].
///
/// The reactor notices within one poll timeout.
#[derive(Debug, Clone, Default)]
pub struct ShutdownHandle(Arc<AtomicBool>);

impl ShutdownHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shutdown(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_shutdown(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

pub struct Server {
    config: ServerConfig,
    listener: OwnedFd,
    local_addr: SocketAddr,
    shutdown: ShutdownHandle,
    metrics: Arc<ServerMetrics>,
}

impl Server {
    /// Validate the config and start listening. Nothing is served until
    /// [`Server::serve`].
    pub fn bind(config: ServerConfig) -> ServeResult<Self> {
        config.validate()?;
        let addr = config.socket_addr()?;
        let listener = syscalls::create_listen_socket(addr, config.backlog)?;
        let local_addr = syscalls::local_addr(&listener)?;

        Ok(Self {
            config,
            listener,
            local_addr,
            shutdown: ShutdownHandle::new(),
            metrics: Arc::new(ServerMetrics::new()),
        })
    }

    /// Bound address; useful after binding port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Run the reactor on the calling thread until shut down.
    pub fn serve(self) -> ServeResult<()> {
        let Server {
            config,
            listener,
            local_addr,
            shutdown,
            metrics,
        } = self;

        let reporter = match config.metrics_interval_secs {
            0 => None,
            secs => spawn_reporter(
                Duration::from_secs(secs),
                Arc::clone(&metrics),
                shutdown.clone(),
            ),
        };

        tracing::info!(
            addr = %local_addr,
            root = %config.doc_root.display(),
            workers = config.workers,
            max_connections = config.max_connections,
            "serving"
        );

        let result = Reactor::new(listener, &config, Arc::clone(&metrics), Arc::clone(&shutdown.0))
            .and_then(|mut reactor| reactor.run());

        // Stop the reporter even when the reactor failed.
        shutdown.shutdown();
        if let Some(reporter) = reporter {
            let _ = reporter.join();
        }

        let totals = metrics.snapshot();
        tracing::info!(
            requests = totals.requests,
            bytes_sent = totals.bytes_sent,
            rejected = totals.rejected_conns,
            "server stopped"
        );
        result
    }
}

fn spawn_reporter(
    interval: Duration,
    metrics: Arc<ServerMetrics>,
    shutdown: ShutdownHandle,
) -> Option<thread::JoinHandle<()>> {
    let spawned = thread::Builder::new()
        .name("cadenza-metrics".to_string())
        .spawn(move || {
            let mut last = Instant::now();
            while !shutdown.is_shutdown() {
                thread::sleep(Duration::from_millis(100));
                if last.elapsed() < interval {
                    continue;
                }
                last = Instant::now();
                let m = metrics.snapshot();
                tracing::info!(
                    active = m.active_conns,
                    requests = m.requests,
                    bytes_sent = m.bytes_sent,
                    ok = m.responses_2xx,
                    client_errors = m.responses_4xx,
                    server_errors = m.responses_5xx,
                    rejected = m.rejected_conns,
                    "metrics"
                );
            }
        });
    match spawned {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!(error = %e, "failed to start metrics reporter");
            None
        }
    }
}
