//! Metrics collection and the Prometheus scrape endpoint.

use std::net::SocketAddr;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response};
use lazy_static::lazy_static;
use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};

lazy_static! {
    /// Global Prometheus registry instance
    pub static ref REGISTRY_INSTANCE: Registry = Registry::new();

    /// Requests seen by the RPC server, labelled by command
    pub static ref REQ_COUNTER_VEC: CounterVec =
        CounterVec::new(Opts::new("request_counter", "request counter"), &["method"]).unwrap();

    /// Time spent applying committed entries, labelled by command
    pub static ref APPLY_HISTOGRAM_VEC: HistogramVec = HistogramVec::new(
        HistogramOpts::new("apply_cost", "apply cost"),
        &["method"]
    )
    .unwrap();
}

/// Registers all collectors with the global registry.
pub fn init_registry() {
    let _ = REGISTRY_INSTANCE.register(Box::new(REQ_COUNTER_VEC.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(APPLY_HISTOGRAM_VEC.clone()));
}

/// Serves the text-format scrape endpoint in the background.
pub fn serve(addr: SocketAddr) {
    let make_svc = make_service_fn(move |_| {
        let registry = REGISTRY_INSTANCE.clone();
        async move {
            Ok::<_, hyper::Error>(service_fn(move |_: Request<Body>| {
                let registry = registry.clone();
                async move {
                    let encoder = TextEncoder::new();
                    let metric_families = registry.gather();
                    let mut buffer = Vec::new();
                    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
                        log::error!("failed to encode metrics: {e}");
                    }
                    Ok::<_, hyper::Error>(Response::new(Body::from(buffer)))
                }
            }))
        }
    });
    match hyper::Server::try_bind(&addr) {
        Ok(builder) => {
            let server = builder.serve(make_svc);
            tokio::spawn(async move {
                if let Err(e) = server.await {
                    log::error!("metrics server error: {e}");
                }
            });
            log::info!("metrics server started on {addr}");
        }
        Err(e) => log::error!("metrics server failed to bind {addr}: {e}"),
    }
}
