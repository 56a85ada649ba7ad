use super::exporter::encode_registry;
use crate::{NetInsightError, Result};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::Registry;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// HTTP endpoint serving `/metrics` and `/healthz`
pub struct MetricsServer {
    local_addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl MetricsServer {
    /// Bind `addr` and serve until `cancel` fires
    pub async fn start(
        addr: SocketAddr,
        registry: Registry,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            NetInsightError::MetricsError(format!("failed to bind {}: {}", addr, e))
        })?;
        let local_addr = listener.local_addr()?;

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(registry);

        let handle = tokio::spawn(async move {
            info!(addr = %local_addr, "Metrics server started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { cancel.cancelled().await })
                .await;

            if let Err(e) = result {
                error!(error = %e, "Metrics server error");
            }
            info!("Metrics server stopped");
        });

        Ok(Self { local_addr, handle })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for the server to finish shutting down
    pub async fn join(self) {
        if let Err(e) = self.handle.await {
            error!(error = %e, "Metrics server task failed");
        }
    }
}

async fn metrics_handler(State(registry): State<Registry>) -> impl IntoResponse {
    match encode_registry(&registry) {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Encoding metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "encoding error").into_response()
        }
    }
}

async fn healthz_handler() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn get(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
            path
        );
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_serves_metrics_and_health() {
        let registry = Registry::new();
        let polls = prometheus::IntCounter::new("netinsight_test_polls_total", "test").unwrap();
        registry.register(Box::new(polls.clone())).unwrap();
        polls.inc();

        let cancel = CancellationToken::new();
        let server = MetricsServer::start("127.0.0.1:0".parse().unwrap(), registry, cancel.clone())
            .await
            .unwrap();
        let addr = server.local_addr();

        let health = get(addr, "/healthz").await;
        assert!(health.starts_with("HTTP/1.1 200"));
        assert!(health.ends_with("ok"));

        let metrics = get(addr, "/metrics").await;
        assert!(metrics.contains("netinsight_test_polls_total 1"));

        cancel.cancel();
        server.join().await;
    }
}
