//! Prometheus instruments and the scrape endpoint.
//!
//! All instruments live under the `rabbitrun` namespace and are lazily
//! registered with the default registry on first use.

use std::net::SocketAddr;
use std::sync::LazyLock;
use std::time::Duration;

use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse};
use axum::routing::get;
use axum::Router;
use prometheus::{Histogram, IntCounterVec, TextEncoder};
use tower_http::timeout::TimeoutLayer;
use tracing::info;

/// Namespace of all instruments.
const NAMESPACE: &str = "rabbitrun";

/// Timeout applied to every scrape request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Total number of child processes executed, by exit code.
pub static PROCESS_COUNTER: LazyLock<IntCounterVec> = LazyLock::new(|| {
    prometheus::register_int_counter_vec!(
        prometheus::opts!(
            "process_total",
            "The total number of processes executed."
        )
        .namespace(NAMESPACE),
        &["exit_code"]
    )
    .expect("registering process counter")
});

/// Time spent processing a message, from build to child exit.
pub static PROCESS_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    prometheus::register_histogram!(prometheus::histogram_opts!(
        "process_duration_seconds",
        "The time spent by the consumer to process the message."
    )
    .namespace(NAMESPACE))
    .expect("registering process duration histogram")
});

/// Time from publishing to finished processing. Only observed for messages
/// carrying a timestamp.
pub static MESSAGE_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    prometheus::register_histogram!(prometheus::histogram_opts!(
        "message_duration_seconds",
        "The time spent from publishing to finished processing the message."
    )
    .namespace(NAMESPACE))
    .expect("registering message duration histogram")
});

/// Errors raised by the metrics endpoint.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("failed to bind metrics listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("failed to serve metrics: {0}")]
    Serve(#[source] std::io::Error),
}

/// Serve the scrape endpoint at `path` plus an index page linking to it.
pub async fn serve(addr: SocketAddr, path: String) -> Result<(), MetricsError> {
    // Touch the instruments so an idle bridge still exposes them.
    LazyLock::force(&PROCESS_COUNTER);
    LazyLock::force(&PROCESS_DURATION);
    LazyLock::force(&MESSAGE_DURATION);

    let index = Html(format!(
        "<html>\n<head><title>rabbitrun</title></head>\n<body>\n<h1>rabbitrun</h1>\n\
         <p><a href='{path}'>Metrics</a></p>\n</body>\n</html>"
    ));

    let app = Router::new()
        .route(&path, get(scrape))
        .route("/", get(move || async move { index }))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| MetricsError::Bind { addr, source })?;

    info!(address = %addr, path = %path, "Serving metrics");

    axum::serve(listener, app).await.map_err(MetricsError::Serve)
}

async fn scrape() -> impl IntoResponse {
    match TextEncoder::new().encode_to_string(&prometheus::gather()) {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instruments_register_under_the_namespace() {
        PROCESS_COUNTER.with_label_values(&["0"]).inc();
        PROCESS_DURATION.observe(0.1);
        MESSAGE_DURATION.observe(1.0);

        let rendered = TextEncoder::new()
            .encode_to_string(&prometheus::gather())
            .unwrap();

        assert!(rendered.contains("rabbitrun_process_total{exit_code=\"0\"}"));
        assert!(rendered.contains("rabbitrun_process_duration_seconds"));
        assert!(rendered.contains("rabbitrun_message_duration_seconds"));
    }

    #[tokio::test]
    async fn scrape_endpoint_serves_the_registry() {
        PROCESS_COUNTER.with_label_values(&["0"]).inc();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        tokio::spawn(serve(addr, "/metrics".to_owned()));
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        tokio::io::AsyncWriteExt::write_all(
            &mut stream,
            b"GET /metrics HTTP/1.0\r\nHost: localhost\r\n\r\n",
        )
        .await
        .unwrap();

        let mut response = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut stream, &mut response)
            .await
            .unwrap();
        let response = String::from_utf8_lossy(&response);

        assert!(response.contains("200 OK"));
        assert!(response.contains("rabbitrun_process_total"));
    }
}
