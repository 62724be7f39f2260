use std::time::Duration;

use error_stack::Report;
use error_stack::ResultExt;
use poem::get;
use poem::handler;
use poem::http::StatusCode;
use poem::listener::TcpListener;
use poem::middleware::Tracing;
use poem::web::Data;
use poem::Endpoint;
use poem::EndpointExt;
use poem::Response;
use poem::Route;
use poem::Server;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;

use super::MetricsError;
use super::SharedMetrics;

const TEXT_FORMAT: &str = "text/plain; version=0.0.4; charset=utf-8";
/// How long in-flight scrapes may take once shutdown starts.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[handler]
fn metrics_handler(Data(metrics): Data<&SharedMetrics>) -> Response {
    let snapshot = metrics.load();
    match snapshot.render() {
        Ok(body) => Response::builder().content_type(TEXT_FORMAT).body(body),
        Err(e) => {
            error!("Failed to render metrics: {e:?}");
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .finish()
        }
    }
}

#[handler]
fn healthz() -> &'static str {
    "ok"
}

/// Routes served by the metrics listener.
pub fn routes(metrics: SharedMetrics) -> impl Endpoint {
    Route::new()
        .at("/metrics", get(metrics_handler))
        .at("/healthz", get(healthz))
        .data(metrics)
        .with(Tracing)
}

/// Pull endpoint serving the current [`SharedMetrics`] snapshot.
pub struct MetricsServer {
    listen_addr: String,
    metrics: SharedMetrics,
}

impl MetricsServer {
    pub fn new(listen_addr: impl Into<String>, metrics: SharedMetrics) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            metrics,
        }
    }

    /// Serves until `token` is cancelled, then lets in-flight scrapes finish.
    ///
    /// # Errors
    ///
    /// - [`MetricsError::Server`] if the listener cannot bind or the server fails
    #[tracing::instrument(skip(self, token), fields(listen_addr = %self.listen_addr))]
    pub async fn run(self, token: CancellationToken) -> Result<(), Report<MetricsError>> {
        info!("Prometheus metrics exposed on {}", self.listen_addr);

        let listener = TcpListener::bind(self.listen_addr.clone());
        Server::new(listener)
            .run_with_graceful_shutdown(
                routes(self.metrics),
                async move { token.cancelled().await },
                Some(SHUTDOWN_GRACE),
            )
            .await
            .change_context(MetricsError::Server {
                message: format!("failed to serve on {}", self.listen_addr),
            })?;

        info!("Metrics server stopped");
        Ok(())
    }
}
