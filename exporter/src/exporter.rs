//! HTTP exposition
//!
//! Serves the Prometheus text format on the metrics path, a raw dump of
//! every table on `/tables` and a small index page on `/`.

use std::{fmt::Write as _, future::Future, net::SocketAddr, sync::Arc};

use anyhow::{bail, Context, Result};
use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Router,
};
use log::{error, info};
use prometheus::{
    core::{Collector, Desc},
    proto::MetricFamily,
    Encoder, Registry, TextEncoder,
};
use serde::Deserialize;
use tokio::signal::unix::{signal, SignalKind};

use crate::{collector::Exporter, runtime::Runtime, types::TableDump};

/// Registers a shared [`Exporter`] with a prometheus registry
struct SharedCollector<R: Runtime>(Arc<Exporter<R>>);

impl<R: Runtime> Collector for SharedCollector<R> {
    fn desc(&self) -> Vec<&Desc> {
        self.0.desc()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        self.0.collect()
    }
}

/// State shared by the HTTP handlers
pub struct AppState<R: Runtime> {
    registry: Registry,
    exporter: Arc<Exporter<R>>,
    metrics_path: String,
}

impl<R: Runtime + 'static> AppState<R> {
    /// Register `exporter` with a fresh registry
    pub fn new(exporter: Arc<Exporter<R>>, metrics_path: &str) -> Result<Self> {
        if !metrics_path.starts_with('/') || metrics_path == "/tables" {
            bail!("Invalid metrics path {:?}", metrics_path);
        }

        let registry = Registry::new();
        registry
            .register(Box::new(SharedCollector(Arc::clone(&exporter))))
            .context("Failed to register exporter")?;

        Ok(Self {
            registry,
            exporter,
            metrics_path: metrics_path.to_string(),
        })
    }
}

/// Build the HTTP router
pub fn router<R: Runtime + 'static>(state: Arc<AppState<R>>) -> Router {
    let mut router = Router::new()
        .route(&state.metrics_path, get(metrics_handler::<R>))
        .route("/tables", get(tables_handler::<R>));
    if state.metrics_path != "/" {
        router = router.route("/", get(index_handler::<R>));
    }
    router.with_state(state)
}

/// Serve until `shutdown` completes
///
/// # Arguments
///
/// * `state` - Registry and exporter to serve
/// * `listen_address` - Address to bind
/// * `shutdown` - Future completing when the server should stop
pub async fn serve<R, F>(
    state: Arc<AppState<R>>,
    listen_address: SocketAddr,
    shutdown: F,
) -> Result<()>
where
    R: Runtime + 'static,
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(listen_address)
        .await
        .with_context(|| format!("Failed to bind {}", listen_address))?;
    info!(
        "Serving metrics on http://{}{}",
        listen_address, state.metrics_path
    );

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP server failed")
}

/// Future completing on SIGINT or SIGTERM.
///
/// The handlers are installed when this is called, so a signal arriving
/// before the future is first polled is not lost.
pub fn shutdown_signal() -> Result<impl Future<Output = ()>> {
    let mut interrupt =
        signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let mut terminate =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

    Ok(async move {
        tokio::select! {
            _ = interrupt.recv() => info!("Interrupted, shutting down..."),
            _ = terminate.recv() => info!("Terminated, shutting down..."),
        }
    })
}

/// Encode every metric of `registry` in the text format
pub fn render_metrics(registry: &Registry) -> Result<Vec<u8>> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&registry.gather(), &mut buffer)
        .context("Failed to encode metrics")?;
    Ok(buffer)
}

/// Plain-text rendering of a table dump
pub fn render_tables(dumps: &[TableDump]) -> String {
    let mut out = String::new();
    for dump in dumps {
        let _ = writeln!(
            out,
            "# program {} pid {} table {}",
            dump.program, dump.pid, dump.table
        );
        for row in &dump.rows {
            let _ = writeln!(out, "{} ({}) -> {}", row.raw, row.labels.join(", "), row.value);
        }
    }
    out
}

fn internal_error(e: anyhow::Error) -> Response {
    error!("{:#}", e);
    (StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}\n", e)).into_response()
}

async fn metrics_handler<R: Runtime + 'static>(State(state): State<Arc<AppState<R>>>) -> Response {
    // Table scans are blocking syscalls
    let result = tokio::task::spawn_blocking(move || render_metrics(&state.registry)).await;

    match result {
        Ok(Ok(body)) => (
            [(header::CONTENT_TYPE, TextEncoder::new().format_type().to_string())],
            body,
        )
            .into_response(),
        Ok(Err(e)) => internal_error(e),
        Err(e) => internal_error(anyhow::Error::new(e).context("Metrics collection panicked")),
    }
}

#[derive(Deserialize, Debug, Default)]
struct TablesQuery {
    format: Option<String>,
}

async fn tables_handler<R: Runtime + 'static>(
    State(state): State<Arc<AppState<R>>>,
    Query(query): Query<TablesQuery>,
) -> Response {
    let result = tokio::task::spawn_blocking(move || state.exporter.table_dump()).await;

    let dumps = match result {
        Ok(Ok(dumps)) => dumps,
        Ok(Err(e)) => return internal_error(e),
        Err(e) => return internal_error(anyhow::Error::new(e).context("Table dump panicked")),
    };

    match query.format.as_deref() {
        Some("json") => match serde_json::to_string_pretty(&dumps) {
            Ok(json) => ([(header::CONTENT_TYPE, "application/json")], json).into_response(),
            Err(e) => internal_error(e.into()),
        },
        _ => render_tables(&dumps).into_response(),
    }
}

async fn index_handler<R: Runtime + 'static>(State(state): State<Arc<AppState<R>>>) -> Html<String> {
    Html(format!(
        "<html><head><title>USDT Exporter</title></head><body>\
         <h1>USDT Exporter</h1>\
         <p><a href=\"{0}\">Metrics</a></p>\
         <p><a href=\"/tables\">Tables</a></p>\
         </body></html>",
        state.metrics_path
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::Config,
        process::{tests::fake_process, ProcessLocator},
        testing::{StubConfig, StubRuntime},
        types::TableEntry,
    };
    use std::collections::HashMap;

    const CONFIG: &str = r#"
programs:
  - name: gc
    usdt:
      "gc__start": trace_gc
    attachment:
      binary_name: python3
    metrics:
      counters:
        - name: gc_total
          help: Garbage collections
          table: gc_counts
          labels:
            - name: gen
              size: 4
              decoders: [{ name: uint }]
"#;

    fn state(tables: HashMap<String, Vec<TableEntry>>) -> Arc<AppState<StubRuntime>> {
        let root = tempfile::tempdir().unwrap();
        fake_process(root.path(), 10, "python3", "/usr/bin/python3");

        let runtime = Arc::new(StubRuntime::new(StubConfig {
            tables,
            ..Default::default()
        }));
        let mut exporter = Exporter::new(
            Config::from_yaml(CONFIG).unwrap(),
            runtime,
            ProcessLocator::new(root.path()),
        )
        .unwrap();
        exporter.attach().unwrap();

        Arc::new(AppState::new(Arc::new(exporter), "/metrics").unwrap())
    }

    fn gc_counts() -> HashMap<String, Vec<TableEntry>> {
        HashMap::from([(
            "gc_counts".to_string(),
            vec![
                TableEntry {
                    key: 0u32.to_ne_bytes().to_vec(),
                    value: 3,
                },
                TableEntry {
                    key: 2u32.to_ne_bytes().to_vec(),
                    value: 1,
                },
            ],
        )])
    }

    #[test]
    fn test_render_metrics() {
        let state = state(gc_counts());

        let text = String::from_utf8(render_metrics(&state.registry).unwrap()).unwrap();

        assert!(text.contains("# TYPE userspace_exporter_gc_total counter"));
        assert!(text.contains("userspace_exporter_gc_total{gen=\"0\",pid=\"10\"} 3"));
        assert!(text.contains("userspace_exporter_gc_total{gen=\"2\",pid=\"10\"} 1"));
        assert!(text.contains("userspace_exporter_enabled_programs{name=\"gc\",pid=\"10\"} 1"));
    }

    #[test]
    fn test_render_metrics_repeated_key() {
        let entry = TableEntry {
            key: 1u32.to_ne_bytes().to_vec(),
            value: 3,
        };
        let state = state(HashMap::from([(
            "gc_counts".to_string(),
            vec![entry.clone(), entry],
        )]));

        let text = String::from_utf8(render_metrics(&state.registry).unwrap()).unwrap();

        let series = "userspace_exporter_gc_total{gen=\"1\",pid=\"10\"} 3";
        assert_eq!(text.matches(series).count(), 1);
    }

    #[test]
    fn test_render_tables() {
        let state = state(gc_counts());

        let text = render_tables(&state.exporter.table_dump().unwrap());

        assert!(text.contains("# program gc pid 10 table gc_counts"));
        assert!(text.contains("00000000 (0) -> 3"));
    }

    #[tokio::test]
    async fn test_metrics_handler() {
        let state = state(gc_counts());

        let response = metrics_handler(State(state)).await;

        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers()[header::CONTENT_TYPE].to_str().unwrap();
        assert!(content_type.starts_with("text/plain"));
    }

    #[tokio::test]
    async fn test_tables_handler_error() {
        // No gc_counts table in the module
        let state = state(HashMap::new());

        let response = tables_handler(State(state), Query(TablesQuery::default())).await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_tables_handler_json() {
        let state = state(gc_counts());

        let response = tables_handler(
            State(state),
            Query(TablesQuery {
                format: Some("json".to_string()),
            }),
        )
        .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/json"
        );
    }

    #[tokio::test]
    async fn test_shutdown_on_sigterm() {
        let shutdown = shutdown_signal().unwrap();

        // SAFETY: the SIGTERM handler is installed, so the process survives
        unsafe {
            libc::kill(libc::getpid(), libc::SIGTERM);
        }

        tokio::time::timeout(std::time::Duration::from_secs(5), shutdown)
            .await
            .unwrap();
    }

    #[test]
    fn test_invalid_metrics_path() {
        let runtime = Arc::new(StubRuntime::new(StubConfig::default()));
        let exporter = Arc::new(
            Exporter::new(
                Config::from_yaml(CONFIG).unwrap(),
                runtime,
                ProcessLocator::default(),
            )
            .unwrap(),
        );

        assert!(AppState::new(Arc::clone(&exporter), "metrics").is_err());
        assert!(AppState::new(exporter, "/tables").is_err());
    }

    #[test]
    fn test_router_builds() {
        let state = state(gc_counts());
        let _ = router(state);

        // A metrics path on the root replaces the index page
        let root = state_with_path("/");
        let _ = router(root);
    }

    fn state_with_path(path: &str) -> Arc<AppState<StubRuntime>> {
        let runtime = Arc::new(StubRuntime::new(StubConfig::default()));
        let exporter = Exporter::new(
            Config::from_yaml(CONFIG).unwrap(),
            runtime,
            ProcessLocator::default(),
        )
        .unwrap();
        Arc::new(AppState::new(Arc::new(exporter), path).unwrap())
    }
}
