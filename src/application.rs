//! Application wiring and lifecycle
//!
//! Builds the capture pipeline from configuration, serves it over HTTP and
//! coordinates graceful shutdown: cancel the shared token, drain the
//! background task tracker, then release the Forwarder's connections and the
//! database handle.

use crate::capture::handler::{capture_handler, CaptureDispatcher, CaptureService};
use crate::capture::rules::ResponseRuleSet;
use crate::capture::sink::{LogSink, RecordSink};
use crate::capture::types::{BodySizeLimit, LiveCapacity};
use crate::config::Settings;
use crate::forward::forwarder::MaxConcurrentForwards;
use crate::forward::{ForwardOptions, Forwarder, PathStrategy, TargetUrl};
use crate::store::{LiveStore, PersistentStore, RetentionPolicy};
use crate::{Error, Result};
use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_http::trace::TraceLayer;
use tracing::{info, instrument, warn};

/// Main application struct that coordinates all components
pub struct Application {
    settings: Settings,
    router: Router,
    persistent: Arc<PersistentStore>,
    live: Arc<LiveStore>,
    forwarder: Arc<Forwarder>,
    sinks: Vec<Arc<dyn RecordSink>>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    dispatcher: JoinHandle<()>,
}

impl Application {
    #[instrument]
    pub async fn new() -> Result<Self> {
        Self::with_settings(Settings::new()?).await
    }

    /// Wire up stores, forwarder and ingress from resolved settings.
    /// Additional recorder sinks (e.g. the web console) attach alongside the
    /// console printer.
    pub async fn with_settings(settings: Settings) -> Result<Self> {
        Self::with_settings_and_sinks(settings, Vec::new()).await
    }

    pub async fn with_settings_and_sinks(
        settings: Settings,
        extra_sinks: Vec<Arc<dyn RecordSink>>,
    ) -> Result<Self> {
        let retention =
            RetentionPolicy::from_raw(settings.storage.retention_hours, settings.storage.max_records);
        info!(path = %settings.storage.database_path, "Opening persistent store");
        let persistent =
            Arc::new(PersistentStore::connect(&settings.storage.database_path, retention).await?);

        let capacity = LiveCapacity::try_new(settings.storage.live_capacity.max(1))
            .map_err(|e| Error::application(format!("Invalid live capacity: {e}")))?;
        let live = Arc::new(LiveStore::new(capacity));

        let mut targets = Vec::with_capacity(settings.forward.targets.len());
        for raw in &settings.forward.targets {
            match TargetUrl::try_new(raw.clone()) {
                Ok(target) => targets.push(target),
                Err(e) => warn!(target = %raw, error = %e, "Ignoring invalid forward target"),
            }
        }

        let max_concurrent = MaxConcurrentForwards::try_new(settings.forward.max_concurrent.max(1))
            .map_err(|e| Error::application(format!("Invalid forward concurrency: {e}")))?;
        let forwarder = Arc::new(Forwarder::new(ForwardOptions {
            retries: settings.forward.retries,
            max_concurrent,
            request_timeout: Duration::from_secs(settings.forward.timeout_secs),
            header_blacklist: settings.forward.header_blacklist.clone(),
            header_whitelist: settings.forward.header_whitelist.clone(),
            path_strategy: PathStrategy::from_settings(&settings.forward.path),
        }));

        let rules = ResponseRuleSet::from_settings(&settings.responses);
        let (service, rx) =
            CaptureService::new(BodySizeLimit::from(settings.capture.max_body_bytes), rules);

        let tracker = TaskTracker::new();
        let shutdown = CancellationToken::new();
        let mut sinks: Vec<Arc<dyn RecordSink>> = vec![Arc::new(LogSink)];
        sinks.extend(extra_sinks);

        let dispatcher = CaptureDispatcher::new(
            rx,
            Arc::clone(&persistent),
            Arc::clone(&live),
            sinks.clone(),
            Arc::clone(&forwarder),
            targets,
            tracker.clone(),
            shutdown.clone(),
        );
        let dispatcher = tokio::spawn(dispatcher.run());

        let router = build_router(Arc::new(service), &settings.server.path_prefix);

        Ok(Self {
            settings,
            router,
            persistent,
            live,
            forwarder,
            sinks,
            tracker,
            shutdown,
            dispatcher,
        })
    }

    #[instrument(skip(self))]
    pub async fn run(self) -> Result<()> {
        let addr: SocketAddr = self
            .settings
            .listen_addr()
            .parse()
            .map_err(|_| Error::InvalidListenAddr(self.settings.listen_addr()))?;

        info!(
            %addr,
            prefix = %self.settings.server.path_prefix,
            targets = self.settings.forward.targets.len(),
            "Starting ReqTap server"
        );
        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(
            listener,
            self.router
                .clone()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await?;

        self.shutdown().await;
        Ok(())
    }

    /// Drain background work and release resources, in dependency order
    pub async fn shutdown(self) {
        info!("Shutting down; draining background capture tasks");
        self.shutdown.cancel();
        let _ = self.dispatcher.await;
        self.tracker.close();
        self.tracker.wait().await;
        for sink in &self.sinks {
            sink.close().await;
        }
        self.forwarder.close().await;
        self.persistent.close().await;
        info!("Shutdown complete");
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn router(&self) -> Router {
        self.router.clone()
    }

    pub fn live_store(&self) -> Arc<LiveStore> {
        Arc::clone(&self.live)
    }

    pub fn persistent_store(&self) -> Arc<PersistentStore> {
        Arc::clone(&self.persistent)
    }
}

fn build_router(service: Arc<CaptureService>, path_prefix: &str) -> Router {
    let capture = Router::new().fallback(capture_handler).with_state(service);
    let router = if path_prefix.is_empty() || path_prefix == "/" {
        capture
    } else {
        Router::new().nest(path_prefix, capture)
    };
    router
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
}

/// Health check handler
async fn health_handler() -> &'static str {
    "OK"
}

async fn shutdown_signal() {
    // Failure to listen for ctrl-c leaves shutdown to process signals only
    if tokio::signal::ctrl_c().await.is_err() {
        warn!("Failed to install ctrl-c handler");
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_settings(dir: &tempfile::TempDir) -> Settings {
        let mut settings = Settings::new().expect("settings load");
        settings.storage.database_path = dir
            .path()
            .join("app.db")
            .to_str()
            .expect("utf-8 path")
            .to_string();
        settings
    }

    #[tokio::test]
    async fn test_application_can_be_created_and_shut_down() {
        let dir = tempfile::tempdir().unwrap();
        let app = Application::with_settings(test_settings(&dir))
            .await
            .expect("application builds");
        assert!(app.settings().server.port > 0);
        app.shutdown().await;
    }

    #[tokio::test]
    async fn test_attached_sinks_are_closed_on_shutdown() {
        use crate::capture::types::StoredRequest;
        use std::sync::atomic::{AtomicBool, Ordering};

        struct TrackingSink {
            closed: AtomicBool,
        }

        #[async_trait::async_trait]
        impl RecordSink for TrackingSink {
            async fn record(&self, _stored: &StoredRequest) {}

            async fn close(&self) {
                self.closed.store(true, Ordering::SeqCst);
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(TrackingSink {
            closed: AtomicBool::new(false),
        });
        let sinks: Vec<Arc<dyn RecordSink>> = vec![sink.clone()];
        let app = Application::with_settings_and_sinks(test_settings(&dir), sinks)
            .await
            .expect("application builds");
        app.shutdown().await;
        assert!(sink.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_invalid_forward_targets_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = test_settings(&dir);
        settings.forward.targets = vec!["not-a-url".to_string()];
        let app = Application::with_settings(settings)
            .await
            .expect("application still builds");
        app.shutdown().await;
    }
}
