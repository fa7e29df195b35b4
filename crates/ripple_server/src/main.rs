#![forbid(unsafe_code)]

mod config;
mod server;
mod util;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context as _;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::server::auth::HmacTokenVerifier;
use crate::server::health::{self, HealthState};
use crate::server::hub::Hub;
use crate::server::store::SqlStore;
use crate::server::ws;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: ripple_server [--bind host:port]\n\
\n\
Options:\n\
\t--bind    WebSocket listen address (default from config, 127.0.0.1:8090)\n\
\t--config  Config file path (default: ~/.ripple/config.toml)\n\
\t--help    Show this help\n\
"
	);
	std::process::exit(2)
}

struct CliArgs {
	bind: Option<String>,
	config_path: Option<std::path::PathBuf>,
}

fn parse_args() -> CliArgs {
	let mut args = CliArgs {
		bind: None,
		config_path: None,
	};

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected host:port)");
					usage_and_exit();
				}
				args.bind = Some(v);
			}
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				args.config_path = Some(std::path::PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	args
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,ripple_server=debug".to_string());
	let registry = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let Some(endpoint) = endpoint else {
		registry.init();
		return;
	};

	use opentelemetry::trace::TracerProvider as _;
	use opentelemetry_otlp::WithExportConfig;

	let exporter = opentelemetry_otlp::SpanExporter::builder()
		.with_tonic()
		.with_endpoint(endpoint.clone())
		.build();
	let exporter = match exporter {
		Ok(exporter) => exporter,
		Err(e) => {
			registry.init();
			warn!(error = %e, "failed to initialize otlp tracing");
			return;
		}
	};

	let provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
		.with_batch_exporter(exporter)
		.build();
	let tracer = provider.tracer("ripple_server");
	opentelemetry::global::set_tracer_provider(provider);

	registry.with(tracing_opentelemetry::layer().with_tracer(tracer)).init();
	info!(endpoint = %endpoint, "otlp tracing enabled");
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};
	let addr = match bind.parse::<SocketAddr>() {
		Ok(addr) => addr,
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
			return;
		}
	};

	match metrics_exporter_prometheus::PrometheusBuilder::new()
		.with_http_listener(addr)
		.install()
	{
		Ok(()) => info!(%addr, "metrics exporter listening"),
		Err(e) => warn!(error = %e, "failed to start metrics exporter"),
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let args = parse_args();

	let config_path = match args.config_path {
		Some(path) => path,
		None => crate::config::default_config_path()?,
	};
	let mut server_cfg = crate::config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	if let Some(bind) = args.bind {
		server_cfg.listen = bind;
	}

	init_metrics(server_cfg.metrics_bind.as_deref());

	let Some(secret) = server_cfg.auth_hmac_secret.clone() else {
		return Err(anyhow::anyhow!(
			"auth_hmac_secret is required (config file or RIPPLE_AUTH_HMAC_SECRET)"
		));
	};
	let verifier = Arc::new(HmacTokenVerifier::new(secret));

	let store = SqlStore::connect(&server_cfg.database_url)
		.await
		.context("connect message store")?;
	info!("message store connected and migrated");

	let listen = server_cfg.listen.clone();
	let hub = Hub::new(server_cfg, Arc::new(store), verifier).await?;

	let listener = tokio::net::TcpListener::bind(&listen)
		.await
		.with_context(|| format!("bind {listen}"))?;
	info!(addr = %listener.local_addr()?, "chat hub listening");

	let health_state = HealthState::new();
	health_state.mark_ready();

	// chat, liveness and readiness share one listener
	let app = ws::router(Arc::clone(&hub)).merge(health::router(Arc::clone(&hub), health_state));
	let shutdown_hub = Arc::clone(&hub);
	axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
		.with_graceful_shutdown(async move {
			if tokio::signal::ctrl_c().await.is_err() {
				warn!("failed to listen for shutdown signal");
				std::future::pending::<()>().await;
			}
			info!("shutdown signal received");
			shutdown_hub.shutdown().await;
		})
		.await
		.context("serve websocket endpoint")?;

	Ok(())
}
