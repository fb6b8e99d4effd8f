use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::info;

use crate::config::Config;
use crate::connection::{ConnectionController, ConnectionDeps, ConnectionSettings};
use crate::gateway_server::GatewayServer;
use crate::handler::build_handler;
use crate::identity::HmacTokenValidator;
use crate::registry::LocalChannelRegistry;
use crate::session_store::SessionStateStore;

pub struct GatewayRuntime {
    config: Config,
    server: GatewayServer,
}

impl GatewayRuntime {
    pub async fn new(config: Config) -> Result<Self> {
        let secret = config
            .identity
            .secret
            .as_deref()
            .context("identity.secret is required to run the gateway")?;
        let validator = Arc::new(HmacTokenValidator::new(secret)?);
        let store = SessionStateStore::open(&config.session.state_path)
            .await
            .with_context(|| {
                format!(
                    "failed opening session state at {}",
                    config.session.state_path.display()
                )
            })?;
        info!(
            "session state backend: {} ({})",
            store.backend_name(),
            config.session.state_path.display()
        );

        let registry = LocalChannelRegistry::new();
        let routes = config.gateway.route_table()?;
        let handler = build_handler(config.gateway.handler, &routes, registry.clone());
        let controller = ConnectionController::new(
            ConnectionDeps {
                validator,
                store: Arc::new(store),
                registry: Arc::new(registry.clone()),
                handler,
            },
            ConnectionSettings {
                outbound_capacity: config.gateway.outbound_queue_capacity,
                overflow: config.gateway.outbound_overflow,
            },
        );
        let server = GatewayServer::new(config.gateway.clone(), controller, registry);
        Ok(Self { config, server })
    }

    pub async fn run(self) -> Result<()> {
        self.run_until(async {
            if signal::ctrl_c().await.is_ok() {
                info!("received ctrl-c, shutting down");
            }
        })
        .await
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        info!(
            "starting gateway (bind={}, subject_header={}, handler={:?}, queue={}, overflow={:?}, max_connections={})",
            self.config.gateway.bind,
            self.config.gateway.subject_header,
            self.config.gateway.handler,
            self.config.gateway.outbound_queue_capacity,
            self.config.gateway.outbound_overflow,
            self.config.gateway.max_connections
        );
        self.server.run_until(shutdown).await
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use super::GatewayRuntime;
    use crate::config::Config;

    #[tokio::test]
    async fn runtime_requires_secret() {
        assert!(GatewayRuntime::new(Config::default()).await.is_err());
    }

    #[tokio::test]
    async fn runtime_stops_on_shutdown_signal() -> Result<()> {
        let mut config = Config::default();
        config.gateway.bind = "127.0.0.1:0".to_owned();
        config.identity.secret = Some("runtime-secret".to_owned());
        config.session.state_path = ":memory:".into();

        let runtime = GatewayRuntime::new(config).await?;
        tokio::time::timeout(
            std::time::Duration::from_secs(10),
            runtime.run_until(async {}),
        )
        .await??;
        Ok(())
    }
}
