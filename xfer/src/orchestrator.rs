//! Top-level flow of one `xfer` invocation.
//!
//! With a target, both locations are connected and handed to [`common::transfer::Transfer`].
//! Without one, the source is exposed over HTTP until the process is interrupted.

use anyhow::{Context, anyhow};
use common::address::Endpoint;
use common::client::Client;
use common::file::File;
use common::transfer::{Settings, Summary, Transfer};
use remote::ConnectOptions;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::location;

#[derive(Clone, Debug)]
pub struct Job {
    pub source: Endpoint,
    pub target: Option<Endpoint>,
    /// Address the passive server binds to when there is no target.
    pub server: Option<String>,
    pub connect: ConnectOptions,
    pub settings: Settings,
    /// Append the partial summary to the error of a failed run.
    pub summary_on_error: bool,
}

impl Job {
    /// Validates and resolves the command line locations.
    pub fn new(
        source: &str,
        target: Option<&str>,
        server: Option<&str>,
        connect: ConnectOptions,
        settings: Settings,
    ) -> anyhow::Result<Self> {
        location::validate_source(source)?;
        let source = location::resolve(source)?;
        let target = match target {
            Some(target) => {
                if server.is_some() {
                    return Err(anyhow!(
                        "--server starts the passive serving mode and cannot be combined with a target"
                    ));
                }
                location::validate_target(target)?;
                Some(location::resolve(target)?)
            }
            None => None,
        };
        Ok(Self {
            source,
            target,
            server: server.map(str::to_string),
            connect,
            settings,
            summary_on_error: false,
        })
    }

    /// Transfers once, or serves until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) -> anyhow::Result<Summary> {
        match &self.target {
            Some(target) => self.transfer(target, cancel).await,
            None => {
                self.serve(cancel).await?;
                Ok(Summary::default())
            }
        }
    }

    async fn connect(&self, endpoint: &Endpoint) -> anyhow::Result<Arc<dyn Client>> {
        remote::connect(endpoint, &self.connect)
            .await
            .with_context(|| format!("failed to connect to {endpoint}"))
    }

    #[instrument(skip(self, cancel))]
    async fn transfer(&self, target: &Endpoint, cancel: CancellationToken) -> anyhow::Result<Summary> {
        let source_client = self.connect(&self.source).await?;
        let target_client = match self.connect(target).await {
            Ok(client) => client,
            Err(error) => {
                close(&source_client).await;
                return Err(error);
            }
        };
        let result = self
            .transfer_between(source_client.clone(), target_client.clone(), target, cancel)
            .await;
        close(&source_client).await;
        close(&target_client).await;
        result
    }

    async fn transfer_between(
        &self,
        source_client: Arc<dyn Client>,
        target_client: Arc<dyn Client>,
        target: &Endpoint,
        cancel: CancellationToken,
    ) -> anyhow::Result<Summary> {
        let source = File::open(source_client, &self.source.path)
            .await
            .with_context(|| format!("failed to stat source {}", &self.source))?;
        if !source.exists {
            return Err(anyhow!("source {} does not exist", &self.source));
        }
        let target = File::probe(target_client, &target.path).await;
        let transfer = Transfer::new(source, target, self.settings)?;
        match transfer.run(common::get_progress(), cancel).await {
            Ok(summary) => Ok(summary),
            Err(error) => {
                if self.summary_on_error {
                    return Err(anyhow!("{}\n\n{}", error, &error.summary));
                }
                Err(error.into())
            }
        }
    }

    #[instrument(skip(self, cancel))]
    async fn serve(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        let bind = remote::server::bind_address(self.server.as_deref().unwrap_or_default())?;
        let client = self.connect(&self.source).await?;
        tracing::info!("serving {} on {}", &self.source, &bind);
        let result = remote::server::serve(&bind, client.clone(), &self.source.path, cancel).await;
        close(&client).await;
        result
    }
}

async fn close(client: &Arc<dyn Client>) {
    if let Err(error) = client.close().await {
        tracing::warn!("failed closing {} client: {:#}", client.kind(), &error);
    }
}

/// Token cancelled on the first ctrl-c.
pub fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::warn!("interrupted, stopping");
                token.cancel();
            }
            Err(error) => tracing::error!("failed to listen for ctrl-c: {}", error),
        }
    });
    cancel
}
