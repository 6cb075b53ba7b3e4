//! Wires every configured environment (inventory, prober, walker, synchroniser, scheduler)
//! and one shared data-plane proxy.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWrite;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{BridgeConfig, EnvironmentConfig};
use crate::contract::CatalogStore;
use crate::error::{BridgeError, ConfigError, WalkError};
use crate::inventory::Inventory;
use crate::prober::{HttpProbe, Prober};
use crate::proxy::{DataPlaneProxy, TransferReport};
use crate::reference::StableId;
use crate::scheduler::Scheduler;
use crate::synchronise::{SyncSettings, SynchroniseReport, Synchroniser, TriggerAck};
use crate::validate::header_map;
use crate::walker::HttpTreeWalker;

struct Environment {
    config: EnvironmentConfig,
    synchroniser: Arc<Synchroniser>,
    inventory: Arc<Inventory>,
    /// Taken when background tasks start.
    prober: Option<Prober>,
    /// Stops this environment's prober and scheduler.
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Environment {
    fn start(&mut self) {
        let Some(prober) = self.prober.take() else {
            return;
        };
        let scheduler = Scheduler::new(Arc::clone(&self.synchroniser), &self.config.sync);
        self.tasks
            .push(tokio::spawn(prober.run(self.cancel.child_token())));
        self.tasks
            .push(tokio::spawn(scheduler.run(self.cancel.child_token())));
        info!(environment = %self.config.name, "Environment started");
    }

    async fn stop(&mut self) {
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(environment = %self.config.name, error = %e, "Background task ended abnormally");
            }
        }
        self.synchroniser.wait_triggered().await;
    }
}

pub struct Runtime {
    environments: BTreeMap<String, Environment>,
    catalog: Arc<dyn CatalogStore>,
    proxy: Arc<DataPlaneProxy>,
    cancel: CancellationToken,
    started: bool,
}

impl Runtime {
    /// Validates `config` and assembles every environment against `catalog`.
    pub fn build(config: &BridgeConfig, catalog: Arc<dyn CatalogStore>) -> Result<Self, BridgeError> {
        config.validate()?;
        let mut runtime = Self {
            environments: BTreeMap::new(),
            catalog,
            proxy: Arc::new(DataPlaneProxy::new(&config.proxy)?),
            cancel: CancellationToken::new(),
            started: false,
        };
        for env in &config.environments {
            let environment = runtime.assemble(env)?;
            runtime.environments.insert(env.name.clone(), environment);
        }
        Ok(runtime)
    }

    fn assemble(&self, env: &EnvironmentConfig) -> Result<Environment, BridgeError> {
        let inventory = Arc::new(match &env.inventory_path {
            Some(path) => Inventory::open(path)?,
            None => Inventory::in_memory(),
        });
        let headers = header_map(&env.headers).map_err(|v| ConfigError::InvalidHeader {
            environment: env.name.clone(),
            reason: v.message,
        })?;
        let probe = HttpProbe::new(
            env.namespace(),
            headers,
            Duration::from_secs(env.probe.timeout_secs),
        )
        .map_err(WalkError::Client)?;
        let prober = Prober::new(&env.name, Arc::new(probe), &env.probe);
        let walker = HttpTreeWalker::new(env)?;
        let synchroniser = Arc::new(Synchroniser::new(
            &env.name,
            SyncSettings::from_config(env)?,
            Arc::new(walker),
            Arc::clone(&self.catalog),
            Arc::clone(&inventory),
            prober.subscribe(),
            self.cancel.child_token(),
        ));
        info!(
            environment = %env.name,
            base_url = %env.base_url,
            entries = inventory.len(),
            "Environment ready"
        );
        Ok(Environment {
            config: env.clone(),
            synchroniser,
            inventory,
            prober: Some(prober),
            cancel: self.cancel.child_token(),
            tasks: Vec::new(),
        })
    }

    /// Spawns the prober and scheduler of every environment. Idempotent.
    pub fn start(&mut self) {
        self.started = true;
        for env in self.environments.values_mut() {
            env.start();
        }
    }

    /// Registers a repository while running. It starts right away if the runtime has.
    pub fn add_environment(&mut self, config: EnvironmentConfig) -> Result<(), BridgeError> {
        if self.environments.contains_key(&config.name) {
            return Err(ConfigError::DuplicateEnvironment(config.name).into());
        }
        config.validate()?;
        let mut environment = self.assemble(&config)?;
        if self.started {
            environment.start();
        }
        info!(environment = %config.name, "Environment registered");
        self.environments.insert(config.name, environment);
        Ok(())
    }

    /// Unregisters a repository: stops its tasks, waits for a running cycle, then removes
    /// everything it cataloged. If the teardown does not complete the environment stays
    /// registered but stopped, and removal can be retried.
    pub async fn remove_environment(
        &mut self,
        environment: &str,
    ) -> Result<SynchroniseReport, BridgeError> {
        let mut env = self
            .environments
            .remove(environment)
            .ok_or_else(|| BridgeError::UnknownEnvironment(environment.to_string()))?;
        env.stop().await;
        let report = env.synchroniser.teardown().await;
        if report.is_success() {
            info!(environment, deleted = report.deleted, "Environment unregistered");
        } else {
            warn!(environment, outcome = ?report.outcome, "Teardown incomplete, environment kept");
            self.environments.insert(environment.to_string(), env);
        }
        Ok(report)
    }

    pub fn environment_names(&self) -> Vec<String> {
        self.environments.keys().cloned().collect()
    }

    pub fn synchroniser(&self, environment: &str) -> Result<&Arc<Synchroniser>, BridgeError> {
        self.environments
            .get(environment)
            .map(|e| &e.synchroniser)
            .ok_or_else(|| BridgeError::UnknownEnvironment(environment.to_string()))
    }

    pub fn inventory(&self, environment: &str) -> Result<&Arc<Inventory>, BridgeError> {
        self.environments
            .get(environment)
            .map(|e| &e.inventory)
            .ok_or_else(|| BridgeError::UnknownEnvironment(environment.to_string()))
    }

    /// Manual trigger: returns as soon as the cycle is started or coalesced.
    pub fn trigger(&self, environment: &str) -> Result<TriggerAck, BridgeError> {
        Ok(self.synchroniser(environment)?.trigger())
    }

    pub fn trigger_all(&self) -> Vec<(String, TriggerAck)> {
        self.environments
            .iter()
            .map(|(name, env)| (name.clone(), env.synchroniser.trigger()))
            .collect()
    }

    /// Probes once and runs one cycle in the foreground.
    pub async fn run_once(&mut self, environment: &str) -> Result<SynchroniseReport, BridgeError> {
        let env = self
            .environments
            .get_mut(environment)
            .ok_or_else(|| BridgeError::UnknownEnvironment(environment.to_string()))?;
        if let Some(prober) = env.prober.as_mut() {
            prober.probe_once().await;
        }
        Ok(env.synchroniser.run_cycle().await)
    }

    /// Streams one cataloged element of `environment` into `sink`.
    pub async fn fetch<W>(
        &self,
        environment: &str,
        id: &StableId,
        sink: &mut W,
        cancel: &CancellationToken,
    ) -> Result<TransferReport, BridgeError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let inventory = self.inventory(environment)?;
        Ok(self.proxy.fetch(inventory, id, sink, cancel).await?)
    }

    pub fn proxy(&self) -> &Arc<DataPlaneProxy> {
        &self.proxy
    }

    /// Cancels every cycle, probe and transfer admission, then waits for the tasks and
    /// for manually triggered cycles to finish rolling back.
    pub async fn shutdown(mut self) {
        info!("Shutting down runtime");
        self.cancel.cancel();
        self.proxy.close();
        for env in self.environments.values_mut() {
            env.stop().await;
        }
        info!("Runtime stopped");
    }
}
