//! Connection manager: one supervising task per service owns the whole
//! open-to-close lifecycle; the manager talks to it through a
//! cancellation token and a watch channel carrying its state.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{ConnectionState, ServiceConnector};
use crate::config::{ConfigError, ServiceSpec, load_service_specs};
use crate::template::TemplateVars;

/// Retry budgets for opening and tearing down services.
#[derive(Debug, Clone, Copy)]
pub struct LifecycleOptions {
    /// Extra attempts after the first failed open.
    pub connect_retries: u32,
    pub connect_retry_delay: Duration,
    /// How long one disconnect round waits for units to finish.
    pub disconnect_timeout: Duration,
    pub disconnect_retries: u32,
    pub disconnect_retry_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            connect_retries: 3,
            connect_retry_delay: Duration::from_secs(2),
            disconnect_timeout: Duration::from_secs(10),
            disconnect_retries: 3,
            disconnect_retry_delay: Duration::from_secs(1),
        }
    }
}

/// Outcome of one `connect` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectSummary {
    pub connected: Vec<String>,
    pub failed: Vec<String>,
    pub already_running: Vec<String>,
    pub unknown: Vec<String>,
}

type StateCell = Arc<watch::Sender<ConnectionState>>;

struct Unit {
    generation: u64,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

struct Registry<T> {
    next_generation: u64,
    units: HashMap<String, Unit>,
    connected: HashMap<String, Arc<T>>,
    states: HashMap<String, StateCell>,
}

impl<T> Registry<T> {
    fn new() -> Self {
        Self {
            next_generation: 0,
            units: HashMap::new(),
            connected: HashMap::new(),
            states: HashMap::new(),
        }
    }

    fn owns(&self, name: &str, generation: u64) -> bool {
        self.units
            .get(name)
            .is_some_and(|u| u.generation == generation)
    }
}

type Shared<T> = Arc<Mutex<Registry<T>>>;

fn lock<T>(registry: &Shared<T>) -> MutexGuard<'_, Registry<T>> {
    registry.lock().unwrap_or_else(|p| p.into_inner())
}

/// Removes a unit from every bookkeeping map when its task ends, however
/// it ends: normal return, panic, or abort.
struct UnitGuard<T> {
    name: String,
    generation: u64,
    registry: Shared<T>,
    state: StateCell,
    failed: bool,
}

impl<T> Drop for UnitGuard<T> {
    fn drop(&mut self) {
        let mut reg = lock(&self.registry);
        if reg.owns(&self.name, self.generation) {
            reg.units.remove(&self.name);
            reg.connected.remove(&self.name);
        }
        let end = if self.failed {
            ConnectionState::Failed
        } else {
            ConnectionState::Disconnected
        };
        self.state.send_replace(end);
        debug!(service = %self.name, state = %end, "service unit finished");
    }
}

pub struct ServiceManager<C: ServiceConnector> {
    specs: BTreeMap<String, ServiceSpec>,
    vars: TemplateVars,
    connector: Arc<C>,
    registry: Shared<C::Connection>,
    op_lock: tokio::sync::Mutex<()>,
    options: LifecycleOptions,
}

impl<C: ServiceConnector> ServiceManager<C> {
    pub fn new(specs: BTreeMap<String, ServiceSpec>, connector: C) -> Self {
        Self {
            specs,
            vars: TemplateVars::new(),
            connector: Arc::new(connector),
            registry: Arc::new(Mutex::new(Registry::new())),
            op_lock: tokio::sync::Mutex::new(()),
            options: LifecycleOptions::default(),
        }
    }

    /// Load every spec in `dir`, rendering placeholders with `vars`.
    pub fn from_dir(dir: &Path, vars: TemplateVars, connector: C) -> Result<Self, ConfigError> {
        let specs = load_service_specs(dir, &vars)?;
        info!(dir = %dir.display(), count = specs.len(), "loaded service specs");
        let mut manager = Self::new(specs, connector);
        manager.vars = vars;
        Ok(manager)
    }

    pub fn with_options(mut self, options: LifecycleOptions) -> Self {
        self.options = options;
        self
    }

    pub fn template_variables(&self) -> &TemplateVars {
        &self.vars
    }

    pub fn spec(&self, name: &str) -> Option<&ServiceSpec> {
        self.specs.get(name)
    }

    /// Every declared service, connected or not.
    pub fn available(&self) -> Vec<String> {
        self.specs.keys().cloned().collect()
    }

    pub fn state(&self, name: &str) -> ConnectionState {
        lock(&self.registry)
            .states
            .get(name)
            .map(|s| *s.borrow())
            .unwrap_or(ConnectionState::Unconnected)
    }

    /// A handle to a service that is currently `Connected`.
    pub fn get_connected(&self, name: &str) -> Option<Arc<C::Connection>> {
        let reg = lock(&self.registry);
        let connected = reg
            .states
            .get(name)
            .is_some_and(|s| *s.borrow() == ConnectionState::Connected);
        if connected {
            reg.connected.get(name).cloned()
        } else {
            None
        }
    }

    pub fn get_all_connected(&self) -> Vec<(String, Arc<C::Connection>)> {
        let names = self.connected_names();
        names
            .into_iter()
            .filter_map(|n| self.get_connected(&n).map(|c| (n, c)))
            .collect()
    }

    pub fn connected_names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.registry).connected.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_connected(&self, name: &str) -> bool {
        self.get_connected(name).is_some()
    }

    pub async fn connect_all(&self) -> ConnectSummary {
        let names = self.available();
        self.connect(names).await
    }

    /// Bring the named services up. Returns once each new unit is either
    /// connected or out of attempts. Names that already have a unit are
    /// left untouched.
    pub async fn connect<I, S>(&self, names: I) -> ConnectSummary
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let _op = self.op_lock.lock().await;
        let mut summary = ConnectSummary::default();
        let mut waiting = Vec::new();

        for name in names {
            let name = name.as_ref();
            let Some(spec) = self.specs.get(name) else {
                warn!(service = name, "no service with this name");
                summary.unknown.push(name.to_string());
                continue;
            };
            if lock(&self.registry).units.contains_key(name) {
                debug!(service = name, "service already running, skipping");
                summary.already_running.push(name.to_string());
                continue;
            }
            waiting.push((name.to_string(), self.spawn_unit(spec.clone())));
        }

        if waiting.is_empty() {
            return summary;
        }
        info!(count = waiting.len(), "connecting services");

        for (name, mut rx) in waiting {
            let settled = rx.wait_for(|s| s.is_settled()).await.map(|s| *s);
            match settled {
                Ok(ConnectionState::Connected) => summary.connected.push(name),
                _ => summary.failed.push(name),
            }
        }

        info!(
            connected = summary.connected.len(),
            failed = summary.failed.len(),
            "service connect finished"
        );
        summary
    }

    fn spawn_unit(&self, spec: ServiceSpec) -> watch::Receiver<ConnectionState> {
        let name = spec.name.clone();
        let cancel = CancellationToken::new();
        let (tx, rx) = watch::channel(ConnectionState::Unconnected);
        let state = Arc::new(tx);

        let generation = {
            let mut reg = lock(&self.registry);
            reg.next_generation += 1;
            let generation = reg.next_generation;
            reg.units.insert(
                name.clone(),
                Unit {
                    generation,
                    cancel: cancel.clone(),
                    handle: None,
                },
            );
            reg.states.insert(name.clone(), state.clone());
            generation
        };

        // Built before spawning so an un-polled, aborted task still cleans up.
        let guard = UnitGuard {
            name: name.clone(),
            generation,
            registry: self.registry.clone(),
            state,
            failed: false,
        };
        let handle = tokio::spawn(supervise(
            spec,
            self.connector.clone(),
            cancel,
            guard,
            self.options,
        ));

        let mut reg = lock(&self.registry);
        if let Some(unit) = reg.units.get_mut(&name).filter(|u| u.generation == generation) {
            unit.handle = Some(handle);
        }
        rx
    }

    /// Tear down the named services. Units that do not finish within the
    /// retry budget are aborted and marked disconnected.
    pub async fn disconnect<I, S>(&self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let names = names.into_iter().map(|n| n.as_ref().to_string()).collect();
        self.disconnect_inner(Some(names)).await;
    }

    pub async fn disconnect_all(&self) {
        self.disconnect_inner(None).await;
    }

    /// Disconnect everything and drop all bookkeeping.
    pub async fn ensure_all_disconnected(&self) {
        self.disconnect_all().await;
        let mut reg = lock(&self.registry);
        for (name, unit) in reg.units.drain() {
            warn!(service = %name, "forcing removal of leftover unit");
            unit.cancel.cancel();
            if let Some(handle) = unit.handle {
                handle.abort();
            }
        }
        reg.connected.clear();
    }

    async fn disconnect_inner(&self, names: Option<Vec<String>>) {
        let _op = self.op_lock.lock().await;
        let mut targets: Vec<(String, u64, JoinHandle<()>)> = Vec::new();
        {
            let mut reg = lock(&self.registry);
            let names = names.unwrap_or_else(|| reg.units.keys().cloned().collect());
            for name in names {
                // Gone from the connected set before anything else happens.
                reg.connected.remove(&name);
                if let Some(unit) = reg.units.get_mut(&name) {
                    unit.cancel.cancel();
                    if let Some(handle) = unit.handle.take() {
                        targets.push((name, unit.generation, handle));
                    }
                }
            }
        }

        if targets.is_empty() {
            debug!("no services to disconnect");
            return;
        }
        info!(count = targets.len(), "disconnecting services");

        let opts = self.options;
        for round in 0..=opts.disconnect_retries {
            let deadline = Instant::now() + opts.disconnect_timeout;
            for (_, _, handle) in targets.iter_mut() {
                if !handle.is_finished() {
                    let _ = tokio::time::timeout_at(deadline, &mut *handle).await;
                }
            }

            let remaining = targets.iter().filter(|(_, _, h)| !h.is_finished()).count();
            if remaining == 0 {
                debug!(round = round + 1, "all services disconnected");
                return;
            }
            if round < opts.disconnect_retries {
                debug!(
                    remaining,
                    round = round + 1,
                    total = opts.disconnect_retries + 1,
                    "services still shutting down, waiting again"
                );
                tokio::time::sleep(opts.disconnect_retry_delay).await;
            }
        }

        let mut reg = lock(&self.registry);
        for (name, generation, handle) in targets.iter().filter(|(_, _, h)| !h.is_finished()) {
            warn!(service = %name, "service did not shut down in time, abandoning");
            handle.abort();
            if reg.owns(name, *generation) {
                reg.units.remove(name);
                reg.connected.remove(name);
                if let Some(state) = reg.states.get(name) {
                    state.send_replace(ConnectionState::Disconnected);
                }
            }
        }
    }
}

impl<C: ServiceConnector> Drop for ServiceManager<C> {
    fn drop(&mut self) {
        let reg = lock(&self.registry);
        for unit in reg.units.values() {
            unit.cancel.cancel();
        }
    }
}

async fn supervise<C: ServiceConnector>(
    spec: ServiceSpec,
    connector: Arc<C>,
    cancel: CancellationToken,
    mut guard: UnitGuard<C::Connection>,
    options: LifecycleOptions,
) {
    let name = spec.name.clone();
    let attempts = options.connect_retries + 1;

    for attempt in 1..=attempts {
        guard.state.send_replace(ConnectionState::Connecting { attempt });

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(service = %name, "cancelled while connecting");
                return;
            }
            res = connector.open(&spec) => res,
        };

        match opened {
            Ok(connection) => {
                let connection = Arc::new(connection);
                {
                    let mut reg = lock(&guard.registry);
                    if reg.owns(&name, guard.generation) {
                        reg.connected.insert(name.clone(), connection.clone());
                    }
                    guard.state.send_replace(ConnectionState::Connected);
                }
                info!(service = %name, attempt, total = attempts, "service connected");

                cancel.cancelled().await;

                guard.state.send_replace(ConnectionState::Disconnecting);
                lock(&guard.registry).connected.remove(&name);
                if let Err(e) = connector.close(connection).await {
                    warn!(service = %name, error = %e, "error while closing service");
                }
                return;
            }
            Err(e) if attempt < attempts => {
                warn!(
                    service = %name,
                    attempt,
                    total = attempts,
                    error = %e,
                    "service connect failed, retrying in {:?}",
                    options.connect_retry_delay
                );
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(options.connect_retry_delay) => {}
                }
            }
            Err(e) => {
                error!(service = %name, attempts, error = %e, "service connect failed for good");
                guard.failed = true;
                return;
            }
        }
    }
}
