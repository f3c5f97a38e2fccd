//! Manager: per-kind watch pumps and worker pools behind a runtime dispatch table.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use kratix_core::ResourceKind;
use kratix_store::ObjectStore;
use metrics::{counter, gauge, histogram};
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{Action, Reconciler, Registrar, Registration, WorkQueue};

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Workers per registered kind.
    pub workers: usize,
    /// Capacity of the watch event channel per kind.
    pub queue_cap: usize,
    /// Pause before a failed or finished watch is restarted.
    pub watch_restart: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_cap: 1024,
            watch_restart: Duration::from_secs(5),
            backoff_base: Duration::from_millis(5),
            backoff_max: Duration::from_secs(300),
        }
    }
}

struct Controller {
    name: String,
    queue: Arc<WorkQueue>,
    tasks: Vec<JoinHandle<()>>,
}

impl Controller {
    fn stop(self) {
        self.queue.shutdown();
        for t in self.tasks {
            t.abort();
        }
    }
}

struct Inner {
    store: Arc<dyn ObjectStore>,
    config: ManagerConfig,
    controllers: Mutex<FxHashMap<ResourceKind, Controller>>,
}

/// The process-wide substrate. Cheap to clone; all clones share one dispatch table.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<Inner>,
}

impl Manager {
    pub fn new(store: Arc<dyn ObjectStore>, config: ManagerConfig) -> Self {
        Self { inner: Arc::new(Inner { store, config, controllers: Mutex::new(FxHashMap::default()) }) }
    }

    fn controllers(&self) -> MutexGuard<'_, FxHashMap<ResourceKind, Controller>> {
        self.inner.controllers.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn is_registered(&self, kind: &ResourceKind) -> bool { self.controllers().contains_key(kind) }

    /// Stop every controller.
    pub fn shutdown(&self) {
        let all: Vec<_> = self.controllers().drain().collect();
        for (kind, c) in all {
            debug!(kind = %kind, controller = %c.name, "stopping controller");
            c.stop();
        }
        info!("manager stopped");
    }

    fn start(&self, kind: ResourceKind, name: String, reconciler: Arc<dyn Reconciler>) -> Controller {
        let cfg = &self.inner.config;
        let queue = Arc::new(WorkQueue::new(cfg.backoff_base, cfg.backoff_max));
        let mut tasks = Vec::with_capacity(cfg.workers.max(1) + 1);

        tasks.push(tokio::spawn(pump(Arc::clone(&self.inner.store), kind.clone(), Arc::clone(&queue), cfg.queue_cap, cfg.watch_restart)));
        for worker in 0..cfg.workers.max(1) {
            tasks.push(tokio::spawn(work(worker, name.clone(), Arc::clone(&reconciler), Arc::clone(&queue))));
        }
        info!(kind = %kind, controller = %name, workers = cfg.workers.max(1), "controller started");
        Controller { name, queue, tasks }
    }
}

/// Feed the queue from the store's watch; restart the watch whenever it ends.
async fn pump(store: Arc<dyn ObjectStore>, kind: ResourceKind, queue: Arc<WorkQueue>, cap: usize, restart: Duration) {
    loop {
        let (tx, mut rx) = mpsc::channel(cap.max(1));
        let forward = async {
            while let Some(key) = rx.recv().await {
                queue.add(key);
                gauge!("queue_depth", queue.len() as f64, "kind" => kind.to_string());
            }
        };
        let (res, ()) = tokio::join!(store.watch(&kind, tx), forward);
        match res {
            Ok(()) => debug!(kind = %kind, "watch ended"),
            Err(e) => warn!(kind = %kind, error = %e, "watch failed"),
        }
        tokio::time::sleep(restart).await;
    }
}

async fn work(worker: usize, name: String, reconciler: Arc<dyn Reconciler>, queue: Arc<WorkQueue>) {
    while let Some(key) = queue.next().await {
        let t0 = Instant::now();
        let res = reconciler.reconcile(&key).await;
        queue.done(&key);
        histogram!("reconcile_latency_ms", t0.elapsed().as_secs_f64() * 1000.0, "controller" => name.clone());
        match res {
            Ok(Action::Done) => {
                queue.forget(&key);
                counter!("reconcile_total", 1u64, "controller" => name.clone(), "outcome" => "done");
            }
            Ok(Action::RequeueAfter(delay)) => {
                queue.forget(&key);
                debug!(controller = %name, key = %key, delay_ms = delay.as_millis() as u64, "requeue");
                queue.add_after(key, delay);
                counter!("reconcile_total", 1u64, "controller" => name.clone(), "outcome" => "requeue");
            }
            Err(e) => {
                let delay = queue.add_rate_limited(key.clone());
                warn!(controller = %name, key = %key, error = %e, retry_ms = delay.as_millis() as u64, "reconcile failed");
                counter!("reconcile_total", 1u64, "controller" => name.clone(), "outcome" => "error");
            }
        }
    }
    debug!(controller = %name, worker, "worker exiting");
}

impl Registrar for Manager {
    fn register(&self, kind: ResourceKind, name: &str, reconciler: Arc<dyn Reconciler>) -> Registration {
        let mut controllers = self.controllers();
        if let Some(existing) = controllers.get(&kind) {
            debug!(kind = %kind, controller = %existing.name, "already registered");
            return Registration::AlreadyRegistered;
        }
        let c = self.start(kind.clone(), name.to_string(), reconciler);
        controllers.insert(kind, c);
        Registration::Started
    }

    fn deregister(&self, kind: &ResourceKind) -> bool {
        let removed = self.controllers().remove(kind);
        match removed {
            Some(c) => {
                info!(kind = %kind, controller = %c.name, "controller deregistered");
                c.stop();
                true
            }
            None => false,
        }
    }

    fn registered(&self) -> Vec<(ResourceKind, String)> {
        let mut out: Vec<_> = self.controllers().iter().map(|(k, c)| (k.clone(), c.name.clone())).collect();
        out.sort();
        out
    }
}
