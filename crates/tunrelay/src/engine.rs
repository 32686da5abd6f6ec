//! Engine lifecycle.
//!
//! The [`Engine`] owns one tunnel instance: a [`Key`] is inserted, `start`
//! brings the components up in a fixed order and `stop` tears them down.
//!
//! Startup order:
//! 1. log level
//! 2. socket mark
//! 3. interface binding
//! 4. stats server (best-effort, started once)
//! 5. proxy
//! 6. device
//! 7. network stack and relay workers

use crate::config::{parse_log_level, Key};
use crate::device::{parse_device, OsPlatform, Platform};
use crate::dialer::{Dialer, DialerOptions};
use crate::dns::Resolver;
use crate::error::{TunnelError, TunnelResult};
use crate::proxy::parse_proxy;
use crate::stack::{Stack, StackOptions};
use crate::stats::{StatsServer, Statistics};
use crate::tunnel::{Dispatcher, Tunnel, Workers};
use std::sync::Arc;
use tokio::task::{AbortHandle, JoinHandle};

/// Lifecycle state of an [`Engine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Starting,
    Running,
    Stopped,
}

/// Stats server task and the task watching it.
struct StatsTask {
    server: AbortHandle,
    supervisor: JoinHandle<()>,
}

/// One tunnel instance.
pub struct Engine {
    platform: Arc<dyn Platform>,
    key: Option<Key>,
    state: EngineState,
    stats: Arc<Statistics>,
    stats_task: Option<StatsTask>,
    stack: Option<Stack>,
    workers: Option<Workers>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    /// Create an engine configuring the real OS.
    pub fn new() -> Self {
        Self::with_platform(Arc::new(OsPlatform::new()))
    }

    /// Create an engine using `platform` for every OS side effect.
    pub fn with_platform(platform: Arc<dyn Platform>) -> Self {
        Self {
            platform,
            key: None,
            state: EngineState::Idle,
            stats: Arc::new(Statistics::new()),
            stats_task: None,
            stack: None,
            workers: None,
        }
    }

    /// Get the current state.
    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Get the shared connection statistics.
    pub fn statistics(&self) -> Arc<Statistics> {
        self.stats.clone()
    }

    /// True while the stats server task is alive.
    pub fn stats_server_running(&self) -> bool {
        self.stats_task
            .as_ref()
            .is_some_and(|task| !task.supervisor.is_finished())
    }

    /// Store the configuration for the next start.
    pub fn insert(&mut self, key: Key) -> TunnelResult<()> {
        if matches!(self.state, EngineState::Running | EngineState::Starting) {
            return Err(TunnelError::Configuration(
                "cannot insert key while engine is running".into(),
            ));
        }
        self.key = Some(key);
        Ok(())
    }

    /// Bring the tunnel up.
    ///
    /// On failure the engine is left `Idle` with nothing running except the
    /// stats server.
    pub async fn start(&mut self) -> TunnelResult<()> {
        let key = self
            .key
            .clone()
            .ok_or_else(|| TunnelError::Configuration("empty key".into()))?;

        if key.version {
            log::info!("{} {}", crate::NAME, crate::VERSION);
            return Ok(());
        }

        if self.state == EngineState::Running {
            return Err(TunnelError::Configuration("engine already running".into()));
        }

        self.state = EngineState::Starting;
        match self.start_components(&key).await {
            Ok(()) => {
                self.state = EngineState::Running;
                Ok(())
            }
            Err(e) => {
                self.state = EngineState::Idle;
                Err(e)
            }
        }
    }

    async fn start_components(&mut self, key: &Key) -> TunnelResult<()> {
        log::set_max_level(parse_log_level(&key.log_level)?);

        let mut options = DialerOptions::default();
        if key.mark != 0 {
            options = options.with_mark(key.mark);
        }
        if !key.interface.is_empty() {
            options = options.with_interface(key.interface.as_str());
        }
        let dialer = Arc::new(Dialer::new(options)?);
        if dialer.mark() != 0 {
            log::info!("[DIALER] set fwmark: {:#x}", dialer.mark());
        }
        if let Some(interface) = dialer.interface() {
            log::info!("[DIALER] use interface: {}", interface);
        }

        self.start_stats(key);

        let resolver = Arc::new(Resolver::from_system(dialer.clone()));
        let proxy = parse_proxy(&key.proxy, dialer, resolver)?;

        let device = parse_device(&key.device, key.mtu, self.platform.clone())?;
        let device_info = device.info().clone();

        let (dispatcher, queues) = Dispatcher::new();
        let stack = Stack::new(device, Arc::new(dispatcher), StackOptions::default())?;
        self.workers = Some(Tunnel::new(proxy.clone(), self.stats.clone()).spawn(queues));
        self.stack = Some(stack);

        log::info!(
            "[STACK] {} <-> {}://{}",
            device_info,
            proxy.proto(),
            proxy.addr()
        );
        Ok(())
    }

    fn start_stats(&mut self, key: &Key) {
        if self.stats_task.is_some() {
            return;
        }
        let addr = match key.stats_addr() {
            Ok(Some(addr)) => addr,
            Ok(None) => return,
            Err(e) => {
                log::warn!("[STATS] {}", e);
                return;
            }
        };

        let server = tokio::spawn(StatsServer::new(addr, &key.token, self.stats.clone()).run());
        let abort = server.abort_handle();
        let supervisor = tokio::spawn(async move {
            match server.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::error!("[STATS] server at {} failed: {}", addr, e),
                Err(e) if e.is_panic() => log::error!("[STATS] server at {} panicked", addr),
                Err(_) => {}
            }
        });
        log::info!("[STATS] serve at: http://{}", addr);

        self.stats_task = Some(StatsTask {
            server: abort,
            supervisor,
        });
    }

    /// Shut the tunnel down: the stack, its endpoint and the device. Relay
    /// workers finish as their connections observe the closure.
    pub async fn stop(&mut self) -> TunnelResult<()> {
        if let Some(stack) = self.stack.take() {
            stack.close().await;
        }
        // Queue drain loops end once the stack's tasks drop the dispatcher;
        // per-connection relays run on until their streams report closure.
        if let Some(workers) = self.workers.take() {
            workers.join().await;
        }

        if self.state == EngineState::Running {
            self.state = EngineState::Stopped;
            log::info!("Engine stopped");
        }
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Some(task) = self.stats_task.take() {
            task.server.abort();
        }
    }
}
