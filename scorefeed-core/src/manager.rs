//! Per-process connection manager and failure-recovery state machine.
//!
//! The `ConnectionManager` decides how a process consumes change events:
//!
//! - `RelayConnected`: subscribed to the shared relay (preferred)
//! - `FallbackConnected`: direct LISTEN subscription to the source store
//! - `Degraded`: no live path; serving continues on stale data while a
//!   background loop retries
//! - `Disconnected`: before `startup()` and after `shutdown()`
//!
//! Transitions run under one mutex guarding the active transport
//! resources, so concurrent mode switches cannot interleave. The state
//! itself is a small atomic, so `is_connected()` / `is_degraded()` never
//! take the lock. Whatever the mode, delivery goes through the one shared
//! [`HandlerRegistry`], so switching transports never changes semantics
//! for downstream consumers.

use crate::config::NotifyConfig;
use crate::error::NotifyError;
use crate::handler::{ChannelHandler, HandlerRegistry, RegistrySink};
use crate::listener::ChangeListener;
use crate::relay::RelayNotifier;
use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use tokio::sync::{Mutex, Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub use crate::events::Channel;

/// Lifecycle state of a [`ConnectionManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Before startup or after shutdown.
    Disconnected = 0,
    /// Consuming change events via the relay.
    RelayConnected = 1,
    /// Consuming change events directly from the source store.
    FallbackConnected = 2,
    /// No live notification path; retrying in the background.
    Degraded = 3,
}

impl ConnectionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => ConnectionState::RelayConnected,
            2 => ConnectionState::FallbackConnected,
            3 => ConnectionState::Degraded,
            _ => ConnectionState::Disconnected,
        }
    }

    /// Whether a live notification path is active.
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            ConnectionState::RelayConnected | ConnectionState::FallbackConnected
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::RelayConnected => "relay",
            ConnectionState::FallbackConnected => "fallback",
            ConnectionState::Degraded => "degraded",
        };
        f.write_str(name)
    }
}

/// A running transport: the cancellation sender for its loop task plus
/// the task handle, awaited on teardown so no handler fires afterwards.
struct TransportTask {
    cancel_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct TransportResources {
    relay: Option<TransportTask>,
    fallback: Option<TransportTask>,
    maintain: Option<JoinHandle<()>>,
}

/// Cancel a transport task and wait for it to actually stop.
async fn teardown(transport: TransportTask) {
    let _ = transport.cancel_tx.send(true);
    if let Err(e) = transport.task.await {
        if e.is_panic() {
            error!(error = %e, "transport task panicked during teardown");
        }
    }
}

/// Seam between the state machine and the concrete transport drivers.
///
/// Each `connect_*` call brings up one transport and returns its running
/// loop task. A task that dies on its own (not via cancellation) must ping
/// `lost` on the way out so the maintenance loop wakes immediately.
trait Transports: Send + Sync + 'static {
    fn connect_relay(&self, lost: Arc<Notify>)
    -> BoxFuture<'_, Result<TransportTask, NotifyError>>;
    fn connect_fallback(
        &self,
        lost: Arc<Notify>,
    ) -> BoxFuture<'_, Result<TransportTask, NotifyError>>;
    /// Cheap reachability check for the relay.
    fn probe_relay(&self) -> BoxFuture<'_, bool>;
}

/// Production drivers: the Redis relay subscription and the direct
/// PostgreSQL LISTEN fallback. Both dispatch through the one shared
/// registry, so a mode switch never changes delivery semantics.
struct LiveTransports {
    config: NotifyConfig,
    registry: Arc<HandlerRegistry>,
}

impl Transports for LiveTransports {
    /// Connect the relay, subscribe, and start the dispatch loop.
    ///
    /// A midway failure rolls the half-open connection back before the
    /// error surfaces.
    fn connect_relay(
        &self,
        lost: Arc<Notify>,
    ) -> BoxFuture<'_, Result<TransportTask, NotifyError>> {
        Box::pin(async move {
            let mut notifier = RelayNotifier::with_registry(
                self.config.relay_url.clone(),
                Arc::clone(&self.registry),
            );
            notifier.connect().await?;
            if let Err(e) = notifier.subscribe().await {
                notifier.disconnect().await;
                return Err(e);
            }

            let (cancel_tx, cancel_rx) = watch::channel(false);
            let task = tokio::spawn(async move {
                if let Err(e) = notifier.dispatch_loop(cancel_rx).await {
                    warn!(error = %e, "relay dispatch loop terminated");
                    lost.notify_one();
                }
                notifier.disconnect().await;
            });
            Ok(TransportTask { cancel_tx, task })
        })
    }

    /// Open a direct store subscription and start its receive loop.
    fn connect_fallback(
        &self,
        lost: Arc<Notify>,
    ) -> BoxFuture<'_, Result<TransportTask, NotifyError>> {
        Box::pin(async move {
            let mut listener = ChangeListener::new(self.config.store_url.clone());
            listener.start().await?;

            let sink = RegistrySink::new(Arc::clone(&self.registry));
            let (cancel_tx, cancel_rx) = watch::channel(false);
            let task = tokio::spawn(async move {
                if let Err(e) = listener.run(&sink, cancel_rx).await {
                    warn!(error = %e, "direct store listener terminated");
                    lost.notify_one();
                }
                listener.stop().await;
            });
            Ok(TransportTask { cancel_tx, task })
        })
    }

    /// A throwaway relay connection.
    fn probe_relay(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            let mut probe = RelayNotifier::new(self.config.relay_url.clone());
            let reachable = probe.connect().await.is_ok();
            probe.disconnect().await;
            reachable
        })
    }
}

/// Orchestrates relay/fallback/degraded transitions for one process.
///
/// Exactly one manager instance owns its store and relay connections;
/// they are never shared across instances.
pub struct ConnectionManager {
    config: NotifyConfig,
    registry: Arc<HandlerRegistry>,
    transports: Arc<dyn Transports>,
    state: AtomicU8,
    transport: Mutex<TransportResources>,
    shutdown_tx: watch::Sender<bool>,
    transport_lost: Arc<Notify>,
}

impl ConnectionManager {
    /// Create a manager with its handler map.
    ///
    /// The registry is populated once here and lives for the manager's
    /// process lifetime; handlers are mode-agnostic.
    pub fn new(config: NotifyConfig, handlers: HashMap<Channel, ChannelHandler>) -> Arc<Self> {
        let registry = Arc::new(HandlerRegistry::from_map(handlers));
        let transports = Arc::new(LiveTransports {
            config: config.clone(),
            registry: Arc::clone(&registry),
        });
        Self::with_transports(config, registry, transports)
    }

    fn with_transports(
        config: NotifyConfig,
        registry: Arc<HandlerRegistry>,
        transports: Arc<dyn Transports>,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            config,
            registry,
            transports,
            state: AtomicU8::new(ConnectionState::Disconnected as u8),
            transport: Mutex::new(TransportResources::default()),
            shutdown_tx,
            transport_lost: Arc::new(Notify::new()),
        })
    }

    /// Current lifecycle state. Lock-free.
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether a live notification path is active. Lock-free.
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Whether the manager is running without any live path. Lock-free.
    pub fn is_degraded(&self) -> bool {
        self.state() == ConnectionState::Degraded
    }

    /// The shared channel→handler routing table.
    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// Bring up the preferred transport and start the maintenance loop.
    ///
    /// Never fails: if both the relay and the source store are
    /// unreachable the manager enters `Degraded`, the retry loop keeps
    /// running, and the surrounding service stays up on stale data.
    /// Calling `startup()` on an already-started manager is a no-op.
    pub async fn startup(self: &Arc<Self>) {
        let mut res = self.transport.lock().await;
        if res.maintain.is_some() {
            return;
        }
        self.try_connect_preferred(&mut res).await;
        res.maintain = Some(self.spawn_maintain());
        info!(state = %self.state(), "connection manager started");
    }

    /// Tear everything down from any state.
    ///
    /// Waits for the maintenance loop and the active transport loop to
    /// actually stop, so no handler fires after this returns. Safe to
    /// call repeatedly, and on a manager that never started.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);

        let maintain = self.transport.lock().await.maintain.take();
        if let Some(task) = maintain {
            if let Err(e) = task.await {
                if e.is_panic() {
                    error!(error = %e, "maintenance loop panicked");
                }
            }
        }

        let mut res = self.transport.lock().await;
        if let Some(relay) = res.relay.take() {
            teardown(relay).await;
        }
        if let Some(fallback) = res.fallback.take() {
            teardown(fallback).await;
        }
        self.set_state(ConnectionState::Disconnected);
        info!("connection manager shut down");
    }

    // -- Mode transitions ---------------------------------------------------

    /// Leave relay mode for a direct store subscription.
    ///
    /// No-op if already in fallback. Relay resources are torn down first;
    /// a failed fallback connect leaves the manager `Degraded` for the
    /// maintenance loop to recover.
    pub(crate) async fn switch_to_fallback_mode(&self) -> Result<(), NotifyError> {
        let mut res = self.transport.lock().await;
        if res.fallback.is_some() {
            return Ok(());
        }
        if let Some(relay) = res.relay.take() {
            teardown(relay).await;
        }
        match self.connect_to_fallback(&mut res).await {
            Ok(()) => {
                info!("switched to fallback mode");
                Ok(())
            }
            Err(e) => {
                self.set_state(ConnectionState::Degraded);
                Err(e)
            }
        }
    }

    /// Return from fallback to relay mode.
    ///
    /// No-op unless currently in fallback. The direct store subscription
    /// is torn down first; if the relay connect then fails, the fallback
    /// is restored (or the manager goes `Degraded` if even that fails).
    pub(crate) async fn switch_to_relay_mode(&self) -> Result<(), NotifyError> {
        let mut res = self.transport.lock().await;
        if res.fallback.is_none() {
            return Ok(());
        }
        if let Some(fallback) = res.fallback.take() {
            teardown(fallback).await;
        }
        match self.connect_to_relay(&mut res).await {
            Ok(()) => {
                info!("switched to relay mode");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "relay connect failed, restoring fallback");
                if let Err(restore) = self.connect_to_fallback(&mut res).await {
                    self.set_state(ConnectionState::Degraded);
                    warn!(error = %restore, "fallback restore failed, entering degraded state");
                }
                Err(e)
            }
        }
    }

    // -- Transport bring-up (caller holds the transport lock) ---------------

    /// Connect the relay transport and start its dispatch loop.
    ///
    /// State becomes `RelayConnected` only after every step succeeds.
    async fn connect_to_relay(&self, res: &mut TransportResources) -> Result<(), NotifyError> {
        let task = self
            .transports
            .connect_relay(Arc::clone(&self.transport_lost))
            .await?;
        res.relay = Some(task);
        self.set_state(ConnectionState::RelayConnected);
        info!("consuming change events via relay");
        Ok(())
    }

    /// Open the direct store subscription and start its receive loop.
    async fn connect_to_fallback(&self, res: &mut TransportResources) -> Result<(), NotifyError> {
        let task = self
            .transports
            .connect_fallback(Arc::clone(&self.transport_lost))
            .await?;
        res.fallback = Some(task);
        self.set_state(ConnectionState::FallbackConnected);
        info!("consuming change events directly from source store");
        Ok(())
    }

    /// Try the relay first (when enabled), then the direct subscription;
    /// go `Degraded` if neither is reachable.
    async fn try_connect_preferred(&self, res: &mut TransportResources) {
        if self.config.prefer_relay {
            match self.connect_to_relay(res).await {
                Ok(()) => return,
                Err(e) => warn!(error = %e, "relay unreachable"),
            }
        }
        if let Err(e) = self.connect_to_fallback(res).await {
            warn!(error = %e, "source store unreachable, entering degraded state");
            self.set_state(ConnectionState::Degraded);
        }
    }

    // -- Maintenance loop ---------------------------------------------------

    fn spawn_maintain(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        // Subscribe here, not inside the task: subscribing marks the
        // current value as seen, so a shutdown sent before the task's
        // first poll would otherwise never wake the `changed()` arm.
        let shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            manager.maintain_connection(shutdown_rx).await;
        })
    }

    /// Retry loop: wakes on a fixed interval or as soon as a transport
    /// task reports itself dead, and reconciles until shutdown.
    async fn maintain_connection(&self, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {}
                _ = self.transport_lost.notified() => {}
                _ = tokio::time::sleep(self.config.retry_interval) => {}
            }
            if *shutdown_rx.borrow() {
                break;
            }
            self.reconcile().await;
        }
        debug!("connection maintenance loop stopped");
    }

    /// One maintenance pass: reap dead transport tasks, then drive the
    /// state toward the preferred mode.
    async fn reconcile(&self) {
        let mut relay_lost = false;
        {
            let mut res = self.transport.lock().await;
            if res.relay.as_ref().is_some_and(|t| t.task.is_finished()) {
                if let Some(t) = res.relay.take() {
                    let _ = t.task.await;
                }
                warn!("relay transport lost");
                self.set_state(ConnectionState::Degraded);
                relay_lost = true;
            }
            if res.fallback.as_ref().is_some_and(|t| t.task.is_finished()) {
                if let Some(t) = res.fallback.take() {
                    let _ = t.task.await;
                }
                warn!("fallback transport lost");
                self.set_state(ConnectionState::Degraded);
            }
        }

        if relay_lost {
            // Losing the relay mid-run goes straight to fallback; a later
            // pass probes the relay and switches back once it returns.
            if let Err(e) = self.switch_to_fallback_mode().await {
                warn!(error = %e, "fallback unavailable after relay loss");
            }
            return;
        }

        match self.state() {
            ConnectionState::RelayConnected => {}
            ConnectionState::FallbackConnected if self.config.prefer_relay => {
                // Probe before giving up a working fallback.
                if self.transports.probe_relay().await {
                    if let Err(e) = self.switch_to_relay_mode().await {
                        debug!(error = %e, "relay switch failed, staying in fallback");
                    }
                }
            }
            ConnectionState::FallbackConnected => {}
            ConnectionState::Degraded | ConnectionState::Disconnected => {
                let mut res = self.transport.lock().await;
                self.try_connect_preferred(&mut res).await;
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::time::Duration;

    fn unreachable_config() -> NotifyConfig {
        // Ports 1 and 9 have no listeners; connects are refused immediately.
        NotifyConfig::new("postgres://scorefeed@127.0.0.1:1/scorefeed", "redis://127.0.0.1:9")
            .with_retry_interval(Duration::from_secs(60))
    }

    /// In-process transport drivers with switchable reachability.
    ///
    /// A "connected" transport is a stub task that runs until cancelled or
    /// until `kill_relay` fires, in which case it reports itself lost the
    /// way the live dispatch loop does.
    struct FakeTransports {
        relay_up: AtomicBool,
        fallback_up: AtomicBool,
        relay_connects: AtomicUsize,
        fallback_connects: AtomicUsize,
        kill_relay: Arc<Notify>,
    }

    impl FakeTransports {
        fn new(relay_up: bool, fallback_up: bool) -> Arc<Self> {
            Arc::new(Self {
                relay_up: AtomicBool::new(relay_up),
                fallback_up: AtomicBool::new(fallback_up),
                relay_connects: AtomicUsize::new(0),
                fallback_connects: AtomicUsize::new(0),
                kill_relay: Arc::new(Notify::new()),
            })
        }

        fn spawn_stub(die: Arc<Notify>, lost: Arc<Notify>) -> TransportTask {
            let (cancel_tx, mut cancel_rx) = watch::channel(false);
            let task = tokio::spawn(async move {
                tokio::select! {
                    _ = cancel_rx.changed() => {}
                    _ = die.notified() => {
                        lost.notify_one();
                    }
                }
            });
            TransportTask { cancel_tx, task }
        }
    }

    impl Transports for FakeTransports {
        fn connect_relay(
            &self,
            lost: Arc<Notify>,
        ) -> BoxFuture<'_, Result<TransportTask, NotifyError>> {
            Box::pin(async move {
                self.relay_connects.fetch_add(1, Ordering::SeqCst);
                if !self.relay_up.load(Ordering::SeqCst) {
                    return Err(NotifyError::ConnectionLost("relay unreachable"));
                }
                Ok(Self::spawn_stub(Arc::clone(&self.kill_relay), lost))
            })
        }

        fn connect_fallback(
            &self,
            lost: Arc<Notify>,
        ) -> BoxFuture<'_, Result<TransportTask, NotifyError>> {
            Box::pin(async move {
                self.fallback_connects.fetch_add(1, Ordering::SeqCst);
                if !self.fallback_up.load(Ordering::SeqCst) {
                    return Err(NotifyError::ConnectionLost("store unreachable"));
                }
                // Fallback stubs only ever exit via cancellation here.
                Ok(Self::spawn_stub(Arc::new(Notify::new()), lost))
            })
        }

        fn probe_relay(&self) -> BoxFuture<'_, bool> {
            Box::pin(async move { self.relay_up.load(Ordering::SeqCst) })
        }
    }

    fn fake_manager(fakes: Arc<FakeTransports>, retry: Duration) -> Arc<ConnectionManager> {
        let config = NotifyConfig::new("postgres://unused", "redis://unused")
            .with_retry_interval(retry);
        ConnectionManager::with_transports(config, Arc::new(HandlerRegistry::new()), fakes)
    }

    async fn wait_for_state(manager: &ConnectionManager, want: ConnectionState) {
        let reached = tokio::time::timeout(Duration::from_secs(5), async {
            while manager.state() != want {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(reached.is_ok(), "timed out waiting for {want} state");
    }

    #[test]
    fn test_state_u8_round_trip() {
        for state in [
            ConnectionState::Disconnected,
            ConnectionState::RelayConnected,
            ConnectionState::FallbackConnected,
            ConnectionState::Degraded,
        ] {
            assert_eq!(ConnectionState::from_u8(state as u8), state);
        }
        assert_eq!(ConnectionState::from_u8(200), ConnectionState::Disconnected);
    }

    #[test]
    fn test_connected_states() {
        assert!(ConnectionState::RelayConnected.is_connected());
        assert!(ConnectionState::FallbackConnected.is_connected());
        assert!(!ConnectionState::Degraded.is_connected());
        assert!(!ConnectionState::Disconnected.is_connected());
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent_on_never_started_manager() {
        let manager = ConnectionManager::new(unreachable_config(), HashMap::new());
        manager.shutdown().await;
        manager.shutdown().await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(!manager.is_connected());

        let res = manager.transport.lock().await;
        assert!(res.relay.is_none());
        assert!(res.fallback.is_none());
        assert!(res.maintain.is_none());
    }

    #[tokio::test]
    async fn test_switch_to_relay_mode_is_noop_outside_fallback() {
        let manager = ConnectionManager::new(unreachable_config(), HashMap::new());
        assert!(manager.switch_to_relay_mode().await.is_ok());
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_startup_with_everything_unreachable_degrades_without_failing() {
        let manager = ConnectionManager::new(unreachable_config(), HashMap::new());
        manager.startup().await;

        assert!(!manager.is_connected());
        assert!(manager.is_degraded());
        {
            let res = manager.transport.lock().await;
            assert!(res.maintain.is_some(), "retry task should be running");
            assert!(res.relay.is_none());
            assert!(res.fallback.is_none());
        }

        manager.shutdown().await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        let res = manager.transport.lock().await;
        assert!(res.maintain.is_none());
    }

    #[tokio::test]
    async fn test_startup_twice_spawns_one_maintenance_loop() {
        let manager = ConnectionManager::new(unreachable_config(), HashMap::new());
        manager.startup().await;
        manager.startup().await;
        manager.shutdown().await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_shutdown_returns_promptly_while_maintenance_loop_is_idle() {
        // Retry interval is 60s; a shutdown that has to wait out the sleep
        // blows well past this timeout.
        let manager = ConnectionManager::new(unreachable_config(), HashMap::new());
        manager.startup().await;

        let done = tokio::time::timeout(Duration::from_secs(3), manager.shutdown()).await;
        assert!(done.is_ok(), "shutdown should not wait out the retry interval");
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_relay_loss_falls_back_then_returns_to_relay() {
        let fakes = FakeTransports::new(true, true);
        let manager = fake_manager(Arc::clone(&fakes), Duration::from_millis(20));
        manager.startup().await;
        assert_eq!(manager.state(), ConnectionState::RelayConnected);

        // Sever the relay mid-run.
        fakes.relay_up.store(false, Ordering::SeqCst);
        fakes.kill_relay.notify_one();
        wait_for_state(&manager, ConnectionState::FallbackConnected).await;
        assert_eq!(fakes.fallback_connects.load(Ordering::SeqCst), 1);

        // Relay comes back; the probe passes and the manager switches home.
        fakes.relay_up.store(true, Ordering::SeqCst);
        wait_for_state(&manager, ConnectionState::RelayConnected).await;
        assert!(fakes.relay_connects.load(Ordering::SeqCst) >= 2);

        manager.shutdown().await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_switch_to_fallback_mode_does_not_duplicate_subscription() {
        let fakes = FakeTransports::new(true, true);
        let manager = fake_manager(Arc::clone(&fakes), Duration::from_secs(60));

        assert!(manager.switch_to_fallback_mode().await.is_ok());
        assert_eq!(manager.state(), ConnectionState::FallbackConnected);
        assert!(manager.switch_to_fallback_mode().await.is_ok());

        assert_eq!(fakes.fallback_connects.load(Ordering::SeqCst), 1);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_degraded_manager_recovers_when_relay_returns() {
        let fakes = FakeTransports::new(false, false);
        let manager = fake_manager(Arc::clone(&fakes), Duration::from_millis(20));
        manager.startup().await;
        assert!(manager.is_degraded());

        fakes.relay_up.store(true, Ordering::SeqCst);
        wait_for_state(&manager, ConnectionState::RelayConnected).await;
        assert!(!manager.is_degraded());

        manager.shutdown().await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }
}
