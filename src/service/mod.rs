/// Service lifecycle controller
///
/// Owns everything a running node needs: the closing token every background
/// loop selects on, the membership handle (through the [`Registry`]), the
/// client dispatcher and the tracked background tasks.
///
/// Lifecycle: `Created → Configured → Clustering → Listening → Closing → Closed`.
/// `close()` runs at most once: flush logs, leave the cluster, shut the
/// transport down, cancel the closing token, drain connections.
mod registry;
mod signals;
mod state;
mod status;

pub use registry::Registry;
pub use state::LifecycleState;
pub use status::{run_status_reporter, MemberCounts};

use crate::address;
use crate::cluster::subscription;
use crate::cluster::{Cluster, ClusterEvent, EventKind, Membership, MembershipConfig, NodeIdentity};
use crate::config::Config;
use crate::errors::{EventError, ServiceError, ServiceResult};
use crate::license::{Cipher, License};
use crate::listener::{self, peer, Dispatcher};
use crate::logger::{self, LogTag};
use crate::session::{ConnectionHandler, Sessions};
use parking_lot::Mutex;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

pub struct Service {
    config: Config,
    license: License,
    cipher: Cipher,
    registry: Arc<Registry>,
    handler: Arc<dyn ConnectionHandler>,
    closing: CancellationToken,
    /// Fires once `close()` has finished
    closed: CancellationToken,
    closing_started: AtomicBool,
    tasks: TaskTracker,
    state: Mutex<LifecycleState>,
    connections: Mutex<Option<TaskTracker>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl Service {
    /// Build a service with the default session handler
    pub fn new(config: Config) -> ServiceResult<Arc<Self>> {
        Self::build(config, |registry, closing| -> Arc<dyn ConnectionHandler> {
            Arc::new(Sessions::new(registry, closing))
        })
    }

    /// Build a service that hands client connections to `handler`
    pub fn with_handler(
        config: Config,
        handler: Arc<dyn ConnectionHandler>,
    ) -> ServiceResult<Arc<Self>> {
        Self::build(config, move |_, _| handler)
    }

    fn build<F>(config: Config, make_handler: F) -> ServiceResult<Arc<Self>>
    where
        F: FnOnce(Arc<Registry>, CancellationToken) -> Arc<dyn ConnectionHandler>,
    {
        let license = License::parse(&config.license).map_err(ServiceError::InvalidLicense)?;
        let cipher = license.cipher().map_err(ServiceError::InvalidCipher)?;
        config.validate()?;

        let registry = Arc::new(Registry::new(local_name(&config)));
        let closing = CancellationToken::new();
        let handler = make_handler(Arc::clone(&registry), closing.clone());

        let service = Self {
            config,
            license,
            cipher,
            registry,
            handler,
            closing,
            closed: CancellationToken::new(),
            closing_started: AtomicBool::new(false),
            tasks: TaskTracker::new(),
            state: Mutex::new(LifecycleState::Created),
            connections: Mutex::new(None),
            local_addr: Mutex::new(None),
        };
        service.set_state(LifecycleState::Configured);
        logger::info(
            LogTag::Service,
            &format!(
                "Service configured: node={}, contract={}",
                service.name(),
                service.license.contract
            ),
        );
        Ok(Arc::new(service))
    }

    /// Local node name
    pub fn name(&self) -> &str {
        self.registry.local()
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock()
    }

    pub fn closing(&self) -> CancellationToken {
        self.closing.clone()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn cipher(&self) -> &Cipher {
        &self.cipher
    }

    pub fn license(&self) -> &License {
        &self.license
    }

    /// Address the client dispatcher is bound to, once listening
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Record a local subscription change and announce it to the cluster
    pub fn broadcast_subscription(&self, kind: EventKind, topic: &str) -> Result<bool, EventError> {
        self.registry.broadcast_subscription(kind, topic)
    }

    fn set_state(&self, next: LifecycleState) {
        let mut state = self.state.lock();
        if next <= *state {
            return;
        }
        *state = next;
        drop(state);
        logger::debug(LogTag::Service, &format!("State -> {}", next));
    }

    /// Start clustering and serve clients until closing. Always closes
    /// before returning.
    pub async fn listen(self: &Arc<Self>) -> ServiceResult<()> {
        if self.state() != LifecycleState::Configured {
            return Err(ServiceError::Closed);
        }
        signals::hook(Arc::clone(self));

        let result = self.run().await;
        if let Err(e) = &result {
            logger::error(LogTag::Service, &format!("Service failed: {}", e));
        }
        self.close().await;
        result
    }

    async fn run(self: &Arc<Self>) -> ServiceResult<()> {
        if let Some(cluster_config) = &self.config.cluster {
            self.set_state(LifecycleState::Clustering);

            let membership_config = MembershipConfig::from_cluster(cluster_config);
            let bind_ip = membership_config.bind_addr;
            let (events_tx, events_rx) = mpsc::channel(membership_config.event_buffer);
            let membership = Membership::create(membership_config, events_tx).await?;

            let route_addr = SocketAddr::new(bind_ip, cluster_config.route_port);
            self.start_cluster(membership, events_rx, &cluster_config.seed, route_addr)
                .await?;
        }

        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.config.listen_port);
        let dispatcher = Dispatcher::bind(
            addr,
            Arc::clone(&self.handler),
            self.config.sniff_timeout(),
        )
        .await?;
        *self.connections.lock() = Some(dispatcher.connections());
        *self.local_addr.lock() = Some(dispatcher.local_addr());

        if self.closing.is_cancelled() {
            return Ok(());
        }
        self.set_state(LifecycleState::Listening);
        dispatcher.serve(self.closing.clone()).await
    }

    /// Wire a membership transport into the service: event loop, route
    /// listener, seed join and status reporter
    pub(crate) async fn start_cluster(
        self: &Arc<Self>,
        cluster: Arc<dyn Cluster>,
        events: mpsc::Receiver<ClusterEvent>,
        seeds: &[String],
        route_addr: SocketAddr,
    ) -> ServiceResult<()> {
        self.registry.attach(Arc::clone(&cluster));

        self.tasks.spawn(subscription::run_event_loop(
            events,
            Arc::clone(self.registry.trie()),
            self.registry.local().to_string(),
            self.closing.clone(),
        ));

        let route_listener = peer::bind(route_addr).await?;
        self.tasks.spawn(peer::serve(
            route_listener,
            self.closing.clone(),
            peer::drop_peer,
        ));

        if !seeds.is_empty() {
            match cluster.join(seeds).await {
                Ok(count) => logger::info(
                    LogTag::Service,
                    &format!("Joined cluster through {} seeds", count),
                ),
                Err(e) => logger::warning(
                    LogTag::Service,
                    &format!("Unable to join cluster, continuing standalone: {}", e),
                ),
            }
        }

        self.tasks.spawn(run_status_reporter(
            cluster,
            self.config.status_interval(),
            self.closing.clone(),
        ));
        Ok(())
    }

    /// Graceful shutdown. Later calls wait for the first one to finish.
    pub async fn close(&self) {
        if self.closing_started.swap(true, Ordering::SeqCst) {
            self.closed.cancelled().await;
            return;
        }

        self.set_state(LifecycleState::Closing);
        logger::info(LogTag::Service, "Closing service");
        logger::flush();

        if let Some(cluster) = self.registry.detach() {
            if let Err(e) = cluster.leave().await {
                logger::warning(LogTag::Service, &format!("Failed to leave cluster: {}", e));
            }
            if let Err(e) = cluster.shutdown().await {
                logger::warning(
                    LogTag::Service,
                    &format!("Failed to shut down membership: {}", e),
                );
            }
        }

        self.closing.cancel();

        let drain_timeout = self.config.drain_timeout();
        let connections = self.connections.lock().clone();
        if let Some(connections) = connections {
            listener::drain(&connections, drain_timeout).await;
        }

        self.tasks.close();
        if tokio::time::timeout(drain_timeout, self.tasks.wait())
            .await
            .is_err()
        {
            logger::warning(LogTag::Service, "Background tasks did not stop in time");
        }

        self.set_state(LifecycleState::Closed);
        logger::info(LogTag::Service, "Service closed");
        logger::flush();
        self.closed.cancel();
    }

    /// Signal path without the process exit
    pub async fn on_signal(&self, signal: &str) {
        logger::warning(
            LogTag::System,
            &format!("Shutdown signal received ({})", signal),
        );
        self.close().await;
    }
}

/// Node name used as the origin of local subscriptions
fn local_name(config: &Config) -> String {
    let fingerprint = address::fingerprint();
    match &config.cluster {
        Some(cluster) => {
            NodeIdentity::new(fingerprint, Some(&cluster.node_name), cluster.gossip_port).name
        }
        None => NodeIdentity::new(fingerprint, None, config.listen_port).name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::Member;
    use crate::config::ClusterConfig;
    use crate::errors::{ClusterError, ClusterResult, LicenseError};
    use crate::session::ClientConn;
    use async_trait::async_trait;
    use std::time::Duration;

    struct Nop;

    #[async_trait]
    impl ConnectionHandler for Nop {
        async fn process(&self, _conn: ClientConn) {}
    }

    /// Records the order of transport calls and whether closing had fired
    struct Recording {
        closing: CancellationToken,
        calls: Mutex<Vec<(&'static str, bool)>>,
    }

    impl Recording {
        fn new(closing: CancellationToken) -> Self {
            Self {
                closing,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn record(&self, call: &'static str) {
            self.calls.lock().push((call, self.closing.is_cancelled()));
        }
    }

    #[async_trait]
    impl Cluster for Recording {
        fn name(&self) -> &str {
            "node-a"
        }

        async fn join(&self, seeds: &[String]) -> ClusterResult<usize> {
            self.record("join");
            Err(ClusterError::JoinFailed(seeds.join(",")))
        }

        fn broadcast(&self, _name: &str, _payload: Vec<u8>, _coalesce: bool) -> ClusterResult<()> {
            self.record("broadcast");
            Ok(())
        }

        async fn leave(&self) -> ClusterResult<()> {
            self.record("leave");
            Ok(())
        }

        async fn shutdown(&self) -> ClusterResult<()> {
            self.record("shutdown");
            Ok(())
        }

        fn members(&self) -> Vec<Member> {
            Vec::new()
        }
    }

    fn config() -> Config {
        Config {
            license: License::new_encoded("s3cret", 1, 0),
            listen_port: 0,
            drain_timeout_secs: 1,
            ..Default::default()
        }
    }

    fn free_port() -> u16 {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port()
    }

    async fn wait_for_state(service: &Service, state: LifecycleState) -> bool {
        for _ in 0..100 {
            if service.state() == state {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[test]
    fn test_new_rejects_bad_license_and_cipher() {
        let bad = Config {
            license: "not a license".to_string(),
            ..config()
        };
        assert!(matches!(
            Service::new(bad),
            Err(ServiceError::InvalidLicense(_))
        ));

        let keyless = Config {
            license: License::new_encoded("", 1, 0),
            ..config()
        };
        assert!(matches!(
            Service::new(keyless),
            Err(ServiceError::InvalidCipher(LicenseError::InvalidCipher))
        ));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let service = Service::with_handler(config(), Arc::new(Nop)).unwrap();
        assert_eq!(service.state(), LifecycleState::Configured);

        service.close().await;
        service.close().await;
        assert_eq!(service.state(), LifecycleState::Closed);
        assert!(service.closing().is_cancelled());
        assert!(matches!(service.listen().await, Err(ServiceError::Closed)));
    }

    #[tokio::test]
    async fn test_signal_leaves_then_shuts_down_then_closes() {
        let service = Service::with_handler(config(), Arc::new(Nop)).unwrap();
        let recording = Arc::new(Recording::new(service.closing()));
        let (_events_tx, events_rx) = mpsc::channel(8);

        service
            .start_cluster(
                recording.clone(),
                events_rx,
                &["10.0.0.2:7946".to_string()],
                "127.0.0.1:0".parse().unwrap(),
            )
            .await
            .unwrap();

        let running = Arc::clone(&service);
        let listening = tokio::spawn(async move { running.listen().await });
        assert!(wait_for_state(&service, LifecycleState::Listening).await);

        service.on_signal("SIGTERM").await;

        assert_eq!(
            *recording.calls.lock(),
            vec![("join", false), ("leave", false), ("shutdown", false)]
        );
        assert!(service.closing().is_cancelled());
        assert_eq!(service.state(), LifecycleState::Closed);

        let result = tokio::time::timeout(Duration::from_secs(5), listening)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_unreachable_seed_does_not_block_listening() {
        let cluster = ClusterConfig {
            seed: vec![format!("127.0.0.1:{}", free_port())],
            gossip_port: 0,
            route_port: 0,
            bind_addr: "127.0.0.1".to_string(),
            node_name: "node-a".to_string(),
            leave_propagate_delay_ms: 100,
            ..Default::default()
        };
        let service = Service::with_handler(
            Config {
                cluster: Some(cluster),
                ..config()
            },
            Arc::new(Nop),
        )
        .unwrap();

        let running = Arc::clone(&service);
        let listening = tokio::spawn(async move { running.listen().await });
        assert!(wait_for_state(&service, LifecycleState::Listening).await);
        assert!(service.local_addr().is_some());

        service.close().await;
        let result = tokio::time::timeout(Duration::from_secs(5), listening)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_listen_fails_on_taken_port() {
        let taken = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        let service = Service::with_handler(
            Config {
                listen_port: port,
                ..config()
            },
            Arc::new(Nop),
        )
        .unwrap();

        assert!(matches!(
            service.listen().await,
            Err(ServiceError::Bind { .. })
        ));
        assert_eq!(service.state(), LifecycleState::Closed);
    }

    #[tokio::test]
    async fn test_subscription_propagates_between_nodes() {
        let (a_tx, _a_rx) = mpsc::channel(64);
        let a = Membership::create(MembershipConfig::local("node-a"), a_tx)
            .await
            .unwrap();
        let (b_tx, b_rx) = mpsc::channel(64);
        let b = Membership::create(MembershipConfig::local("node-b"), b_tx)
            .await
            .unwrap();
        b.join(&[a.advertise_addr().to_string()]).await.unwrap();
        for _ in 0..100 {
            if a.members().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let registry_a = Registry::new("node-a".to_string());
        registry_a.attach(a.clone());
        let trie_b = Arc::new(crate::subscriptions::SubscriptionTrie::new());
        let closing = CancellationToken::new();
        let event_loop = tokio::spawn(subscription::run_event_loop(
            b_rx,
            Arc::clone(&trie_b),
            "node-b".to_string(),
            closing.clone(),
        ));

        registry_a
            .broadcast_subscription(EventKind::Subscribe, "chat/room1")
            .unwrap();
        let mut applied = false;
        for _ in 0..150 {
            if trie_b.contains("chat/room1", "node-a") {
                applied = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(applied);
        assert!(registry_a.trie().contains("chat/room1", "node-a"));

        closing.cancel();
        event_loop.await.unwrap();
        a.shutdown().await.unwrap();
        b.shutdown().await.unwrap();
    }
}
