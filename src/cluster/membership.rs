//! SWIM-style membership transport.
//!
//! One UDP socket carries probes and piggybacked gossip, a TCP listener on the
//! same port serves full state exchanges (join and anti-entropy). Background
//! tasks:
//!
//! - receiver: decodes datagrams, applies piggybacked broadcasts, answers probes
//! - acceptor: answers push/pull state exchanges
//! - prober: direct then indirect probing of one random member per interval
//! - gossip: flushes the broadcast queue to a few random members
//! - push/pull: periodic full state exchange with a random member
//! - reaper: suspicion timeouts, removal of departed members, snapshot writes
//!
//! All of them stop when [`Membership::shutdown`] cancels the closing token.

use crate::cluster::config::MembershipConfig;
use crate::cluster::messages::{
    self, Broadcast, MemberState, Message, Packet, PushPull, UserEvent, PIGGYBACK_BUDGET,
};
use crate::cluster::queue::BroadcastQueue;
use crate::cluster::snapshot::Snapshot;
use crate::cluster::types::{ClusterEvent, Member, MemberStatus};
use crate::errors::{ClusterError, ClusterResult};
use crate::logger::{self, LogTag};
use parking_lot::{Mutex, RwLock};
use rand::seq::IteratorRandom;
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot;
use tokio::time::{timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

const RECENT_EVENT_CAPACITY: usize = 1024;
const SHUTDOWN_WAIT: Duration = Duration::from_secs(2);

type EventKey = (u64, String, Vec<u8>);

struct Tracked {
    member: Member,
    /// Time of the last status transition
    changed: Instant,
}

enum AckHandler {
    Local(oneshot::Sender<()>),
    /// Relay the ack of an indirect probe back to the requester
    Forward {
        requester: SocketAddr,
        seq: u32,
        created: Instant,
    },
}

#[derive(Default)]
struct LamportClock(AtomicU64);

impl LamportClock {
    fn time(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    fn increment(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn witness(&self, other: u64) {
        let _ = self
            .0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (other >= current).then_some(other + 1)
            });
    }
}

struct RecentEvents {
    order: VecDeque<EventKey>,
    seen: HashSet<EventKey>,
}

impl RecentEvents {
    fn new() -> Self {
        Self {
            order: VecDeque::with_capacity(RECENT_EVENT_CAPACITY),
            seen: HashSet::with_capacity(RECENT_EVENT_CAPACITY),
        }
    }

    /// Returns false for an event seen before
    fn insert(&mut self, key: EventKey) -> bool {
        if !self.seen.insert(key.clone()) {
            return false;
        }
        self.order.push_back(key);
        if self.order.len() > RECENT_EVENT_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }
}

fn event_key(event: &UserEvent) -> EventKey {
    (event.ltime, event.name.clone(), event.payload.clone())
}

fn timed_out(what: &str) -> ClusterError {
    ClusterError::Io(std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        format!("{} timed out", what),
    ))
}

pub struct Membership {
    config: MembershipConfig,
    name: String,
    advertise: SocketAddr,
    socket: UdpSocket,
    nodes: RwLock<HashMap<String, Tracked>>,
    incarnation: AtomicU64,
    seq: AtomicU32,
    acks: Mutex<HashMap<u32, AckHandler>>,
    queue: Mutex<BroadcastQueue>,
    clock: LamportClock,
    recent: Mutex<RecentEvents>,
    coalesced: Mutex<HashMap<(String, Vec<u8>), ClusterEvent>>,
    events: mpsc::Sender<ClusterEvent>,
    left: AtomicBool,
    stopped: AtomicBool,
    snapshot_dirty: AtomicBool,
    closing: CancellationToken,
    tasks: TaskTracker,
}

impl Membership {
    /// Bind the gossip port, start the protocol tasks and rejoin snapshot peers
    pub async fn create(
        config: MembershipConfig,
        events: mpsc::Sender<ClusterEvent>,
    ) -> ClusterResult<Arc<Self>> {
        let bind = SocketAddr::new(config.bind_addr, config.bind_port);
        let listener = TcpListener::bind(bind)
            .await
            .map_err(|source| ClusterError::Bind { addr: bind, source })?;
        let port = listener.local_addr()?.port();

        let udp_addr = SocketAddr::new(config.bind_addr, port);
        let socket = UdpSocket::bind(udp_addr)
            .await
            .map_err(|source| ClusterError::Bind {
                addr: udp_addr,
                source,
            })?;

        let advertise_port = match config.advertise_port {
            0 => port,
            p => p,
        };
        let advertise = SocketAddr::new(config.advertise_addr, advertise_port);
        let name = config.identity.name.clone();

        let mut nodes = HashMap::new();
        nodes.insert(
            name.clone(),
            Tracked {
                member: Member {
                    name: name.clone(),
                    addr: advertise,
                    status: MemberStatus::Alive,
                    incarnation: 0,
                    tags: config.tags.clone(),
                },
                changed: Instant::now(),
            },
        );

        let membership = Arc::new(Self {
            queue: Mutex::new(BroadcastQueue::new(
                config.retransmit_mult,
                config.max_queue_depth,
            )),
            config,
            name,
            advertise,
            socket,
            nodes: RwLock::new(nodes),
            incarnation: AtomicU64::new(0),
            seq: AtomicU32::new(0),
            acks: Mutex::new(HashMap::new()),
            clock: LamportClock::default(),
            recent: Mutex::new(RecentEvents::new()),
            coalesced: Mutex::new(HashMap::new()),
            events,
            left: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            snapshot_dirty: AtomicBool::new(false),
            closing: CancellationToken::new(),
            tasks: TaskTracker::new(),
        });

        membership.spawn_tasks(listener);
        membership.rejoin_from_snapshot().await;

        logger::info(
            LogTag::Cluster,
            &format!(
                "Membership started: name={}, gossip={}, advertise={}",
                membership.name, udp_addr, membership.advertise
            ),
        );
        Ok(membership)
    }

    fn spawn_tasks(self: &Arc<Self>, listener: TcpListener) {
        let this = Arc::clone(self);
        self.tasks.spawn(async move { this.run_receiver().await });

        let this = Arc::clone(self);
        self.tasks
            .spawn(async move { this.run_acceptor(listener).await });

        let this = Arc::clone(self);
        self.tasks.spawn(async move { this.run_prober().await });

        let this = Arc::clone(self);
        self.tasks.spawn(async move { this.run_gossip().await });

        let this = Arc::clone(self);
        self.tasks.spawn(async move { this.run_push_pull().await });

        let this = Arc::clone(self);
        self.tasks.spawn(async move { this.run_reaper().await });

        if !self.config.user_coalesce_period.is_zero() {
            let this = Arc::clone(self);
            self.tasks.spawn(async move { this.run_coalescer().await });
        }
    }

    async fn rejoin_from_snapshot(self: &Arc<Self>) {
        let Some(path) = self.config.snapshot_path.clone() else {
            return;
        };
        let snapshot = Snapshot::load(&path).await;
        let peers: Vec<String> = snapshot
            .rejoin_peers(self.config.rejoin_after_leave)
            .iter()
            .filter(|peer| **peer != self.advertise)
            .map(|peer| peer.to_string())
            .collect();
        if peers.is_empty() {
            return;
        }

        logger::info(
            LogTag::Cluster,
            &format!("Rejoining {} peers from snapshot", peers.len()),
        );
        let this = Arc::clone(self);
        self.tasks.spawn(async move {
            tokio::select! {
                _ = this.closing.cancelled() => {}
                result = this.join(&peers) => match result {
                    Ok(count) => logger::info(
                        LogTag::Cluster,
                        &format!("Rejoined cluster through {} snapshot peers", count),
                    ),
                    Err(e) => logger::warning(
                        LogTag::Cluster,
                        &format!("Snapshot rejoin failed: {}", e),
                    ),
                },
            }
        });
    }

    // ------------------------------------------------------------------
    // Public operations
    // ------------------------------------------------------------------

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn advertise_addr(&self) -> SocketAddr {
        self.advertise
    }

    /// All known members including the local one, sorted by name
    pub fn members(&self) -> Vec<Member> {
        let mut members: Vec<Member> = self
            .nodes
            .read()
            .values()
            .map(|tracked| tracked.member.clone())
            .collect();
        members.sort_by(|a, b| a.name.cmp(&b.name));
        members
    }

    /// Exchange state with each seed. Errors only if no seed answered.
    pub async fn join(&self, seeds: &[String]) -> ClusterResult<usize> {
        self.ensure_running()?;

        let mut joined = 0;
        let mut failures = Vec::new();
        for seed in seeds {
            match self.join_seed(seed).await {
                Ok(()) => joined += 1,
                Err(e) => {
                    logger::debug(
                        LogTag::Cluster,
                        &format!("Failed to join seed {}: {}", seed, e),
                    );
                    failures.push(format!("{}: {}", seed, e));
                }
            }
        }

        if joined == 0 && !seeds.is_empty() {
            return Err(ClusterError::JoinFailed(failures.join("; ")));
        }

        logger::info(
            LogTag::Cluster,
            &format!("Joined cluster through {} of {} seeds", joined, seeds.len()),
        );
        Ok(joined)
    }

    /// Queue a user event for dissemination and deliver it locally
    pub fn broadcast(&self, name: &str, payload: Vec<u8>, coalesce: bool) -> ClusterResult<()> {
        self.ensure_running()?;

        let size = name.len() + payload.len();
        let limit = self.config.user_event_size_limit;
        if size > limit {
            return Err(ClusterError::EventTooLarge { size, limit });
        }

        let event = UserEvent {
            ltime: self.clock.increment(),
            name: name.to_string(),
            payload,
            coalesce,
        };
        self.recent.lock().insert(event_key(&event));
        self.deliver(ClusterEvent {
            name: event.name.clone(),
            payload: event.payload.clone(),
            ltime: event.ltime,
            coalesce,
        });
        self.enqueue(Broadcast::UserEvent(event));
        Ok(())
    }

    /// Announce departure and wait briefly for it to propagate
    pub async fn leave(&self) -> ClusterResult<()> {
        self.ensure_running()?;
        if self.left.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let incarnation = self.incarnation.load(Ordering::SeqCst);
        if let Some(local) = self.nodes.write().get_mut(&self.name) {
            local.member.status = MemberStatus::Left;
            local.changed = Instant::now();
        }
        self.enqueue(Broadcast::Dead {
            name: self.name.clone(),
            incarnation,
            from: self.name.clone(),
        });
        logger::info(LogTag::Cluster, "Leaving cluster");

        if self.peer_count() > 0 {
            let deadline = Instant::now() + self.config.leave_propagate_delay;
            loop {
                let drained = self.queue.lock().is_empty();
                if drained || Instant::now() >= deadline {
                    break;
                }
                tokio::time::sleep(self.config.gossip_interval.min(Duration::from_millis(50)))
                    .await;
            }
        }

        self.persist_snapshot().await;
        Ok(())
    }

    /// Stop all protocol tasks. Idempotent.
    pub async fn shutdown(&self) -> ClusterResult<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.closing.cancel();
        self.tasks.close();
        if timeout(SHUTDOWN_WAIT, self.tasks.wait()).await.is_err() {
            logger::warning(
                LogTag::Cluster,
                "Membership tasks did not stop in time, abandoning them",
            );
        }
        logger::info(LogTag::Cluster, "Membership transport shut down");
        Ok(())
    }

    fn ensure_running(&self) -> ClusterResult<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(ClusterError::Shutdown);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Member selection
    // ------------------------------------------------------------------

    /// Reachable members other than the local node
    fn peer_count(&self) -> usize {
        self.nodes
            .read()
            .values()
            .filter(|t| t.member.name != self.name && t.member.status.is_reachable())
            .count()
    }

    fn live_count(&self) -> usize {
        self.nodes
            .read()
            .values()
            .filter(|t| t.member.status.is_reachable())
            .count()
    }

    fn pick_peers(&self, amount: usize, exclude: &str) -> Vec<Member> {
        let nodes = self.nodes.read();
        let mut rng = rand::thread_rng();
        nodes
            .values()
            .filter(|t| {
                t.member.name != self.name
                    && t.member.name != exclude
                    && t.member.status.is_reachable()
            })
            .map(|t| t.member.clone())
            .choose_multiple(&mut rng, amount)
    }

    fn next_seq(&self) -> u32 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    fn enqueue(&self, broadcast: Broadcast) {
        let pruned = self.queue.lock().push(broadcast);
        if pruned > 0 {
            logger::debug(
                LogTag::Cluster,
                &format!("Broadcast queue full, dropped {} oldest", pruned),
            );
        }
    }

    /// Send a message with as many queued broadcasts as fit piggybacked
    async fn send(&self, message: Message, addr: SocketAddr) {
        let members = self.live_count();
        let piggyback = self.queue.lock().take(PIGGYBACK_BUDGET, members);
        self.send_packet(&Packet::with_piggyback(message, piggyback), addr)
            .await;
    }

    async fn send_packet(&self, packet: &Packet, addr: SocketAddr) {
        let data = match messages::seal(packet, &self.config.secret_key) {
            Ok(data) => data,
            Err(e) => {
                logger::error(LogTag::Cluster, &format!("Failed to encode packet: {}", e));
                return;
            }
        };
        if let Err(e) = self.socket.send_to(&data, addr).await {
            logger::debug(
                LogTag::Cluster,
                &format!("Failed to send packet to {}: {}", addr, e),
            );
        }
    }

    // ------------------------------------------------------------------
    // Receiving
    // ------------------------------------------------------------------

    async fn run_receiver(self: Arc<Self>) {
        let mut buf = vec![0u8; 65536];
        loop {
            let (len, from) = tokio::select! {
                _ = self.closing.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    Err(e) => {
                        logger::debug(LogTag::Cluster, &format!("Gossip receive error: {}", e));
                        continue;
                    }
                },
            };

            let packet = match messages::open(&buf[..len], &self.config.secret_key) {
                Ok(packet) => packet,
                Err(e) => {
                    logger::debug(
                        LogTag::Cluster,
                        &format!("Dropping packet from {}: {}", from, e),
                    );
                    continue;
                }
            };
            self.handle_packet(packet, from).await;
        }
    }

    async fn handle_packet(&self, packet: Packet, from: SocketAddr) {
        for broadcast in packet.piggyback {
            self.apply_broadcast(broadcast);
        }

        match packet.message {
            Message::Ping { seq, .. } => {
                let ack = Message::Ack {
                    seq,
                    from: self.name.clone(),
                };
                self.send(ack, from).await;
            }
            Message::Ack { seq, .. } => {
                let handler = self.acks.lock().remove(&seq);
                match handler {
                    Some(AckHandler::Local(tx)) => {
                        let _ = tx.send(());
                    }
                    Some(AckHandler::Forward { requester, seq, .. }) => {
                        let ack = Message::Ack {
                            seq,
                            from: self.name.clone(),
                        };
                        self.send(ack, requester).await;
                    }
                    None => {}
                }
            }
            Message::PingReq {
                seq,
                target,
                target_addr,
                from: requester,
            } => {
                logger::verbose(
                    LogTag::Cluster,
                    &format!("Indirect probe of {} for {}", target, requester),
                );
                let local_seq = self.next_seq();
                self.acks.lock().insert(
                    local_seq,
                    AckHandler::Forward {
                        requester: from,
                        seq,
                        created: Instant::now(),
                    },
                );
                let ping = Message::Ping {
                    seq: local_seq,
                    from: self.name.clone(),
                };
                self.send(ping, target_addr).await;
            }
            Message::Gossip => {}
            Message::PushPull(_) => {
                logger::debug(
                    LogTag::Cluster,
                    &format!("Ignoring push/pull datagram from {}", from),
                );
            }
        }
    }

    fn apply_broadcast(&self, broadcast: Broadcast) {
        let accepted = match &broadcast {
            Broadcast::Alive {
                name,
                addr,
                incarnation,
                tags,
            } => self.on_alive(name, *addr, *incarnation, tags),
            Broadcast::Suspect {
                name,
                incarnation,
                from,
            } => self.on_suspect(name, *incarnation, from),
            Broadcast::Dead {
                name,
                incarnation,
                from,
            } => self.on_dead(name, *incarnation, from),
            Broadcast::UserEvent(event) => self.on_user_event(event),
        };

        if accepted {
            self.enqueue(broadcast);
        }
    }

    // ------------------------------------------------------------------
    // State transitions. Each returns true if the change was accepted
    // and should be gossiped further.
    // ------------------------------------------------------------------

    fn on_alive(
        &self,
        name: &str,
        addr: SocketAddr,
        incarnation: u64,
        tags: &HashMap<String, String>,
    ) -> bool {
        if name == self.name {
            if incarnation > self.incarnation.load(Ordering::SeqCst)
                && !self.left.load(Ordering::SeqCst)
            {
                self.refute(incarnation);
            }
            return false;
        }

        let mut nodes = self.nodes.write();
        match nodes.get_mut(name) {
            None => {
                nodes.insert(
                    name.to_string(),
                    Tracked {
                        member: Member {
                            name: name.to_string(),
                            addr,
                            status: MemberStatus::Alive,
                            incarnation,
                            tags: tags.clone(),
                        },
                        changed: Instant::now(),
                    },
                );
                drop(nodes);
                logger::info(
                    LogTag::Cluster,
                    &format!("Member joined: {} ({})", name, addr),
                );
                self.snapshot_dirty.store(true, Ordering::SeqCst);
                true
            }
            Some(tracked) if incarnation > tracked.member.incarnation => {
                let previous = tracked.member.status;
                tracked.member.addr = addr;
                tracked.member.incarnation = incarnation;
                tracked.member.tags = tags.clone();
                tracked.member.status = MemberStatus::Alive;
                if previous != MemberStatus::Alive {
                    tracked.changed = Instant::now();
                    drop(nodes);
                    logger::info(
                        LogTag::Cluster,
                        &format!("Member {} is alive again (was {})", name, previous),
                    );
                    self.snapshot_dirty.store(true, Ordering::SeqCst);
                }
                true
            }
            Some(_) => false,
        }
    }

    fn on_suspect(&self, name: &str, incarnation: u64, from: &str) -> bool {
        if name == self.name {
            if !self.left.load(Ordering::SeqCst) {
                self.refute(incarnation);
            }
            return false;
        }

        let mut nodes = self.nodes.write();
        let Some(tracked) = nodes.get_mut(name) else {
            return false;
        };
        if incarnation < tracked.member.incarnation || tracked.member.status != MemberStatus::Alive
        {
            return false;
        }
        tracked.member.status = MemberStatus::Suspect;
        tracked.member.incarnation = incarnation;
        tracked.changed = Instant::now();
        drop(nodes);

        logger::info(
            LogTag::Cluster,
            &format!("Member suspected: {} (reported by {})", name, from),
        );
        true
    }

    fn on_dead(&self, name: &str, incarnation: u64, from: &str) -> bool {
        if name == self.name {
            if from != self.name && !self.left.load(Ordering::SeqCst) {
                self.refute(incarnation);
            }
            return false;
        }

        let mut nodes = self.nodes.write();
        let Some(tracked) = nodes.get_mut(name) else {
            return false;
        };
        if incarnation < tracked.member.incarnation || tracked.member.status.is_gone() {
            return false;
        }
        let status = if from == name {
            MemberStatus::Left
        } else {
            MemberStatus::Failed
        };
        tracked.member.status = status;
        tracked.member.incarnation = incarnation;
        tracked.changed = Instant::now();
        drop(nodes);

        match status {
            MemberStatus::Left => {
                logger::info(LogTag::Cluster, &format!("Member left: {}", name))
            }
            _ => logger::warning(
                LogTag::Cluster,
                &format!("Member failed: {} (reported by {})", name, from),
            ),
        }
        self.snapshot_dirty.store(true, Ordering::SeqCst);
        true
    }

    fn on_user_event(&self, event: &UserEvent) -> bool {
        self.clock.witness(event.ltime);
        if !self.recent.lock().insert(event_key(event)) {
            return false;
        }
        self.deliver(ClusterEvent {
            name: event.name.clone(),
            payload: event.payload.clone(),
            ltime: event.ltime,
            coalesce: event.coalesce,
        });
        true
    }

    /// Claim a higher incarnation than the accusation and gossip it
    fn refute(&self, accused: u64) {
        let previous = self
            .incarnation
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                Some(current.max(accused) + 1)
            })
            .unwrap_or(accused);
        let incarnation = previous.max(accused) + 1;

        let local = {
            let mut nodes = self.nodes.write();
            nodes.get_mut(&self.name).map(|tracked| {
                tracked.member.incarnation = incarnation;
                tracked.member.status = MemberStatus::Alive;
                tracked.member.clone()
            })
        };

        if let Some(local) = local {
            logger::debug(
                LogTag::Cluster,
                &format!("Refuting suspicion with incarnation {}", incarnation),
            );
            self.enqueue(Broadcast::Alive {
                name: local.name,
                addr: local.addr,
                incarnation,
                tags: local.tags,
            });
        }
    }

    fn deliver(&self, event: ClusterEvent) {
        if event.coalesce && !self.config.user_coalesce_period.is_zero() {
            self.coalesced
                .lock()
                .insert((event.name.clone(), event.payload.clone()), event);
            return;
        }
        self.dispatch(event);
    }

    fn dispatch(&self, event: ClusterEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => logger::warning(
                LogTag::Cluster,
                &format!("Event channel full, dropping '{}' event", event.name),
            ),
            Err(TrySendError::Closed(_)) => {}
        }
    }

    // ------------------------------------------------------------------
    // Background tasks
    // ------------------------------------------------------------------

    async fn run_prober(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.probe_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.closing.cancelled() => break,
                _ = interval.tick() => {}
            }
            if self.left.load(Ordering::SeqCst) {
                continue;
            }
            if let Some(target) = self.pick_peers(1, "").pop() {
                self.probe(target).await;
            }
        }
    }

    async fn probe(&self, target: Member) {
        let seq = self.next_seq();
        let (tx, mut rx) = oneshot::channel();
        self.acks.lock().insert(seq, AckHandler::Local(tx));

        let ping = Message::Ping {
            seq,
            from: self.name.clone(),
        };
        self.send(ping, target.addr).await;
        if matches!(timeout(self.config.probe_timeout, &mut rx).await, Ok(Ok(()))) {
            return;
        }

        let helpers = self.pick_peers(self.config.indirect_checks, &target.name);
        for helper in &helpers {
            let request = Message::PingReq {
                seq,
                target: target.name.clone(),
                target_addr: target.addr,
                from: self.name.clone(),
            };
            self.send(request, helper.addr).await;
        }

        let wait = self
            .config
            .probe_interval
            .saturating_sub(self.config.probe_timeout)
            .max(self.config.probe_timeout);
        let acked = matches!(timeout(wait, &mut rx).await, Ok(Ok(())));
        self.acks.lock().remove(&seq);

        if !acked {
            logger::debug(
                LogTag::Cluster,
                &format!(
                    "No ack from {} after direct and {} indirect probes",
                    target.name,
                    helpers.len()
                ),
            );
            if self.on_suspect(&target.name, target.incarnation, &self.name) {
                self.enqueue(Broadcast::Suspect {
                    name: target.name,
                    incarnation: target.incarnation,
                    from: self.name.clone(),
                });
            }
        }
    }

    async fn run_gossip(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.gossip_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = self.closing.cancelled() => break,
                _ = interval.tick() => {}
            }
            if self.queue.lock().is_empty() {
                continue;
            }

            let members = self.live_count();
            for target in self.pick_peers(self.config.gossip_nodes, "") {
                let piggyback = self.queue.lock().take(PIGGYBACK_BUDGET, members);
                if piggyback.is_empty() {
                    break;
                }
                let packet = Packet::with_piggyback(Message::Gossip, piggyback);
                self.send_packet(&packet, target.addr).await;
            }
        }
    }

    async fn run_push_pull(self: Arc<Self>) {
        let period = self.config.push_pull_interval;
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.closing.cancelled() => break,
                _ = interval.tick() => {}
            }
            if self.left.load(Ordering::SeqCst) {
                continue;
            }
            let Some(peer) = self.pick_peers(1, "").pop() else {
                continue;
            };
            if let Err(e) = self.exchange(peer.addr, false).await {
                logger::debug(
                    LogTag::Cluster,
                    &format!("Periodic push/pull with {} failed: {}", peer.name, e),
                );
            }
        }
    }

    async fn run_reaper(self: Arc<Self>) {
        let tick = self.config.probe_interval.min(Duration::from_secs(1));
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.closing.cancelled() => break,
                _ = interval.tick() => {}
            }
            self.reap();
            if self.snapshot_dirty.swap(false, Ordering::SeqCst) {
                self.persist_snapshot().await;
            }
        }
    }

    fn reap(&self) {
        let suspicion_timeout = self.config.suspicion_timeout();
        let reap_after = self.config.reap_after;
        let mut failed = Vec::new();
        let mut reaped = Vec::new();

        {
            let mut nodes = self.nodes.write();
            for tracked in nodes.values_mut() {
                if tracked.member.status == MemberStatus::Suspect
                    && tracked.changed.elapsed() >= suspicion_timeout
                {
                    tracked.member.status = MemberStatus::Failed;
                    tracked.changed = Instant::now();
                    failed.push((tracked.member.name.clone(), tracked.member.incarnation));
                }
            }
            nodes.retain(|name, tracked| {
                let expired = name != &self.name
                    && tracked.member.status.is_gone()
                    && tracked.changed.elapsed() >= reap_after;
                if expired {
                    reaped.push(name.clone());
                }
                !expired
            });
        }

        for (name, incarnation) in failed {
            logger::warning(
                LogTag::Cluster,
                &format!("Member failed: {} (suspicion timed out)", name),
            );
            self.enqueue(Broadcast::Dead {
                name,
                incarnation,
                from: self.name.clone(),
            });
            self.snapshot_dirty.store(true, Ordering::SeqCst);
        }
        for name in reaped {
            logger::debug(LogTag::Cluster, &format!("Reaped member {}", name));
        }

        let stale_after = self.config.probe_interval * 2;
        self.acks.lock().retain(|_, handler| match handler {
            AckHandler::Local(tx) => !tx.is_closed(),
            AckHandler::Forward { created, .. } => created.elapsed() < stale_after,
        });
    }

    async fn run_coalescer(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.user_coalesce_period);
        loop {
            tokio::select! {
                _ = self.closing.cancelled() => break,
                _ = interval.tick() => {}
            }
            let mut pending: Vec<ClusterEvent> =
                self.coalesced.lock().drain().map(|(_, event)| event).collect();
            pending.sort_by_key(|event| event.ltime);
            for event in pending {
                self.dispatch(event);
            }
        }
    }

    // ------------------------------------------------------------------
    // Push/pull state exchange
    // ------------------------------------------------------------------

    async fn run_acceptor(self: Arc<Self>, listener: TcpListener) {
        loop {
            let (stream, peer) = tokio::select! {
                _ = self.closing.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        logger::debug(LogTag::Cluster, &format!("Gossip accept error: {}", e));
                        continue;
                    }
                },
            };

            let this = Arc::clone(&self);
            self.tasks.spawn(async move {
                if let Err(e) = this.serve_push_pull(stream).await {
                    logger::debug(
                        LogTag::Cluster,
                        &format!("Push/pull from {} failed: {}", peer, e),
                    );
                }
            });
        }
    }

    async fn serve_push_pull(&self, mut stream: TcpStream) -> ClusterResult<()> {
        let key = self.config.secret_key;
        let request = timeout(self.config.tcp_timeout, messages::read_frame(&mut stream, &key))
            .await
            .map_err(|_| timed_out("push/pull read"))??;

        let Message::PushPull(remote) = request.message else {
            return Err(ClusterError::Decode(
                "expected push/pull request".to_string(),
            ));
        };

        let reply = Packet::new(Message::PushPull(self.local_state(false)));
        messages::write_frame(&mut stream, &reply, &key).await?;

        if remote.join {
            logger::debug(
                LogTag::Cluster,
                &format!("Join request carrying {} members", remote.members.len()),
            );
        }
        self.merge(remote);
        Ok(())
    }

    async fn join_seed(&self, seed: &str) -> ClusterResult<()> {
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host(seed).await?.collect();
        let mut last_error = ClusterError::JoinFailed(format!("{} resolved to no address", seed));
        for addr in addrs {
            match self.exchange(addr, true).await {
                Ok(()) => return Ok(()),
                Err(e) => last_error = e,
            }
        }
        Err(last_error)
    }

    async fn exchange(&self, addr: SocketAddr, join: bool) -> ClusterResult<()> {
        let key = self.config.secret_key;
        let tcp_timeout = self.config.tcp_timeout;

        let mut stream = timeout(tcp_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| timed_out("connect"))??;

        let request = Packet::new(Message::PushPull(self.local_state(join)));
        let reply = timeout(tcp_timeout, async {
            messages::write_frame(&mut stream, &request, &key).await?;
            messages::read_frame(&mut stream, &key).await
        })
        .await
        .map_err(|_| timed_out("push/pull"))??;

        match reply.message {
            Message::PushPull(remote) => {
                self.merge(remote);
                Ok(())
            }
            _ => Err(ClusterError::Decode(
                "expected push/pull reply".to_string(),
            )),
        }
    }

    fn local_state(&self, join: bool) -> PushPull {
        let members = self
            .nodes
            .read()
            .values()
            .map(|tracked| MemberState {
                name: tracked.member.name.clone(),
                addr: tracked.member.addr,
                incarnation: tracked.member.incarnation,
                status: tracked.member.status,
                tags: tracked.member.tags.clone(),
            })
            .collect();
        PushPull {
            join,
            members,
            event_ltime: self.clock.time(),
        }
    }

    fn merge(&self, remote: PushPull) {
        self.clock.witness(remote.event_ltime);

        for state in remote.members {
            if state.name == self.name {
                let ours = self.incarnation.load(Ordering::SeqCst);
                let accused = state.status != MemberStatus::Alive && state.incarnation >= ours;
                if (accused || state.incarnation > ours) && !self.left.load(Ordering::SeqCst) {
                    self.refute(state.incarnation);
                }
                continue;
            }

            match state.status {
                MemberStatus::Alive | MemberStatus::Suspect => {
                    if self.on_alive(&state.name, state.addr, state.incarnation, &state.tags) {
                        self.enqueue(Broadcast::Alive {
                            name: state.name.clone(),
                            addr: state.addr,
                            incarnation: state.incarnation,
                            tags: state.tags.clone(),
                        });
                    }
                    if state.status == MemberStatus::Suspect
                        && self.on_suspect(&state.name, state.incarnation, &self.name)
                    {
                        self.enqueue(Broadcast::Suspect {
                            name: state.name,
                            incarnation: state.incarnation,
                            from: self.name.clone(),
                        });
                    }
                }
                MemberStatus::Failed | MemberStatus::Left => {
                    let from = if state.status == MemberStatus::Left {
                        state.name.clone()
                    } else {
                        self.name.clone()
                    };
                    if self.on_dead(&state.name, state.incarnation, &from) {
                        self.enqueue(Broadcast::Dead {
                            name: state.name,
                            incarnation: state.incarnation,
                            from,
                        });
                    }
                }
            }
        }
    }

    async fn persist_snapshot(&self) {
        let Some(path) = &self.config.snapshot_path else {
            return;
        };
        let mut peers: Vec<SocketAddr> = self
            .nodes
            .read()
            .values()
            .filter(|t| t.member.name != self.name && t.member.status.is_reachable())
            .map(|t| t.member.addr)
            .collect();
        peers.sort();

        let snapshot = Snapshot {
            left: self.left.load(Ordering::SeqCst),
            peers,
        };
        if let Err(e) = snapshot.save(path).await {
            logger::warning(
                LogTag::Cluster,
                &format!("Failed to write snapshot {}: {}", path.display(), e),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn node(name: &str) -> (Arc<Membership>, mpsc::Receiver<ClusterEvent>) {
        let (tx, rx) = mpsc::channel(64);
        let membership = Membership::create(MembershipConfig::local(name), tx)
            .await
            .unwrap();
        (membership, rx)
    }

    async fn eventually<F: Fn() -> bool>(check: F) -> bool {
        for _ in 0..100 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    fn status_of(membership: &Membership, name: &str) -> Option<MemberStatus> {
        membership
            .members()
            .into_iter()
            .find(|m| m.name == name)
            .map(|m| m.status)
    }

    #[test]
    fn test_lamport_clock_witness() {
        let clock = LamportClock::default();
        assert_eq!(clock.increment(), 1);
        clock.witness(10);
        assert_eq!(clock.time(), 11);
        clock.witness(3);
        assert_eq!(clock.time(), 11);
    }

    #[test]
    fn test_recent_events_deduplicate_and_evict() {
        let mut recent = RecentEvents::new();
        assert!(recent.insert((1, "+".to_string(), vec![1])));
        assert!(!recent.insert((1, "+".to_string(), vec![1])));
        for i in 0..RECENT_EVENT_CAPACITY as u64 {
            recent.insert((i + 100, "+".to_string(), vec![]));
        }
        assert!(recent.insert((1, "+".to_string(), vec![1])));
    }

    #[tokio::test]
    async fn test_oversized_broadcast_is_rejected_without_side_effects() {
        let (membership, mut events) = node("solo").await;
        let before = membership.members();

        let result = membership.broadcast("+", vec![0u8; 600], false);
        assert!(matches!(
            result,
            Err(ClusterError::EventTooLarge {
                size: 601,
                limit: 512
            })
        ));
        assert_eq!(membership.members(), before);
        assert!(events.try_recv().is_err());

        membership.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_broadcast_is_delivered_locally() {
        let (membership, mut events) = node("solo").await;
        membership.broadcast("+", b"payload".to_vec(), true).unwrap();

        let event = events.recv().await.unwrap();
        assert_eq!(event.name, "+");
        assert_eq!(event.payload, b"payload");
        assert!(event.coalesce);

        membership.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_join_unreachable_seed_reports_error() {
        let (membership, _events) = node("lonely").await;

        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let free = probe.local_addr().unwrap();
        drop(probe);

        let result = membership.join(&[free.to_string()]).await;
        assert!(matches!(result, Err(ClusterError::JoinFailed(_))));
        assert_eq!(membership.members().len(), 1);

        membership.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_two_nodes_join_and_gossip_events() {
        let (a, _a_events) = node("node-a").await;
        let (b, mut b_events) = node("node-b").await;

        let joined = b.join(&[a.advertise_addr().to_string()]).await.unwrap();
        assert_eq!(joined, 1);
        assert_eq!(b.members().len(), 2);
        assert!(eventually(|| a.members().len() == 2).await);

        a.broadcast("+", b"chat/room1".to_vec(), false).unwrap();
        let event = timeout(Duration::from_secs(5), b_events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.name, "+");
        assert_eq!(event.payload, b"chat/room1");

        a.shutdown().await.unwrap();
        b.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_leave_is_seen_by_peers() {
        let (a, _a_events) = node("node-a").await;
        let (b, _b_events) = node("node-b").await;
        b.join(&[a.advertise_addr().to_string()]).await.unwrap();
        assert!(eventually(|| a.members().len() == 2).await);

        b.leave().await.unwrap();
        assert_eq!(status_of(&b, "node-b"), Some(MemberStatus::Left));
        assert!(eventually(|| status_of(&a, "node-b") == Some(MemberStatus::Left)).await);

        a.shutdown().await.unwrap();
        b.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_silent_member_is_suspected_then_failed() {
        let (a, _a_events) = node("node-a").await;
        let (b, _b_events) = node("node-b").await;
        b.join(&[a.advertise_addr().to_string()]).await.unwrap();
        assert!(eventually(|| a.members().len() == 2).await);

        b.shutdown().await.unwrap();
        assert!(eventually(|| matches!(
            status_of(&a, "node-b"),
            Some(MemberStatus::Failed) | None
        ))
        .await);

        a.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_operations_after_shutdown_fail() {
        let (membership, _events) = node("solo").await;
        membership.shutdown().await.unwrap();
        membership.shutdown().await.unwrap();

        assert!(matches!(
            membership.broadcast("+", vec![], false),
            Err(ClusterError::Shutdown)
        ));
        assert!(matches!(
            membership.join(&["127.0.0.1:1".to_string()]).await,
            Err(ClusterError::Shutdown)
        ));
        assert!(matches!(membership.leave().await, Err(ClusterError::Shutdown)));
    }

    #[tokio::test]
    async fn test_standalone_backlog_is_bounded() {
        let mut config = MembershipConfig::local("solo");
        config.max_queue_depth = 64;
        let (tx, _rx) = mpsc::channel(1024);
        let membership = Membership::create(config, tx).await.unwrap();

        for i in 0..500 {
            membership
                .broadcast("+", format!("topic/{}", i).into_bytes(), true)
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(membership.queue.lock().len(), 64);

        membership.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_leave_writes_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("members.json");
        let mut config = MembershipConfig::local("snap");
        config.snapshot_path = Some(path.clone());

        let (tx, _rx) = mpsc::channel(8);
        let membership = Membership::create(config, tx).await.unwrap();
        membership.leave().await.unwrap();
        membership.shutdown().await.unwrap();

        let snapshot = Snapshot::load(&path).await;
        assert!(snapshot.left);
        assert!(snapshot.peers.is_empty());
    }
}
