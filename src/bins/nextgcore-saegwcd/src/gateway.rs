//! Node Gateway
//!
//! Front of the coordinator. Session messages are routed to the partition
//! owning the session; node-level messages (echo, heartbeat, association,
//! connection-set deletion) are answered here, and liveness failures are
//! fanned out to every partition as peer-down cleanup.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::SaegwcConfig;
use crate::context::{partition_of_seid, partition_of_teid, NodeShared};
use crate::error::SaegwcResult;
use crate::gtp_build;
use crate::identity::{IdentityKey, PartitionId};
use crate::message::{Envelope, GtpBody, Inbound, Outbound, PfcpBody};
use crate::partition::{Partition, PartitionInput};
use crate::peer::{gtp_peer_kind, LivenessEvent, PeerTable};
use crate::sm::Dispatcher;
use crate::sx_build;
use crate::types::{gtp_cause, pfcp_cause, PeerKind};

// ============================================================================
// Routing
// ============================================================================

/// Where an inbound message is processed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Node-level message, liveness and association handling
    Node,
    /// Session message for the owning partition
    Partition(PartitionId),
}

/// Pick the worker for an inbound message
///
/// Locally allocated TEIDs and SEIDs carry their partition. A Create Session
/// Request without a TEID goes to the partition already holding the IMSI,
/// otherwise to the partition the IMSI hashes to.
pub fn route(shared: &NodeShared, envelope: &Envelope) -> Route {
    let partitions = shared.partitions().max(1);
    let id = match envelope {
        Envelope::Gtp { msg, .. } => match &msg.body {
            GtpBody::EchoRequest { .. }
            | GtpBody::EchoResponse { .. }
            | GtpBody::DeletePdnConnectionSetRequest(_)
            | GtpBody::DeletePdnConnectionSetResponse { .. } => return Route::Node,
            _ if msg.teid != 0 => partition_of_teid(msg.teid),
            GtpBody::CreateSessionRequest(req) => req
                .imsi
                .as_ref()
                .map(|imsi| {
                    shared
                        .identities
                        .lookup(&IdentityKey::Imsi(imsi.clone()))
                        .map(|owner| owner.partition)
                        .unwrap_or_else(|| (imsi.as_u64() % partitions as u64) as PartitionId)
                })
                .unwrap_or(0),
            GtpBody::ChangeNotificationRequest(req) => req
                .imsi
                .as_ref()
                .and_then(|imsi| shared.identities.lookup(&IdentityKey::Imsi(imsi.clone())))
                .map(|owner| owner.partition)
                .unwrap_or(0),
            _ => 0,
        },
        Envelope::Pfcp { msg, .. } => match &msg.body {
            PfcpBody::HeartbeatRequest { .. }
            | PfcpBody::HeartbeatResponse { .. }
            | PfcpBody::AssociationSetupRequest { .. }
            | PfcpBody::AssociationSetupResponse { .. }
            | PfcpBody::SessionSetDeletionRequest(_)
            | PfcpBody::SessionSetDeletionResponse { .. } => return Route::Node,
            _ => partition_of_seid(msg.seid.unwrap_or(0)),
        },
        Envelope::Gx { msg } => shared
            .identities
            .lookup(&IdentityKey::GxSession(msg.session_id.clone()))
            .map(|owner| owner.partition)
            .unwrap_or(0),
    };
    Route::Partition(id % partitions)
}

// ============================================================================
// Node-Level Handling
// ============================================================================

/// Liveness and association state of the node
pub struct NodeHandler {
    shared: Arc<NodeShared>,
    peers: PeerTable,
}

impl NodeHandler {
    pub fn new(shared: Arc<NodeShared>) -> Self {
        Self {
            shared,
            peers: PeerTable::new(),
        }
    }

    pub fn peers(&self) -> &PeerTable {
        &self.peers
    }

    /// Start probing the configured user plane nodes
    pub fn start(&mut self, now: Instant) {
        let upfs: Vec<IpAddr> = self.shared.config.upf.iter().map(|u| u.node).collect();
        for upf in upfs {
            self.peers.contact(upf, PeerKind::Upf, now);
        }
    }

    /// Note the sender of a session message as a peer to watch
    pub fn observe(&mut self, envelope: &Envelope, now: Instant) {
        if let Envelope::Gtp { peer, iface, .. } = envelope {
            let kind = gtp_peer_kind(self.shared.role(), *iface);
            self.peers.contact(*peer, kind, now + self.shared.timers.probe.duration);
        }
    }

    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.peers.next_deadline()
    }

    /// Drive probe timers
    pub fn tick(&mut self, now: Instant) -> (Vec<Outbound>, Vec<PartitionInput>) {
        let (out, events) = self.peers.tick(now, &self.shared);
        let mut inputs = Vec::new();
        self.liveness(events, &mut inputs);
        (out, inputs)
    }

    /// Handle a node-level message
    pub fn handle(&mut self, envelope: Inbound, now: Instant) -> (Vec<Outbound>, Vec<PartitionInput>) {
        let mut out = Vec::new();
        let mut inputs = Vec::new();
        match envelope {
            Envelope::Gtp { peer, iface, msg } => {
                let kind = gtp_peer_kind(self.shared.role(), iface);
                match msg.body {
                    GtpBody::EchoRequest { recovery } => {
                        out.push(gtp_build::build_echo_response(
                            peer,
                            iface,
                            msg.seq,
                            self.shared.restart_counter,
                        ));
                        let events = self.peers.on_probe_request(peer, kind, u32::from(recovery), now);
                        self.liveness(events, &mut inputs);
                    }
                    GtpBody::EchoResponse { recovery } => {
                        let events =
                            self.peers
                                .on_probe_response(peer, kind, msg.seq, u32::from(recovery), now, &self.shared);
                        self.liveness(events, &mut inputs);
                    }
                    GtpBody::DeletePdnConnectionSetRequest(req) => {
                        log::info!("Delete PDN Connection Set Request from {peer} FQ-CSIDs[{}]", req.fqcsids.len());
                        out.push(gtp_build::build_message(
                            peer,
                            iface,
                            0,
                            msg.seq,
                            GtpBody::DeletePdnConnectionSetResponse {
                                cause: gtp_cause::REQUEST_ACCEPTED,
                            },
                        ));
                        for fqcsid in req.fqcsids {
                            inputs.push(PartitionInput::PeerDown {
                                peer: fqcsid.node,
                                kind,
                                csids: Some(fqcsid.csids),
                            });
                        }
                    }
                    other => log::debug!("{} from {peer} ignored", other.message_type().name()),
                }
            }
            Envelope::Pfcp { peer, msg } => match msg.body {
                PfcpBody::HeartbeatRequest { recovery_ts } => {
                    out.push(sx_build::build_heartbeat_response(peer, msg.seq, self.shared.recovery_ts));
                    let events = self.peers.on_probe_request(peer, PeerKind::Upf, recovery_ts, now);
                    self.liveness(events, &mut inputs);
                }
                PfcpBody::HeartbeatResponse { recovery_ts } => {
                    let events =
                        self.peers
                            .on_probe_response(peer, PeerKind::Upf, msg.seq, recovery_ts, now, &self.shared);
                    self.liveness(events, &mut inputs);
                }
                PfcpBody::AssociationSetupRequest { recovery_ts, .. } => {
                    out.push(sx_build::build_association_setup_response(
                        peer,
                        self.shared.node_addr(),
                        msg.seq,
                        pfcp_cause::REQUEST_ACCEPTED,
                        self.shared.recovery_ts,
                    ));
                    let events = self.peers.on_probe_request(peer, PeerKind::Upf, recovery_ts, now);
                    self.liveness(events, &mut inputs);
                    self.associated(peer, &mut inputs);
                }
                PfcpBody::AssociationSetupResponse { cause, recovery_ts, .. } => {
                    let events =
                        self.peers
                            .on_probe_response(peer, PeerKind::Upf, msg.seq, recovery_ts, now, &self.shared);
                    self.liveness(events, &mut inputs);
                    if cause == pfcp_cause::REQUEST_ACCEPTED {
                        self.associated(peer, &mut inputs);
                    } else {
                        log::warn!("PFCP association with UPF[{peer}] refused cause[{cause}]");
                        self.shared.clear_association(peer);
                    }
                }
                PfcpBody::SessionSetDeletionRequest(req) => {
                    log::info!("Session Set Deletion Request from UPF[{peer}]");
                    out.push(sx_build::build_session_set_deletion_response(
                        peer,
                        msg.seq,
                        pfcp_cause::REQUEST_ACCEPTED,
                    ));
                    for fqcsid in req.fqcsids {
                        if fqcsid.node != peer {
                            log::warn!("FQ-CSID of node[{}] in Session Set Deletion ignored", fqcsid.node);
                            continue;
                        }
                        inputs.push(PartitionInput::PeerDown {
                            peer,
                            kind: PeerKind::Upf,
                            csids: Some(fqcsid.csids),
                        });
                    }
                }
                other => log::debug!("{} from {peer} ignored", other.message_type().name()),
            },
            Envelope::Gx { msg } => log::debug!("{} at node level ignored", msg.body.name()),
        }
        (out, inputs)
    }

    fn associated(&mut self, upf: IpAddr, inputs: &mut Vec<PartitionInput>) {
        if !self.shared.is_associated(upf) {
            log::info!("[Associated] UPF[{upf}]");
        }
        self.shared.set_associated(upf);
        inputs.push(PartitionInput::UpfAssociated { upf });
    }

    /// Cleanup inputs for failed and restarted peers
    fn liveness(&mut self, events: Vec<LivenessEvent>, inputs: &mut Vec<PartitionInput>) {
        for event in events {
            match event {
                LivenessEvent::Down { peer, kind } | LivenessEvent::Restarted { peer, kind } => {
                    if kind == PeerKind::Upf {
                        self.shared.clear_association(peer);
                    }
                    inputs.push(PartitionInput::PeerDown {
                        peer,
                        kind,
                        csids: None,
                    });
                }
                LivenessEvent::Up { peer, kind } => log::info!("Peer {}[{peer}] up", kind.name()),
                LivenessEvent::Removed { peer, kind } => log::debug!("Peer {}[{peer}] forgotten", kind.name()),
            }
        }
    }
}

// ============================================================================
// Gateway
// ============================================================================

/// Node handler plus every partition, driven from one thread
pub struct Gateway {
    shared: Arc<NodeShared>,
    node: NodeHandler,
    partitions: Vec<Partition>,
}

impl Gateway {
    pub fn new(config: SaegwcConfig, restart_counter: u8, recovery_ts: u32) -> SaegwcResult<Self> {
        config.validate()?;
        let dispatcher = Arc::new(Dispatcher::new()?);
        let shared = Arc::new(NodeShared::new(config, restart_counter, recovery_ts));
        let partitions: Vec<Partition> = (0..shared.partitions())
            .map(|id| Partition::new(Arc::clone(&shared), Arc::clone(&dispatcher), id))
            .collect();
        log::info!(
            "{} ready: partitions[{}] routes[{}] restart counter[{}]",
            shared.role().name(),
            partitions.len(),
            dispatcher.len(),
            restart_counter
        );
        Ok(Self {
            node: NodeHandler::new(Arc::clone(&shared)),
            shared,
            partitions,
        })
    }

    pub fn shared(&self) -> &Arc<NodeShared> {
        &self.shared
    }

    pub fn peers(&self) -> &PeerTable {
        self.node.peers()
    }

    pub fn partition(&self, id: PartitionId) -> Option<&Partition> {
        self.partitions.get(id)
    }

    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    pub fn start(&mut self, now: Instant) {
        self.node.start(now);
    }

    /// Process one inbound message
    pub fn handle(&mut self, envelope: Inbound, now: Instant) -> Vec<Outbound> {
        match route(&self.shared, &envelope) {
            Route::Node => {
                let (mut out, inputs) = self.node.handle(envelope, now);
                out.extend(self.broadcast(inputs, now));
                out
            }
            Route::Partition(id) => {
                self.node.observe(&envelope, now);
                match self.partitions.get_mut(id) {
                    Some(partition) => partition.handle_message(envelope, now),
                    None => Vec::new(),
                }
            }
        }
    }

    fn broadcast(&mut self, inputs: Vec<PartitionInput>, now: Instant) -> Vec<Outbound> {
        let mut out = Vec::new();
        for input in inputs {
            for partition in &mut self.partitions {
                out.extend(partition.handle(input.clone(), now));
            }
        }
        out
    }

    /// Fire every expired probe and response timer
    pub fn tick(&mut self, now: Instant) -> Vec<Outbound> {
        let (mut out, inputs) = self.node.tick(now);
        out.extend(self.broadcast(inputs, now));
        for partition in &mut self.partitions {
            out.extend(partition.tick(now));
        }
        out
    }

    pub fn next_deadline(&mut self) -> Option<Instant> {
        let node = self.node.next_deadline();
        self.partitions
            .iter_mut()
            .filter_map(|p| p.next_deadline())
            .chain(node)
            .min()
    }

    /// Run the node handler and each partition on its own task
    ///
    /// Inbound messages go through the returned handle; every answer and
    /// request the node produces comes out of its outbound receiver.
    pub fn spawn(mut self, shutdown: Arc<AtomicBool>, tick: Duration) -> GatewayHandle {
        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel::<Inbound>();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<Outbound>();
        let mut tasks = Vec::new();
        let mut senders = Vec::new();

        for mut partition in self.partitions.drain(..) {
            let (tx, mut rx) = mpsc::unbounded_channel::<PartitionInput>();
            senders.push(tx);
            let out = outbound_tx.clone();
            let shutdown = Arc::clone(&shutdown);
            tasks.push(tokio::spawn(async move {
                let id = partition.id();
                log::debug!("Partition[{id}] task started");
                let mut interval = tokio::time::interval(tick);
                loop {
                    tokio::select! {
                        input = rx.recv() => {
                            let Some(input) = input else {
                                break;
                            };
                            for message in partition.handle(input, Instant::now()) {
                                let _ = out.send(message);
                            }
                        }
                        _ = interval.tick() => {
                            if shutdown.load(Ordering::SeqCst) {
                                break;
                            }
                            for message in partition.tick(Instant::now()) {
                                let _ = out.send(message);
                            }
                        }
                    }
                }
                log::debug!("Partition[{id}] task finished");
            }));
        }

        let mut node = self.node;
        let shared = self.shared;
        let node_shutdown = Arc::clone(&shutdown);
        tasks.push(tokio::spawn(async move {
            log::debug!("Node task started");
            node.start(Instant::now());
            let mut interval = tokio::time::interval(tick);
            let broadcast = |inputs: Vec<PartitionInput>| {
                for input in inputs {
                    for sender in &senders {
                        let _ = sender.send(input.clone());
                    }
                }
            };
            loop {
                tokio::select! {
                    envelope = inbound_rx.recv() => {
                        let Some(envelope) = envelope else {
                            break;
                        };
                        let now = Instant::now();
                        match route(&shared, &envelope) {
                            Route::Node => {
                                let (out, inputs) = node.handle(envelope, now);
                                for message in out {
                                    let _ = outbound_tx.send(message);
                                }
                                broadcast(inputs);
                            }
                            Route::Partition(id) => {
                                node.observe(&envelope, now);
                                if let Some(sender) = senders.get(id) {
                                    let _ = sender.send(PartitionInput::Message(envelope));
                                }
                            }
                        }
                    }
                    _ = interval.tick() => {
                        if node_shutdown.load(Ordering::SeqCst) {
                            break;
                        }
                        let (out, inputs) = node.tick(Instant::now());
                        for message in out {
                            let _ = outbound_tx.send(message);
                        }
                        broadcast(inputs);
                    }
                }
            }
            log::debug!("Node task finished");
        }));

        GatewayHandle {
            inbound: inbound_tx,
            outbound: Some(outbound_rx),
            tasks,
            shutdown,
        }
    }
}

/// Running gateway tasks
pub struct GatewayHandle {
    inbound: mpsc::UnboundedSender<Inbound>,
    outbound: Option<mpsc::UnboundedReceiver<Outbound>>,
    tasks: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl GatewayHandle {
    /// Sender for decoded inbound messages
    pub fn sender(&self) -> mpsc::UnboundedSender<Inbound> {
        self.inbound.clone()
    }

    /// Receiver of everything the node sends; available once
    pub fn take_outbound(&mut self) -> Option<mpsc::UnboundedReceiver<Outbound>> {
        self.outbound.take()
    }

    /// Stop every task and wait for them
    pub async fn shutdown(self) {
        self.shutdown.store(true, Ordering::SeqCst);
        drop(self.inbound);
        for task in self.tasks {
            if let Err(e) = task.await {
                log::error!("Gateway task failed: {e}");
            }
        }
        log::info!("Gateway stopped");
    }
}
