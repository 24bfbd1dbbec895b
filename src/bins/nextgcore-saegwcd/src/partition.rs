//! Session Partition
//!
//! Run-to-completion worker owning one slice of the sessions. Inbound
//! session messages, response timer expiries and peer failures addressed
//! to the slice are processed here one at a time, so nothing the partition
//! owns needs a lock.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use crate::classifier::{self, Classified};
use crate::config::RetransmissionPolicy;
use crate::context::{NodeShared, PdnHandle, UeHandle};
use crate::correlation::{AnswerKey, CorrelationRecord, Leg, LegRequest, Origin, UeAggregate};
use crate::error::{Rejection, SaegwcError};
use crate::event::{Procedure, SessEvent, SessState};
use crate::gtp_build;
use crate::gx_build;
use crate::handler::{fold_aggregate, gtp_origin, retransmit_holder, SessionCtx, SessionTables};
use crate::identity::{IdentityKey, PartitionId};
use crate::message::{Envelope, GtpBody, GtpMessageType, GxBody, Inbound, Outbound, PfcpBody};
use crate::sm::{Dispatcher, Disposition, Outcome};
use crate::sx_build;
use crate::timer::DelayQueue;
use crate::types::{gtp_cause, gx_result, pfcp_cause, Csid, GtpInterface, PeerKind};
use crate::xact::{Seq24, SeqVerdict};

/// Work item delivered to a partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionInput {
    /// Session-level protocol message
    Message(Inbound),
    /// Peer died, restarted or deleted a connection set
    PeerDown {
        peer: IpAddr,
        kind: PeerKind,
        csids: Option<Vec<Csid>>,
    },
    /// PFCP association with a UPF came up
    UpfAssociated { upf: IpAddr },
}

/// Retransmission timer of one pending request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ResponseTimer {
    seid: u64,
    leg: Leg,
    key: AnswerKey,
}

/// Dispatch key of one handler run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Step {
    procedure: Procedure,
    state: SessState,
    ue: Option<UeHandle>,
    pdn: Option<PdnHandle>,
}

impl From<&Classified> for Step {
    fn from(classified: &Classified) -> Self {
        Self {
            procedure: classified.procedure,
            state: classified.state,
            ue: classified.ue,
            pdn: classified.pdn,
        }
    }
}

/// One session-owning partition
pub struct Partition {
    shared: Arc<NodeShared>,
    dispatcher: Arc<Dispatcher>,
    tables: SessionTables,
    timers: DelayQueue<ResponseTimer>,
}

impl Partition {
    pub fn new(shared: Arc<NodeShared>, dispatcher: Arc<Dispatcher>, id: PartitionId) -> Self {
        let tables = SessionTables::new(&shared, id);
        Self {
            shared,
            dispatcher,
            tables,
            timers: DelayQueue::new(),
        }
    }

    pub fn id(&self) -> PartitionId {
        self.tables.id
    }

    pub fn tables(&self) -> &SessionTables {
        &self.tables
    }

    /// Earliest pending response timer
    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Process one input to completion
    pub fn handle(&mut self, input: PartitionInput, now: Instant) -> Vec<Outbound> {
        match input {
            PartitionInput::Message(envelope) => self.handle_message(envelope, now),
            PartitionInput::PeerDown { peer, kind, csids } => self.peer_down(peer, kind, csids, now),
            PartitionInput::UpfAssociated { upf } => self.upf_associated(upf, now),
        }
    }

    // ========================================================================
    // Inbound Messages
    // ========================================================================

    pub fn handle_message(&mut self, envelope: Inbound, now: Instant) -> Vec<Outbound> {
        let mut out = Vec::new();
        let classified = match classifier::classify(
            &self.shared.identities,
            self.tables.id,
            &self.tables.graph,
            &self.tables.store,
            &envelope,
        ) {
            Ok(classified) => classified,
            Err(rejection) => {
                self.reject(&envelope, None, None, &rejection, &mut out);
                return out;
            }
        };
        if classified.event.is_answer() {
            self.handle_answer(envelope, &classified, now, &mut out);
        } else {
            self.handle_request(envelope, &classified, now, &mut out);
        }
        out
    }

    /// Leg an answer arrived on
    fn leg_of(&self, envelope: &Envelope) -> Leg {
        match envelope {
            Envelope::Gtp { iface, .. } if *iface == self.shared.role().access_interface() => Leg::Access,
            Envelope::Gtp { .. } => Leg::S5s8,
            Envelope::Pfcp { .. } => Leg::Sx,
            Envelope::Gx { .. } => Leg::Gx,
        }
    }

    fn handle_answer(&mut self, envelope: Inbound, classified: &Classified, now: Instant, out: &mut Vec<Outbound>) {
        let Some(seid) = classified.pdn.and_then(|pdn| self.seid_of(pdn)) else {
            log::warn!("{} without session, dropped", envelope.name());
            return;
        };
        let leg = self.leg_of(&envelope);
        let pending = AnswerKey::of_answer(&envelope).and_then(|key| {
            self.tables
                .store
                .get_mut(seid)
                .and_then(|record| record.take_matching(leg, key))
        });
        let Some(pending) = pending else {
            log::warn!(
                "Unmatched {} on {} SEID[0x{seid:016x}], dropped",
                envelope.name(),
                leg.name()
            );
            return;
        };
        if let Some(timer) = pending.timer {
            self.timers.cancel(timer);
        }

        let name = envelope.name();
        let event = SessEvent::Message(envelope);
        if let Err(rejection) = self.run(Step::from(classified), &event, now, out) {
            log::warn!("{name} rejected: {rejection}");
        }
    }

    fn handle_request(&mut self, envelope: Inbound, classified: &Classified, now: Instant, out: &mut Vec<Outbound>) {
        let gtp = match &envelope {
            Envelope::Gtp { iface, msg, .. } if msg.message_type().is_initial() => Some((*iface, msg.seq)),
            _ => None,
        };
        let mut fresh_holder = false;
        if let Some((iface, seq)) = gtp {
            match self.screen(classified, iface, seq, out) {
                Screen::Consumed => return,
                Screen::Accepted => {}
                Screen::NoHolder => fresh_holder = true,
            }
        }

        let initiating = gtp.is_some() || matches!(&envelope, Envelope::Gx { msg } if matches!(msg.body, GxBody::ReAuthRequest(_)));
        if initiating {
            if let Some(seid) = self.busy_target(classified) {
                let rejection = Rejection::with_cause(
                    gtp_cause::TEMPORARILY_REJECTED,
                    SaegwcError::AlreadyOutstanding { seid },
                );
                self.reject(&envelope, classified.ue, classified.pdn, &rejection, out);
                return;
            }
        }

        let fan_out = matches!(
            envelope.gtp_type(),
            Some(GtpMessageType::ModifyBearerRequest | GtpMessageType::ReleaseAccessBearersRequest)
        );
        let event = SessEvent::Message(envelope);
        if fan_out {
            self.fan_out(classified, &event, now, out);
            return;
        }

        match self.run(Step::from(classified), &event, now, out) {
            Ok(done) => {
                if let (true, Some((iface, seq))) = (fresh_holder, gtp) {
                    if let Some(holder) = retransmit_holder(&mut self.tables.graph, done.ue, done.pdn, iface) {
                        if holder.last_seq() != Some(seq) {
                            holder.accept(seq);
                        }
                    }
                }
            }
            Err(rejection) => {
                if let Some(envelope) = event.envelope() {
                    self.reject(envelope, classified.ue, classified.pdn, &rejection, out);
                }
            }
        }
    }

    /// Inbound retransmission detection for a GTP request
    fn screen(&mut self, classified: &Classified, iface: GtpInterface, seq: Seq24, out: &mut Vec<Outbound>) -> Screen {
        let outstanding = self.outstanding(classified, iface);
        let policy = self.shared.config.retransmission;
        let Some(holder) = retransmit_holder(&mut self.tables.graph, classified.ue, classified.pdn, iface) else {
            return Screen::NoHolder;
        };
        match holder.check(seq) {
            SeqVerdict::New => {
                holder.accept(seq);
                Screen::Accepted
            }
            SeqVerdict::Stale => {
                log::warn!("Stale request SEQ[{seq}] on {}, dropped", iface.name());
                Screen::Consumed
            }
            SeqVerdict::Duplicate => {
                match (outstanding, policy, holder.cached_response()) {
                    (true, _, _) => log::warn!("Retransmitted SEQ[{seq}] while in progress, dropped"),
                    (false, RetransmissionPolicy::Resend, Some(cached)) => {
                        log::info!("Retransmitted SEQ[{seq}], previous answer re-sent");
                        out.push(cached.clone());
                    }
                    (false, _, _) => log::warn!("Retransmitted SEQ[{seq}], dropped"),
                }
                Screen::Consumed
            }
        }
    }

    /// Whether a procedure runs on a session the holder covers
    fn outstanding(&self, classified: &Classified, iface: GtpInterface) -> bool {
        let graph = &self.tables.graph;
        let pdns: Vec<PdnHandle> = match iface {
            GtpInterface::S11 => classified
                .ue
                .and_then(|ue| graph.ue(ue))
                .map(|u| u.pdns().to_vec())
                .unwrap_or_default(),
            GtpInterface::S5s8 => classified.pdn.into_iter().collect(),
        };
        pdns.iter()
            .filter_map(|pdn| graph.pdn(*pdn))
            .any(|p| self.tables.store.contains(p.seid))
    }

    /// First addressed session with a live record
    fn busy_target(&self, classified: &Classified) -> Option<u64> {
        classified
            .targets
            .iter()
            .chain(classified.pdn.iter())
            .filter_map(|pdn| self.seid_of(*pdn))
            .find(|seid| self.tables.store.contains(*seid))
    }

    /// Run a UE-level request on each addressed PDN connection, answering once
    fn fan_out(&mut self, classified: &Classified, event: &SessEvent, now: Instant, out: &mut Vec<Outbound>) {
        let Some(envelope) = event.envelope() else {
            return;
        };
        let (Some(ue), false) = (classified.ue, classified.targets.is_empty()) else {
            let rejection = Rejection::from(SaegwcError::ContextNotFound("PDN connection".to_string()));
            self.reject(envelope, classified.ue, classified.pdn, &rejection, out);
            return;
        };
        let shared = Arc::clone(&self.shared);
        let origin = {
            let ctx = SessionCtx::new(
                &shared,
                &mut self.tables,
                classified.procedure,
                classified.state,
                Some(ue),
                classified.pdn,
            );
            gtp_origin(&ctx, event)
        };
        let origin = match origin {
            Ok(origin) => origin,
            Err(rejection) => {
                self.reject(envelope, Some(ue), classified.pdn, &rejection, out);
                return;
            }
        };
        let seids: Vec<u64> = classified.targets.iter().filter_map(|pdn| self.seid_of(*pdn)).collect();
        if let Some(ue_ctx) = self.tables.graph.ue_mut(ue) {
            ue_ctx.aggregate = Some(UeAggregate::new(origin, seids));
        }

        for target in classified.targets.iter().copied() {
            let Some(state) = self.tables.graph.pdn(target).map(|p| p.state) else {
                continue;
            };
            let procedure = classifier::initiated_procedure(&self.tables.graph, Some(target), envelope)
                .unwrap_or(classified.procedure);
            let step = Step {
                procedure,
                state,
                ue: Some(ue),
                pdn: Some(target),
            };
            if let Err(rejection) = self.run(step, event, now, out) {
                log::warn!("{} rejected for one PDN connection: {}", envelope.name(), rejection);
                let mut ctx = SessionCtx::new(&shared, &mut self.tables, procedure, state, Some(ue), Some(target));
                fold_aggregate(&mut ctx, rejection.cause, Vec::new());
                out.extend(ctx.take_outbound());
            }
        }
    }

    /// Peer TEID an error answer is addressed to
    fn answer_teid(&self, body: &GtpBody, iface: GtpInterface, ue: Option<UeHandle>, pdn: Option<PdnHandle>) -> u32 {
        let graph = &self.tables.graph;
        let role = self.shared.role();
        let fteid = match body {
            GtpBody::CreateSessionRequest(req) => req.sender_fteid,
            _ if iface == role.access_interface() && role.has_s11() => ue.and_then(|ue| graph.ue(ue)).and_then(|u| u.mme_s11),
            _ => pdn.and_then(|pdn| graph.pdn(pdn)).and_then(|p| p.peer_s5s8),
        };
        fteid.map(|f| f.teid).unwrap_or(0)
    }

    /// Answer a request that could not be processed
    fn reject(
        &mut self,
        envelope: &Envelope,
        ue: Option<UeHandle>,
        pdn: Option<PdnHandle>,
        rejection: &Rejection,
        out: &mut Vec<Outbound>,
    ) {
        log::warn!("{} rejected: {}", envelope.name(), rejection);
        match envelope {
            Envelope::Gtp { iface, msg, .. } if msg.message_type().is_initial() => {
                let teid = self.answer_teid(&msg.body, *iface, ue, pdn);
                let Some(answer) = gtp_build::build_error_response(envelope, teid, rejection.cause) else {
                    return;
                };
                if let Some(holder) = retransmit_holder(&mut self.tables.graph, ue, pdn, *iface) {
                    if holder.last_seq() == Some(msg.seq) {
                        holder.store_response(answer.clone());
                    }
                }
                out.push(answer);
            }
            Envelope::Gx { msg } if matches!(msg.body, GxBody::ReAuthRequest(_)) => {
                let origin = Origin::Gx {
                    session_id: msg.session_id.clone(),
                    hop_by_hop: msg.hop_by_hop,
                };
                out.extend(gx_build::build_raa(&origin, gx_result::from_gtp(rejection.cause), Vec::new()));
            }
            Envelope::Pfcp { peer, msg } if matches!(msg.body, PfcpBody::SessionReportRequest(_)) => {
                let answered = out.iter().any(|o| {
                    matches!(o, Envelope::Pfcp { msg: m, .. }
                        if m.seq == msg.seq && matches!(m.body, PfcpBody::SessionReportResponse { .. }))
                });
                if !answered {
                    let up_seid = pdn.and_then(|pdn| self.tables.graph.pdn(pdn)).and_then(|p| p.up_seid);
                    let cause = if pdn.is_some() {
                        pfcp_cause::REQUEST_REJECTED
                    } else {
                        pfcp_cause::SESSION_CONTEXT_NOT_FOUND
                    };
                    out.push(sx_build::build_session_report_response(*peer, up_seid, msg.seq, cause));
                }
            }
            _ => {}
        }
    }

    // ========================================================================
    // Handler Runs
    // ========================================================================

    fn seid_of(&self, pdn: PdnHandle) -> Option<u64> {
        self.tables.graph.pdn(pdn).map(|p| p.seid)
    }

    fn pdn_of_seid(&self, seid: u64) -> Option<PdnHandle> {
        let graph = &self.tables.graph;
        self.shared
            .identities
            .lookup(&IdentityKey::Seid(seid))
            .filter(|owner| owner.partition == self.tables.id)
            .and_then(|owner| owner.pdn)
            .filter(|pdn| graph.pdn(*pdn).is_some_and(|p| p.seid == seid))
            .or_else(|| graph.pdns().find(|(_, p)| p.seid == seid).map(|(pdn, _)| pdn))
    }

    /// Dispatch one event and apply the outcome to the session
    fn run(&mut self, step: Step, event: &SessEvent, now: Instant, out: &mut Vec<Outbound>) -> Result<Step, Rejection> {
        let shared = Arc::clone(&self.shared);
        let dispatcher = Arc::clone(&self.dispatcher);
        let had_record = step
            .pdn
            .and_then(|pdn| self.seid_of(pdn))
            .is_some_and(|seid| self.tables.store.contains(seid));

        let (result, done) = {
            let mut ctx = SessionCtx::new(&shared, &mut self.tables, step.procedure, step.state, step.ue, step.pdn);
            let result = dispatcher.dispatch(&mut ctx, event);
            out.extend(ctx.take_outbound());
            let done = Step {
                procedure: ctx.procedure,
                state: ctx.state,
                ue: ctx.ue,
                pdn: ctx.pdn,
            };
            (result, done)
        };

        match result {
            Ok(outcome) => {
                self.apply(done, outcome, now, out);
                Ok(done)
            }
            Err(rejection) => {
                self.undo(step, done, had_record);
                Err(rejection)
            }
        }
    }

    /// Drop what a rejected handler left behind
    fn undo(&mut self, before: Step, after: Step, had_record: bool) {
        if let Some(pdn) = after.pdn {
            if let Some(seid) = self.seid_of(pdn) {
                let created = after.pdn != before.pdn;
                if created || !had_record {
                    if let Some(record) = self.tables.store.complete(seid) {
                        self.cancel_timers(&record);
                    }
                }
                let unused = (created || before.state == SessState::Idle)
                    && self.tables.graph.pdn(pdn).is_some_and(|p| p.state == SessState::Idle);
                if unused {
                    self.tables.release_pdn(&self.shared, pdn);
                }
            }
        }
        if let Some(ue) = after.ue {
            self.tables.release_empty_ue(&self.shared, ue);
        }
    }

    fn set_state(&mut self, pdn: PdnHandle, procedure: Option<Procedure>, state: SessState) {
        if let Some(p) = self.tables.graph.pdn_mut(pdn) {
            if p.state != state {
                log::debug!("SEID[0x{:016x}] {} -> {}", p.seid, p.state.name(), state.name());
            }
            p.state = state;
            if procedure.is_some() {
                p.procedure = procedure;
            }
        }
    }

    fn apply(&mut self, done: Step, outcome: Outcome, now: Instant, out: &mut Vec<Outbound>) {
        let Some((pdn, seid)) = done.pdn.and_then(|pdn| self.seid_of(pdn).map(|seid| (pdn, seid))) else {
            // no session left to track requests against
            for request in outcome.requests() {
                out.push(request.request.clone());
            }
            return;
        };
        match outcome {
            Outcome::Advance { state, requests } => {
                self.set_state(pdn, Some(done.procedure), state);
                self.track(seid, requests, now, out);
            }
            Outcome::Switch {
                procedure,
                state,
                requests,
            } => {
                if let Some(record) = self.tables.store.get_mut(seid) {
                    record.procedure = procedure;
                }
                self.set_state(pdn, Some(procedure), state);
                self.track(seid, requests, now, out);
            }
            Outcome::Stay { requests } => {
                let procedure = self.tables.store.contains(seid).then_some(done.procedure);
                self.set_state(pdn, procedure, done.state);
                self.track(seid, requests, now, out);
            }
            Outcome::Complete(disposition) => self.complete(pdn, seid, done.state, disposition),
        }
    }

    fn complete(&mut self, pdn: PdnHandle, seid: u64, state: SessState, disposition: Disposition) {
        let record = self.tables.store.complete(seid);
        if let Some(record) = &record {
            self.cancel_timers(record);
        }
        let next = match disposition {
            Disposition::Connected => SessState::Connected,
            Disposition::IdleMode => SessState::IdleMode,
            Disposition::Resume => record
                .map(|r| r.resume)
                .filter(|s| s.is_stable())
                .or_else(|| state.is_stable().then_some(state))
                .unwrap_or(SessState::Connected),
            Disposition::Released | Disposition::RolledBack => {
                let ue = self.tables.graph.pdn(pdn).map(|p| p.ue);
                self.tables.release_pdn(&self.shared, pdn);
                if let Some(ue) = ue {
                    self.tables.release_empty_ue(&self.shared, ue);
                }
                return;
            }
        };
        self.set_state(pdn, None, next);
    }

    fn cancel_timers(&mut self, record: &CorrelationRecord) {
        for pending in record.pending() {
            if let Some(timer) = pending.timer {
                self.timers.cancel(timer);
            }
        }
    }

    /// Register outbound requests with the record and arm their timers
    fn track(&mut self, seid: u64, requests: Vec<LegRequest>, now: Instant, out: &mut Vec<Outbound>) {
        let response = self.shared.timers.response;
        let gx_wait = self.shared.timers.gx_answer_wait();
        for LegRequest { leg, request } in requests {
            let wait = if leg == Leg::Gx { gx_wait } else { response.duration };
            match self
                .tables
                .store
                .get_mut(seid)
                .and_then(|record| record.add_pending(leg, request.clone()))
            {
                Some(pending) => {
                    if response.enabled {
                        let timer = ResponseTimer {
                            seid,
                            leg,
                            key: pending.key,
                        };
                        pending.timer = Some(self.timers.schedule(now + wait, timer));
                    }
                }
                None => log::warn!("{} sent untracked SEID[0x{seid:016x}]", request.name()),
            }
            out.push(request);
        }
    }

    // ========================================================================
    // Timers and Node Events
    // ========================================================================

    /// Retransmit or time out the requests whose timers expired
    pub fn tick(&mut self, now: Instant) -> Vec<Outbound> {
        let mut out = Vec::new();
        let response = self.shared.timers.response;
        for (_, timer) in self.timers.pop_expired(now) {
            let Some(record) = self.tables.store.get_mut(timer.seid) else {
                continue;
            };
            let Some(pending) = record
                .pending_mut()
                .iter_mut()
                .find(|p| p.leg == timer.leg && p.key == timer.key)
            else {
                continue;
            };
            if timer.leg != Leg::Gx && pending.retries < response.max_count {
                pending.retries += 1;
                log::debug!(
                    "Retransmit {} retry[{}] SEID[0x{:016x}]",
                    pending.request.name(),
                    pending.retries,
                    timer.seid
                );
                out.push(pending.request.clone());
                pending.timer = Some(self.timers.schedule(now + response.duration, timer));
                continue;
            }
            record.take_matching(timer.leg, timer.key);
            log::warn!("No answer on {} for SEID[0x{:016x}]", timer.leg.name(), timer.seid);
            self.session_event(timer.seid, SessEvent::ResponseTimeout { leg: timer.leg }, now, &mut out);
        }
        out
    }

    /// Dispatch an internally generated event to one session
    fn session_event(&mut self, seid: u64, event: SessEvent, now: Instant, out: &mut Vec<Outbound>) {
        let Some(pdn) = self.pdn_of_seid(seid) else {
            return;
        };
        let Some(kind) = event.kind() else {
            return;
        };
        let Some(classified) = Classified::for_session(&self.tables.graph, pdn, kind) else {
            return;
        };
        if let Err(rejection) = self.run(Step::from(&classified), &event, now, out) {
            log::warn!("{} on SEID[0x{seid:016x}] failed: {}", kind.name(), rejection);
        }
    }

    /// Clean up every session depending on a failed peer
    pub fn peer_down(&mut self, peer: IpAddr, kind: PeerKind, csids: Option<Vec<Csid>>, now: Instant) -> Vec<Outbound> {
        let mut seids: Vec<u64> = match &csids {
            Some(csids) => self.tables.csids.sessions_for_csids(peer, csids).collect(),
            None => {
                let graph = &self.tables.graph;
                let mut seids: Vec<u64> = self.tables.csids.sessions_for(peer).collect();
                seids.extend(
                    graph
                        .pdns()
                        .filter(|(_, p)| {
                            p.depends_on(peer)
                                || graph
                                    .ue(p.ue)
                                    .and_then(|u| u.mme_s11)
                                    .is_some_and(|f| f.addr == peer)
                        })
                        .map(|(_, p)| p.seid),
                );
                seids
            }
        };
        seids.sort_unstable();
        seids.dedup();

        let mut out = Vec::new();
        if seids.is_empty() {
            return out;
        }
        log::info!(
            "{}[{peer}] down, {} session(s) in partition[{}]",
            kind.name(),
            seids.len(),
            self.tables.id
        );
        for seid in seids {
            let event = SessEvent::PeerDown {
                peer,
                kind,
                csids: csids.clone(),
            };
            self.session_event(seid, event, now, &mut out);
        }
        out
    }

    /// Resume the sessions parked until the UPF association
    pub fn upf_associated(&mut self, upf: IpAddr, now: Instant) -> Vec<Outbound> {
        let seids: Vec<u64> = self
            .tables
            .graph
            .pdns()
            .filter(|(_, p)| p.state == SessState::AssociationRequested && p.upf == Some(upf))
            .map(|(_, p)| p.seid)
            .collect();
        let mut out = Vec::new();
        for seid in seids {
            self.session_event(seid, SessEvent::UpfAssociated { upf }, now, &mut out);
        }
        out
    }
}

/// Result of inbound retransmission detection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Screen {
    /// New request, sequence number recorded
    Accepted,
    /// Duplicate or stale, nothing more to do
    Consumed,
    /// No context holds the sequence state yet
    NoHolder,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SaegwcConfig;
    use crate::message::{
        BearerContext, CreateSessionRequest, GtpMessage, ModifyBearerRequest, PfcpMessage,
        SessionEstablishmentResponse,
    };
    use crate::types::{FTeid, Imsi};
    use std::time::Duration;

    fn mme() -> IpAddr {
        "10.0.0.1".parse().unwrap()
    }

    fn upf() -> IpAddr {
        "127.0.0.7".parse().unwrap()
    }

    fn partition() -> Partition {
        let mut config = SaegwcConfig::default();
        config.partitions = 1;
        let shared = Arc::new(NodeShared::new(config, 1, 100));
        shared.set_associated(upf());
        let dispatcher = Arc::new(Dispatcher::new().unwrap());
        Partition::new(shared, dispatcher, 0)
    }

    fn create_session(seq: u32) -> Envelope {
        Envelope::Gtp {
            peer: mme(),
            iface: GtpInterface::S11,
            msg: GtpMessage::new(
                0,
                Seq24::new(seq),
                GtpBody::CreateSessionRequest(CreateSessionRequest {
                    imsi: Imsi::new("001010000000001"),
                    apn: "internet".to_string(),
                    sender_fteid: Some(FTeid::new(0x100, mme())),
                    bearer_contexts: vec![BearerContext::new(5)],
                    ..Default::default()
                }),
            ),
        }
    }

    fn establishment_answer(p: &Partition, out: &[Outbound]) -> Envelope {
        let seq = out
            .iter()
            .find_map(|o| match o {
                Envelope::Pfcp { msg, .. } => Some(msg.seq),
                _ => None,
            })
            .unwrap();
        let (_, pdn) = p.tables().graph.pdns().next().unwrap();
        Envelope::Pfcp {
            peer: upf(),
            msg: PfcpMessage::new(
                Some(pdn.seid),
                seq,
                PfcpBody::SessionEstablishmentResponse(SessionEstablishmentResponse {
                    cause: pfcp_cause::REQUEST_ACCEPTED,
                    up_seid: Some(0x9000),
                    up_fqcsid: None,
                }),
            ),
        }
    }

    fn pdn_state(p: &Partition) -> SessState {
        p.tables().graph.pdns().next().map(|(_, pdn)| pdn.state).unwrap()
    }

    fn gtp_cause_of(out: &Outbound) -> Option<u8> {
        match out {
            Envelope::Gtp { msg, .. } => msg.body.cause(),
            _ => None,
        }
    }

    #[test]
    fn test_create_session_establishes_user_plane() {
        let mut p = partition();
        let now = Instant::now();
        let out = p.handle_message(create_session(1), now);
        assert_eq!(out.len(), 1);
        assert!(matches!(
            &out[0],
            Envelope::Pfcp { msg, .. } if matches!(msg.body, PfcpBody::SessionEstablishmentRequest(_))
        ));
        assert_eq!(pdn_state(&p), SessState::SessionEstablishRequested);

        let answer = establishment_answer(&p, &out);
        let out = p.handle_message(answer, now);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].gtp_type(), Some(GtpMessageType::CreateSessionResponse));
        assert_eq!(gtp_cause_of(&out[0]), Some(gtp_cause::REQUEST_ACCEPTED));
        assert_eq!(pdn_state(&p), SessState::Connected);
        assert!(p.tables().store.is_empty());
        assert!(p.next_deadline().is_none());
    }

    #[test]
    fn test_duplicate_dropped_while_in_progress() {
        let mut p = partition();
        let now = Instant::now();
        assert_eq!(p.handle_message(create_session(1), now).len(), 1);
        assert!(p.handle_message(create_session(1), now).is_empty());
        assert_eq!(p.tables().graph.pdn_count(), 1);
    }

    #[test]
    fn test_duplicate_after_completion_resends_answer() {
        let mut p = partition();
        let now = Instant::now();
        let out = p.handle_message(create_session(1), now);
        let answer = establishment_answer(&p, &out);
        let first = p.handle_message(answer, now);

        let again = p.handle_message(create_session(1), now);
        assert_eq!(again, first);
        assert_eq!(p.tables().graph.pdn_count(), 1);
        assert_eq!(pdn_state(&p), SessState::Connected);
    }

    #[test]
    fn test_colliding_request_temporarily_rejected() {
        let mut p = partition();
        let now = Instant::now();
        p.handle_message(create_session(1), now);
        let out = p.handle_message(create_session(2), now);
        assert_eq!(out.len(), 1);
        assert_eq!(gtp_cause_of(&out[0]), Some(gtp_cause::TEMPORARILY_REJECTED));
        assert_eq!(pdn_state(&p), SessState::SessionEstablishRequested);
    }

    #[test]
    fn test_unknown_teid_context_not_found() {
        let mut p = partition();
        let request = Envelope::Gtp {
            peer: mme(),
            iface: GtpInterface::S11,
            msg: GtpMessage::new(
                0x1234,
                Seq24::new(7),
                GtpBody::ModifyBearerRequest(ModifyBearerRequest::default()),
            ),
        };
        let out = p.handle_message(request, Instant::now());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].gtp_type(), Some(GtpMessageType::ModifyBearerResponse));
        assert_eq!(gtp_cause_of(&out[0]), Some(gtp_cause::CONTEXT_NOT_FOUND));
    }

    #[test]
    fn test_retransmits_then_rolls_back() {
        let mut p = partition();
        let t3 = Duration::from_millis(3_001);
        let mut now = Instant::now();
        let sent = p.handle_message(create_session(1), now);

        for _ in 0..3 {
            now += t3;
            let out = p.tick(now);
            assert_eq!(out, sent);
        }
        now += t3;
        let out = p.tick(now);
        assert_eq!(out.len(), 1);
        assert_eq!(gtp_cause_of(&out[0]), Some(gtp_cause::REMOTE_PEER_NOT_RESPONDING));
        assert_eq!(p.tables().graph.pdn_count(), 0);
        assert_eq!(p.tables().graph.ue_count(), 0);
        assert!(p.tables().store.is_empty());
    }

    #[test]
    fn test_unmatched_answer_dropped() {
        let mut p = partition();
        let now = Instant::now();
        let out = p.handle_message(create_session(1), now);
        let Envelope::Pfcp { peer, msg } = establishment_answer(&p, &out) else {
            panic!("not PFCP");
        };
        let stray = Envelope::Pfcp {
            peer,
            msg: PfcpMessage::new(msg.seid, msg.seq.next(), msg.body),
        };
        assert!(p.handle_message(stray, now).is_empty());
        assert_eq!(pdn_state(&p), SessState::SessionEstablishRequested);
    }
}
