//! Session State Machine
//!
//! Table-driven dispatch: every (procedure, state, event) triple maps to at
//! most one handler. The table is built once at start-up and checked for
//! duplicates and for states that could never leave on peer failure or
//! timeout.

use std::collections::HashMap;

use crate::correlation::LegRequest;
use crate::error::{Rejection, SaegwcError, SaegwcResult};
use crate::event::{EventKind, Procedure, SessEvent, SessState};
use crate::handler::SessionCtx;
use crate::{gx_handler, recovery_handler, s11_handler, s5c_handler, sx_handler};

/// How a procedure ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Connected,
    IdleMode,
    /// Back to the stable state the procedure started from
    Resume,
    Released,
    /// Failed setup undone
    RolledBack,
}

/// Result of one handler invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Move to a waiting state and send requests
    Advance {
        state: SessState,
        requests: Vec<LegRequest>,
    },
    /// Hand the session to another procedure
    Switch {
        procedure: Procedure,
        state: SessState,
        requests: Vec<LegRequest>,
    },
    /// Keep the state, possibly sending more requests
    Stay { requests: Vec<LegRequest> },
    Complete(Disposition),
}

impl Outcome {
    pub fn stay() -> Self {
        Outcome::Stay {
            requests: Vec::new(),
        }
    }

    pub fn requests(&self) -> &[LegRequest] {
        match self {
            Outcome::Advance { requests, .. }
            | Outcome::Switch { requests, .. }
            | Outcome::Stay { requests } => requests,
            Outcome::Complete(_) => &[],
        }
    }
}

pub type Handler = fn(&mut SessionCtx<'_>, &SessEvent) -> Result<Outcome, Rejection>;

/// One row of the dispatch table, expanded over its procedures and states
pub struct Route {
    pub procedures: &'static [Procedure],
    pub states: &'static [SessState],
    pub event: EventKind,
    pub handler: Handler,
    pub name: &'static str,
}

// ============================================================================
// Dispatch Table
// ============================================================================

use Procedure as P;
use SessState as S;

const ATTACH: &[Procedure] = &[P::InitialAttach, P::ServiceRequest, P::Handover];
const MODIFY: &[Procedure] = &[P::ModifyBearer, P::ServiceRequest, P::Handover];
const ALL: &[Procedure] = &Procedure::ALL;

const STABLE: &[SessState] = &[S::Connected, S::IdleMode];
const SETUP_WAIT: &[SessState] = &[
    S::AssociationRequested,
    S::SessionEstablishRequested,
    S::SessionEstablished,
];
const TEARDOWN: &[SessState] = &[S::DeleteRequested, S::ErrorOccurred];

/// States waiting for an answer
pub const WAITING: &[SessState] = &[
    S::AssociationRequested,
    S::SessionEstablishRequested,
    S::SessionEstablished,
    S::CreateSessionRequested,
    S::ModifyRequested,
    S::BearerRequested,
    S::PolicyRequested,
    S::ForwardRequested,
    S::DeleteRequested,
    S::ErrorOccurred,
];

/// States of a session that exists
pub const LIVE: &[SessState] = &[
    S::AssociationRequested,
    S::SessionEstablishRequested,
    S::SessionEstablished,
    S::CreateSessionRequested,
    S::ModifyRequested,
    S::BearerRequested,
    S::PolicyRequested,
    S::ForwardRequested,
    S::DeleteRequested,
    S::ErrorOccurred,
    S::Connected,
    S::IdleMode,
];

const fn route(
    procedures: &'static [Procedure],
    states: &'static [SessState],
    event: EventKind,
    handler: Handler,
    name: &'static str,
) -> Route {
    Route {
        procedures,
        states,
        event,
        handler,
        name,
    }
}

pub static ROUTES: &[Route] = &[
    // PDN setup
    route(
        ATTACH,
        &[S::Idle, S::Connected, S::IdleMode],
        EventKind::CsReqRcvd,
        s11_handler::handle_create_session_request,
        "create_session_request",
    ),
    route(
        ATTACH,
        &[S::AssociationRequested],
        EventKind::UpfAssociated,
        sx_handler::handle_upf_associated,
        "upf_associated",
    ),
    route(
        ATTACH,
        &[S::SessionEstablishRequested],
        EventKind::PfcpSessEstRespRcvd,
        sx_handler::handle_session_establishment_response,
        "session_establishment_response",
    ),
    route(
        ATTACH,
        SETUP_WAIT,
        EventKind::CcaInitialRcvd,
        gx_handler::handle_cca_initial,
        "cca_initial",
    ),
    route(
        ATTACH,
        &[S::CreateSessionRequested],
        EventKind::CsRespRcvd,
        s5c_handler::handle_create_session_response,
        "create_session_response",
    ),
    route(
        &[
            P::InitialAttach,
            P::ServiceRequest,
            P::Handover,
            P::ModifyBearer,
            P::ReleaseAccessBearers,
            P::DedicatedBearerActivation,
            P::BearerModification,
            P::DedicatedBearerDeactivation,
        ],
        &[S::ModifyRequested],
        EventKind::PfcpSessModRespRcvd,
        sx_handler::handle_session_modification_response,
        "session_modification_response",
    ),
    // release
    route(
        &[P::InitialAttach, P::ServiceRequest, P::Handover, P::Detach, P::PeerRecovery],
        TEARDOWN,
        EventKind::PfcpSessEstRespRcvd,
        recovery_handler::handle_teardown_answer,
        "teardown_establishment_response",
    ),
    route(
        &[P::InitialAttach, P::ServiceRequest, P::Handover, P::Detach, P::PeerRecovery],
        TEARDOWN,
        EventKind::PfcpSessDelRespRcvd,
        recovery_handler::handle_teardown_answer,
        "teardown_deletion_response",
    ),
    route(
        &[P::InitialAttach, P::ServiceRequest, P::Handover, P::Detach, P::PeerRecovery],
        TEARDOWN,
        EventKind::CcaInitialRcvd,
        recovery_handler::handle_teardown_answer,
        "teardown_cca_initial",
    ),
    route(
        &[P::InitialAttach, P::ServiceRequest, P::Handover, P::Detach, P::PeerRecovery],
        TEARDOWN,
        EventKind::CcaTerminationRcvd,
        recovery_handler::handle_teardown_answer,
        "teardown_cca_termination",
    ),
    route(
        &[P::InitialAttach, P::ServiceRequest, P::Handover, P::Detach, P::PeerRecovery],
        TEARDOWN,
        EventKind::CsRespRcvd,
        recovery_handler::handle_teardown_answer,
        "teardown_create_session_response",
    ),
    route(
        &[P::InitialAttach, P::ServiceRequest, P::Handover, P::Detach, P::PeerRecovery],
        TEARDOWN,
        EventKind::DsRespRcvd,
        recovery_handler::handle_teardown_answer,
        "teardown_delete_session_response",
    ),
    route(
        &[P::PeerRecovery],
        TEARDOWN,
        EventKind::DbRespRcvd,
        recovery_handler::handle_teardown_answer,
        "teardown_delete_bearer_response",
    ),
    // access-side requests
    route(
        MODIFY,
        STABLE,
        EventKind::MbReqRcvd,
        s11_handler::handle_modify_bearer_request,
        "modify_bearer_request",
    ),
    route(
        &[P::ReleaseAccessBearers],
        STABLE,
        EventKind::RabReqRcvd,
        s11_handler::handle_release_access_bearers_request,
        "release_access_bearers_request",
    ),
    route(
        &[P::Detach],
        STABLE,
        EventKind::DsReqRcvd,
        s11_handler::handle_delete_session_request,
        "delete_session_request",
    ),
    route(
        &[P::UeRequestedBearerResource],
        STABLE,
        EventKind::BrCmdRcvd,
        s11_handler::handle_bearer_resource_command,
        "bearer_resource_command",
    ),
    route(
        &[P::DedicatedBearerDeactivation],
        STABLE,
        EventKind::DbCmdRcvd,
        s11_handler::handle_delete_bearer_command,
        "delete_bearer_command",
    ),
    route(
        &[P::ChangeNotification],
        STABLE,
        EventKind::CnReqRcvd,
        s11_handler::handle_change_notification_request,
        "change_notification_request",
    ),
    // access-side answers
    route(
        &[
            P::Detach,
            P::DedicatedBearerActivation,
            P::BearerModification,
            P::DedicatedBearerDeactivation,
        ],
        &[S::BearerRequested],
        EventKind::CbRespRcvd,
        s11_handler::handle_create_bearer_response,
        "create_bearer_response",
    ),
    route(
        &[
            P::Detach,
            P::DedicatedBearerActivation,
            P::BearerModification,
            P::DedicatedBearerDeactivation,
        ],
        &[S::BearerRequested],
        EventKind::UbRespRcvd,
        s11_handler::handle_update_bearer_response,
        "update_bearer_response",
    ),
    route(
        &[
            P::Detach,
            P::DedicatedBearerActivation,
            P::BearerModification,
            P::DedicatedBearerDeactivation,
        ],
        &[S::BearerRequested],
        EventKind::DbRespRcvd,
        s11_handler::handle_delete_bearer_response,
        "delete_bearer_response",
    ),
    // policy
    route(
        &[
            P::Detach,
            P::DedicatedBearerActivation,
            P::BearerModification,
            P::DedicatedBearerDeactivation,
        ],
        STABLE,
        EventKind::RarRcvd,
        gx_handler::handle_re_auth_request,
        "re_auth_request",
    ),
    route(
        &[
            P::UeRequestedBearerResource,
            P::ChangeNotification,
            P::DedicatedBearerActivation,
            P::BearerModification,
            P::DedicatedBearerDeactivation,
        ],
        &[S::PolicyRequested, S::ModifyRequested],
        EventKind::CcaUpdateRcvd,
        gx_handler::handle_cca_update,
        "cca_update",
    ),
    // PGW side (SGW-C)
    route(
        &[P::DedicatedBearerActivation],
        STABLE,
        EventKind::CbReqRcvd,
        s5c_handler::handle_create_bearer_request,
        "create_bearer_request",
    ),
    route(
        &[P::BearerModification],
        STABLE,
        EventKind::UbReqRcvd,
        s5c_handler::handle_update_bearer_request,
        "update_bearer_request",
    ),
    route(
        &[P::DedicatedBearerDeactivation, P::Detach],
        STABLE,
        EventKind::DbReqRcvd,
        s5c_handler::handle_delete_bearer_request,
        "delete_bearer_request",
    ),
    route(
        &[P::UeRequestedBearerResource],
        STABLE,
        EventKind::BrFailIndRcvd,
        s5c_handler::handle_failure_indication,
        "bearer_resource_failure_indication",
    ),
    route(
        &[P::DedicatedBearerDeactivation],
        STABLE,
        EventKind::DbFailIndRcvd,
        s5c_handler::handle_failure_indication,
        "delete_bearer_failure_indication",
    ),
    route(
        &[P::ChangeNotification],
        &[S::ForwardRequested],
        EventKind::CnRespRcvd,
        s5c_handler::handle_change_notification_response,
        "change_notification_response",
    ),
    // any procedure
    route(
        ALL,
        LIVE,
        EventKind::PfcpSessRptReqRcvd,
        sx_handler::handle_session_report_request,
        "session_report_request",
    ),
    route(
        ALL,
        LIVE,
        EventKind::DdnAckRcvd,
        s11_handler::handle_downlink_data_notification_ack,
        "downlink_data_notification_ack",
    ),
    route(
        ALL,
        LIVE,
        EventKind::PeerDown,
        recovery_handler::handle_peer_down,
        "peer_down",
    ),
    route(
        ALL,
        WAITING,
        EventKind::ResponseTimeout,
        recovery_handler::handle_response_timeout,
        "response_timeout",
    ),
];

// ============================================================================
// Dispatcher
// ============================================================================

type RouteKey = (Procedure, SessState, EventKind);

/// Expanded dispatch table
pub struct Dispatcher {
    table: HashMap<RouteKey, &'static Route>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("entries", &self.table.len())
            .finish()
    }
}

impl Dispatcher {
    /// Expand and validate the static route table
    pub fn new() -> SaegwcResult<Self> {
        let dispatcher = Self::from_routes(ROUTES)?;
        dispatcher.validate()?;
        Ok(dispatcher)
    }

    pub fn from_routes(routes: &'static [Route]) -> SaegwcResult<Self> {
        let mut table = HashMap::new();
        for route in routes {
            for procedure in route.procedures {
                for state in route.states {
                    let key = (*procedure, *state, route.event);
                    if let Some(existing) = table.insert(key, route) {
                        return Err(SaegwcError::DispatchTable(format!(
                            "{}/{}/{} claimed by both {} and {}",
                            procedure.name(),
                            state.name(),
                            route.event.name(),
                            existing.name,
                            route.name
                        )));
                    }
                }
            }
        }
        log::debug!("Dispatch table: {} routes, {} entries", routes.len(), table.len());
        Ok(Self { table })
    }

    /// Every live state must leave on peer failure, every waiting state on
    /// timeout
    pub fn validate(&self) -> SaegwcResult<()> {
        for procedure in Procedure::ALL {
            for state in LIVE {
                if self.lookup(procedure, *state, EventKind::PeerDown).is_none() {
                    return Err(SaegwcError::DispatchTable(format!(
                        "{}/{} has no peer failure exit",
                        procedure.name(),
                        state.name()
                    )));
                }
            }
            for state in WAITING {
                if self.lookup(procedure, *state, EventKind::ResponseTimeout).is_none() {
                    return Err(SaegwcError::DispatchTable(format!(
                        "{}/{} has no timeout exit",
                        procedure.name(),
                        state.name()
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn lookup(&self, procedure: Procedure, state: SessState, event: EventKind) -> Option<&'static Route> {
        self.table.get(&(procedure, state, event)).copied()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Run the handler registered for the context's key
    pub fn dispatch(&self, ctx: &mut SessionCtx<'_>, event: &SessEvent) -> Result<Outcome, Rejection> {
        let kind = event.kind().ok_or_else(|| {
            Rejection::from(SaegwcError::UnexpectedMessage(format!("{event:?}")))
        })?;
        let route = self.lookup(ctx.procedure, ctx.state, kind).ok_or_else(|| {
            Rejection::from(SaegwcError::UnexpectedMessage(format!(
                "{} in {}/{}",
                kind.name(),
                ctx.procedure.name(),
                ctx.state.name()
            )))
        })?;
        log::debug!(
            "Dispatch {}/{}/{} -> {}",
            ctx.procedure.name(),
            ctx.state.name(),
            kind.name(),
            route.name
        );
        (route.handler)(ctx, event)
    }
}
