//! Maps protocol requests onto the tracker.

use serde::Serialize;
use serde_json::{json, Value};

use playtime_core::{on_presence, LiveSession, PlayHistory, PlaytimeError};
use playtime_daemon_protocol::{
    parse_activity_started, parse_identity, parse_presence, LiveSessionData, Method, Request,
    Response, SnapshotData, TotalsData, PROTOCOL_VERSION,
};

use crate::state::DaemonState;

pub fn handle_request(request: Request, state: &DaemonState) -> Response {
    state.record_request();

    if request.protocol_version != PROTOCOL_VERSION {
        return Response::error(
            request.id,
            "protocol_mismatch",
            "unsupported protocol version",
        );
    }

    let id = request.id;
    match request.method {
        Method::GetHealth => to_response(id, &state.health_snapshot(), "health"),
        Method::ActivityStarted => {
            let params = match parse_activity_started(request.params) {
                Ok(params) => params,
                Err(err) => return Response::error_with_info(id, err),
            };
            match state
                .tracker()
                .start_session(&params.identity, &params.activity)
            {
                Ok(()) => Response::ok(id, json!({ "accepted": true })),
                Err(err) => tracker_error(id, err),
            }
        }
        Method::ActivityEnded => {
            let params = match parse_identity(request.params) {
                Ok(params) => params,
                Err(err) => return Response::error_with_info(id, err),
            };
            match state.tracker().request_end(&params.identity) {
                Ok(()) => Response::ok(id, json!({ "accepted": true })),
                Err(err) => tracker_error(id, err),
            }
        }
        Method::Presence => {
            let params = match parse_presence(request.params) {
                Ok(params) => params,
                Err(err) => return Response::error_with_info(id, err),
            };
            match on_presence(
                state.tracker(),
                &params.identity,
                params.activity.as_deref(),
            ) {
                Ok(outcome) => Response::ok(id, json!({ "outcome": outcome })),
                Err(err) => tracker_error(id, err),
            }
        }
        Method::GetTotals => {
            let params = match parse_identity(request.params) {
                Ok(params) => params,
                Err(err) => return Response::error_with_info(id, err),
            };
            match state.tracker().get_total(&params.identity) {
                Ok(history) => to_response(id, &totals_data(params.identity, history), "totals"),
                Err(err) => tracker_error(id, err),
            }
        }
        Method::GetLiveSessions => {
            let sessions: Vec<LiveSessionData> = state
                .tracker()
                .live_sessions()
                .into_iter()
                .map(live_session_data)
                .collect();
            tracing::debug!(sessions = sessions.len(), "Live sessions snapshot");
            to_response(id, &sessions, "live sessions")
        }
        Method::Snapshot => match state.run_snapshot() {
            Ok(report) => to_response(
                id,
                &SnapshotData {
                    flushed: report.flushed,
                    failed: report.failed,
                },
                "snapshot report",
            ),
            Err(err) => tracker_error(id, err),
        },
    }
}

fn totals_data(identity: String, history: PlayHistory) -> TotalsData {
    match history {
        PlayHistory::Never => TotalsData {
            identity,
            found: false,
            activities: Default::default(),
        },
        PlayHistory::Played(activities) => TotalsData {
            identity,
            found: true,
            activities,
        },
    }
}

fn live_session_data(session: LiveSession) -> LiveSessionData {
    LiveSessionData {
        identity: session.identity,
        activity: session.activity,
        opened_at: session.opened_at.to_rfc3339(),
        elapsed_nanos: session.elapsed_nanos,
    }
}

fn tracker_error(id: Option<String>, err: PlaytimeError) -> Response {
    match err {
        PlaytimeError::ShuttingDown => Response::error(id, "shutting_down", err.to_string()),
        other => {
            tracing::warn!(error = %other, "Ledger request failed");
            Response::error(id, "ledger_error", other.to_string())
        }
    }
}

fn to_response<T: Serialize>(id: Option<String>, value: &T, what: &str) -> Response {
    match serde_json::to_value(value) {
        Ok(value) => Response::ok(id, value),
        Err(err) => Response::error(
            id,
            "serialization_error",
            format!("Failed to serialize {}: {}", what, err),
        ),
    }
}
