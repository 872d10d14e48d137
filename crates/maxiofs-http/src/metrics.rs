//! Prometheus text exposition for `/metrics`.

use std::fmt::Write;
use std::sync::Arc;

use http::StatusCode;

use crate::body::ResponseBody;
use crate::state::AppState;

/// Render the metrics document.
#[must_use]
pub fn response(state: &Arc<AppState>) -> http::Response<ResponseBody> {
    let body = render(state);
    http::Response::builder()
        .status(StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "text/plain; version=0.0.4")
        .body(ResponseBody::full(body))
        .unwrap_or_else(|_| http::Response::new(ResponseBody::empty()))
}

fn render(state: &Arc<AppState>) -> String {
    let mut out = String::with_capacity(1024);

    let _ = writeln!(out, "# HELP maxiofs_uptime_seconds Seconds since process start.");
    let _ = writeln!(out, "# TYPE maxiofs_uptime_seconds gauge");
    let _ = writeln!(out, "maxiofs_uptime_seconds {}", state.uptime_secs());

    let depth = state.replication.queue_depth().unwrap_or(0);
    let _ = writeln!(
        out,
        "# HELP maxiofs_replication_queue_depth Pending and in-flight replication entries."
    );
    let _ = writeln!(out, "# TYPE maxiofs_replication_queue_depth gauge");
    let _ = writeln!(out, "maxiofs_replication_queue_depth {depth}");

    let warn_depth = state.config.replication_queue_warn_depth;
    let _ = writeln!(
        out,
        "# HELP maxiofs_replication_backpressure 1 when the queue exceeds the configured depth."
    );
    let _ = writeln!(out, "# TYPE maxiofs_replication_backpressure gauge");
    let _ = writeln!(
        out,
        "maxiofs_replication_backpressure {}",
        u8::from(depth > warn_depth)
    );

    let _ = writeln!(out, "# HELP maxiofs_peer_health Peer health (1 = in that state).");
    let _ = writeln!(out, "# TYPE maxiofs_peer_health gauge");
    if let Ok(peers) = state.manager.list_peers() {
        for peer in peers {
            let _ = writeln!(
                out,
                "maxiofs_peer_health{{node=\"{}\",state=\"{}\"}} 1",
                peer.id,
                peer.health.as_str()
            );
        }
    }

    let _ = writeln!(out, "# HELP maxiofs_maintenance_mode 1 when writes are refused.");
    let _ = writeln!(out, "# TYPE maxiofs_maintenance_mode gauge");
    let _ = writeln!(
        out,
        "maxiofs_maintenance_mode {}",
        u8::from(state.settings.read().maintenance_mode)
    );

    out
}
