use harvest_adapters::{correlate_network_events, NetworkCapture};
use tracing::debug;

use crate::session::{RenderSession, SessionError};

/// Collect every observed response, with its body and the matching request
/// payload. With `url_filter` set, only responses whose URL contains it are
/// fetched. Bodies that cannot be retrieved are skipped individually.
pub async fn capture(
    session: &mut dyn RenderSession,
    url_filter: Option<&str>,
) -> Result<Vec<NetworkCapture>, SessionError> {
    let entries = session.performance_log().await?;
    let log = correlate_network_events(&entries);

    let mut captures = Vec::new();
    for event in &log.responses {
        if url_filter.is_some_and(|filter| !event.url.contains(filter)) {
            continue;
        }
        match session.response_body(&event.request_id).await {
            Ok(body) => captures.push(NetworkCapture {
                url: event.url.clone(),
                body,
                request_payload: log.payload_for(&event.request_id).cloned(),
                timestamp: event.timestamp,
            }),
            Err(err) => {
                debug!(request_id = %event.request_id, url = %event.url, error = %err, "response body unavailable");
            }
        }
    }
    debug!(
        observed = log.responses.len(),
        captured = captures.len(),
        "network capture complete"
    );
    Ok(captures)
}
