use axum::{extract::Request, middleware::Next, response::Response};
use metrics::{counter, histogram};
use std::time::Instant;

/// Records request totals and latency per route.
///
/// Path segments that look like resource ids (UUIDs) are collapsed to `:id`
/// to keep label cardinality bounded; movement and connection endpoints
/// would otherwise produce one label set per row.
pub async fn metrics_middleware(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().to_string();
    let path = normalize_path(req.uri().path());

    let response = next.run(req).await;

    let duration = start.elapsed();
    let status = response.status().as_u16().to_string();

    let labels = [("method", method), ("path", path), ("status", status)];

    counter!("http_requests_total", &labels).increment(1);
    histogram!("http_request_duration_seconds", &labels).record(duration.as_secs_f64());

    response
}

fn normalize_path(path: &str) -> String {
    path.split('/')
        .map(|segment| {
            if uuid::Uuid::parse_str(segment).is_ok() {
                ":id"
            } else {
                segment
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::normalize_path;

    #[test]
    fn collapses_uuid_segments() {
        let path = "/movements/3f2f7c4e-9f6a-4f0a-91d2-0a8ef4c2b9d1/confirm";
        assert_eq!(normalize_path(path), "/movements/:id/confirm");
    }

    #[test]
    fn leaves_static_paths_untouched() {
        assert_eq!(normalize_path("/jobs/transaction-sync"), "/jobs/transaction-sync");
    }
}
