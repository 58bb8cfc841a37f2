//! Prometheus metrics HTTP endpoint
//!
//! Exposes pipeline metrics in Prometheus text format at /metrics, plus
//! /health, the reconciled store at /junctions and a density summary at
//! /stats. Uses hyper for the HTTP server.

use crate::domain::stats::DensityStats;
use crate::infra::metrics::{Metrics, MetricsSummary, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS};
use crate::services::registry::TrafficRegistry;
use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

/// Prometheus metric type
enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

/// Write a simple metric (counter or gauge) with site label
fn write_metric(
    output: &mut String,
    name: &str,
    help: &str,
    typ: MetricType,
    site: &str,
    val: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{site=\"{site}\"}} {val}");
}

/// Write a histogram metric with buckets, sum, and count
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    site: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    bounds: &[u64; 10],
    avg: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in bounds.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"+Inf\"}} {cumulative}");

    let count: u64 = buckets.iter().sum();
    let sum = avg * count;
    let _ = writeln!(output, "{name}_sum{{site=\"{site}\"}} {sum}");
    let _ = writeln!(output, "{name}_count{{site=\"{site}\"}} {count}");
}

/// Format metrics in Prometheus text exposition format
fn format_prometheus_metrics(metrics: &Metrics, site_id: &str) -> String {
    let summary = metrics.peek();
    let mut output = String::with_capacity(4096);

    write_feed_metrics(&mut output, site_id, &summary);
    write_latency_metrics(&mut output, site_id, &summary);
    write_enrichment_metrics(&mut output, site_id, &summary);
    write_egress_metrics(&mut output, site_id, &summary);

    output
}

fn write_feed_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "junction_snapshots_total",
        "Feed snapshots reconciled",
        MetricType::Counter,
        site,
        summary.snapshots_total,
    );
    write_metric(
        output,
        "junction_records_total",
        "Junction records delivered to subscribers",
        MetricType::Counter,
        site,
        summary.records_total,
    );
    write_metric(
        output,
        "junction_malformed_total",
        "Feed entries skipped as malformed",
        MetricType::Counter,
        site,
        summary.malformed_total,
    );
    write_metric(
        output,
        "junction_stale_total",
        "Records older than the stored one",
        MetricType::Counter,
        site,
        summary.stale_total,
    );
    write_metric(
        output,
        "junction_emergencies_total",
        "Emergency vehicle notifications",
        MetricType::Counter,
        site,
        summary.emergencies_total,
    );
    write_metric(
        output,
        "junction_feed_errors_total",
        "Upstream feed errors",
        MetricType::Counter,
        site,
        summary.feed_errors_total,
    );
    write_metric(
        output,
        "junction_subscribers",
        "Registered subscribers",
        MetricType::Gauge,
        site,
        summary.subscribers,
    );
    write_metric(
        output,
        "junction_store_size",
        "Junctions in the reconciled store",
        MetricType::Gauge,
        site,
        summary.junctions,
    );
}

fn write_latency_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_histogram(
        output,
        "junction_reconcile_latency_us",
        "Reconcile and fan-out latency in microseconds",
        site,
        &summary.lat_buckets,
        &METRICS_BUCKET_BOUNDS,
        summary.avg_reconcile_latency_us,
    );
    write_metric(
        output,
        "junction_reconcile_latency_p99_us",
        "99th percentile reconcile latency",
        MetricType::Gauge,
        site,
        summary.lat_p99_us,
    );
    write_metric(
        output,
        "junction_reconcile_latency_max_us",
        "Max reconcile latency this period",
        MetricType::Gauge,
        site,
        summary.max_reconcile_latency_us,
    );
}

fn write_enrichment_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "junction_enrichment_success_total",
        "Enrichment requests completed",
        MetricType::Counter,
        site,
        summary.enrichment_success_total,
    );
    write_metric(
        output,
        "junction_enrichment_failed_total",
        "Enrichment requests failed",
        MetricType::Counter,
        site,
        summary.enrichment_failed_total,
    );
    write_metric(
        output,
        "junction_enrichment_timeout_total",
        "Enrichment requests timed out",
        MetricType::Counter,
        site,
        summary.enrichment_timeout_total,
    );
    write_metric(
        output,
        "junction_enrichment_avg_latency_ms",
        "Average enrichment latency this period",
        MetricType::Gauge,
        site,
        summary.enrichment_avg_latency_ms,
    );
}

fn write_egress_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "junction_egress_dropped_total",
        "Egress messages dropped due to channel full",
        MetricType::Counter,
        site,
        summary.egress_dropped_total,
    );
    write_metric(
        output,
        "junction_history_written_total",
        "History records written",
        MetricType::Counter,
        site,
        summary.history_written_total,
    );
}

fn respond(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn respond_json<T: Serialize>(value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(body) => respond(StatusCode::OK, "application/json", body),
        Err(e) => respond(StatusCode::INTERNAL_SERVER_ERROR, "text/plain", e.to_string()),
    }
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
    site_id: Arc<String>,
    registry: Option<TrafficRegistry>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => respond(
            StatusCode::OK,
            "text/plain; version=0.0.4; charset=utf-8",
            format_prometheus_metrics(&metrics, &site_id),
        ),
        (&Method::GET, "/health") => respond(StatusCode::OK, "text/plain", "ok"),
        (&Method::GET, "/junctions") => match registry {
            Some(registry) => respond_json(&registry.snapshot()),
            None => respond(StatusCode::SERVICE_UNAVAILABLE, "text/plain", "registry not attached"),
        },
        (&Method::GET, "/stats") => match registry {
            Some(registry) => respond_json(&DensityStats::from_records(&registry.snapshot())),
            None => respond(StatusCode::SERVICE_UNAVAILABLE, "text/plain", "registry not attached"),
        },
        _ => respond(StatusCode::NOT_FOUND, "text/plain", "Not Found"),
    };
    Ok(response)
}

/// Start the Prometheus metrics HTTP server
pub async fn start_metrics_server(
    port: u16,
    metrics: Arc<Metrics>,
    site_id: String,
    registry: Option<TrafficRegistry>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    let site_id = Arc::new(site_id);

    info!(port = %port, site = %site_id, "prometheus_metrics_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let metrics = metrics.clone();
                        let site_id = site_id.clone();
                        let registry = registry.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                let site_id = site_id.clone();
                                let registry = registry.clone();
                                async move { handle_request(req, metrics, site_id, registry).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "prometheus_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "prometheus_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("prometheus_metrics_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_prometheus_metrics() {
        let metrics = Metrics::new();
        metrics.record_snapshot(150, 2, 0);
        metrics.record_snapshot(250, 2, 1);
        metrics.record_emergency();
        metrics.set_subscribers(2);

        let output = format_prometheus_metrics(&metrics, "bangalore");

        assert!(output.contains("junction_snapshots_total{site=\"bangalore\"} 2"));
        assert!(output.contains("junction_stale_total{site=\"bangalore\"} 1"));
        assert!(output.contains("junction_emergencies_total{site=\"bangalore\"} 1"));
        assert!(output.contains("junction_subscribers{site=\"bangalore\"} 2"));
        assert!(output.contains("junction_reconcile_latency_us_bucket{site=\"bangalore\",le=\"+Inf\"} 2"));
    }

    #[test]
    fn test_scrape_does_not_reset_period() {
        let metrics = Metrics::new();
        metrics.record_snapshot(150, 1, 0);

        let _ = format_prometheus_metrics(&metrics, "s");
        let output = format_prometheus_metrics(&metrics, "s");

        assert!(output.contains("junction_reconcile_latency_us_count{site=\"s\"} 1"));
    }

    #[test]
    fn test_respond_sets_status_and_type() {
        let response = respond(StatusCode::NOT_FOUND, "text/plain", "Not Found");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()[CONTENT_TYPE], "text/plain");
    }
}
