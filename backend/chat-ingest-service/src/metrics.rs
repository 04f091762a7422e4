//! Prometheus metrics for the ingest pipeline
//!
//! Metrics are registered on a registry owned by the host process and served
//! at `GET /metrics`.

use std::io;

use actix_web::{dev::Server, web, App, HttpResponse, HttpServer, Responder};
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

use crate::error::FailureReason;

#[derive(Clone)]
pub struct IngestMetrics {
    /// Records persisted (new or duplicate) and acknowledged
    pub messages_processed_total: IntCounter,
    /// Records whose pipeline run ended in an error, of any class
    pub messages_failed_total: IntCounter,
    /// Records recognised as already stored
    pub messages_duplicate_total: IntCounter,
    /// Records handed to the dead-letter topic, by reason
    pub messages_dead_lettered_total: IntCounterVec,
    /// Records left unacknowledged for redelivery
    pub messages_retried_total: IntCounter,
    pub processing_seconds: Histogram,
    /// Transport receive errors
    pub consumer_errors_total: IntCounter,
    /// 1 while a worker's transport is healthy, by worker
    pub consumer_healthy: IntGaugeVec,
}

impl IngestMetrics {
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let messages_processed_total = IntCounter::new(
            "chat_ingest_messages_processed_total",
            "Total number of chat messages persisted and acknowledged",
        )?;
        let messages_failed_total = IntCounter::new(
            "chat_ingest_messages_failed_total",
            "Total number of chat message processing failures",
        )?;
        let messages_duplicate_total = IntCounter::new(
            "chat_ingest_messages_duplicate_total",
            "Total number of redelivered chat messages that were already stored",
        )?;
        let messages_dead_lettered_total = IntCounterVec::new(
            Opts::new(
                "chat_ingest_messages_dead_lettered_total",
                "Total number of chat messages routed to the dead-letter topic",
            ),
            &["reason"],
        )?;
        let messages_retried_total = IntCounter::new(
            "chat_ingest_messages_retried_total",
            "Total number of chat messages left unacknowledged for redelivery",
        )?;
        let processing_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "chat_ingest_message_processing_seconds",
                "Time spent processing one inbound record",
            )
            .buckets(vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ]),
        )?;
        let consumer_errors_total = IntCounter::new(
            "chat_ingest_consumer_errors_total",
            "Total number of Kafka consumer receive errors",
        )?;
        let consumer_healthy = IntGaugeVec::new(
            Opts::new(
                "chat_ingest_consumer_healthy",
                "Consumer health status per worker (1 = healthy, 0 = unhealthy)",
            ),
            &["worker"],
        )?;

        registry.register(Box::new(messages_processed_total.clone()))?;
        registry.register(Box::new(messages_failed_total.clone()))?;
        registry.register(Box::new(messages_duplicate_total.clone()))?;
        registry.register(Box::new(messages_dead_lettered_total.clone()))?;
        registry.register(Box::new(messages_retried_total.clone()))?;
        registry.register(Box::new(processing_seconds.clone()))?;
        registry.register(Box::new(consumer_errors_total.clone()))?;
        registry.register(Box::new(consumer_healthy.clone()))?;

        Ok(Self {
            messages_processed_total,
            messages_failed_total,
            messages_duplicate_total,
            messages_dead_lettered_total,
            messages_retried_total,
            processing_seconds,
            consumer_errors_total,
            consumer_healthy,
        })
    }

    pub fn record_dead_lettered(&self, reason: FailureReason) {
        self.messages_dead_lettered_total
            .with_label_values(&[reason.as_str()])
            .inc();
    }

    pub fn set_worker_healthy(&self, worker_id: usize, healthy: bool) {
        self.consumer_healthy
            .with_label_values(&[&worker_id.to_string()])
            .set(i64::from(healthy));
    }
}

async fn metrics_handler(registry: web::Data<Registry>) -> impl Responder {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => HttpResponse::Ok()
            .content_type(encoder.format_type())
            .body(buffer),
        Err(err) => HttpResponse::InternalServerError().body(err.to_string()),
    }
}

/// Bind the metrics endpoint; the returned server must be awaited or spawned
pub fn serve(registry: Registry, port: u16) -> io::Result<Server> {
    let registry = web::Data::new(registry);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(registry.clone())
            .route("/metrics", web::get().to(metrics_handler))
    })
    .workers(1)
    .disable_signals()
    .bind(("0.0.0.0", port))?
    .run();

    Ok(server)
}
