//! Prometheus metrics for the database connection pool
//!
//! Gauges are registered on a registry owned by the host process.

use prometheus::{IntGaugeVec, Opts, Registry};
use sqlx::PgPool;

/// Pool size by state (idle/active/max), labeled by service
#[derive(Clone)]
pub struct PoolMetrics {
    connections: IntGaugeVec,
}

impl PoolMetrics {
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let connections = IntGaugeVec::new(
            Opts::new(
                "db_pool_connections",
                "Database pool connection count by state",
            ),
            &["service", "state"],
        )?;
        registry.register(Box::new(connections.clone()))?;

        Ok(Self { connections })
    }

    /// Update connection pool gauges (called periodically)
    pub fn update(&self, pool: &PgPool, service: &str) {
        let size = pool.size() as i64;
        let idle = pool.num_idle() as i64;

        self.connections
            .with_label_values(&[service, "idle"])
            .set(idle);
        self.connections
            .with_label_values(&[service, "active"])
            .set(size - idle);
        self.connections
            .with_label_values(&[service, "max"])
            .set(pool.options().get_max_connections() as i64);
    }

    #[cfg(test)]
    pub(crate) fn value(&self, service: &str, state: &str) -> i64 {
        self.connections.with_label_values(&[service, state]).get()
    }
}
