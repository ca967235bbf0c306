//! Connection registry and factory.
//!
//! The manager maps driver names to constructors, builds at most one backend
//! per connection name, and forwards queue operations to the backend the
//! configuration (or an explicit override) selects.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::{
    backend::{
        broker::{BrokerOptions, BrokerQueue},
        jobserver::{JobServerOptions, JobServerQueue},
        sync::SyncQueue,
        BoxedHandle, QueueBackend,
    },
    config::{parse_options, QueueConfig},
    Clock, JobId, JobRegistry, QueueError, QueueResult, SystemClock,
};

#[cfg(feature = "database")]
use crate::backend::database::{DatabaseOptions, DatabaseQueue};
#[cfg(feature = "database")]
use sqlx::SqlitePool;

/// What a driver constructor gets to build a backend from
pub struct DriverContext<'a> {
    /// Connection name
    pub name: &'a str,
    pub options: &'a Map<String, Value>,
    pub registry: Arc<JobRegistry>,
    pub clock: Arc<dyn Clock>,
    /// Shared pool handed over by the application, if any
    #[cfg(feature = "database")]
    pub database_pool: Option<SqlitePool>,
}

impl DriverContext<'_> {
    /// Deserialize the connection options into a driver's typed options
    pub fn options<T: serde::de::DeserializeOwned>(&self, driver: &str) -> QueueResult<T> {
        parse_options(driver, self.options)
    }
}

/// Constructor registered under a driver name
pub type DriverFactory =
    Arc<dyn Fn(&DriverContext<'_>) -> QueueResult<Arc<dyn QueueBackend>> + Send + Sync>;

/// Registry of drivers and cache of connected backends
pub struct QueueManager {
    config: QueueConfig,
    registry: Arc<JobRegistry>,
    clock: Arc<dyn Clock>,
    drivers: HashMap<String, DriverFactory>,
    connections: Mutex<HashMap<String, Arc<dyn QueueBackend>>>,
    #[cfg(feature = "database")]
    database_pool: Option<SqlitePool>,
}

impl QueueManager {
    /// Create a manager with the built-in drivers registered
    pub fn new(config: QueueConfig, registry: Arc<JobRegistry>) -> Self {
        let manager = Self {
            config,
            registry,
            clock: Arc::new(SystemClock),
            drivers: HashMap::new(),
            connections: Mutex::new(HashMap::new()),
            #[cfg(feature = "database")]
            database_pool: None,
        };

        let manager = manager
            .register_driver("sync", |ctx: &DriverContext<'_>| {
                Ok(Arc::new(SyncQueue::new(ctx.registry.clone(), ctx.clock.clone())) as Arc<dyn QueueBackend>)
            })
            .register_driver("broker", |ctx: &DriverContext<'_>| {
                let options: BrokerOptions = ctx.options("broker")?;
                let queue = BrokerQueue::from_options(options, ctx.registry.clone(), ctx.clock.clone())?;
                Ok(Arc::new(queue) as Arc<dyn QueueBackend>)
            })
            .register_driver("jobserver", |ctx: &DriverContext<'_>| {
                let options: JobServerOptions = ctx.options("jobserver")?;
                let queue = JobServerQueue::from_options(&options, ctx.registry.clone(), ctx.clock.clone())?;
                Ok(Arc::new(queue) as Arc<dyn QueueBackend>)
            });

        #[cfg(feature = "database")]
        let manager = manager.register_driver("database", |ctx: &DriverContext<'_>| {
            let options: DatabaseOptions = ctx.options("database")?;
            let queue = DatabaseQueue::from_options(
                &options,
                ctx.database_pool.clone(),
                ctx.registry.clone(),
                ctx.clock.clone(),
            )?;
            Ok(Arc::new(queue) as Arc<dyn QueueBackend>)
        });

        manager
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Share an application pool with every `database` connection
    #[cfg(feature = "database")]
    pub fn with_database_pool(mut self, pool: SqlitePool) -> Self {
        self.database_pool = Some(pool);
        self
    }

    /// Register (or replace) the constructor for a driver name
    pub fn register_driver<F>(mut self, driver: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&DriverContext<'_>) -> QueueResult<Arc<dyn QueueBackend>> + Send + Sync + 'static,
    {
        self.drivers.insert(driver.into(), Arc::new(factory));
        self
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn default_queue(&self) -> &str {
        &self.config.default_queue
    }

    pub fn default_connection(&self) -> &str {
        &self.config.default_connection
    }

    /// Registered driver names, sorted
    pub fn known_drivers(&self) -> Vec<String> {
        let mut drivers: Vec<String> = self.drivers.keys().cloned().collect();
        drivers.sort();
        drivers
    }

    /// The connected backend for a connection name, built on first use
    ///
    /// A name missing from the configuration is taken as a driver name with
    /// default options. The cache lock is not held while connecting.
    pub async fn connection(&self, name: Option<&str>) -> QueueResult<Arc<dyn QueueBackend>> {
        let name = name.unwrap_or(&self.config.default_connection);

        let cached = self.connections.lock().get(name).cloned();
        if let Some(backend) = cached {
            return Ok(backend);
        }

        let backend = self.build(name)?;
        backend.connect().await?;

        let cached = self
            .connections
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| backend.clone())
            .clone();

        if same_backend(&cached, &backend) {
            info!("Queue connection `{}` ready (driver: {})", name, backend.driver());
        } else {
            debug!("Queue connection `{}` was connected concurrently; dropping the duplicate", name);
            if let Err(e) = backend.disconnect().await {
                warn!("Error disconnecting duplicate queue connection `{}`: {}", name, e);
            }
        }
        Ok(cached)
    }

    /// Disconnect a connection and drop it from the cache
    ///
    /// The next lookup builds and connects it again.
    pub async fn disconnect(&self, name: Option<&str>) -> QueueResult<()> {
        let name = name.unwrap_or(&self.config.default_connection);

        let Some(backend) = self.connections.lock().remove(name) else {
            return Ok(());
        };
        debug!("Disconnecting queue connection `{}`", name);
        backend.disconnect().await
    }

    fn build(&self, name: &str) -> QueueResult<Arc<dyn QueueBackend>> {
        let empty = Map::new();
        let (driver, options) = match self.config.connections.get(name) {
            Some(connection) => (connection.driver.as_str(), &connection.options),
            None => (name, &empty),
        };

        let factory = self.drivers.get(driver).ok_or_else(|| QueueError::UnknownDriver {
            requested: driver.to_string(),
            known: self.known_drivers(),
        })?;

        debug!("Building queue connection `{}` with driver {}", name, driver);
        factory(&DriverContext {
            name,
            options,
            registry: self.registry.clone(),
            clock: self.clock.clone(),
            #[cfg(feature = "database")]
            database_pool: self.database_pool.clone(),
        })
    }

    pub async fn push(
        &self,
        job_name: &str,
        payload: Value,
        queue: Option<&str>,
        connection: Option<&str>,
    ) -> QueueResult<JobId> {
        let queue = queue.unwrap_or(&self.config.default_queue);
        self.connection(connection).await?.push(job_name, payload, queue).await
    }

    pub async fn pop(&self, queue: Option<&str>, connection: Option<&str>) -> QueueResult<Option<BoxedHandle>> {
        let queue = queue.unwrap_or(&self.config.default_queue);
        self.connection(connection).await?.pop(queue).await
    }

    pub async fn size(&self, queue: Option<&str>, connection: Option<&str>) -> QueueResult<u64> {
        let queue = queue.unwrap_or(&self.config.default_queue);
        self.connection(connection).await?.size(queue).await
    }

    pub async fn clear(&self, queue: Option<&str>, connection: Option<&str>) -> QueueResult<()> {
        let queue = queue.unwrap_or(&self.config.default_queue);
        self.connection(connection).await?.clear(queue).await
    }

    /// Disconnect and forget every cached backend
    pub async fn disconnect_all(&self) {
        let connections: Vec<_> = self.connections.lock().drain().collect();

        for (name, backend) in connections {
            if let Err(e) = backend.disconnect().await {
                warn!("Error disconnecting queue connection `{}`: {}", name, e);
            }
        }
    }
}

fn same_backend(a: &Arc<dyn QueueBackend>, b: &Arc<dyn QueueBackend>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::ManualClock;
    use std::time::Duration;

    fn manager(config: QueueConfig) -> QueueManager {
        QueueManager::new(config, Arc::new(JobRegistry::new())).with_clock(Arc::new(ManualClock::new()))
    }

    #[tokio::test]
    async fn test_unknown_driver_lists_known_drivers() {
        let config = QueueConfig::default().with_connection("main", ConnectionConfig::new("redis"));
        let manager = manager(config);

        let err = manager.connection(Some("main")).await.err().unwrap();
        match err {
            QueueError::UnknownDriver { requested, known } => {
                assert_eq!(requested, "redis");
                assert!(known.contains(&"broker".to_string()));
                assert!(known.contains(&"sync".to_string()));
                assert!(known.windows(2).all(|pair| pair[0] <= pair[1]));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_connection_is_cached_per_name() {
        let config = QueueConfig::default()
            .with_connection("jobs", ConnectionConfig::new("broker"))
            .with_default_connection("jobs");
        let manager = manager(config);

        let first = manager.connection(None).await.unwrap();
        let second = manager.connection(Some("jobs")).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.driver(), "broker");
    }

    #[tokio::test]
    async fn test_disconnect_drops_cached_connection() {
        let manager = manager(QueueConfig::default());
        let first = manager.connection(Some("broker")).await.unwrap();

        manager.disconnect(Some("broker")).await.unwrap();
        manager.disconnect(Some("broker")).await.unwrap();

        let second = manager.connection(Some("broker")).await.unwrap();
        assert!(!same_backend(&first, &second));
        assert_eq!(manager.size(Some("default"), Some("broker")).await.unwrap(), 0);
    }

    struct NeverConnects;

    #[async_trait::async_trait]
    impl QueueBackend for NeverConnects {
        fn driver(&self) -> &'static str {
            "never"
        }

        async fn connect(&self) -> QueueResult<()> {
            std::future::pending().await
        }

        async fn disconnect(&self) -> QueueResult<()> {
            Ok(())
        }

        async fn push(&self, _job_name: &str, _payload: Value, _queue: &str) -> QueueResult<JobId> {
            Err(QueueError::Connection("never connected".to_string()))
        }

        async fn pop(&self, _queue: &str) -> QueueResult<Option<BoxedHandle>> {
            Ok(None)
        }

        async fn size(&self, _queue: &str) -> QueueResult<u64> {
            Ok(0)
        }

        async fn clear(&self, _queue: &str) -> QueueResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_slow_connect_does_not_block_other_connections() {
        let manager = Arc::new(
            manager(QueueConfig::default())
                .register_driver("never", |_: &DriverContext<'_>| Ok(Arc::new(NeverConnects) as Arc<dyn QueueBackend>)),
        );

        let stuck = tokio::spawn({
            let manager = manager.clone();
            async move { manager.connection(Some("never")).await.map(|_| ()) }
        });
        tokio::task::yield_now().await;

        let sync = tokio::time::timeout(Duration::from_secs(1), manager.connection(Some("sync"))).await;
        assert_eq!(sync.unwrap().unwrap().driver(), "sync");
        assert!(!stuck.is_finished());
        stuck.abort();
    }

    #[tokio::test]
    async fn test_driver_name_used_as_connection() {
        let manager = manager(QueueConfig::default());
        let backend = manager.connection(Some("jobserver")).await.unwrap();
        assert_eq!(backend.driver(), "jobserver");
    }

    #[tokio::test]
    async fn test_invalid_options_are_configuration_errors() {
        let config = QueueConfig::default().with_connection(
            "broker",
            ConnectionConfig::new("broker").with_option("visibility_timeout", "soon"),
        );
        let manager = manager(config);

        let err = manager.connection(Some("broker")).await.err().unwrap();
        assert!(err.is_configuration());
    }

    #[cfg(feature = "database")]
    #[tokio::test]
    async fn test_database_without_pool_or_url_is_configuration_error() {
        let manager = manager(QueueConfig::default());
        let err = manager.connection(Some("database")).await.err().unwrap();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn test_custom_driver() {
        let manager = manager(QueueConfig::default().with_default_connection("inline"))
            .register_driver("inline", |ctx: &DriverContext<'_>| {
                Ok(Arc::new(SyncQueue::new(ctx.registry.clone(), ctx.clock.clone())) as Arc<dyn QueueBackend>)
            });

        assert_eq!(manager.size(None, None).await.unwrap(), 0);
    }
}
