mod address;
mod batch;
mod cluster;
mod config;
mod db;
mod errors;
mod geocoder;
mod records;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::db::{bootstrap, DatabaseContext};

pub use crate::address::{normalize, smart_address, StructuredAddress};
pub use crate::batch::{
    BatchGeocodingOrchestrator, BatchObserver, BatchProgress, BatchReport, GeocodeDispatcher,
};
pub use crate::cluster::{cluster, threshold_for_zoom, ClusterGroup, MapPoint};
pub use crate::config::{AppConfig, PublicAppConfig};
pub use crate::errors::{AppError, AppResult};
pub use crate::geocoder::{
    GeocodeProvider, GeocodeResult, GeocoderSettings, GeocodingClient, HttpGeocodeProvider,
    Precision, ProviderFeature, Tier, TierCategories, TierQuery,
};
pub use crate::records::{
    ConsumerRecord, CoordinateState, CoordinateStore, ImportSummary, SqliteRecordStore,
    WorksheetStats, NOT_FOUND_SENTINEL,
};

#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    pub version: String,
    pub db_path: String,
    pub config: PublicAppConfig,
}

pub struct GeomapService {
    db_path: PathBuf,
    config: AppConfig,
    store: SqliteRecordStore,
    orchestrator: BatchGeocodingOrchestrator,
    worksheet_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl GeomapService {
    /// Opens the database under `data_dir` and starts the geocoding dispatcher.
    /// Must be called from within a tokio runtime.
    pub fn initialize<P: AsRef<Path>>(data_dir: P, config: AppConfig) -> AppResult<Self> {
        init_tracing();
        let DatabaseContext { connection, path } =
            bootstrap(data_dir.as_ref(), &config.database_file_name)?;
        let store = SqliteRecordStore::new(Arc::new(Mutex::new(connection)));

        let client = GeocodingClient::new(GeocoderSettings::from_config(&config))?;
        let dispatcher = GeocodeDispatcher::spawn(
            client,
            Duration::from_millis(config.geocoder_request_delay_ms),
        );
        let orchestrator = BatchGeocodingOrchestrator::new(dispatcher, Arc::new(store.clone()));

        info!(
            target: "geomap_service",
            db_path = %path.display(),
            delay_ms = config.geocoder_request_delay_ms,
            "geomap service ready"
        );
        Ok(Self {
            db_path: path,
            config,
            store,
            orchestrator,
            worksheet_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn import_addresses(&self, worksheet: &str, addresses: &[String]) -> AppResult<ImportSummary> {
        let summary = self.store.import_addresses(worksheet, addresses)?;
        info!(
            target: "geomap_service",
            worksheet,
            rows = summary.row_count,
            "addresses imported"
        );
        Ok(summary)
    }

    /// Geocodes every unattempted record of `worksheet`. A second call for the
    /// same worksheet waits until the running one finishes.
    pub async fn geocode_worksheet(
        &self,
        worksheet: &str,
        observer: Option<Arc<dyn BatchObserver>>,
        cancel_flag: Option<Arc<AtomicBool>>,
    ) -> AppResult<BatchReport> {
        let lock = self.worksheet_lock(worksheet);
        let _guard = lock.lock().await;
        let items = self.store.load_worksheet(worksheet)?;
        Ok(self.orchestrator.run(&items, observer, cancel_flag).await)
    }

    pub fn map_clusters(&self, worksheet: &str, zoom: f64) -> AppResult<Vec<ClusterGroup>> {
        let points = self.store.load_found_points(worksheet)?;
        Ok(cluster(&points, threshold_for_zoom(zoom)))
    }

    pub fn worksheet_records(&self, worksheet: &str) -> AppResult<Vec<ConsumerRecord>> {
        self.store.load_worksheet(worksheet)
    }

    pub fn worksheet_stats(&self, worksheet: &str) -> AppResult<WorksheetStats> {
        self.store.worksheet_stats(worksheet)
    }

    pub fn health(&self) -> ServiceHealth {
        ServiceHealth {
            version: env!("CARGO_PKG_VERSION").to_string(),
            db_path: self.db_path.to_string_lossy().to_string(),
            config: self.config.public_profile(),
        }
    }

    fn worksheet_lock(&self, worksheet: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.worksheet_locks.lock();
        Arc::clone(
            locks
                .entry(worksheet.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        )
    }
}

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,address_geomap=debug"));
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init();
    });
}
