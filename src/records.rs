use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::cluster::MapPoint;
use crate::errors::{AppError, AppResult};

/// Persisted marker for "resolution attempted and nothing validated".
pub const NOT_FOUND_SENTINEL: (f64, f64) = (0.0, 0.0);

/// Geocoding state of a record.
///
/// On disk this is the legacy column pair: both NULL is `Unattempted`, the
/// `(0.0, 0.0)` sentinel is `NotFound` and any other pair is `Found`. A real hit
/// exactly at `(0.0, 0.0)` therefore reads back as `NotFound`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CoordinateState {
    Unattempted,
    NotFound,
    Found { lat: f64, lon: f64 },
}

impl CoordinateState {
    pub fn from_pair(lat: f64, lon: f64) -> Self {
        if (lat, lon) == NOT_FOUND_SENTINEL {
            CoordinateState::NotFound
        } else {
            CoordinateState::Found { lat, lon }
        }
    }

    pub fn from_columns(lat: Option<f64>, lon: Option<f64>) -> AppResult<Self> {
        match (lat, lon) {
            (None, None) => Ok(CoordinateState::Unattempted),
            (Some(lat), Some(lon)) => Ok(Self::from_pair(lat, lon)),
            _ => Err(AppError::Config(
                "coordinate columns must be both set or both unset".into(),
            )),
        }
    }

    pub fn to_columns(self) -> (Option<f64>, Option<f64>) {
        match self {
            CoordinateState::Unattempted => (None, None),
            CoordinateState::NotFound => (Some(NOT_FOUND_SENTINEL.0), Some(NOT_FOUND_SENTINEL.1)),
            CoordinateState::Found { lat, lon } => (Some(lat), Some(lon)),
        }
    }

    pub fn is_attempted(&self) -> bool {
        !matches!(self, CoordinateState::Unattempted)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumerRecord {
    pub id: i64,
    pub raw_address: String,
    pub coordinates: CoordinateState,
}

impl ConsumerRecord {
    pub fn unattempted(id: i64, raw_address: impl Into<String>) -> Self {
        Self {
            id,
            raw_address: raw_address.into(),
            coordinates: CoordinateState::Unattempted,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportSummary {
    pub worksheet: String,
    pub worksheet_id: i64,
    pub row_count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorksheetStats {
    pub total: usize,
    pub unattempted: usize,
    pub not_found: usize,
    pub found: usize,
}

/// Write side consumed by the batch orchestrator.
///
/// Implementations must be durable before returning so the next item in the
/// same batch reads consistent state, and idempotent for repeated arguments.
pub trait CoordinateStore: Send + Sync {
    fn update_coordinates(&self, id: i64, latitude: f64, longitude: f64) -> AppResult<()>;
}

#[derive(Clone)]
pub struct SqliteRecordStore {
    db: Arc<Mutex<Connection>>,
}

impl SqliteRecordStore {
    pub fn new(db: Arc<Mutex<Connection>>) -> Self {
        Self { db }
    }

    pub fn import_addresses(
        &self,
        worksheet: &str,
        addresses: &[String],
    ) -> AppResult<ImportSummary> {
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO worksheets (name) VALUES (?1) ON CONFLICT(name) DO NOTHING",
            [worksheet],
        )?;
        let worksheet_id: i64 = tx.query_row(
            "SELECT id FROM worksheets WHERE name = ?1",
            [worksheet],
            |row| row.get(0),
        )?;
        let mut row_count = 0;
        {
            let mut stmt =
                tx.prepare("INSERT INTO consumers (worksheet_id, raw_address) VALUES (?1, ?2)")?;
            for address in addresses.iter().filter(|a| !a.trim().is_empty()) {
                stmt.execute(params![worksheet_id, address.trim()])?;
                row_count += 1;
            }
        }
        tx.commit()?;

        Ok(ImportSummary {
            worksheet: worksheet.to_string(),
            worksheet_id,
            row_count,
        })
    }

    pub fn load_worksheet(&self, worksheet: &str) -> AppResult<Vec<ConsumerRecord>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT c.id, c.raw_address, c.latitude, c.longitude
            FROM consumers c
            JOIN worksheets w ON w.id = c.worksheet_id
            WHERE w.name = ?1
            ORDER BY c.id ASC",
        )?;
        let rows = stmt
            .query_map([worksheet], parse_record_columns)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(into_record).collect()
    }

    pub fn load_record(&self, id: i64) -> AppResult<Option<ConsumerRecord>> {
        let conn = self.db.lock();
        let columns = conn
            .query_row(
                "SELECT id, raw_address, latitude, longitude FROM consumers WHERE id = ?1",
                [id],
                parse_record_columns,
            )
            .optional()?;
        columns.map(into_record).transpose()
    }

    /// Resolved points only; unattempted rows and sentinels never reach the map.
    pub fn load_found_points(&self, worksheet: &str) -> AppResult<Vec<MapPoint>> {
        let records = self.load_worksheet(worksheet)?;
        Ok(records
            .into_iter()
            .filter_map(|record| match record.coordinates {
                CoordinateState::Found { lat, lon } => Some(MapPoint {
                    id: record.id,
                    lat,
                    lon,
                }),
                _ => None,
            })
            .collect())
    }

    pub fn worksheet_stats(&self, worksheet: &str) -> AppResult<WorksheetStats> {
        let records = self.load_worksheet(worksheet)?;
        let mut stats = WorksheetStats {
            total: records.len(),
            ..WorksheetStats::default()
        };
        for record in &records {
            match record.coordinates {
                CoordinateState::Unattempted => stats.unattempted += 1,
                CoordinateState::NotFound => stats.not_found += 1,
                CoordinateState::Found { .. } => stats.found += 1,
            }
        }
        Ok(stats)
    }
}

impl CoordinateStore for SqliteRecordStore {
    fn update_coordinates(&self, id: i64, latitude: f64, longitude: f64) -> AppResult<()> {
        let conn = self.db.lock();
        let updated = conn.execute(
            "UPDATE consumers
            SET latitude = ?2, longitude = ?3, geocoded_at = DATETIME('now')
            WHERE id = ?1",
            params![id, latitude, longitude],
        )?;
        if updated == 0 {
            return Err(AppError::Config(format!("unknown consumer record {id}")));
        }
        trace!(id, latitude, longitude, "consumer coordinates recorded");
        Ok(())
    }
}

type RecordColumns = (i64, String, Option<f64>, Option<f64>);

fn parse_record_columns(row: &Row<'_>) -> rusqlite::Result<RecordColumns> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn into_record((id, raw_address, lat, lon): RecordColumns) -> AppResult<ConsumerRecord> {
    Ok(ConsumerRecord {
        id,
        raw_address,
        coordinates: CoordinateState::from_columns(lat, lon)?,
    })
}
