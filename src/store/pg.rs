/// PostgreSQL implementation of the reading and alert stores.
///
/// Every operation leases one pooled connection for a single statement; the
/// lease is returned when the guard drops, on success and error alike. A
/// caller blocked on an exhausted pool waits at most the configured lease
/// timeout before getting a transient `StoreError::Pool`.

use chrono::{DateTime, Utc};
use postgres::Row;
use tracing::debug;

use super::{checked_field, AlertStore, ReadingStore, StoreError};
use crate::db::{PgConnection, PgPool};
use crate::model::{Alert, AlertStatus, ComparisonOp, Reading, ReadingStatus, ThresholdConfig};

const READING_COLUMNS: &str = "station_id, timestamp, temperature, humidity, pressure, \
     wind_speed, wind_direction, precipitation, solar_radiation, battery_level, status";

const ALERT_COLUMNS: &str = "id, station_id, alert_type, alert_message, alert_value, \
     threshold_value, timestamp, status, created_at, resolved_at";

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn conn(&self) -> Result<PgConnection, StoreError> {
        Ok(self.pool.get()?)
    }
}

impl ReadingStore for PostgresStore {
    fn insert(&self, reading: &Reading) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        conn.execute(
            "INSERT INTO weather_logs (
                station_id, timestamp, temperature, humidity, pressure,
                wind_speed, wind_direction, precipitation, solar_radiation,
                battery_level, status
             ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
            &[
                &reading.station_id,
                &reading.timestamp,
                &reading.temperature,
                &reading.humidity,
                &reading.pressure,
                &reading.wind_speed,
                &reading.wind_direction,
                &reading.precipitation,
                &reading.solar_radiation,
                &reading.battery_level,
                &reading.status.as_str(),
            ],
        )?;
        Ok(())
    }

    fn latest(&self, station_id: Option<&str>) -> Result<Vec<Reading>, StoreError> {
        let mut conn = self.conn()?;
        let rows = match station_id {
            Some(id) => conn.query(
                format!("SELECT {} FROM latest_station_readings WHERE station_id = $1", READING_COLUMNS)
                    .as_str(),
                &[&id],
            )?,
            None => conn.query(
                format!("SELECT {} FROM latest_station_readings ORDER BY station_id", READING_COLUMNS)
                    .as_str(),
                &[],
            )?,
        };
        rows.iter().map(row_to_reading).collect()
    }

    fn threshold_exceeded(
        &self,
        field: &str,
        op: ComparisonOp,
        value: f64,
    ) -> Result<Vec<Reading>, StoreError> {
        let column = checked_field(field)?;
        let sql = format!(
            "SELECT {cols} FROM latest_station_readings
             WHERE {col} IS NOT NULL AND {col} {op} $1
             ORDER BY station_id",
            cols = READING_COLUMNS,
            col = column,
            op = op.as_str(),
        );

        let mut conn = self.conn()?;
        let rows = conn.query(sql.as_str(), &[&value])?;
        debug!(field = column, operator = %op, value, matched = rows.len(), "Threshold query");
        rows.iter().map(row_to_reading).collect()
    }
}

impl AlertStore for PostgresStore {
    fn enabled_thresholds(&self) -> Result<Vec<ThresholdConfig>, StoreError> {
        let mut conn = self.conn()?;
        let rows = conn.query(
            "SELECT id, name, field_name, operator, threshold_value, severity, enabled
             FROM alert_configurations
             WHERE enabled = TRUE
             ORDER BY id",
            &[],
        )?;

        let mut configs = Vec::with_capacity(rows.len());
        for row in rows {
            configs.push(ThresholdConfig {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
                field_name: row.try_get("field_name")?,
                operator: row.try_get("operator")?,
                threshold_value: row.try_get("threshold_value")?,
                severity: row.try_get("severity")?,
                enabled: row.try_get("enabled")?,
            });
        }
        Ok(configs)
    }

    fn open_alert(&self, station_id: &str, alert_type: &str) -> Result<Option<Alert>, StoreError> {
        let mut conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM weather_alerts
             WHERE station_id = $1 AND alert_type = $2 AND status <> 'RESOLVED'
             ORDER BY timestamp DESC
             LIMIT 1",
            ALERT_COLUMNS
        );
        let row = conn.query_opt(sql.as_str(), &[&station_id, &alert_type])?;
        row.as_ref().map(row_to_alert).transpose()
    }

    fn save_alert(&self, alert: &Alert) -> Result<i64, StoreError> {
        let mut conn = self.conn()?;
        let row = conn.query_one(
            "INSERT INTO weather_alerts (
                station_id, alert_type, alert_message, alert_value,
                threshold_value, timestamp, status
             ) VALUES ($1, $2, $3, $4, $5, $6, $7)
             RETURNING id",
            &[
                &alert.station_id,
                &alert.alert_type,
                &alert.message,
                &alert.alert_value,
                &alert.threshold_value,
                &alert.timestamp,
                &alert.status.as_str(),
            ],
        )?;
        Ok(row.try_get(0)?)
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn row_to_reading(row: &Row) -> Result<Reading, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(Reading {
        station_id: row.try_get("station_id")?,
        timestamp: row.try_get::<_, DateTime<Utc>>("timestamp")?,
        temperature: row.try_get("temperature")?,
        humidity: row.try_get("humidity")?,
        pressure: row.try_get("pressure")?,
        wind_speed: row.try_get("wind_speed")?,
        wind_direction: row.try_get("wind_direction")?,
        precipitation: row.try_get("precipitation")?,
        solar_radiation: row.try_get("solar_radiation")?,
        battery_level: row.try_get("battery_level")?,
        status: status.parse::<ReadingStatus>().map_err(StoreError::InvalidRow)?,
    })
}

fn row_to_alert(row: &Row) -> Result<Alert, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(Alert {
        id: Some(row.try_get("id")?),
        station_id: row.try_get("station_id")?,
        alert_type: row.try_get("alert_type")?,
        message: row.try_get("alert_message")?,
        alert_value: row.try_get("alert_value")?,
        threshold_value: row.try_get("threshold_value")?,
        timestamp: row.try_get("timestamp")?,
        status: status.parse::<AlertStatus>().map_err(StoreError::InvalidRow)?,
        created_at: row.try_get("created_at")?,
        resolved_at: row.try_get("resolved_at")?,
    })
}
