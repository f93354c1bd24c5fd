use std::sync::MutexGuard;
use std::time::Duration;

use gpslink_core::{CacheEntry, CacheError, CacheKey, Classification, DeviceCache, EndpointRecord};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::SqliteCache;

struct DeviceRow {
    name: String,
    success_count: i64,
    failure_count: i64,
    last_detected: String,
    last_connected: String,
    connection_ms: i64,
    major: i64,
    minor: i64,
    service_flags: i64,
}

/// Permission, read-only and unopenable databases read as "nothing cached".
fn map_err(e: rusqlite::Error) -> CacheError {
    match &e {
        rusqlite::Error::SqliteFailure(f, _)
            if matches!(
                f.code,
                ErrorCode::PermissionDenied
                    | ErrorCode::ReadOnly
                    | ErrorCode::CannotOpen
                    | ErrorCode::AuthorizationForStatementDenied
            ) =>
        {
            CacheError::AccessDenied(e.to_string())
        }
        _ => CacheError::Backend(e.to_string()),
    }
}

fn corrupt(key: &CacheKey, reason: impl Into<String>) -> CacheError {
    CacheError::Corrupt { key: key.to_string(), reason: reason.into() }
}

fn to_u32(key: &CacheKey, column: &str, v: i64) -> Result<u32, CacheError> {
    u32::try_from(v).map_err(|_| corrupt(key, format!("{column} out of range: {v}")))
}

fn format_ts(at: OffsetDateTime) -> Result<String, CacheError> {
    at.format(&Rfc3339).map_err(|e| CacheError::Backend(e.to_string()))
}

fn parse_ts(key: &CacheKey, s: &str) -> Result<OffsetDateTime, CacheError> {
    OffsetDateTime::parse(s, &Rfc3339).map_err(|e| corrupt(key, format!("bad timestamp {s:?}: {e}")))
}

impl SqliteCache {
    fn lock(&self) -> MutexGuard<'_, Connection> {
        // rusqlite rolls back an unfinished transaction on drop, so the connection stays usable.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn read_endpoints(conn: &Connection, key: &CacheKey) -> Result<Vec<EndpointRecord>, CacheError> {
        let mut stmt = conn
            .prepare(
                "SELECT endpoint_id, name, service_id, success_count, failure_count FROM endpoints
                 WHERE root=? AND device_key=? ORDER BY endpoint_id",
            )
            .map_err(map_err)?;
        let rows = stmt
            .query_map(params![key.root, key.device], |r| {
                Ok((r.get::<_, i64>(0)?, r.get::<_, Option<String>>(1)?, r.get::<_, String>(2)?, r.get::<_, i64>(3)?, r.get::<_, i64>(4)?))
            })
            .map_err(map_err)?;
        let mut out = Vec::new();
        for row in rows {
            let (id, name, service_id, success, failure) = row.map_err(map_err)?;
            out.push(EndpointRecord {
                id: to_u32(key, "endpoint_id", id)?,
                name,
                service_id,
                success_count: to_u32(key, "endpoint success_count", success)?,
                failure_count: to_u32(key, "endpoint failure_count", failure)?,
            });
        }
        Ok(out)
    }
}

impl DeviceCache for SqliteCache {
    fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT name, success_count, failure_count, last_detected, last_connected, connection_ms,
                        major_class, minor_class, service_flags
                 FROM devices WHERE root=? AND device_key=?",
                params![key.root, key.device],
                |r| {
                    Ok(DeviceRow {
                        name: r.get(0)?,
                        success_count: r.get(1)?,
                        failure_count: r.get(2)?,
                        last_detected: r.get(3)?,
                        last_connected: r.get(4)?,
                        connection_ms: r.get(5)?,
                        major: r.get(6)?,
                        minor: r.get(7)?,
                        service_flags: r.get(8)?,
                    })
                },
            )
            .optional()
            .map_err(map_err)?;
        let Some(row) = row else { return Ok(None) };

        let endpoints = Self::read_endpoints(&conn, key)?;
        Ok(Some(CacheEntry {
            name: row.name,
            success_count: to_u32(key, "success_count", row.success_count)?,
            failure_count: to_u32(key, "failure_count", row.failure_count)?,
            last_detected: parse_ts(key, &row.last_detected)?,
            last_connected: parse_ts(key, &row.last_connected)?,
            connection_time: Duration::from_millis(u64::try_from(row.connection_ms).unwrap_or(0)),
            class: Classification {
                major: to_u32(key, "major_class", row.major)?,
                minor: to_u32(key, "minor_class", row.minor)?,
                service_flags: to_u32(key, "service_flags", row.service_flags)?,
            },
            endpoints,
        }))
    }

    fn put(&self, key: &CacheKey, entry: &CacheEntry) -> Result<(), CacheError> {
        let last_detected = format_ts(entry.last_detected)?;
        let last_connected = format_ts(entry.last_connected)?;
        let connection_ms = i64::try_from(entry.connection_time.as_millis()).unwrap_or(i64::MAX);

        let mut conn = self.lock();
        let tx = conn.transaction().map_err(map_err)?;
        tx.execute(
            "INSERT INTO devices(root,device_key,name,success_count,failure_count,last_detected,last_connected,connection_ms,major_class,minor_class,service_flags)
             VALUES (?,?,?,?,?,?,?,?,?,?,?)
             ON CONFLICT(root,device_key) DO UPDATE SET name=excluded.name, success_count=excluded.success_count, failure_count=excluded.failure_count,
               last_detected=excluded.last_detected, last_connected=excluded.last_connected, connection_ms=excluded.connection_ms,
               major_class=excluded.major_class, minor_class=excluded.minor_class, service_flags=excluded.service_flags",
            params![
                key.root,
                key.device,
                entry.name,
                entry.success_count,
                entry.failure_count,
                last_detected,
                last_connected,
                connection_ms,
                entry.class.major,
                entry.class.minor,
                entry.class.service_flags
            ],
        )
        .map_err(map_err)?;
        tx.execute("DELETE FROM endpoints WHERE root=? AND device_key=?", params![key.root, key.device])
            .map_err(map_err)?;
        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO endpoints(root,device_key,endpoint_id,name,service_id,success_count,failure_count)
                     VALUES (?,?,?,?,?,?,?)",
                )
                .map_err(map_err)?;
            for e in &entry.endpoints {
                stmt.execute(params![key.root, key.device, e.id, e.name, e.service_id, e.success_count, e.failure_count])
                    .map_err(map_err)?;
            }
        }
        tx.commit().map_err(map_err)
    }

    fn delete(&self, key: &CacheKey) -> Result<(), CacheError> {
        self.lock()
            .execute("DELETE FROM devices WHERE root=? AND device_key=?", params![key.root, key.device])
            .map_err(map_err)?;
        Ok(())
    }

    fn keys(&self, root: &str) -> Result<Vec<String>, CacheError> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare("SELECT device_key FROM devices WHERE root=? ORDER BY device_key")
            .map_err(map_err)?;
        let rows = stmt.query_map(params![root], |r| r.get::<_, String>(0)).map_err(map_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(map_err)
    }
}
