mod open;
mod schema;
mod store;

pub use open::SqliteCache;

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use gpslink_core::{CacheEntry, CacheError, CacheKey, Classification, DeviceCache, EndpointRecord};
    use time::macros::datetime;

    use super::*;

    fn sample() -> CacheEntry {
        let mut entry = CacheEntry::new("Test");
        entry.success_count = 3;
        entry.failure_count = 1;
        entry.last_detected = datetime!(2024-03-01 12:30:00 UTC);
        entry.connection_time = Duration::from_millis(1500);
        entry.class = Classification { major: 1, minor: 3, service_flags: 0x1_0000 };
        entry.endpoints = vec![
            EndpointRecord { id: 1, name: Some("Serial Port".into()), service_id: "spp".into(), success_count: 3, failure_count: 0 },
            EndpointRecord { id: 4, name: None, service_id: "spp".into(), success_count: 0, failure_count: 2 },
        ];
        entry
    }

    #[test]
    fn entry_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("devices.db");
        let key = CacheKey::new("radio", "AA:BB:CC:DD:EE:FF");
        {
            let cache = SqliteCache::open_or_create(&path).unwrap();
            cache.put(&key, &sample()).unwrap();
        }
        let cache = SqliteCache::open_or_create(&path).unwrap();
        assert_eq!(cache.get(&key).unwrap(), Some(sample()));
        assert_eq!(cache.keys("radio").unwrap(), vec!["AA:BB:CC:DD:EE:FF".to_string()]);
        assert!(cache.keys("net").unwrap().is_empty());
    }

    #[test]
    fn put_replaces_endpoints() {
        let cache = SqliteCache::open_in_memory().unwrap();
        let key = CacheKey::new("net", "10.0.0.5");
        cache.put(&key, &sample()).unwrap();
        let mut entry = sample();
        entry.endpoints.truncate(1);
        entry.success_count = 4;
        cache.put(&key, &entry).unwrap();
        let stored = cache.get(&key).unwrap().unwrap();
        assert_eq!(stored.endpoints.len(), 1);
        assert_eq!(stored.success_count, 4);
    }

    #[test]
    fn delete_removes_endpoint_subtree() {
        let cache = SqliteCache::open_in_memory().unwrap();
        let key = CacheKey::new("radio", "00:11:22:33:44:55");
        cache.put(&key, &sample()).unwrap();
        cache.delete(&key).unwrap();
        cache.delete(&key).unwrap();
        assert_eq!(cache.get(&key).unwrap(), None);
        let left: i64 = cache.conn.lock().unwrap().query_row("SELECT COUNT(1) FROM endpoints", [], |r| r.get(0)).unwrap();
        assert_eq!(left, 0);
    }

    #[test]
    fn bad_timestamp_is_reported_as_corrupt() {
        let cache = SqliteCache::open_in_memory().unwrap();
        let key = CacheKey::new("net", "10.0.0.9");
        cache.put(&key, &sample()).unwrap();
        cache
            .conn
            .lock()
            .unwrap()
            .execute("UPDATE devices SET last_detected='yesterday' WHERE device_key='10.0.0.9'", [])
            .unwrap();
        assert!(matches!(cache.get(&key), Err(CacheError::Corrupt { .. })));
    }
}
