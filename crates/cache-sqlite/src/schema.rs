pub const MIG_0001_INIT: &str = r#"
BEGIN;

CREATE TABLE devices (
  root            TEXT NOT NULL,
  device_key      TEXT NOT NULL,
  name            TEXT NOT NULL DEFAULT '',
  success_count   INTEGER NOT NULL DEFAULT 0 CHECK (success_count >= 0),
  failure_count   INTEGER NOT NULL DEFAULT 0 CHECK (failure_count >= 0),
  last_detected   TEXT NOT NULL,
  last_connected  TEXT NOT NULL,
  connection_ms   INTEGER NOT NULL DEFAULT 0,
  major_class     INTEGER NOT NULL DEFAULT 0,
  minor_class     INTEGER NOT NULL DEFAULT 0,
  service_flags   INTEGER NOT NULL DEFAULT 0,
  PRIMARY KEY (root, device_key)
);

CREATE TABLE endpoints (
  root            TEXT NOT NULL,
  device_key      TEXT NOT NULL,
  endpoint_id     INTEGER NOT NULL,
  name            TEXT,
  service_id      TEXT NOT NULL,
  success_count   INTEGER NOT NULL DEFAULT 0,
  failure_count   INTEGER NOT NULL DEFAULT 0,
  PRIMARY KEY (root, device_key, endpoint_id),
  FOREIGN KEY (root, device_key) REFERENCES devices(root, device_key) ON DELETE CASCADE
);

CREATE INDEX idx_devices_root ON devices(root);

COMMIT;
"#;
