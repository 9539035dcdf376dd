//! Queries over the `results` table.
//!
//! Everything here is expressed as parameterized [`Query`] values executed
//! through the [`PersistenceQueue`]; nothing touches the pool directly.

use meshtenna_common::models::Sample;

use crate::persistence::PersistenceQueue;
use crate::storage::{Query, Storage, Value};

/// One distinct antenna setup as it appears in the results table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AntennaGroup {
    pub antenna_name: String,
    pub location: String,
    pub url: String,
    pub notes: String,
}

pub fn insert(sample: &Sample) -> Query {
    Query::new(
        "INSERT INTO results (antenna_name, url, notes, location, node_name, node_id, \
         connection_type, address, timestamp, rssi, snr) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(sample.antenna_name.as_str())
    .bind(sample.url.as_str())
    .bind(sample.notes.as_str())
    .bind(sample.location.as_str())
    .bind(sample.node_name.as_str())
    .bind(sample.node_id.as_str())
    .bind(sample.connection_type.to_string())
    .bind(sample.address.as_str())
    .bind(sample.timestamp.as_str())
    .bind(sample.rssi)
    .bind(sample.snr)
}

pub async fn count<S: Storage>(queue: &PersistenceQueue<S>) -> u64 {
    queue
        .read_one(Query::new("SELECT COUNT(*) FROM results"))
        .await
        .and_then(|row| row.first().and_then(Value::as_i64))
        .map_or(0, |n| n.max(0) as u64)
}

pub async fn distinct_locations<S: Storage>(queue: &PersistenceQueue<S>) -> Vec<String> {
    text_column(queue, Query::new("SELECT DISTINCT location FROM results")).await
}

pub async fn distinct_antennas<S: Storage>(queue: &PersistenceQueue<S>) -> Vec<String> {
    text_column(queue, Query::new("SELECT DISTINCT antenna_name FROM results")).await
}

/// Distinct antenna setups, optionally restricted to one location.
pub async fn antenna_groups<S: Storage>(
    queue: &PersistenceQueue<S>,
    location: Option<&str>,
) -> Vec<AntennaGroup> {
    let query = match location {
        Some(location) => Query::new(
            "SELECT antenna_name, location, url, notes FROM results WHERE location = ? \
             GROUP BY antenna_name, location, url, notes",
        )
        .bind(location),
        None => Query::new(
            "SELECT antenna_name, location, url, notes FROM results \
             GROUP BY antenna_name, location, url, notes",
        ),
    };

    queue
        .read_all(query)
        .await
        .into_iter()
        .map(|row| {
            let mut cols = row.into_iter().map(Value::into_text);
            AntennaGroup {
                antenna_name: cols.next().unwrap_or_default(),
                location: cols.next().unwrap_or_default(),
                url: cols.next().unwrap_or_default(),
                notes: cols.next().unwrap_or_default(),
            }
        })
        .collect()
}

/// Antenna that recorded the strongest single RSSI sample at `location`.
pub async fn best_antenna<S: Storage>(queue: &PersistenceQueue<S>, location: &str) -> Option<String> {
    let query = Query::new(
        "SELECT antenna_name, rssi FROM results WHERE location = ? AND rssi IS NOT NULL \
         ORDER BY rssi DESC LIMIT 1",
    )
    .bind(location);
    queue
        .read_one(query)
        .await
        .and_then(|row| row.into_iter().next())
        .and_then(|v| v.as_str().map(str::to_string))
}

pub async fn delete_antenna<S: Storage>(queue: &PersistenceQueue<S>, antenna_name: &str) -> u64 {
    let deleted = queue
        .write(Query::new("DELETE FROM results WHERE antenna_name = ?").bind(antenna_name))
        .await;
    tracing::info!(antenna = antenna_name, deleted, "deleted antenna samples");
    deleted
}

pub async fn delete_location<S: Storage>(queue: &PersistenceQueue<S>, location: &str) -> u64 {
    let deleted = queue
        .write(Query::new("DELETE FROM results WHERE location = ?").bind(location))
        .await;
    tracing::info!(location, deleted, "deleted location samples");
    deleted
}

pub async fn delete_all<S: Storage>(queue: &PersistenceQueue<S>) -> u64 {
    let deleted = queue.write(Query::new("DELETE FROM results")).await;
    tracing::info!(deleted, "deleted all samples");
    deleted
}

async fn text_column<S: Storage>(queue: &PersistenceQueue<S>, query: Query) -> Vec<String> {
    queue
        .read_all(query)
        .await
        .into_iter()
        .filter_map(|row| row.into_iter().next())
        .filter_map(|v| match v {
            Value::Text(s) => Some(s),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshtenna_common::models::ConnectionType;

    #[test]
    fn insert_binds_every_column_in_order() {
        let sample = Sample {
            antenna_name: "yagi".into(),
            url: "u".into(),
            notes: "n".into(),
            location: "hill".into(),
            node_name: "Unknown Node".into(),
            node_id: "!0000000a".into(),
            connection_type: ConnectionType::Ble,
            address: "Meshtastic_ab".into(),
            timestamp: "2026-03-01 08:00:00".into(),
            rssi: Some(-97),
            snr: None,
        };
        let q = insert(&sample);
        assert_eq!(q.sql.matches('?').count(), 11);
        assert_eq!(q.params.len(), 11);
        assert_eq!(q.params[0], Value::Text("yagi".into()));
        assert_eq!(q.params[6], Value::Text("BLE".into()));
        assert_eq!(q.params[9], Value::Integer(-97));
        assert_eq!(q.params[10], Value::Null);
    }
}
