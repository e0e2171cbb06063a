//! Legion dashboard
//!
//! Aggregates detection and stolen-vehicle records for the admin's legion,
//! feeds the live notification list and produces the CSV export. Only
//! admins scoped to a legion get here; a global admin without one is
//! turned away.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::audit;
use crate::csv;
use crate::error::AdminError;
use crate::realtime::{ListenerHandle, Realtime};
use crate::session::AdminSession;
use crate::store::{Direction, Document, DocumentStore, Query};
use crate::types::{collections, AuditAction, DetectionLog, StolenVehicle, VehicleCheck};

/// How many detections the live feed shows
pub const NOTIFICATION_LIMIT: usize = 10;

pub const CSV_HEADER: [&str; 5] = ["date", "utilisateur", "plaque", "resultat", "legion"];

/// Legion of the session's admin, or `AccessDenied`
pub fn require_legion(session: &AdminSession) -> Result<&str, AdminError> {
    session.legion().ok_or(AdminError::AccessDenied)
}

/// Headline counters for one legion
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub total_detections: usize,
    pub stolen_detections: usize,
    pub stolen_vehicles: usize,
    pub vehicle_checks: usize,
}

/// Labels and values for one Chart.js chart
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ChartData {
    pub labels: Vec<String>,
    pub values: Vec<usize>,
}

impl From<&BTreeMap<String, usize>> for ChartData {
    fn from(buckets: &BTreeMap<String, usize>) -> Self {
        ChartData {
            labels: buckets.keys().cloned().collect(),
            values: buckets.values().copied().collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Aggregates {
    pub legion: String,
    pub summary: Summary,
    pub detections_by_month: ChartData,
    pub vehicles_by_status: ChartData,
}

/// Count detections per `YYYY-MM`, keys ascending
pub fn bucket_by_month(detections: &[DetectionLog]) -> BTreeMap<String, usize> {
    let mut buckets = BTreeMap::new();
    for detection in detections {
        let month = detection.timestamp.format("%Y-%m").to_string();
        *buckets.entry(month).or_insert(0) += 1;
    }
    buckets
}

/// Count stolen vehicles per status, missing statuses under `Inconnu`
pub fn bucket_by_status(vehicles: &[StolenVehicle]) -> BTreeMap<String, usize> {
    let mut buckets = BTreeMap::new();
    for vehicle in vehicles {
        *buckets.entry(vehicle.status_label().to_string()).or_insert(0) += 1;
    }
    buckets
}

fn for_legion(collection: &str, legion: &str) -> Query {
    Query::new(collection).where_eq("legion", legion)
}

/// Decode documents, skipping the ones the mobile client wrote malformed
fn decode_lenient<T: DeserializeOwned>(docs: Vec<Document>) -> Vec<T> {
    docs.into_iter()
        .filter_map(|doc| match doc.decode::<T>() {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(id = %doc.id, error = %e, "Skipping malformed document");
                None
            }
        })
        .collect()
}

fn legion_detections(
    store: &DocumentStore,
    legion: &str,
    direction: Direction,
) -> Result<Vec<DetectionLog>, AdminError> {
    let query = for_legion(collections::DETECTIONS, legion).order_by("timestamp", direction);
    Ok(decode_lenient(store.query(&query)?))
}

/// Build chart data and counters for the session's legion
pub fn load_aggregates(
    store: &DocumentStore,
    session: &AdminSession,
) -> Result<Aggregates, AdminError> {
    let legion = require_legion(session)?;

    let detections = legion_detections(store, legion, Direction::Asc)?;
    let vehicles: Vec<StolenVehicle> =
        decode_lenient(store.query(&for_legion(collections::STOLEN_VEHICLES, legion))?);
    let checks: Vec<VehicleCheck> =
        decode_lenient(store.query(&for_legion(collections::VEHICLE_CHECKS, legion))?);

    let summary = Summary {
        total_detections: detections.len(),
        stolen_detections: detections.iter().filter(|d| d.is_stolen()).count(),
        stolen_vehicles: vehicles.len(),
        vehicle_checks: checks.len(),
    };

    Ok(Aggregates {
        legion: legion.to_string(),
        summary,
        detections_by_month: ChartData::from(&bucket_by_month(&detections)),
        vehicles_by_status: ChartData::from(&bucket_by_status(&vehicles)),
    })
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Stolen,
    Clean,
}

/// One entry of the live feed
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Notification {
    pub kind: NotificationKind,
    pub plate: String,
    pub user: String,
    pub result: String,
    pub timestamp: DateTime<Utc>,
}

impl From<DetectionLog> for Notification {
    fn from(log: DetectionLog) -> Self {
        let kind = if log.is_stolen() {
            NotificationKind::Stolen
        } else {
            NotificationKind::Clean
        };
        Notification {
            kind,
            plate: log.plate,
            user: log.user,
            result: log.result,
            timestamp: log.timestamp,
        }
    }
}

/// Ten most recent detections of a legion, newest first
pub fn notifications_query(legion: &str) -> Query {
    for_legion(collections::DETECTIONS, legion)
        .order_by("timestamp", Direction::Desc)
        .limit(NOTIFICATION_LIMIT)
}

pub fn to_notifications(docs: Vec<Document>) -> Vec<Notification> {
    decode_lenient::<DetectionLog>(docs)
        .into_iter()
        .map(Notification::from)
        .collect()
}

/// Attach the live feed for the session's legion.
///
/// `on_update` receives the whole list on attach and after each write to
/// the detections collection.
pub fn subscribe_notifications<F>(
    realtime: &Realtime,
    session: &AdminSession,
    on_update: F,
) -> Result<ListenerHandle, AdminError>
where
    F: Fn(Vec<Notification>) + Send + 'static,
{
    let legion = require_legion(session)?;
    realtime
        .subscribe(Some(session), notifications_query(legion), move |docs| {
            on_update(to_notifications(docs))
        })
        .ok_or(AdminError::Unauthorized)
}

/// Render every detection of a legion as CSV, returning the text and row count
pub fn render_legion_csv(store: &DocumentStore, legion: &str) -> Result<(String, usize), AdminError> {
    let detections = legion_detections(store, legion, Direction::Desc)?;

    let mut out = String::new();
    csv::write_record(&mut out, &CSV_HEADER);
    for d in &detections {
        csv::write_record(
            &mut out,
            &[
                d.timestamp.to_rfc3339(),
                d.user.clone(),
                d.plate.clone(),
                d.result.clone(),
                d.legion.clone(),
            ],
        );
    }
    Ok((out, detections.len()))
}

/// Export the session's legion and log the export
pub fn export_csv(
    store: &DocumentStore,
    session: &AdminSession,
    now: DateTime<Utc>,
) -> Result<String, AdminError> {
    let legion = require_legion(session)?;
    let (text, rows) = render_legion_csv(store, legion)?;

    audit::record(
        store,
        &session.admin.email,
        AuditAction::ExportCsv,
        Some(format!("{} ({} lignes)", legion, rows)),
        now,
    )?;
    info!(legion = %legion, rows = rows, "Detections exported");
    Ok(text)
}

/// Download name for an export, e.g. `detections_dakar_2025-02-10.csv`
pub fn export_filename(legion: &str, now: DateTime<Utc>) -> String {
    let slug: String = legion
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect();
    format!("detections_{}_{}.csv", slug, now.format("%Y-%m-%d"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AdminProfile, AdminRole};
    use chrono::TimeZone;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 10, 0, 0).unwrap()
    }

    fn session(legion: Option<&str>) -> AdminSession {
        AdminSession {
            id: Uuid::new_v4(),
            credential_id: "admin-1".to_string(),
            admin: AdminProfile {
                email: "chef@securauto.sn".to_string(),
                display_name: "Chef".to_string(),
                role: if legion.is_some() {
                    AdminRole::LegionAdmin
                } else {
                    AdminRole::GlobalAdmin
                },
                legion: legion.map(str::to_string),
                permissions: BTreeMap::new(),
                active: true,
                last_login: None,
                created_at: at(2025, 1, 1),
            },
            captured_at: at(2025, 1, 1),
        }
    }

    fn detection(ts: DateTime<Utc>, plate: &str, result: &str, legion: &str) -> DetectionLog {
        DetectionLog {
            timestamp: ts,
            user: "agent-7".to_string(),
            plate: plate.to_string(),
            result: result.to_string(),
            legion: legion.to_string(),
        }
    }

    fn seeded() -> DocumentStore {
        let store = DocumentStore::open_in_memory().unwrap();
        for d in [
            detection(at(2025, 1, 5), "DK-1", "stolen", "Dakar"),
            detection(at(2025, 1, 20), "DK-2", "clean", "Dakar"),
            detection(at(2025, 3, 2), "DK-3", "Volé", "Dakar"),
            detection(at(2024, 12, 31), "DK-4", "clean", "Dakar"),
            detection(at(2025, 1, 6), "TH-1", "stolen", "Thiès"),
        ] {
            store.add(collections::DETECTIONS, &d).unwrap();
        }
        for (plate, status) in [("DK-1", Some("recherche")), ("DK-3", None), ("DK-9", Some(""))] {
            let vehicle = StolenVehicle {
                plate: plate.to_string(),
                status: status.map(str::to_string),
                legion: "Dakar".to_string(),
                reported_at: None,
            };
            store.add(collections::STOLEN_VEHICLES, &vehicle).unwrap();
        }
        store
            .add(
                collections::VEHICLE_CHECKS,
                &json!({"plate": "DK-2", "user": "agent-7", "timestamp": "2025-01-20T10:00:00Z", "legion": "Dakar"}),
            )
            .unwrap();
        store
    }

    // ========== access tests ==========

    #[test]
    fn test_require_legion() {
        assert_eq!(require_legion(&session(Some("Dakar"))).unwrap(), "Dakar");
        assert!(matches!(require_legion(&session(None)), Err(AdminError::AccessDenied)));
        assert!(matches!(require_legion(&session(Some(" "))), Err(AdminError::AccessDenied)));
    }

    #[test]
    fn test_load_aggregates_denied_without_legion() {
        let store = seeded();
        let result = load_aggregates(&store, &session(None));
        assert!(matches!(result, Err(AdminError::AccessDenied)));
    }

    // ========== bucketing tests ==========

    #[test]
    fn test_bucket_by_month_ascending() {
        let detections = vec![
            detection(at(2025, 3, 1), "a", "", "x"),
            detection(at(2024, 12, 1), "b", "", "x"),
            detection(at(2025, 3, 15), "c", "", "x"),
        ];
        let buckets = bucket_by_month(&detections);

        assert_eq!(buckets.keys().collect::<Vec<_>>(), vec!["2024-12", "2025-03"]);
        assert_eq!(buckets["2025-03"], 2);
    }

    #[test]
    fn test_bucket_by_status_unknown() {
        let vehicles = vec![
            StolenVehicle {
                plate: "a".into(),
                status: None,
                legion: "x".into(),
                reported_at: None,
            },
            StolenVehicle {
                plate: "b".into(),
                status: Some("retrouvé".into()),
                legion: "x".into(),
                reported_at: None,
            },
        ];
        let buckets = bucket_by_status(&vehicles);

        assert_eq!(buckets["Inconnu"], 1);
        assert_eq!(buckets["retrouvé"], 1);
    }

    // ========== load_aggregates tests ==========

    #[test]
    fn test_load_aggregates_scoped_to_legion() {
        let store = seeded();
        let aggregates = load_aggregates(&store, &session(Some("Dakar"))).unwrap();

        assert_eq!(aggregates.legion, "Dakar");
        assert_eq!(
            aggregates.detections_by_month,
            ChartData {
                labels: vec!["2024-12".into(), "2025-01".into(), "2025-03".into()],
                values: vec![1, 2, 1],
            }
        );
        assert_eq!(aggregates.vehicles_by_status.labels, vec!["Inconnu", "recherche"]);
        assert_eq!(aggregates.vehicles_by_status.values, vec![2, 1]);
        assert_eq!(
            aggregates.summary,
            Summary {
                total_detections: 4,
                stolen_detections: 2,
                stolen_vehicles: 3,
                vehicle_checks: 1,
            }
        );
    }

    #[test]
    fn test_load_aggregates_skips_malformed_documents() {
        let store = seeded();
        store
            .add(collections::DETECTIONS, &json!({"legion": "Dakar", "timestamp": "hier"}))
            .unwrap();

        let aggregates = load_aggregates(&store, &session(Some("Dakar"))).unwrap();
        assert_eq!(aggregates.summary.total_detections, 4);
    }

    #[test]
    fn test_vehicle_checks_counted_per_legion() {
        let store = seeded();
        store
            .add(
                collections::VEHICLE_CHECKS,
                &json!({"plate": "TH-1", "timestamp": "2025-01-21T10:00:00Z", "legion": "Thiès"}),
            )
            .unwrap();
        store
            .add(collections::VEHICLE_CHECKS, &json!({"plate": "DK-7", "legion": "Dakar"}))
            .unwrap();

        let aggregates = load_aggregates(&store, &session(Some("Dakar"))).unwrap();
        assert_eq!(aggregates.summary.vehicle_checks, 1);
    }

    #[test]
    fn test_aggregates_json_shape() {
        let store = seeded();
        let aggregates = load_aggregates(&store, &session(Some("Dakar"))).unwrap();
        let value = serde_json::to_value(&aggregates).unwrap();

        assert_eq!(value["detectionsByMonth"]["labels"][0], "2024-12");
        assert_eq!(value["summary"]["stolenDetections"], 2);
    }

    // ========== notification tests ==========

    #[test]
    fn test_notifications_newest_first_and_tagged() {
        let store = seeded();
        let docs = store.query(&notifications_query("Dakar")).unwrap();
        let feed = to_notifications(docs);

        assert_eq!(feed.len(), 4);
        assert_eq!(feed[0].plate, "DK-3");
        assert_eq!(feed[0].kind, NotificationKind::Stolen);
        assert_eq!(feed[1].kind, NotificationKind::Clean);
        assert_eq!(feed[3].plate, "DK-4");
    }

    #[test]
    fn test_notifications_limited_to_ten() {
        let store = DocumentStore::open_in_memory().unwrap();
        for day in 1..=15 {
            store
                .add(collections::DETECTIONS, &detection(at(2025, 1, day), &format!("P-{}", day), "clean", "Dakar"))
                .unwrap();
        }

        let feed = to_notifications(store.query(&notifications_query("Dakar")).unwrap());
        assert_eq!(feed.len(), 10);
        assert_eq!(feed[0].plate, "P-15");
        assert_eq!(feed[9].plate, "P-6");
    }

    #[tokio::test]
    async fn test_subscribe_notifications_pushes_updates() {
        let store = Arc::new(seeded());
        let realtime = Realtime::new(Arc::clone(&store));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let _handle = subscribe_notifications(&realtime, &session(Some("Dakar")), move |feed| {
            let _ = tx.send(feed);
        })
        .unwrap();

        let first = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(first.len(), 4);

        store
            .add(collections::DETECTIONS, &detection(at(2025, 4, 1), "DK-NEW", "stolen", "Dakar"))
            .unwrap();
        let second = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(second[0].plate, "DK-NEW");
        assert_eq!(second[0].kind, NotificationKind::Stolen);
    }

    #[tokio::test]
    async fn test_subscribe_notifications_denied_without_legion() {
        let store = Arc::new(seeded());
        let realtime = Realtime::new(store);

        let result = subscribe_notifications(&realtime, &session(None), |_| {});
        assert!(matches!(result, Err(AdminError::AccessDenied)));
        assert_eq!(realtime.active_count(), 0);
    }

    // ========== export tests ==========

    #[test]
    fn test_export_csv_roundtrip() {
        let store = DocumentStore::open_in_memory().unwrap();
        let rows = vec![
            detection(at(2025, 2, 2), "DK \"A\"", "volé", "Dakar"),
            detection(at(2025, 2, 1), "DK;B", "clean", "Dakar"),
        ];
        for d in &rows {
            store.add(collections::DETECTIONS, d).unwrap();
        }

        let text = export_csv(&store, &session(Some("Dakar")), at(2025, 2, 10)).unwrap();
        assert!(text.starts_with("\"date\";\"utilisateur\";\"plaque\";\"resultat\";\"legion\"\n"));
        assert!(text.contains("\"DK \"\"A\"\"\""));

        let parsed = csv::parse(&text);
        assert_eq!(parsed[0], CSV_HEADER.to_vec());
        let tuples: Vec<Vec<String>> = rows
            .iter()
            .map(|d| {
                vec![
                    d.timestamp.to_rfc3339(),
                    d.user.clone(),
                    d.plate.clone(),
                    d.result.clone(),
                    d.legion.clone(),
                ]
            })
            .collect();
        assert_eq!(parsed[1..].to_vec(), tuples);
    }

    #[test]
    fn test_export_csv_records_audit() {
        let store = seeded();
        export_csv(&store, &session(Some("Dakar")), at(2025, 2, 10)).unwrap();

        let last = audit::last_action(&store, "chef@securauto.sn").unwrap().unwrap();
        assert_eq!(last.action, AuditAction::ExportCsv);
        assert_eq!(last.details.as_deref(), Some("Dakar (4 lignes)"));
    }

    #[test]
    fn test_export_csv_denied_without_legion() {
        let store = seeded();
        let result = export_csv(&store, &session(None), at(2025, 2, 10));
        assert!(matches!(result, Err(AdminError::AccessDenied)));
    }

    #[test]
    fn test_render_legion_csv_empty() {
        let store = DocumentStore::open_in_memory().unwrap();
        let (text, rows) = render_legion_csv(&store, "Kolda").unwrap();

        assert_eq!(rows, 0);
        assert_eq!(csv::parse(&text).len(), 1);
    }

    #[test]
    fn test_export_filename() {
        assert_eq!(export_filename("Dakar", at(2025, 2, 10)), "detections_dakar_2025-02-10.csv");
        assert_eq!(export_filename("Saint Louis", at(2025, 2, 10)), "detections_saint_louis_2025-02-10.csv");
    }
}
