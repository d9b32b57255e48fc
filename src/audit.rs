use core::marker::PhantomData;
use std::collections::VecDeque;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::err::Fallible;
use crate::version::checksum32;
use crate::{FlagValue, Host};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AuditEvent {
    Created,
    Updated,
    Deleted,
    Evaluated,
    Expired,
    Synced,
    ConflictResolved,
}

impl AuditEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEvent::Created => "created",
            AuditEvent::Updated => "updated",
            AuditEvent::Deleted => "deleted",
            AuditEvent::Evaluated => "evaluated",
            AuditEvent::Expired => "expired",
            AuditEvent::Synced => "synced",
            AuditEvent::ConflictResolved => "conflictResolved",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ActorKind {
    User,
    System,
    Api,
}

impl ActorKind {
    fn as_str(&self) -> &'static str {
        match self {
            ActorKind::User => "user",
            ActorKind::System => "system",
            ActorKind::Api => "api",
        }
    }
}

/// Who performed a mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Actor {
    pub kind: ActorKind,
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub ip: Option<String>,
}

impl Actor {
    pub fn user(id: impl Into<String>) -> Actor {
        Actor {
            kind: ActorKind::User,
            id: id.into(),
            ip: None,
        }
    }

    pub fn system(id: impl Into<String>) -> Actor {
        Actor {
            kind: ActorKind::System,
            id: id.into(),
            ip: None,
        }
    }

    pub fn api(id: impl Into<String>) -> Actor {
        Actor {
            kind: ActorKind::Api,
            id: id.into(),
            ip: None,
        }
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Actor {
        self.ip = Some(ip.into());
        self
    }
}

/// Where a record was produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditContext {
    pub node_id: String,
    pub environment: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub user_agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub correlation_id: Option<String>,
}

impl AuditContext {
    pub fn new(node_id: impl Into<String>, environment: impl Into<String>) -> AuditContext {
        AuditContext {
            node_id: node_id.into(),
            environment: environment.into(),
            user_agent: None,
            correlation_id: None,
        }
    }
}

/// One immutable audit entry. The id is time-sortable: a 12-hex-char unix-ms
/// prefix followed by a 12-hex-char random suffix. The checksum covers every
/// other field and can be re-validated at any time with [`verify_record`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub id: String,
    pub timestamp: i64,
    pub event_type: AuditEvent,
    pub flag_key: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub previous_value: Option<FlagValue>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub new_value: Option<FlagValue>,
    pub actor: Actor,
    pub context: AuditContext,
    pub checksum: String,
}

fn checksum_payload(record: &AuditRecord) -> String {
    let render = |value: &Option<FlagValue>| -> String {
        value
            .as_ref()
            .map(|v| serde_json::to_string(v).unwrap_or_default())
            .unwrap_or_default()
    };
    format!(
        "{}|{}|{}|{}|{}|{}|{}|{}|{}|{}",
        record.id,
        record.timestamp,
        record.event_type.as_str(),
        record.flag_key,
        render(&record.previous_value),
        render(&record.new_value),
        record.actor.kind.as_str(),
        record.actor.id,
        record.context.node_id,
        record.context.environment,
    )
}

/// Recomputes a record's checksum and compares it to the stored one.
pub fn verify_record(record: &AuditRecord) -> bool {
    checksum32(&checksum_payload(record)) == record.checksum
}

#[derive(Debug, Clone)]
pub struct AuditConfig {
    pub max_records: usize,
    pub retention_days: i64,
    /// Evaluations are high-volume; they are only recorded when this is on.
    pub evaluation_logging: bool,
}

impl Default for AuditConfig {
    fn default() -> Self {
        AuditConfig {
            max_records: 100_000,
            retention_days: 90,
            evaluation_logging: false,
        }
    }
}

/// Filter for [`AuditLog::query`]. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub flag_key: Option<String>,
    pub event_types: Option<Vec<AuditEvent>>,
    pub actor_id: Option<String>,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    /// Record id of the last item of the previous page; results resume
    /// strictly after it.
    pub cursor: Option<String>,
    pub limit: Option<usize>,
}

/// Append-only, bounded audit log. Appending at capacity drops the oldest
/// tenth; `purge` applies the retention window. Records never change once
/// appended; queries hand out copies.
#[derive(Debug)]
pub struct AuditLog<H: Host> {
    records: Mutex<VecDeque<AuditRecord>>,
    config: AuditConfig,
    context: AuditContext,
    host: PhantomData<H>,
}

impl<H: Host> AuditLog<H> {
    pub fn new(config: AuditConfig, context: AuditContext) -> AuditLog<H> {
        AuditLog {
            records: Mutex::new(VecDeque::new()),
            config,
            context,
            host: PhantomData,
        }
    }

    pub fn config(&self) -> &AuditConfig {
        &self.config
    }

    fn append(
        &self,
        event_type: AuditEvent,
        flag_key: &str,
        previous_value: Option<FlagValue>,
        new_value: Option<FlagValue>,
        actor: &Actor,
    ) -> AuditRecord {
        let now = H::now_millis();
        let mut record = AuditRecord {
            id: format!("{:012x}-{}", now as u64, H::random_hex(12)),
            timestamp: now,
            event_type,
            flag_key: flag_key.to_string(),
            previous_value,
            new_value,
            actor: actor.clone(),
            context: self.context.clone(),
            checksum: String::new(),
        };
        record.checksum = checksum32(&checksum_payload(&record));
        self.push(record.clone());
        record
    }

    fn push(&self, record: AuditRecord) {
        let Ok(mut records) = self.records.lock() else {
            return;
        };
        if records.len() >= self.config.max_records {
            let keep = self.config.max_records * 9 / 10;
            while records.len() > keep {
                records.pop_front();
            }
        }
        records.push_back(record);
    }

    pub fn log_created(&self, flag_key: &str, new_value: &FlagValue, actor: &Actor) -> AuditRecord {
        self.append(AuditEvent::Created, flag_key, None, Some(new_value.clone()), actor)
    }

    pub fn log_updated(
        &self,
        flag_key: &str,
        previous_value: Option<&FlagValue>,
        new_value: Option<&FlagValue>,
        actor: &Actor,
    ) -> AuditRecord {
        self.append(
            AuditEvent::Updated,
            flag_key,
            previous_value.cloned(),
            new_value.cloned(),
            actor,
        )
    }

    pub fn log_deleted(
        &self,
        flag_key: &str,
        previous_value: Option<&FlagValue>,
        actor: &Actor,
    ) -> AuditRecord {
        self.append(AuditEvent::Deleted, flag_key, previous_value.cloned(), None, actor)
    }

    /// No-op unless `evaluation_logging` is enabled.
    pub fn log_evaluated(
        &self,
        flag_key: &str,
        value: &FlagValue,
        actor: &Actor,
    ) -> Option<AuditRecord> {
        if !self.config.evaluation_logging {
            return None;
        }
        Some(self.append(AuditEvent::Evaluated, flag_key, None, Some(value.clone()), actor))
    }

    pub fn log_expired(
        &self,
        flag_key: &str,
        previous_value: Option<&FlagValue>,
        actor: &Actor,
    ) -> AuditRecord {
        self.append(AuditEvent::Expired, flag_key, previous_value.cloned(), None, actor)
    }

    pub fn log_synced(&self, flag_key: &str, new_value: &FlagValue, actor: &Actor) -> AuditRecord {
        self.append(AuditEvent::Synced, flag_key, None, Some(new_value.clone()), actor)
    }

    pub fn log_conflict_resolved(
        &self,
        flag_key: &str,
        previous_value: Option<&FlagValue>,
        new_value: Option<&FlagValue>,
        actor: &Actor,
    ) -> AuditRecord {
        self.append(
            AuditEvent::ConflictResolved,
            flag_key,
            previous_value.cloned(),
            new_value.cloned(),
            actor,
        )
    }

    /// Filtered view, newest first, cursor-paginated on record id.
    pub fn query(&self, query: &AuditQuery) -> Vec<AuditRecord> {
        let Ok(records) = self.records.lock() else {
            return Vec::new();
        };
        let mut matched: Vec<AuditRecord> = records
            .iter()
            .filter(|r| {
                query.flag_key.as_ref().is_none_or(|k| &r.flag_key == k)
                    && query
                        .event_types
                        .as_ref()
                        .is_none_or(|types| types.contains(&r.event_type))
                    && query.actor_id.as_ref().is_none_or(|id| &r.actor.id == id)
                    && query.start_time.is_none_or(|t| r.timestamp >= t)
                    && query.end_time.is_none_or(|t| r.timestamp <= t)
            })
            .cloned()
            .collect();
        drop(records);

        matched.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| b.id.cmp(&a.id)));

        let mut page: Box<dyn Iterator<Item = AuditRecord>> = Box::new(matched.into_iter());
        if let Some(cursor) = &query.cursor {
            let cursor = cursor.clone();
            let mut seen = false;
            page = Box::new(page.skip_while(move |r| {
                if seen {
                    return false;
                }
                seen = r.id == cursor;
                true
            }));
        }
        if let Some(limit) = query.limit {
            page = Box::new(page.take(limit));
        }
        page.collect()
    }

    /// Drops records older than the retention window, returning the count.
    pub fn purge(&self) -> u32 {
        let cutoff = H::now_millis() - self.config.retention_days * 86_400_000;
        let Ok(mut records) = self.records.lock() else {
            return 0;
        };
        let before = records.len();
        records.retain(|r| r.timestamp >= cutoff);
        (before - records.len()) as u32
    }

    pub fn clear(&self) {
        if let Ok(mut records) = self.records.lock() {
            records.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// JSON array of records, ids and checksums verbatim.
    pub fn export_json(&self) -> Fallible<String> {
        let Ok(records) = self.records.lock() else {
            return Ok("[]".to_string());
        };
        let all: Vec<&AuditRecord> = records.iter().collect();
        Ok(serde_json::to_string(&all)?)
    }

    /// Re-imports exported records verbatim: ids and checksums are preserved,
    /// nothing is recomputed. Capacity rules still apply.
    pub fn import_json(&self, json: &str) -> Fallible<u32> {
        let imported: Vec<AuditRecord> = serde_json::from_str(json)?;
        let count = imported.len() as u32;
        for record in imported {
            self.push(record);
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};

    fn log_with<H: Host>(max_records: usize) -> AuditLog<H> {
        AuditLog::new(
            AuditConfig {
                max_records,
                retention_days: 90,
                evaluation_logging: false,
            },
            AuditContext::new("node-a", "production"),
        )
    }

    struct SysClock;
    impl Host for SysClock {}

    #[test]
    fn id_is_time_sortable_hex() {
        let log: AuditLog<SysClock> = log_with(10);
        let record = log.log_created("dark_mode", &FlagValue::Bool(true), &Actor::system("node-a"));
        let re = regex::Regex::new(r"^[0-9a-f]{12}-[0-9a-f]{12}$").unwrap();
        assert!(re.is_match(&record.id), "unexpected id {}", record.id);
        assert_eq!(
            u64::from_str_radix(&record.id[..12], 16).unwrap(),
            record.timestamp as u64
        );
    }

    #[test]
    fn records_are_self_checksummed() {
        let log: AuditLog<SysClock> = log_with(10);
        let record = log.log_updated(
            "dark_mode",
            Some(&FlagValue::Bool(false)),
            Some(&FlagValue::Bool(true)),
            &Actor::user("jan"),
        );
        assert!(verify_record(&record));

        let mut tampered = record.clone();
        tampered.flag_key = "other".to_string();
        assert!(!verify_record(&tampered));

        let mut tampered = record;
        tampered.new_value = Some(FlagValue::Bool(false));
        assert!(!verify_record(&tampered));
    }

    #[test]
    fn appending_at_capacity_drops_the_oldest_tenth() {
        static NOW: AtomicI64 = AtomicI64::new(0);
        struct C;
        impl Host for C {
            fn now_millis() -> i64 {
                NOW.fetch_add(1, Ordering::Relaxed)
            }
        }

        let log: AuditLog<C> = log_with(20);
        for i in 0..21 {
            log.log_created(&format!("flag{}", i), &FlagValue::Bool(true), &Actor::system("s"));
        }
        // the 21st append found 20 records, kept the newest 18, then pushed
        assert_eq!(log.len(), 19);
        let oldest_kept = log
            .query(&AuditQuery::default())
            .into_iter()
            .last()
            .unwrap();
        assert_eq!(oldest_kept.flag_key, "flag2");
    }

    #[test]
    fn evaluation_logging_is_gated() {
        let log: AuditLog<SysClock> = log_with(10);
        assert!(log
            .log_evaluated("dark_mode", &FlagValue::Bool(true), &Actor::system("s"))
            .is_none());
        assert_eq!(log.len(), 0);

        let log: AuditLog<SysClock> = AuditLog::new(
            AuditConfig {
                evaluation_logging: true,
                ..AuditConfig::default()
            },
            AuditContext::new("node-a", "production"),
        );
        assert!(log
            .log_evaluated("dark_mode", &FlagValue::Bool(true), &Actor::system("s"))
            .is_some());
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn query_filters_sorts_and_paginates() {
        static NOW: AtomicI64 = AtomicI64::new(1_000);
        struct C;
        impl Host for C {
            fn now_millis() -> i64 {
                NOW.fetch_add(10, Ordering::Relaxed)
            }
        }

        let log: AuditLog<C> = log_with(100);
        log.log_created("a", &FlagValue::Bool(true), &Actor::user("jan"));
        log.log_updated("a", None, Some(&FlagValue::Bool(false)), &Actor::user("kim"));
        log.log_created("b", &FlagValue::Int(1), &Actor::user("jan"));
        log.log_deleted("a", Some(&FlagValue::Bool(false)), &Actor::user("kim"));

        // newest first
        let all = log.query(&AuditQuery::default());
        assert_eq!(all.len(), 4);
        assert!(all[0].timestamp > all[3].timestamp);
        assert_eq!(all[0].event_type, AuditEvent::Deleted);

        // by flag key
        let for_a = log.query(&AuditQuery {
            flag_key: Some("a".to_string()),
            ..AuditQuery::default()
        });
        assert_eq!(for_a.len(), 3);

        // by event types
        let creates = log.query(&AuditQuery {
            event_types: Some(vec![AuditEvent::Created]),
            ..AuditQuery::default()
        });
        assert_eq!(creates.len(), 2);

        // by actor
        let by_kim = log.query(&AuditQuery {
            actor_id: Some("kim".to_string()),
            ..AuditQuery::default()
        });
        assert_eq!(by_kim.len(), 2);

        // time window covering the middle two records
        let windowed = log.query(&AuditQuery {
            start_time: Some(all[2].timestamp),
            end_time: Some(all[1].timestamp),
            ..AuditQuery::default()
        });
        assert_eq!(windowed.len(), 2);

        // cursor pagination walks the full set without overlap
        let page1 = log.query(&AuditQuery {
            limit: Some(2),
            ..AuditQuery::default()
        });
        let page2 = log.query(&AuditQuery {
            limit: Some(2),
            cursor: Some(page1[1].id.clone()),
            ..AuditQuery::default()
        });
        assert_eq!(page1.len(), 2);
        assert_eq!(page2.len(), 2);
        assert_eq!(page2[1].id, all[3].id);
        let ids: std::collections::HashSet<&String> =
            page1.iter().chain(page2.iter()).map(|r| &r.id).collect();
        assert_eq!(ids.len(), 4);
    }

    #[test]
    fn purge_applies_the_retention_window() {
        static NOW: AtomicI64 = AtomicI64::new(0);
        struct C;
        impl Host for C {
            fn now_millis() -> i64 {
                NOW.load(Ordering::Relaxed)
            }
        }

        let log: AuditLog<C> = AuditLog::new(
            AuditConfig {
                max_records: 100,
                retention_days: 1,
                evaluation_logging: false,
            },
            AuditContext::new("node-a", "production"),
        );
        log.log_created("old", &FlagValue::Bool(true), &Actor::system("s"));
        NOW.store(90_000_000, Ordering::Relaxed); // past one day
        log.log_created("young", &FlagValue::Bool(true), &Actor::system("s"));

        assert_eq!(log.purge(), 1);
        assert_eq!(log.len(), 1);
        assert_eq!(log.query(&AuditQuery::default())[0].flag_key, "young");
    }

    #[test]
    fn export_import_round_trips_ids_and_checksums() {
        let log: AuditLog<SysClock> = log_with(10);
        log.log_created("a", &FlagValue::Bool(true), &Actor::user("jan").with_ip("10.0.0.1"));
        log.log_synced("b", &FlagValue::String("beta".to_string()), &Actor::system("sync"));

        let exported = log.export_json().unwrap();
        let restored: AuditLog<SysClock> = log_with(10);
        assert_eq!(restored.import_json(&exported).unwrap(), 2);

        let original = log.query(&AuditQuery::default());
        let imported = restored.query(&AuditQuery::default());
        assert_eq!(original, imported);
        assert!(imported.iter().all(verify_record));
    }
}
