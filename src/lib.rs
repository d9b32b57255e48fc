#![cfg_attr(not(test), deny(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
))]

use core::fmt;
use std::collections::HashMap;

use fastmurmur3::murmur3_x64_128;
use serde::{Deserialize, Serialize};

pub mod audit;
pub mod cache;
mod err;
pub mod file_store;
pub mod store;
pub mod version;
mod value;

pub use audit::{Actor, AuditConfig, AuditEvent, AuditLog, AuditQuery, AuditRecord};
pub use cache::{CacheConfig, CacheState, CacheStats, ExpiryPolicy, FlagCache};
pub use err::{Fallible, FlagError};
pub use file_store::FileStore;
pub use store::{FlagBatch, FlagStore, MemoryStore};
pub use value::FlagValue;
pub use version::VersionVector;

use audit::AuditContext;

/// Rollout buckets per flag: percentages compare against `[0, 100)`.
pub(crate) const BUCKETS: u32 = 100;

const MAX_FLAGS_PER_BATCH_EVALUATE: usize = 200;

/// Clock, randomness and logging seam between the runtime and its host.
///
/// The defaults cover embedded std use; servers and tests override what
/// they need (tests typically pin `now_millis` to a counter).
pub trait Host {
    fn now_millis() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    fn random_hex(len: usize) -> String {
        use rand::Rng;
        let mut rng = rand::rng();
        (0..len)
            .map(|_| char::from_digit(rng.random_range(0..16u32), 16).unwrap_or('0'))
            .collect()
    }

    fn log(_: &str) {
        // noop
    }
}

/// Host backed by the system clock and thread-local RNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemHost;

impl Host for SystemHost {}

/// Murmur3 x64-128 with seed 0 over the UTF-8 bytes. The returned `u128`
/// carries h1 in its low 64 bits.
pub fn hash(key: &str) -> u128 {
    murmur3_x64_128(key.as_bytes(), 0)
}

/// Maps a digest into `[0, buckets)` by truncating to its low 32 bits.
/// This function is part of the interop contract: identical inputs must
/// land on identical buckets on every node, so neither the hash nor the
/// truncation may change.
pub fn bucket(hash: u128, buckets: u32) -> u32 {
    (hash as u32) % buckets
}

/// Rollout bucket in `[0, 100)` for a (seed, flag key, user id) triple.
pub fn rollout_bucket(seed: &str, flag_key: &str, user_id: &str) -> u32 {
    bucket(hash(&format!("{}:{}:{}", seed, flag_key, user_id)), BUCKETS)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FlagKind {
    Boolean,
    Variant,
    Rollout,
    Segment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FlagState {
    Enabled,
    Disabled,
    Archived,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RuleOperator {
    Eq,
    Neq,
    Contains,
    StartsWith,
    EndsWith,
    In,
    NotIn,
    Gt,
    Gte,
    Lt,
    Lte,
    Regex,
}

/// One attribute predicate. Rules on a segment flag are independent:
/// evaluation ORs across them, first match wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetingRule {
    pub attribute: String,
    pub operator: RuleOperator,
    pub value: String,
    #[serde(default)]
    pub negate: bool,
}

impl TargetingRule {
    pub fn new(
        attribute: impl Into<String>,
        operator: RuleOperator,
        value: impl Into<String>,
    ) -> TargetingRule {
        TargetingRule {
            attribute: attribute.into(),
            operator,
            value: value.into(),
            negate: false,
        }
    }

    pub fn negated(mut self) -> TargetingRule {
        self.negate = true;
        self
    }
}

/// A flag definition. Which optional fields are meaningful depends on
/// `kind`: `variants` for Variant, `percentage` and `hash_seed` for
/// Rollout, `rules` for Segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Flag {
    pub key: String,
    pub name: String,
    pub description: String,
    pub kind: FlagKind,
    pub state: FlagState,
    pub value: FlagValue,
    pub default_value: FlagValue,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub variants: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub percentage: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub rules: Option<Vec<TargetingRule>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub hash_seed: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub environment: String,
}

impl Flag {
    fn base(key: String, kind: FlagKind, value: FlagValue, default_value: FlagValue) -> Flag {
        Flag {
            name: key.clone(),
            key,
            description: String::new(),
            kind,
            state: FlagState::Enabled,
            value,
            default_value,
            variants: None,
            percentage: None,
            rules: None,
            hash_seed: None,
            tags: Vec::new(),
            environment: String::new(),
        }
    }

    pub fn boolean(key: impl Into<String>, value: bool) -> Flag {
        Flag::base(
            key.into(),
            FlagKind::Boolean,
            FlagValue::Bool(value),
            FlagValue::Bool(false),
        )
    }

    pub fn variant(key: impl Into<String>, value: impl Into<String>, variants: Vec<String>) -> Flag {
        let value = value.into();
        let mut flag = Flag::base(
            key.into(),
            FlagKind::Variant,
            FlagValue::String(value.clone()),
            FlagValue::String(value),
        );
        flag.variants = Some(variants);
        flag
    }

    /// Percentage rollout; the hash seed defaults to the key at creation.
    pub fn rollout(key: impl Into<String>, percentage: f64) -> Flag {
        let mut flag = Flag::base(
            key.into(),
            FlagKind::Rollout,
            FlagValue::Bool(true),
            FlagValue::Bool(false),
        );
        flag.percentage = Some(percentage);
        flag
    }

    pub fn segment(key: impl Into<String>, value: FlagValue, default_value: FlagValue) -> Flag {
        let mut flag = Flag::base(key.into(), FlagKind::Segment, value, default_value);
        flag.rules = Some(Vec::new());
        flag
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Flag {
        self.name = name.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Flag {
        self.description = description.into();
        self
    }

    pub fn with_default(mut self, default_value: FlagValue) -> Flag {
        self.default_value = default_value;
        self
    }

    pub fn with_rule(mut self, rule: TargetingRule) -> Flag {
        self.rules.get_or_insert_with(Vec::new).push(rule);
        self
    }

    pub fn with_hash_seed(mut self, seed: impl Into<String>) -> Flag {
        self.hash_seed = Some(seed.into());
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Flag {
        self.tags = tags;
        self
    }

    pub fn with_environment(mut self, environment: impl Into<String>) -> Flag {
        self.environment = environment.into();
        self
    }

    /// Checks the kind-specific invariants and the value/default type
    /// agreement. Run at creation; synced definitions are taken as-is and
    /// degrade at evaluation instead.
    pub fn validate(&self) -> Fallible<()> {
        if !self.value.same_tag(&self.default_value) {
            return Err(FlagError::invalid_type(
                self.value.type_tag(),
                self.default_value.type_tag(),
            ));
        }
        match self.kind {
            FlagKind::Boolean | FlagKind::Segment => {}
            FlagKind::Variant => {
                let Some(variants) = &self.variants else {
                    return Err(FlagError::evaluation(format!(
                        "variant flag '{}' has no variants",
                        self.key
                    )));
                };
                let value = self.value.as_string();
                if !variants.iter().any(|v| *v == value) {
                    return Err(FlagError::evaluation(format!(
                        "variant flag '{}' value '{}' is not among its variants",
                        self.key, value
                    )));
                }
            }
            FlagKind::Rollout => {
                let Some(percentage) = self.percentage else {
                    return Err(FlagError::evaluation(format!(
                        "rollout flag '{}' has no percentage",
                        self.key
                    )));
                };
                if !(0.0..=100.0).contains(&percentage) {
                    return Err(FlagError::evaluation(format!(
                        "rollout flag '{}' percentage {} is outside [0, 100]",
                        self.key, percentage
                    )));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagMeta {
    pub created_at: i64,
    pub updated_at: i64,
    pub version: VersionVector,
    /// Advisory only: evaluation never consults it. Expiry happens through
    /// the explicit purge API.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub expires_at: Option<i64>,
    pub expiry_policy: ExpiryPolicy,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub last_evaluated_at: Option<i64>,
    pub evaluation_count: u64,
}

impl FlagMeta {
    pub fn new(now: i64, version: VersionVector) -> FlagMeta {
        FlagMeta {
            created_at: now,
            updated_at: now,
            version,
            expires_at: None,
            expiry_policy: ExpiryPolicy::Adaptive,
            last_evaluated_at: None,
            evaluation_count: 0,
        }
    }
}

/// The unit of storage and replication. The cache holds copies, never
/// references, so cache and store lifetimes stay independent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagWithMeta {
    pub flag: Flag,
    pub meta: FlagMeta,
}

#[cfg(test)]
impl FlagWithMeta {
    pub(crate) fn for_tests(flag: Flag, now: i64) -> FlagWithMeta {
        FlagWithMeta {
            flag,
            meta: FlagMeta::new(
                now,
                VersionVector {
                    version: 1,
                    timestamp: now,
                    node_id: "test-node".to_string(),
                    checksum: "00000000".to_string(),
                },
            ),
        }
    }
}

/// Caller-supplied evaluation input. Immutable during an evaluation; build
/// a fresh one per evaluation rather than mutating shared state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationContext {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    pub timestamp: i64,
}

impl EvaluationContext {
    pub fn anonymous(timestamp: i64) -> EvaluationContext {
        EvaluationContext {
            user_id: None,
            session_id: None,
            attributes: HashMap::new(),
            timestamp,
        }
    }

    pub fn for_user(user_id: impl Into<String>, timestamp: i64) -> EvaluationContext {
        EvaluationContext {
            user_id: Some(user_id.into()),
            ..EvaluationContext::anonymous(timestamp)
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> EvaluationContext {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_attribute(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> EvaluationContext {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationReason {
    Fallthrough,
    FlagDisabled,
    FlagNotFound,
    RolloutIncluded,
    RolloutExcluded,
    NoUserId,
    RolloutConfigMissing,
    RuleMatch,
    NoRuleMatch,
    NoRules,
}

impl EvaluationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvaluationReason::Fallthrough => "fallthrough",
            EvaluationReason::FlagDisabled => "flag_disabled",
            EvaluationReason::FlagNotFound => "flag_not_found",
            EvaluationReason::RolloutIncluded => "rollout_included",
            EvaluationReason::RolloutExcluded => "rollout_excluded",
            EvaluationReason::NoUserId => "no_user_id",
            EvaluationReason::RolloutConfigMissing => "rollout_config_missing",
            EvaluationReason::RuleMatch => "rule_match",
            EvaluationReason::NoRuleMatch => "no_rule_match",
            EvaluationReason::NoRules => "no_rules",
        }
    }
}

impl fmt::Display for EvaluationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationResult {
    pub flag_key: String,
    pub value: FlagValue,
    pub reason: EvaluationReason,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub rule_index: Option<usize>,
    pub cached: bool,
    pub stale: bool,
}

impl EvaluationResult {
    fn new(flag_key: &str, value: FlagValue, reason: EvaluationReason) -> EvaluationResult {
        EvaluationResult {
            flag_key: flag_key.to_string(),
            value,
            reason,
            rule_index: None,
            cached: false,
            stale: false,
        }
    }
}

/// Resolves a flag against a context.
///
/// Pure and total: no I/O, no clock beyond `ctx.timestamp`, and a
/// well-formed result for every input. Illegal inputs degrade to the flag
/// default with an explanatory reason instead of failing.
pub fn evaluate_flag(flag: &Flag, ctx: &EvaluationContext) -> EvaluationResult {
    if matches!(flag.state, FlagState::Disabled | FlagState::Archived) {
        return EvaluationResult::new(
            &flag.key,
            flag.default_value.clone(),
            EvaluationReason::FlagDisabled,
        );
    }
    match flag.kind {
        FlagKind::Boolean | FlagKind::Variant => {
            EvaluationResult::new(&flag.key, flag.value.clone(), EvaluationReason::Fallthrough)
        }
        FlagKind::Rollout => {
            let Some(user_id) = &ctx.user_id else {
                return EvaluationResult::new(
                    &flag.key,
                    flag.default_value.clone(),
                    EvaluationReason::NoUserId,
                );
            };
            let (Some(percentage), Some(seed)) = (flag.percentage, flag.hash_seed.as_ref()) else {
                return EvaluationResult::new(
                    &flag.key,
                    flag.default_value.clone(),
                    EvaluationReason::RolloutConfigMissing,
                );
            };
            let bucket = rollout_bucket(seed, &flag.key, user_id);
            let included = f64::from(bucket) < percentage;
            EvaluationResult::new(
                &flag.key,
                FlagValue::Bool(included),
                if included {
                    EvaluationReason::RolloutIncluded
                } else {
                    EvaluationReason::RolloutExcluded
                },
            )
        }
        FlagKind::Segment => {
            let Some(rules) = &flag.rules else {
                return EvaluationResult::new(
                    &flag.key,
                    flag.default_value.clone(),
                    EvaluationReason::NoRules,
                );
            };
            for (index, rule) in rules.iter().enumerate() {
                // absent attribute: the rule cannot match, negated or not
                let Some(attribute) = ctx.attributes.get(&rule.attribute) else {
                    continue;
                };
                if value::rule_matches(rule, attribute) {
                    let mut result = EvaluationResult::new(
                        &flag.key,
                        flag.value.clone(),
                        EvaluationReason::RuleMatch,
                    );
                    result.rule_index = Some(index);
                    return result;
                }
            }
            EvaluationResult::new(
                &flag.key,
                flag.default_value.clone(),
                EvaluationReason::NoRuleMatch,
            )
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub node_id: String,
    pub environment: String,
    pub cache: CacheConfig,
    pub audit: AuditConfig,
}

impl ClientConfig {
    pub fn new(node_id: impl Into<String>, environment: impl Into<String>) -> ClientConfig {
        ClientConfig {
            node_id: node_id.into(),
            environment: environment.into(),
            cache: CacheConfig::default(),
            audit: AuditConfig::default(),
        }
    }
}

/// The composition root: store + cache + audit behind one surface.
///
/// Reads go cache-first with store fallback; mutations write through the
/// store, refresh the cache, bump the store version and leave an audit
/// record. Locks live inside the components; the façade never holds two at
/// once.
pub struct FlagClient<S: FlagStore, H: Host = SystemHost> {
    store: S,
    cache: FlagCache<H>,
    audit: AuditLog<H>,
    config: ClientConfig,
    actor: Actor,
}

impl<H: Host> FlagClient<MemoryStore<H>, H> {
    pub fn in_memory(config: ClientConfig) -> Fallible<FlagClient<MemoryStore<H>, H>> {
        let store = MemoryStore::new(&config.node_id)?;
        Ok(FlagClient::new(store, config))
    }
}

impl<S: FlagStore, H: Host> FlagClient<S, H> {
    pub fn new(store: S, config: ClientConfig) -> FlagClient<S, H> {
        let audit = AuditLog::new(
            config.audit.clone(),
            AuditContext::new(&config.node_id, &config.environment),
        );
        let cache = FlagCache::new(config.cache.clone());
        let actor = Actor::system(config.node_id.clone());
        FlagClient {
            store,
            cache,
            audit,
            config,
            actor,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn cache(&self) -> &FlagCache<H> {
        &self.cache
    }

    pub fn audit(&self) -> &AuditLog<H> {
        &self.audit
    }

    /// Fresh anonymous context stamped with the host clock.
    pub fn context(&self) -> EvaluationContext {
        EvaluationContext::anonymous(H::now_millis())
    }

    pub fn context_for(&self, user_id: impl Into<String>) -> EvaluationContext {
        EvaluationContext::for_user(user_id, H::now_millis())
    }

    pub fn create_flag(&self, mut flag: Flag) -> Fallible<FlagWithMeta> {
        if flag.kind == FlagKind::Rollout && flag.hash_seed.is_none() {
            flag.hash_seed = Some(flag.key.clone());
        }
        flag.validate()?;
        if self.store.has(&flag.key)? {
            return Err(FlagError::conflict(format!(
                "flag '{}' already exists",
                flag.key
            )));
        }
        let now = H::now_millis();
        let meta = FlagMeta::new(now, VersionVector::make(&self.config.node_id, &flag.key, now)?);
        let entry = FlagWithMeta { flag, meta };
        self.store.set(&entry.flag.key, entry.clone())?;
        self.bump_version(&entry.flag.key, now)?;
        self.cache_entry(&entry);
        self.audit
            .log_created(&entry.flag.key, &entry.flag.value, &self.actor);
        Ok(entry)
    }

    /// Replaces a flag's value. The new value must carry the same type tag
    /// as the flag's default.
    pub fn update_flag(&self, key: &str, value: FlagValue) -> Fallible<Option<FlagWithMeta>> {
        let Some(mut entry) = self.store.get(key)? else {
            return Ok(None);
        };
        if !value.same_tag(&entry.flag.default_value) {
            return Err(FlagError::invalid_type(
                entry.flag.default_value.type_tag(),
                value.type_tag(),
            ));
        }
        let previous = entry.flag.value.clone();
        let now = H::now_millis();
        entry.flag.value = value.clone();
        entry.meta.updated_at = now;
        entry.meta.version = entry.meta.version.increment(&value.as_string(), now);
        self.store.set(key, entry.clone())?;
        self.bump_version(key, now)?;
        self.cache_entry(&entry);
        self.audit
            .log_updated(key, Some(&previous), Some(&value), &self.actor);
        Ok(Some(entry))
    }

    pub fn enable_flag(&self, key: &str) -> bool {
        self.set_state(key, FlagState::Enabled)
    }

    pub fn disable_flag(&self, key: &str) -> bool {
        self.set_state(key, FlagState::Disabled)
    }

    fn set_state(&self, key: &str, state: FlagState) -> bool {
        let outcome: Fallible<bool> = (|| {
            let Some(mut entry) = self.store.get(key)? else {
                return Ok(false);
            };
            let now = H::now_millis();
            entry.flag.state = state;
            entry.meta.updated_at = now;
            entry.meta.version = entry.meta.version.increment(key, now);
            self.store.set(key, entry.clone())?;
            self.bump_version(key, now)?;
            self.cache_entry(&entry);
            self.audit.log_updated(key, None, None, &self.actor);
            Ok(true)
        })();
        outcome.unwrap_or(false)
    }

    pub fn delete_flag(&self, key: &str) -> bool {
        let outcome: Fallible<bool> = (|| {
            let previous = self.store.get(key)?;
            if !self.store.delete(key)? {
                return Ok(false);
            }
            self.cache.remove(key);
            self.bump_version(key, H::now_millis())?;
            self.audit
                .log_deleted(key, previous.as_ref().map(|e| &e.flag.value), &self.actor);
            Ok(true)
        })();
        outcome.unwrap_or(false)
    }

    /// Cache-first read; a store hit repopulates the cache.
    pub fn get_flag(&self, key: &str) -> Option<FlagWithMeta> {
        if let Some((entry, _)) = self.cache.get(key) {
            return Some(entry);
        }
        let entry = self.store.get(key).ok().flatten()?;
        self.cache_entry(&entry);
        Some(entry)
    }

    /// Resolves a flag for a context. Never fails: an unknown key yields a
    /// well-formed result with reason `flag_not_found` and value
    /// `Bool(false)`.
    pub fn evaluate(&self, key: &str, ctx: Option<&EvaluationContext>) -> EvaluationResult {
        let now = H::now_millis();
        let fallback;
        let ctx = match ctx {
            Some(ctx) => ctx,
            None => {
                fallback = EvaluationContext::anonymous(now);
                &fallback
            }
        };

        let (entry, cached, stale) = match self.cache.get(key) {
            Some((entry, state)) => (Some(entry), true, state == CacheState::Stale),
            None => match self.store.get(key) {
                Ok(Some(mut entry)) => {
                    entry.meta.last_evaluated_at = Some(now);
                    entry.meta.evaluation_count += 1;
                    // bookkeeping only: not a versioned mutation
                    if let Err(e) = self.store.set(key, entry.clone()) {
                        H::log(&format!("evaluation bookkeeping write failed: {}", e));
                    }
                    self.cache_entry(&entry);
                    (Some(entry), false, false)
                }
                _ => (None, false, false),
            },
        };

        let Some(entry) = entry else {
            return EvaluationResult::new(key, FlagValue::Bool(false), EvaluationReason::FlagNotFound);
        };

        let mut result = evaluate_flag(&entry.flag, ctx);
        result.cached = cached;
        result.stale = stale;
        self.audit.log_evaluated(key, &result.value, &self.actor);
        result
    }

    pub fn evaluate_bool(&self, key: &str, ctx: Option<&EvaluationContext>, default: bool) -> bool {
        let result = self.evaluate(key, ctx);
        if result.reason == EvaluationReason::FlagNotFound {
            return default;
        }
        result.value.as_bool(default)
    }

    pub fn evaluate_string(
        &self,
        key: &str,
        ctx: Option<&EvaluationContext>,
        default: &str,
    ) -> String {
        let result = self.evaluate(key, ctx);
        if result.reason == EvaluationReason::FlagNotFound {
            return default.to_string();
        }
        result.value.as_string()
    }

    pub fn evaluate_rollout(&self, key: &str, ctx: Option<&EvaluationContext>) -> bool {
        self.evaluate(key, ctx).value.as_bool(false)
    }

    /// Resolves several flags against one context.
    pub fn evaluate_batch(
        &self,
        keys: &[&str],
        ctx: Option<&EvaluationContext>,
    ) -> Fallible<Vec<EvaluationResult>> {
        if keys.len() > MAX_FLAGS_PER_BATCH_EVALUATE {
            return Err(FlagError::evaluation(format!(
                "max {} flags allowed in a single batch, this request asked for {}",
                MAX_FLAGS_PER_BATCH_EVALUATE,
                keys.len()
            )));
        }
        let fallback = EvaluationContext::anonymous(H::now_millis());
        let ctx = ctx.unwrap_or(&fallback);
        Ok(keys.iter().map(|key| self.evaluate(key, Some(ctx))).collect())
    }

    /// Reconciles a remote flag set against local state. Accepted entries
    /// refresh the cache and leave a `Synced` record; an accepted entry
    /// that replaced existing local state leaves a `ConflictResolved`
    /// record as well. Replaying a batch accepts nothing and logs nothing.
    pub fn merge_remote(&self, remote: Vec<FlagWithMeta>) -> Fallible<u32> {
        let mut locals: HashMap<String, Option<FlagWithMeta>> = HashMap::new();
        for entry in &remote {
            if !locals.contains_key(&entry.flag.key) {
                locals.insert(entry.flag.key.clone(), self.store.get(&entry.flag.key)?);
            }
        }

        let accepted = self.store.merge(remote.clone())?;

        for entry in &remote {
            let previous = locals.get(&entry.flag.key).and_then(|p| p.as_ref());
            if previous.is_some_and(|p| p.meta.version == entry.meta.version) {
                continue; // equal versions are rejected by the merge contract
            }
            let Some(current) = self.store.get(&entry.flag.key)? else {
                continue;
            };
            if current.meta.version != entry.meta.version {
                continue; // lost to another entry in the same batch
            }
            self.cache_entry(&current);
            self.audit
                .log_synced(&entry.flag.key, &current.flag.value, &self.actor);
            if let Some(previous) = previous {
                self.audit.log_conflict_resolved(
                    &entry.flag.key,
                    Some(&previous.flag.value),
                    Some(&current.flag.value),
                    &self.actor,
                );
            }
        }
        Ok(accepted)
    }

    /// Exports every entry plus the store version.
    pub fn snapshot(&self) -> Fallible<(Vec<FlagWithMeta>, VersionVector)> {
        Ok((self.store.list()?, self.store.get_version()?))
    }

    /// Replaces local state with a snapshot, entry metadata untouched.
    pub fn restore(&self, entries: Vec<FlagWithMeta>) -> Fallible<()> {
        self.store.clear()?;
        self.cache.clear();
        for entry in entries {
            let key = entry.flag.key.clone();
            self.store.set(&key, entry)?;
        }
        self.bump_version("restore", H::now_millis())
    }

    pub fn list_flags(&self) -> Fallible<Vec<FlagWithMeta>> {
        self.store.list()
    }

    pub fn flag_count(&self) -> Fallible<usize> {
        self.store.count()
    }

    pub fn query_audit(&self, query: &AuditQuery) -> Vec<AuditRecord> {
        self.audit.query(query)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Drops cache entries past their stale window.
    pub fn purge_cache(&self) -> u32 {
        self.cache.purge_expired()
    }

    /// Applies the audit retention window.
    pub fn purge_audit(&self) -> u32 {
        self.audit.purge()
    }

    /// Sets or clears a flag's advisory expiry.
    pub fn set_flag_expiry(&self, key: &str, expires_at: Option<i64>) -> Fallible<bool> {
        let Some(mut entry) = self.store.get(key)? else {
            return Ok(false);
        };
        let now = H::now_millis();
        entry.meta.expires_at = expires_at;
        entry.meta.updated_at = now;
        entry.meta.version = entry.meta.version.increment(key, now);
        self.store.set(key, entry.clone())?;
        self.bump_version(key, now)?;
        self.cache_entry(&entry);
        self.audit.log_updated(key, None, None, &self.actor);
        Ok(true)
    }

    /// Deletes flags whose advisory `expires_at` has passed and logs an
    /// `Expired` record per flag. This is the only expiry path; evaluation
    /// never consults `expires_at` on its own.
    pub fn purge_expired_flags(&self) -> Fallible<u32> {
        let now = H::now_millis();
        let mut purged = 0;
        for entry in self.store.list()? {
            let Some(expires_at) = entry.meta.expires_at else {
                continue;
            };
            if now < expires_at {
                continue;
            }
            if self.store.delete(&entry.flag.key)? {
                self.cache.remove(&entry.flag.key);
                self.bump_version(&entry.flag.key, now)?;
                self.audit
                    .log_expired(&entry.flag.key, Some(&entry.flag.value), &self.actor);
                purged += 1;
            }
        }
        Ok(purged)
    }

    fn bump_version(&self, seed: &str, now: i64) -> Fallible<()> {
        let next = self.store.get_version()?.increment(seed, now);
        self.store.set_version(next)
    }

    fn cache_entry(&self, entry: &FlagWithMeta) {
        self.cache.put(
            &entry.flag.key,
            entry.clone(),
            entry.meta.expiry_policy,
            Some(entry.meta.updated_at),
        );
    }
}
