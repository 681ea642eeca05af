//! Authorization engine implementation.

use super::{Decision, RequestDescriptor};
use crate::config::Config;
use crate::core::{compile, PolicySet};
use crate::policy::{PolicyDocument, RuleKind};
use crate::telemetry::Telemetry;
use crate::{Error, Result};

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::task::JoinHandle;

/// Log target for per-decision audit lines.
pub const AUDIT_TARGET: &str = "authz::audit";

/// The policy set currently serving decisions.
#[derive(Debug)]
pub struct ActivePolicy {
    /// Compiled rules
    pub set: PolicySet,
    /// Increments on every successful load
    pub generation: u64,
    /// When this set was installed
    pub loaded_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct PolicySources {
    file: PathBuf,
    data_file: Option<PathBuf>,
}

impl PolicySources {
    fn load(&self) -> Result<PolicyDocument> {
        let mut document = PolicyDocument::from_file(&self.file)?;
        if let Some(data_file) = &self.data_file {
            document.load_data_file(data_file)?;
        }
        Ok(document)
    }

    /// `None` when a file cannot be inspected; such sources always reload.
    fn stamp(&self) -> Option<SourceStamp> {
        let policy = FileStamp::of(&self.file)?;
        let data = match &self.data_file {
            Some(path) => Some(FileStamp::of(path)?),
            None => None,
        };
        Some(SourceStamp { policy, data })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct FileStamp {
    modified: SystemTime,
    len: u64,
}

impl FileStamp {
    fn of(path: &Path) -> Option<Self> {
        let meta = std::fs::metadata(path).ok()?;
        Some(Self {
            modified: meta.modified().ok()?,
            len: meta.len(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SourceStamp {
    policy: FileStamp,
    data: Option<FileStamp>,
}

/// The authorization engine: an atomically swappable [`PolicySet`] plus
/// metrics and audit logging around each decision.
///
/// Decisions never block on reloads; readers keep the set they loaded until
/// they finish.
pub struct AuthzEngine {
    active: ArcSwap<ActivePolicy>,
    // Serializes installs so generations are stored in the order they are issued.
    install_lock: Mutex<()>,
    sources: Option<PolicySources>,
    last_stamp: Mutex<Option<SourceStamp>>,
    telemetry: Telemetry,
    audit: bool,
}

impl AuthzEngine {
    /// Create an engine builder.
    pub fn builder() -> AuthzEngineBuilder {
        AuthzEngineBuilder::new()
    }

    /// Create an engine serving an already compiled set.
    pub fn new(set: PolicySet) -> Result<Self> {
        Self::assemble(set, None, None, Telemetry::new()?, true)
    }

    fn assemble(
        set: PolicySet,
        sources: Option<PolicySources>,
        stamp: Option<SourceStamp>,
        telemetry: Telemetry,
        audit: bool,
    ) -> Result<Self> {
        telemetry.set_rules(set.len());
        Ok(Self {
            active: ArcSwap::from_pointee(ActivePolicy {
                set,
                generation: 1,
                loaded_at: Utc::now(),
            }),
            install_lock: Mutex::new(()),
            sources,
            last_stamp: Mutex::new(stamp),
            telemetry,
            audit,
        })
    }

    /// Decide a request.
    ///
    /// This is the hot path: a lock-free load of the active set, the
    /// decision, one metric update and (if enabled) one audit line.
    pub fn check(&self, desc: &RequestDescriptor) -> Decision {
        let start = Instant::now();
        let active = self.active.load();
        let decision = active.set.decide(desc);
        let elapsed = start.elapsed();

        self.telemetry.record_check(&decision, elapsed);
        if self.audit {
            self.log_decision(desc, &decision, &active, elapsed, None);
        }
        decision
    }

    /// Record and return the decision for a request the gateway could not
    /// turn into a descriptor (missing or unreadable headers).
    pub fn invalid_request(&self, detail: &str) -> Decision {
        let decision = Decision::invalid_request();
        self.telemetry.record_check(&decision, Duration::ZERO);
        if self.audit {
            let active = self.active.load();
            self.log_decision(
                &RequestDescriptor::default(),
                &decision,
                &active,
                Duration::ZERO,
                Some(detail),
            );
        }
        decision
    }

    fn log_decision(
        &self,
        desc: &RequestDescriptor,
        decision: &Decision,
        active: &ActivePolicy,
        elapsed: Duration,
        detail: Option<&str>,
    ) {
        let rule = decision
            .matched_rule
            .and_then(|id| active.set.rule(id))
            .map(|r| r.label());
        tracing::info!(
            target: AUDIT_TARGET,
            source = desc.source.as_deref().unwrap_or("-"),
            path = %desc.path,
            method = %desc.method,
            effect = %decision.effect,
            reason = %decision.reason,
            rule = rule.as_deref().unwrap_or("-"),
            generation = active.generation,
            elapsed_us = elapsed.as_micros() as u64,
            detail = detail.unwrap_or(""),
            "decision"
        );
    }

    /// Compile a document and install it.
    ///
    /// # Arguments
    /// * `document` - The policy document to compile
    ///
    /// # Returns
    /// * `Ok(u64)` - The generation now serving decisions
    /// * `Err(Error)` - If compilation fails; the previous set keeps serving
    pub fn reload(&self, document: &PolicyDocument) -> Result<u64> {
        match compile(document) {
            Ok(set) => Ok(self.install(set)),
            Err(e) => {
                self.telemetry.record_reload(false);
                tracing::warn!(
                    error = %e,
                    category = e.category(),
                    "policy reload rejected, keeping previous set"
                );
                Err(e)
            }
        }
    }

    /// Re-read the configured policy (and data) files and install the result.
    pub fn reload_from_files(&self) -> Result<u64> {
        let sources = self.sources()?;
        *self.last_stamp.lock() = sources.stamp();
        self.load_sources(sources)
    }

    /// Reload only if a policy or data file changed (size or modification
    /// time) since the last load.
    ///
    /// # Returns
    /// * `Ok(Some(u64))` - The files changed and this generation now serves
    /// * `Ok(None)` - Nothing changed; the active set is untouched
    /// * `Err(Error)` - The changed files failed to load or compile
    pub fn reload_if_changed(&self) -> Result<Option<u64>> {
        let sources = self.sources()?;
        let stamp = sources.stamp();
        {
            let mut last = self.last_stamp.lock();
            if stamp.is_some() && *last == stamp {
                return Ok(None);
            }
            // A broken file is reported once, not on every tick.
            *last = stamp;
        }
        self.load_sources(sources).map(Some)
    }

    fn sources(&self) -> Result<&PolicySources> {
        self.sources
            .as_ref()
            .ok_or_else(|| Error::config_key("no policy file configured", "policy.file"))
    }

    fn load_sources(&self, sources: &PolicySources) -> Result<u64> {
        match sources.load() {
            Ok(document) => self.reload(&document),
            Err(e) => {
                self.telemetry.record_reload(false);
                tracing::warn!(
                    file = %sources.file.display(),
                    error = %e,
                    category = e.category(),
                    "policy files unreadable, keeping previous set"
                );
                Err(e)
            }
        }
    }

    fn install(&self, set: PolicySet) -> u64 {
        let rules = set.len();
        let _guard = self.install_lock.lock();
        let generation = self.active.load().generation + 1;
        self.active.store(Arc::new(ActivePolicy {
            set,
            generation,
            loaded_at: Utc::now(),
        }));
        self.telemetry.record_reload(true);
        self.telemetry.set_rules(rules);
        tracing::info!(generation, rules, "policy set installed");
        generation
    }

    /// Check the files every `interval` on a background task and reload
    /// them when they change.
    ///
    /// Returns `None` when the engine has no policy file to watch. Must be
    /// called from within a Tokio runtime.
    pub fn spawn_reloader(self: &Arc<Self>, interval: Duration) -> Option<JoinHandle<()>> {
        self.sources.as_ref()?;
        let engine = Arc::clone(self);

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let engine = Arc::clone(&engine);
                match tokio::task::spawn_blocking(move || engine.reload_if_changed()).await {
                    Ok(Ok(Some(generation))) => tracing::debug!(generation, "periodic reload done"),
                    Ok(Ok(None)) => tracing::trace!("policy files unchanged"),
                    Ok(Err(_)) => {}
                    Err(e) => tracing::error!(error = %e, "reload task failed"),
                }
            }
        }))
    }

    /// Current generation.
    pub fn generation(&self) -> u64 {
        self.active.load().generation
    }

    /// Engine metrics.
    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    /// Describe the active set.
    pub fn summary(&self) -> PolicySummary {
        let active = self.active.load();
        let by_kind = [RuleKind::Json, RuleKind::Regex, RuleKind::Jwt]
            .iter()
            .map(|k| (k.as_str().to_string(), active.set.count(*k)))
            .collect();
        PolicySummary {
            name: active.set.name().map(str::to_string),
            generation: active.generation,
            loaded_at: active.loaded_at,
            rules: active.set.len(),
            by_kind,
            file: self.sources.as_ref().map(|s| s.file.display().to_string()),
        }
    }
}

impl std::fmt::Debug for AuthzEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthzEngine")
            .field("generation", &self.generation())
            .field("sources", &self.sources)
            .field("audit", &self.audit)
            .finish()
    }
}

/// Description of the active policy set, served on `/policy`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicySummary {
    /// Document name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Generation serving decisions
    pub generation: u64,
    /// Install time
    pub loaded_at: DateTime<Utc>,
    /// Total rules
    pub rules: usize,
    /// Rules per kind
    pub by_kind: BTreeMap<String, usize>,
    /// Policy file, if loaded from one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

/// Builder for creating an [`AuthzEngine`].
#[derive(Debug, Default)]
pub struct AuthzEngineBuilder {
    document: Option<PolicyDocument>,
    policy_file: Option<PathBuf>,
    data_file: Option<PathBuf>,
    audit: Option<bool>,
}

impl AuthzEngineBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take policy file, data file and audit settings from configuration.
    pub fn with_config(mut self, config: &Config) -> Self {
        self.policy_file = config.policy.file.clone();
        self.data_file = config.policy.data_file.clone();
        self.audit = Some(config.logging.audit);
        self
    }

    /// Serve an in-memory document.
    pub fn with_document(mut self, document: PolicyDocument) -> Self {
        self.document = Some(document);
        self
    }

    /// Load (and later reload) this policy file.
    pub fn with_policy_file(mut self, path: impl AsRef<Path>) -> Self {
        self.policy_file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Load this data file alongside the policy file.
    pub fn with_data_file(mut self, path: impl AsRef<Path>) -> Self {
        self.data_file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Enable or disable per-decision audit logging.
    pub fn with_audit(mut self, enabled: bool) -> Self {
        self.audit = Some(enabled);
        self
    }

    /// Build the engine. A policy that fails to load or compile is an error.
    pub fn build(self) -> Result<AuthzEngine> {
        let sources = match (self.policy_file, self.data_file) {
            (Some(file), data_file) => Some(PolicySources { file, data_file }),
            (None, Some(_)) => {
                return Err(Error::config_key("data_file requires a policy file", "policy.data_file"));
            }
            (None, None) => None,
        };

        let (set, stamp) = match (&self.document, &sources) {
            (Some(document), _) => (compile(document)?, None),
            (None, Some(sources)) => {
                let stamp = sources.stamp();
                (compile(&sources.load()?)?, stamp)
            }
            (None, None) => {
                tracing::warn!("no policy configured, every request will be denied");
                (PolicySet::empty(), None)
            }
        };

        AuthzEngine::assemble(
            set,
            sources,
            stamp,
            Telemetry::new()?,
            self.audit.unwrap_or(true),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::Reason;
    use crate::policy::{Effect, PredicateSpec, RuleSpec};
    use std::thread;

    const POLICY: &str = r#"
name: test
data:
  team1:
    - name: client1
rules:
  - kind: json
    pattern: /json_1/{id}
    predicate:
      field: source
      in_data: "{.team1[*].name}"
  - kind: regex
    pattern: "~/regex_1/[0-9]+"
"#;

    fn request(path: &str, source: &str) -> RequestDescriptor {
        RequestDescriptor::builder()
            .with_path(path)
            .with_method("GET")
            .with_source(source)
            .build()
    }

    fn engine() -> AuthzEngine {
        AuthzEngine::builder()
            .with_document(PolicyDocument::from_yaml(POLICY).unwrap())
            .with_audit(false)
            .build()
            .unwrap()
    }

    #[test]
    fn test_engine_check() {
        let engine = engine();
        assert!(engine.check(&request("/json_1/4", "client1")).is_allowed());
        assert_eq!(
            engine.check(&request("/json_1/4", "client2")).reason,
            Reason::PredicateDenied
        );
        assert!(engine.check(&request("/regex_1/77", "x")).is_allowed());
        assert_eq!(engine.telemetry().check_count("allow", "rule-allow"), 2);
        assert_eq!(engine.telemetry().check_count("deny", "predicate-denied"), 1);
    }

    #[test]
    fn test_invalid_request_is_counted() {
        let engine = engine();
        let decision = engine.invalid_request("missing x-path");
        assert_eq!(decision.reason, Reason::InvalidRequest);
        assert_eq!(engine.telemetry().check_count("deny", "invalid-request"), 1);
    }

    #[test]
    fn test_failed_reload_keeps_previous_set() {
        let engine = engine();
        let bad = PolicyDocument::with_rules(vec![RuleSpec::new(RuleKind::Regex, "~/[0-9")]);
        assert!(engine.reload(&bad).is_err());
        assert_eq!(engine.generation(), 1);
        assert!(engine.check(&request("/regex_1/77", "x")).is_allowed());
        assert_eq!(engine.telemetry().reload_count("failure"), 1);
    }

    #[test]
    fn test_reload_swaps_set() {
        let engine = engine();
        let deny_all = PolicyDocument::with_rules(vec![
            RuleSpec::new(RuleKind::Regex, "/regex_1/[0-9]+").with_effect(Effect::Deny)
        ]);
        assert_eq!(engine.reload(&deny_all).unwrap(), 2);
        assert_eq!(
            engine.check(&request("/regex_1/77", "x")).reason,
            Reason::RuleDeny
        );
        assert_eq!(engine.summary().rules, 1);
    }

    #[test]
    fn test_reload_from_files() {
        let dir = tempfile::tempdir().unwrap();
        let policy = dir.path().join("policy.yaml");
        let data = dir.path().join("data.json");
        std::fs::write(&policy, POLICY).unwrap();
        std::fs::write(&data, r#"{"team1":[{"name":"client5"}]}"#).unwrap();

        let engine = AuthzEngine::builder()
            .with_policy_file(&policy)
            .with_data_file(&data)
            .with_audit(false)
            .build()
            .unwrap();
        assert!(engine.check(&request("/json_1/1", "client5")).is_allowed());
        assert!(!engine.check(&request("/json_1/1", "client1")).is_allowed());

        std::fs::write(&data, r#"{"team1":[{"name":"client1"}]}"#).unwrap();
        assert_eq!(engine.reload_from_files().unwrap(), 2);
        assert!(engine.check(&request("/json_1/1", "client1")).is_allowed());

        std::fs::write(&policy, "rules: [").unwrap();
        assert!(engine.reload_from_files().is_err());
        assert_eq!(engine.generation(), 2);
    }

    #[test]
    fn test_reload_if_changed_skips_unchanged_files() {
        let dir = tempfile::tempdir().unwrap();
        let policy = dir.path().join("policy.yaml");
        std::fs::write(&policy, POLICY).unwrap();

        let engine = AuthzEngine::builder()
            .with_policy_file(&policy)
            .with_audit(false)
            .build()
            .unwrap();
        assert_eq!(engine.reload_if_changed().unwrap(), None);
        assert_eq!(engine.reload_if_changed().unwrap(), None);
        assert_eq!(engine.generation(), 1);
        assert_eq!(engine.telemetry().reload_count("success"), 0);

        std::fs::write(&policy, format!("{}\n# revised\n", POLICY)).unwrap();
        assert_eq!(engine.reload_if_changed().unwrap(), Some(2));
        assert_eq!(engine.reload_if_changed().unwrap(), None);

        // A broken edit is rejected once and not retried until the file changes again.
        std::fs::write(&policy, "rules: [").unwrap();
        assert!(engine.reload_if_changed().is_err());
        assert_eq!(engine.reload_if_changed().unwrap(), None);
        assert_eq!(engine.generation(), 2);
        assert_eq!(engine.telemetry().reload_count("failure"), 1);
    }

    #[test]
    fn test_concurrent_reloads_keep_latest_generation() {
        let engine = &engine();
        let document = &PolicyDocument::from_yaml(POLICY).unwrap();

        let mut issued: Vec<u64> = thread::scope(|s| {
            let workers: Vec<_> = (0..8)
                .map(|_| {
                    s.spawn(move || {
                        (0..25)
                            .map(|_| engine.reload(&document).unwrap())
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            workers
                .into_iter()
                .flat_map(|w| w.join().unwrap())
                .collect()
        });
        issued.sort_unstable();
        issued.dedup();

        assert_eq!(issued.len(), 200);
        assert_eq!(issued.last(), Some(&201));
        assert_eq!(engine.generation(), 201);
        assert_eq!(engine.summary().generation, 201);
    }

    #[test]
    fn test_build_errors() {
        let missing = AuthzEngine::builder()
            .with_policy_file("/nonexistent/authz/policy.yaml")
            .build();
        assert!(missing.is_err());

        let data_only = AuthzEngine::builder().with_data_file("/tmp/data.json").build();
        assert!(data_only.is_err());

        let empty = AuthzEngine::builder().build().unwrap();
        assert_eq!(empty.check(&request("/json_1/1", "client1")).reason, Reason::DefaultDeny);
        assert!(empty.reload_from_files().is_err());
    }

    #[test]
    fn test_concurrent_checks_are_deterministic() {
        let engine = Arc::new(engine());
        let expected = engine.check(&request("/json_1/9", "client1"));

        thread::scope(|s| {
            for _ in 0..8 {
                let engine = Arc::clone(&engine);
                s.spawn(move || {
                    for _ in 0..500 {
                        assert_eq!(engine.check(&request("/json_1/9", "client1")), expected);
                    }
                });
            }
        });
    }

    #[test]
    fn test_summary() {
        let engine = engine();
        let summary = engine.summary();
        assert_eq!(summary.name.as_deref(), Some("test"));
        assert_eq!(summary.rules, 2);
        assert_eq!(summary.by_kind["json"], 1);
        assert_eq!(summary.by_kind["jwt"], 0);
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["generation"], 1);
    }

    #[tokio::test]
    async fn test_spawn_reloader_picks_up_changes() {
        let dir = tempfile::tempdir().unwrap();
        let policy = dir.path().join("policy.yaml");
        std::fs::write(&policy, POLICY).unwrap();

        let engine = Arc::new(
            AuthzEngine::builder()
                .with_policy_file(&policy)
                .with_audit(false)
                .build()
                .unwrap(),
        );
        let handle = engine.spawn_reloader(Duration::from_millis(20)).unwrap();

        let doc = PolicyDocument::with_rules(vec![RuleSpec::new(RuleKind::Json, "/new/{id}")
            .with_predicate(PredicateSpec::exists("source", true))]);
        std::fs::write(&policy, doc.to_yaml().unwrap()).unwrap();

        let mut allowed = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if engine.check(&request("/new/1", "client1")).is_allowed() {
                allowed = true;
                break;
            }
        }
        handle.abort();
        assert!(allowed);
        assert!(engine.generation() > 1);
    }

    #[test]
    fn test_no_reloader_without_file() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        rt.block_on(async {
            let engine = Arc::new(engine());
            assert!(engine.spawn_reloader(Duration::from_secs(1)).is_none());
        });
    }
}
