use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use rule_kernel_core::{compile_rule, json_path, Match};
use rule_kernel_store_sqlite::{delete_instantiation, next_instantiation, upsert_resource, Store};
use rusqlite::{params, OptionalExtension, Transaction};
use serde_json::Value;

pub use rule_kernel_core as dsl;
pub use rule_kernel_store_sqlite::{IntegrityReport, PendingInstantiation, ResourceKey};

/// How many times one instantiation's action may fail before `run` gives up.
const MAX_ACTION_ATTEMPTS: u32 = 4;

pub type Action = Arc<dyn Fn(&mut RuleContext<'_>) -> Result<()> + Send + Sync>;
pub type KeyFn = dyn Fn(&Value) -> Result<ResourceKey, KeyError> + Send + Sync;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum KeyError {
    #[error("resource payload is missing '{0}'")]
    Missing(&'static str),
    #[error("resource payload field '{0}' is not a string")]
    NotAString(&'static str),
}

/// Extract `(kind, metadata.name, metadata.namespace)` from a resource payload.
///
/// # Errors
/// Returns [`KeyError`] when any of the three fields is absent or non-string.
pub fn default_key(doc: &Value) -> Result<ResourceKey, KeyError> {
    Ok(ResourceKey::new(
        key_segment(doc, &["kind"], "kind")?,
        key_segment(doc, &["metadata", "name"], "metadata.name")?,
        key_segment(doc, &["metadata", "namespace"], "metadata.namespace")?,
    ))
}

fn key_segment(doc: &Value, path: &[&str], label: &'static str) -> Result<String, KeyError> {
    let value = get_path(doc, path).ok_or(KeyError::Missing(label))?;
    value.as_str().map(str::to_string).ok_or(KeyError::NotAString(label))
}

/// Navigate a dotted path through nested JSON objects.
#[must_use]
pub fn get_path<'v>(doc: &'v Value, path: &[&str]) -> Option<&'v Value> {
    let mut current = doc;
    for segment in path {
        current = current.get(segment)?;
    }

    Some(current)
}

/// Set a dotted path inside a JSON document, creating intermediate objects as
/// needed. Useful for mutating a snapshot returned by [`RuleContext::delete`]
/// before re-adding it.
pub fn set_path(doc: &mut Value, path: &[&str], value: Value) {
    let Some((last, parents)) = path.split_last() else {
        *doc = value;
        return;
    };

    let mut current = doc;
    for segment in parents {
        if !current.is_object() {
            *current = Value::Object(serde_json::Map::new());
        }
        let Some(map) = current.as_object_mut() else {
            return;
        };
        current = map.entry((*segment).to_string()).or_insert(Value::Null);
    }

    if !current.is_object() {
        *current = Value::Object(serde_json::Map::new());
    }
    if let Some(map) = current.as_object_mut() {
        map.insert((*last).to_string(), value);
    }
}

/// A named production rule: LHS matches plus the action fired per
/// instantiation. Lower priority values fire first.
#[derive(Clone)]
pub struct Rule {
    pub name: String,
    pub priority: i64,
    pub conditions: Vec<Match>,
    action: Option<Action>,
}

impl Rule {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), priority: 0, conditions: Vec::new(), action: None }
    }

    #[must_use]
    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn when(mut self, matches: impl IntoIterator<Item = Match>) -> Self {
        self.conditions.extend(matches);
        self
    }

    #[must_use]
    pub fn then(
        mut self,
        action: impl Fn(&mut RuleContext<'_>) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.action = Some(Arc::new(action));
        self
    }
}

#[derive(Clone)]
pub struct RuleSet {
    pub name: String,
    pub rules: Vec<Rule>,
}

impl RuleSet {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), rules: Vec::new() }
    }

    #[must_use]
    pub fn rule(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }
}

/// Engine-scoped registry of named rulesets.
#[derive(Clone, Default)]
pub struct Catalog {
    sets: HashMap<String, RuleSet>,
}

impl Catalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a ruleset under its name, replacing any previous one.
    pub fn add(&mut self, set: RuleSet) {
        self.sets.insert(set.name.clone(), set);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&RuleSet> {
        self.sets.get(name)
    }
}

struct RegisteredRule {
    name: String,
    action: Action,
    positions: HashMap<String, usize>,
}

/// A forward-chaining rule engine over SQLite working memory.
///
/// Rules are compiled into instantiation predicates and resource triggers at
/// registration; [`Engine::run`] then fires instantiations one transaction at
/// a time until the conflict set is empty.
pub struct Engine {
    store: Store,
    catalog: Catalog,
    key_fn: Box<KeyFn>,
    rules: Vec<RegisteredRule>,
    rule_index_by_name: HashMap<String, usize>,
}

impl Engine {
    /// Open an engine backed by `path` (in-memory when `None`) and register
    /// the named rulesets from `catalog`.
    ///
    /// # Errors
    /// Returns an error when storage cannot be opened or any ruleset fails to
    /// compile or register.
    pub fn new(path: Option<&Path>, catalog: Catalog, rulesets: &[&str]) -> Result<Self> {
        let store = Store::open(path)?;
        let mut engine = Self {
            store,
            catalog,
            key_fn: Box::new(default_key),
            rules: Vec::new(),
            rule_index_by_name: HashMap::new(),
        };

        for name in rulesets {
            engine.add_ruleset(name)?;
        }

        Ok(engine)
    }

    /// Replace the resource key function used by upserts and RHS `add`.
    #[must_use]
    pub fn with_key_fn(
        mut self,
        key_fn: impl Fn(&Value) -> Result<ResourceKey, KeyError> + Send + Sync + 'static,
    ) -> Self {
        self.key_fn = Box::new(key_fn);
        self
    }

    /// Compile and install a ruleset declared in the catalog. Each rule gets
    /// the next dense rule index; all generated SQL is applied in a single
    /// transaction, and the in-memory metadata is frozen only after that
    /// transaction commits.
    ///
    /// # Errors
    /// Returns an error for an unknown ruleset name, a rule without an
    /// action, a compile failure, or a storage failure.
    pub fn add_ruleset(&mut self, name: &str) -> Result<()> {
        let set =
            self.catalog.get(name).ok_or_else(|| anyhow!("no such ruleset: {name}"))?.clone();

        let mut batch = Vec::new();
        let mut registered = Vec::new();
        for (offset, rule) in set.rules.iter().enumerate() {
            let action = rule
                .action
                .clone()
                .ok_or_else(|| anyhow!("rule '{}' has no action", rule.name))?;
            let compiled = compile_rule(
                self.rules.len() + offset,
                rule.priority,
                &rule.name,
                &rule.conditions,
            )
            .with_context(|| format!("failed to compile rule '{}'", rule.name))?;

            for trigger in &compiled.triggers {
                batch.push(trigger.sql.clone());
            }
            // Materialise instantiations for resources already in working memory.
            if let Some(predicate) = compiled.insert_predicate {
                batch.push(predicate);
            }

            registered.push(RegisteredRule {
                name: rule.name.clone(),
                action,
                positions: compiled.object_map,
            });
        }

        self.store
            .apply_batch(&batch)
            .with_context(|| format!("failed to register ruleset '{name}'"))?;

        for rule in registered {
            self.rule_index_by_name.insert(rule.name.clone(), self.rules.len());
            self.rules.push(rule);
        }

        Ok(())
    }

    /// The dense index assigned to a rule at registration time.
    #[must_use]
    pub fn rule_index(&self, name: &str) -> Option<usize> {
        self.rule_index_by_name.get(name).copied()
    }

    /// Upsert a batch of resources in one transaction.
    ///
    /// # Errors
    /// Returns an error when key extraction or any write fails; the whole
    /// batch rolls back.
    pub fn add_resources(&mut self, docs: &[Value]) -> Result<()> {
        let mut records = Vec::with_capacity(docs.len());
        for doc in docs {
            let key = (self.key_fn)(doc).context("failed to derive resource key")?;
            let data = serde_json::to_string(doc).context("failed to serialize resource")?;
            records.push((key, data));
        }

        self.store.upsert_resources(&records)
    }

    /// Upsert a batch of JSON strings in one transaction. The raw string is
    /// stored as the resource payload.
    ///
    /// # Errors
    /// Returns an error when parsing, key extraction, or any write fails.
    pub fn add_resource_strings(&mut self, payloads: &[&str]) -> Result<()> {
        let mut records = Vec::with_capacity(payloads.len());
        for payload in payloads {
            let doc: Value =
                serde_json::from_str(payload).context("failed to parse resource JSON")?;
            let key = (self.key_fn)(&doc).context("failed to derive resource key")?;
            records.push((key, (*payload).to_string()));
        }

        self.store.upsert_resources(&records)
    }

    /// Read a resource's JSON payload by identity.
    ///
    /// # Errors
    /// Returns an error when the resource does not exist or the read fails.
    pub fn resource(&self, kind: &str, name: &str, namespace: &str) -> Result<String> {
        self.store
            .resource_data(kind, name, namespace)?
            .ok_or_else(|| anyhow!("no such resource: {kind}/{namespace}/{name}"))
    }

    /// Delete a resource by identity; dependent instantiations cascade.
    /// Returns whether a row existed.
    ///
    /// # Errors
    /// Returns an error when the delete fails.
    pub fn delete_resource(&mut self, kind: &str, name: &str, namespace: &str) -> Result<bool> {
        self.store.delete_resource(kind, name, namespace)
    }

    /// # Errors
    /// Returns an error when the count query fails.
    pub fn resource_count(&self) -> Result<i64> {
        self.store.resource_count()
    }

    /// Number of instantiations currently awaiting firing.
    ///
    /// # Errors
    /// Returns an error when the count query fails.
    pub fn conflict_set_size(&self) -> Result<i64> {
        self.store.instantiation_count()
    }

    /// The live conflict set in firing order.
    ///
    /// # Errors
    /// Returns an error when the rows cannot be read or decoded.
    pub fn conflict_set(&self) -> Result<Vec<PendingInstantiation>> {
        self.store.pending_instantiations()
    }

    /// The registered name of a rule index, as assigned at registration.
    #[must_use]
    pub fn rule_name(&self, index: usize) -> Option<&str> {
        self.rules.get(index).map(|rule| rule.name.as_str())
    }

    /// Probe the working-memory invariants (link-table exactness, resource
    /// existence, file health).
    ///
    /// # Errors
    /// Returns an error when any probe query fails.
    pub fn integrity_report(&self) -> Result<IntegrityReport> {
        self.store.integrity_check()
    }

    /// Fire instantiations until the conflict set is empty.
    ///
    /// Each iteration selects the next instantiation (lowest priority value,
    /// then oldest, then smallest ID), invokes its rule's action inside a
    /// fresh transaction, and on success deletes the instantiation and
    /// commits. A failing action rolls the transaction back and charges the
    /// instantiation's error budget; once the same instantiation has failed
    /// four times its error is returned.
    ///
    /// # Errors
    /// Returns the last action error once an instantiation exhausts its
    /// budget, or any storage error from the loop itself.
    pub fn run(&mut self) -> Result<()> {
        let mut attempts: HashMap<i64, u32> = HashMap::new();

        loop {
            let tx = self.store.transaction()?;
            let Some(pending) = next_instantiation(&tx)? else {
                tx.commit().context("failed to commit final transaction")?;
                return Ok(());
            };

            let rule = self.rules.get(pending.rule_num).ok_or_else(|| {
                anyhow!(
                    "instantiation {} references unknown rule index {}",
                    pending.id,
                    pending.rule_num
                )
            })?;

            tracing::debug!("firing rule '{}' for instantiation {}", rule.name, pending.id);

            let mut ctx = RuleContext {
                tx: &tx,
                positions: &rule.positions,
                resources: &pending.resources,
                key_fn: &*self.key_fn,
            };

            match (rule.action)(&mut ctx) {
                Ok(()) => {
                    delete_instantiation(&tx, pending.id)?;
                    tx.commit().context("failed to commit firing transaction")?;
                    attempts.remove(&pending.id);
                }
                Err(err) => {
                    drop(tx);
                    let count = attempts.entry(pending.id).or_insert(0);
                    *count += 1;
                    tracing::warn!(
                        "rule '{}' failed on instantiation {} (attempt {}): {err:#}",
                        rule.name,
                        pending.id,
                        count,
                    );
                    if *count >= MAX_ACTION_ATTEMPTS {
                        return Err(err.context(format!(
                            "rule '{}' exhausted its error budget",
                            rule.name
                        )));
                    }
                }
            }
        }
    }
}

/// The RHS API handed to an action, scoped to one firing transaction.
///
/// Field reads and writes resolve match variables through the rule's
/// position map into the instantiation's resource tuple. A write cascades:
/// the instantiation being fired is destroyed by storage triggers, which is
/// expected, as it is deleted on successful commit anyway.
pub struct RuleContext<'tx> {
    tx: &'tx Transaction<'tx>,
    positions: &'tx HashMap<String, usize>,
    resources: &'tx [i64],
    key_fn: &'tx KeyFn,
}

impl RuleContext<'_> {
    fn resource_id(&self, var: &str) -> Result<i64> {
        let position = self
            .positions
            .get(var)
            .copied()
            .ok_or_else(|| anyhow!("unknown match variable: {var}"))?;
        self.resources.get(position).copied().ok_or_else(|| {
            anyhow!("match variable '{var}' is out of range for this instantiation")
        })
    }

    /// Read an integer field of the resource bound to `var`.
    ///
    /// # Errors
    /// Returns an error when the variable is unknown, the resource is gone,
    /// or the field is absent or non-integer.
    pub fn int_field(&self, var: &str, path: &[&str]) -> Result<i64> {
        let id = self.resource_id(var)?;
        self.tx
            .query_row(
                "SELECT json_extract(data, ?1) FROM resources WHERE id = ?2",
                params![json_path(path), id],
                |row| row.get::<_, Option<i64>>(0),
            )
            .optional()
            .with_context(|| format!("failed to read field {} of '{var}'", json_path(path)))?
            .ok_or_else(|| anyhow!("resource bound to '{var}' no longer exists"))?
            .ok_or_else(|| anyhow!("field {} is absent on '{var}'", json_path(path)))
    }

    /// Read a string field of the resource bound to `var`.
    ///
    /// # Errors
    /// Returns an error when the variable is unknown, the resource is gone,
    /// or the field is absent or non-string.
    pub fn str_field(&self, var: &str, path: &[&str]) -> Result<String> {
        let id = self.resource_id(var)?;
        self.tx
            .query_row(
                "SELECT json_extract(data, ?1) FROM resources WHERE id = ?2",
                params![json_path(path), id],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()
            .with_context(|| format!("failed to read field {} of '{var}'", json_path(path)))?
            .ok_or_else(|| anyhow!("resource bound to '{var}' no longer exists"))?
            .ok_or_else(|| anyhow!("field {} is absent on '{var}'", json_path(path)))
    }

    /// Read any field of the resource bound to `var` as JSON.
    ///
    /// # Errors
    /// Returns an error when the variable is unknown, the resource is gone,
    /// or the field is absent.
    pub fn json_field(&self, var: &str, path: &[&str]) -> Result<Value> {
        let doc = self.snapshot(var)?;
        get_path(&doc, path)
            .cloned()
            .ok_or_else(|| anyhow!("field {} is absent on '{var}'", json_path(path)))
    }

    /// Overwrite one field of the resource bound to `var`. Dependent
    /// instantiations are destroyed and re-derived by the storage triggers.
    ///
    /// # Errors
    /// Returns an error when the variable is unknown, the resource is gone,
    /// or the write fails.
    pub fn update_field(&self, var: &str, path: &[&str], value: &Value) -> Result<()> {
        let id = self.resource_id(var)?;
        let encoded = serde_json::to_string(value).context("failed to encode field value")?;
        let changed = self
            .tx
            .execute(
                "UPDATE resources SET data = json_set(data, ?1, json(?2)) WHERE id = ?3",
                params![json_path(path), encoded, id],
            )
            .with_context(|| format!("failed to update field {} of '{var}'", json_path(path)))?;

        if changed == 0 {
            return Err(anyhow!("resource bound to '{var}' no longer exists"));
        }

        Ok(())
    }

    /// Upsert a resource inside the firing transaction.
    ///
    /// # Errors
    /// Returns an error when key extraction or the write fails.
    pub fn add(&self, doc: &Value) -> Result<()> {
        let key = (self.key_fn)(doc).context("failed to derive resource key")?;
        let data = serde_json::to_string(doc).context("failed to serialize resource")?;
        upsert_resource(self.tx, &key, &data)
    }

    /// Delete the resource bound to `var`, returning a snapshot of its data
    /// so the action may re-add a mutated version.
    ///
    /// # Errors
    /// Returns an error when the variable is unknown, the resource is gone,
    /// or the delete fails.
    pub fn delete(&self, var: &str) -> Result<Value> {
        let doc = self.snapshot(var)?;
        let id = self.resource_id(var)?;
        self.tx
            .execute("DELETE FROM resources WHERE id = ?1", params![id])
            .with_context(|| format!("failed to delete resource bound to '{var}'"))?;

        Ok(doc)
    }

    fn snapshot(&self, var: &str) -> Result<Value> {
        let id = self.resource_id(var)?;
        let data: String = self
            .tx
            .query_row("SELECT data FROM resources WHERE id = ?1", params![id], |row| {
                row.get(0)
            })
            .optional()
            .with_context(|| format!("failed to read resource bound to '{var}'"))?
            .ok_or_else(|| anyhow!("resource bound to '{var}' no longer exists"))?;

        serde_json::from_str(&data)
            .with_context(|| format!("resource bound to '{var}' holds invalid JSON"))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn default_key_reads_kind_and_metadata() {
        let doc = json!({
            "kind": "Deployment",
            "metadata": {"name": "coredns", "namespace": "kube-system"},
        });
        let key = default_key(&doc).unwrap();
        assert_eq!(key, ResourceKey::new("Deployment", "coredns", "kube-system"));
    }

    #[test]
    fn default_key_reports_the_missing_segment() {
        let doc = json!({"kind": "Deployment", "metadata": {"name": "coredns"}});
        assert_eq!(default_key(&doc).unwrap_err(), KeyError::Missing("metadata.namespace"));

        let doc = json!({"kind": 7, "metadata": {"name": "x", "namespace": "y"}});
        assert_eq!(default_key(&doc).unwrap_err(), KeyError::NotAString("kind"));
    }

    #[test]
    fn set_path_creates_intermediate_objects() {
        let mut doc = json!({"spec": {"replicas": 1}});
        set_path(&mut doc, &["spec", "replicas"], json!(2));
        set_path(&mut doc, &["status", "ready", "count"], json!(0));
        assert_eq!(
            doc,
            json!({"spec": {"replicas": 2}, "status": {"ready": {"count": 0}}})
        );
    }

    #[test]
    fn get_path_navigates_nested_objects() {
        let doc = json!({"a": {"b": {"c": 3}}});
        assert_eq!(get_path(&doc, &["a", "b", "c"]), Some(&json!(3)));
        assert_eq!(get_path(&doc, &["a", "x"]), None);
    }

    #[test]
    fn unknown_ruleset_is_rejected() {
        let err = Engine::new(None, Catalog::new(), &["missing"]).err().unwrap();
        assert!(err.to_string().contains("no such ruleset: missing"));
    }

    #[test]
    fn rules_without_actions_are_rejected() {
        let mut catalog = Catalog::new();
        catalog.add(RuleSet::new("broken").rule(Rule::new("no-action")));
        let err = Engine::new(None, catalog, &["broken"]).err().unwrap();
        assert!(err.to_string().contains("rule 'no-action' has no action"));
    }

    #[test]
    fn registration_assigns_dense_rule_indices() -> Result<()> {
        let mut catalog = Catalog::new();
        catalog.add(
            RuleSet::new("a")
                .rule(Rule::new("first").then(|_| Ok(())))
                .rule(Rule::new("second").then(|_| Ok(()))),
        );
        catalog.add(RuleSet::new("b").rule(Rule::new("third").then(|_| Ok(()))));

        let engine = Engine::new(None, catalog, &["a", "b"])?;
        assert_eq!(engine.rule_index("first"), Some(0));
        assert_eq!(engine.rule_index("second"), Some(1));
        assert_eq!(engine.rule_index("third"), Some(2));
        assert_eq!(engine.rule_index("nope"), None);
        Ok(())
    }
}
