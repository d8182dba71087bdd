use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use rule_kernel_engine::dsl::{eq, field, gt, join_field, lt, namespace, values, within, Match};
use rule_kernel_engine::{set_path, Catalog, Engine, KeyError, ResourceKey, Rule, RuleSet};
use serde_json::{json, Value};

fn deployment(name: &str, ns: &str, replicas: i64) -> Value {
    json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {"name": name, "namespace": ns},
        "spec": {"replicas": replicas},
    })
}

fn ball(name: &str, color: &str) -> Value {
    json!({
        "kind": "Ball",
        "metadata": {"name": name, "namespace": "test"},
        "color": color,
    })
}

fn replicas_of(engine: &Engine, name: &str, ns: &str) -> Result<i64> {
    let doc: Value = serde_json::from_str(&engine.resource("Deployment", name, ns)?)?;
    doc["spec"]["replicas"]
        .as_i64()
        .ok_or_else(|| anyhow!("replicas missing on {ns}/{name}"))
}

#[test]
fn single_match_rule_fires_until_quiescence() -> Result<()> {
    let mut catalog = Catalog::new();
    catalog.add(
        RuleSet::new("scaling").rule(
            Rule::new("grow-undersized")
                .when([Match::new("Deployment", "foo")
                    .test(namespace("kube-system"))
                    .test(lt(field(["spec", "replicas"]), 1000.0))])
                .then(|ctx| {
                    let replicas = ctx.int_field("foo", &["spec", "replicas"])?;
                    ctx.update_field("foo", &["spec", "replicas"], &json!(replicas + 1))
                }),
        ),
    );

    let mut engine = Engine::new(None, catalog, &["scaling"])?;
    engine.add_resources(&[deployment("coredns", "kube-system", 1)])?;
    engine.run()?;

    assert_eq!(replicas_of(&engine, "coredns", "kube-system")?, 1000);
    assert_eq!(engine.conflict_set_size()?, 0);
    Ok(())
}

#[test]
fn actions_can_delete_mutate_and_re_add() -> Result<()> {
    let mut catalog = Catalog::new();
    catalog.add(
        RuleSet::new("scaling").rule(
            Rule::new("rebuild-undersized")
                .when([Match::new("Deployment", "foo")
                    .test(namespace("kube-system"))
                    .test(lt(field(["spec", "replicas"]), 5.0))])
                .then(|ctx| {
                    let replicas = ctx.int_field("foo", &["spec", "replicas"])?;
                    let mut doc = ctx.delete("foo")?;
                    set_path(&mut doc, &["spec", "replicas"], json!(replicas + 1));
                    ctx.add(&doc)
                }),
        ),
    );

    let mut engine = Engine::new(None, catalog, &["scaling"])?;
    engine.add_resources(&[deployment("coredns", "kube-system", 1)])?;
    engine.run()?;

    assert_eq!(replicas_of(&engine, "coredns", "kube-system")?, 5);
    assert_eq!(engine.conflict_set_size()?, 0);
    assert_eq!(engine.resource_count()?, 1);
    Ok(())
}

#[test]
fn join_rules_bind_pairs_across_resources() -> Result<()> {
    let fired = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&fired);

    let mut catalog = Catalog::new();
    catalog.add(
        RuleSet::new("pairs").rule(
            Rule::new("larger-than")
                .when([
                    Match::new("Deployment", "foo")
                        .test(namespace("ns"))
                        .test(lt(field(["spec", "replicas"]), 2.0)),
                    Match::new("Deployment", "bar")
                        .test(namespace("ns"))
                        .test(gt(
                            field(["spec", "replicas"]),
                            join_field("foo", ["spec", "replicas"]),
                        )),
                ])
                .then(move |ctx| {
                    let small = ctx.str_field("foo", &["metadata", "name"])?;
                    let large = ctx.str_field("bar", &["metadata", "name"])?;
                    log.lock().expect("log lock").push((small, large));
                    Ok(())
                }),
        ),
    );

    let mut engine = Engine::new(None, catalog, &["pairs"])?;
    engine.add_resources(&[deployment("small", "ns", 1), deployment("large", "ns", 3)])?;
    engine.run()?;

    let pairs = fired.lock().expect("log lock").clone();
    assert_eq!(pairs, vec![("small".to_string(), "large".to_string())]);
    assert_eq!(engine.conflict_set_size()?, 0);
    Ok(())
}

#[test]
fn resource_writes_cascade_and_re_derive_instantiations() -> Result<()> {
    let mut catalog = Catalog::new();
    catalog.add(
        RuleSet::new("colors").rule(
            Rule::new("red-balls")
                .when([Match::new("Ball", "b").test(eq(field(["color"]), "red"))])
                .then(|_| Ok(())),
        ),
    );

    let mut engine = Engine::new(None, catalog, &["colors"])?;

    engine.add_resources(&[ball("bouncy", "red")])?;
    assert_eq!(engine.conflict_set_size()?, 1);

    engine.add_resources(&[ball("bouncy", "blue")])?;
    assert_eq!(engine.conflict_set_size()?, 0);

    engine.add_resources(&[ball("bouncy", "red")])?;
    assert_eq!(engine.conflict_set_size()?, 1);
    assert_eq!(engine.resource_count()?, 1);
    Ok(())
}

#[test]
fn upserting_an_unchanged_payload_preserves_the_conflict_set() -> Result<()> {
    let mut catalog = Catalog::new();
    catalog.add(
        RuleSet::new("colors").rule(
            Rule::new("red-balls")
                .when([Match::new("Ball", "b").test(eq(field(["color"]), "red"))])
                .then(|_| Ok(())),
        ),
    );

    let mut engine = Engine::new(None, catalog, &["colors"])?;
    engine.add_resources(&[ball("bouncy", "red")])?;
    engine.add_resources(&[ball("bouncy", "red")])?;

    assert_eq!(engine.resource_count()?, 1);
    assert_eq!(engine.conflict_set_size()?, 1);
    let stored: Value = serde_json::from_str(&engine.resource("Ball", "bouncy", "test")?)?;
    assert_eq!(stored["color"], json!("red"));
    Ok(())
}

#[test]
fn lower_priority_values_fire_first() -> Result<()> {
    let order = Arc::new(Mutex::new(Vec::new()));

    let mut catalog = Catalog::new();
    let mut set = RuleSet::new("ordered");
    for (name, priority) in [("late", 5), ("early", 1)] {
        let log = Arc::clone(&order);
        set = set.rule(
            Rule::new(name)
                .priority(priority)
                .when([Match::new("Ball", "b")])
                .then(move |_| {
                    log.lock().expect("order lock").push(name);
                    Ok(())
                }),
        );
    }
    catalog.add(set);

    let mut engine = Engine::new(None, catalog, &["ordered"])?;
    engine.add_resources(&[ball("bouncy", "red")])?;
    engine.run()?;

    assert_eq!(*order.lock().expect("order lock"), vec!["early", "late"]);
    Ok(())
}

#[test]
fn equal_priority_instantiations_fire_in_id_order() -> Result<()> {
    let order = Arc::new(Mutex::new(Vec::new()));

    let mut catalog = Catalog::new();
    let mut set = RuleSet::new("tied");
    for name in ["alpha", "omega"] {
        let log = Arc::clone(&order);
        set = set.rule(Rule::new(name).when([Match::new("Ball", "b")]).then(move |_| {
            log.lock().expect("order lock").push(name);
            Ok(())
        }));
    }
    catalog.add(set);

    let mut engine = Engine::new(None, catalog, &["tied"])?;
    engine.add_resources(&[ball("bouncy", "red")])?;

    // Both rules were instantiated by one upsert with equal priority and
    // timestamp, so the firing order is the instantiation ID order.
    let expected = engine
        .conflict_set()?
        .into_iter()
        .map(|pending| engine.rule_name(pending.rule_num).expect("registered rule").to_string())
        .collect::<Vec<_>>();
    assert_eq!(expected.len(), 2);

    engine.run()?;
    assert_eq!(*order.lock().expect("order lock"), expected);
    Ok(())
}

#[test]
fn one_upsert_batch_instantiates_in_insertion_order() -> Result<()> {
    let order = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&order);

    let mut catalog = Catalog::new();
    catalog.add(
        RuleSet::new("all-balls").rule(
            Rule::new("visit").when([Match::new("Ball", "b")]).then(move |ctx| {
                log.lock().expect("order lock").push(ctx.str_field("b", &["metadata", "name"])?);
                Ok(())
            }),
        ),
    );

    let mut engine = Engine::new(None, catalog, &["all-balls"])?;
    engine.add_resources(&[ball("first", "red"), ball("second", "blue")])?;
    engine.run()?;

    assert_eq!(*order.lock().expect("order lock"), vec!["first", "second"]);
    Ok(())
}

#[test]
fn failing_actions_are_retried_four_times_then_returned() -> Result<()> {
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);

    let mut catalog = Catalog::new();
    catalog.add(
        RuleSet::new("doomed").rule(
            Rule::new("always-fails").when([Match::new("Ball", "b")]).then(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(anyhow!("boom"))
            }),
        ),
    );

    let mut engine = Engine::new(None, catalog, &["doomed"])?;
    engine.add_resources(&[ball("bouncy", "red")])?;

    let err = engine.run().expect_err("budget should be exhausted");
    assert_eq!(attempts.load(Ordering::SeqCst), 4);
    assert!(format!("{err:#}").contains("boom"));
    assert!(err.to_string().contains("exhausted its error budget"));

    // The failing instantiation survives the rollback.
    assert_eq!(engine.conflict_set_size()?, 1);
    Ok(())
}

#[test]
fn failed_actions_roll_back_their_resource_effects() -> Result<()> {
    let mut catalog = Catalog::new();
    catalog.add(
        RuleSet::new("doomed").rule(
            Rule::new("mutate-then-fail")
                .when([Match::new("Deployment", "foo").test(namespace("ns"))])
                .then(|ctx| {
                    ctx.update_field("foo", &["spec", "replicas"], &json!(99))?;
                    Err(anyhow!("changed my mind"))
                }),
        ),
    );

    let mut engine = Engine::new(None, catalog, &["doomed"])?;
    engine.add_resources(&[deployment("web", "ns", 1)])?;

    assert!(engine.run().is_err());
    assert_eq!(replicas_of(&engine, "web", "ns")?, 1);
    Ok(())
}

#[test]
fn registration_materialises_instantiations_for_existing_resources() -> Result<()> {
    let mut catalog = Catalog::new();
    catalog.add(
        RuleSet::new("colors").rule(
            Rule::new("red-balls")
                .when([Match::new("Ball", "b").test(eq(field(["color"]), "red"))])
                .then(|_| Ok(())),
        ),
    );

    let mut engine = Engine::new(None, catalog, &[])?;
    engine.add_resources(&[ball("bouncy", "red"), ball("calm", "blue")])?;
    assert_eq!(engine.conflict_set_size()?, 0);

    engine.add_ruleset("colors")?;
    assert_eq!(engine.conflict_set_size()?, 1);
    Ok(())
}

#[test]
fn membership_tests_match_against_array_fields() -> Result<()> {
    let tagged = |name: &str, tags: Value| {
        json!({
            "kind": "Service",
            "metadata": {"name": name, "namespace": "test"},
            "tags": tags,
        })
    };

    let fired = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&fired);

    let mut catalog = Catalog::new();
    catalog.add(
        RuleSet::new("tagged").rule(
            Rule::new("dns-services")
                .when([Match::new("Service", "svc")
                    .test(within("dns", values(field(["tags"]))))])
                .then(move |ctx| {
                    log.lock().expect("log lock").push(ctx.str_field("svc", &["metadata", "name"])?);
                    Ok(())
                }),
        ),
    );

    let mut engine = Engine::new(None, catalog, &["tagged"])?;
    engine.add_resources(&[
        tagged("resolver", json!(["dns", "edge"])),
        tagged("gateway", json!(["http"])),
    ])?;
    engine.run()?;

    assert_eq!(*fired.lock().expect("log lock"), vec!["resolver"]);
    Ok(())
}

#[test]
fn deleting_a_resource_empties_its_conflict_set() -> Result<()> {
    let mut catalog = Catalog::new();
    catalog.add(
        RuleSet::new("colors").rule(
            Rule::new("red-balls")
                .when([Match::new("Ball", "b").test(eq(field(["color"]), "red"))])
                .then(|_| Ok(())),
        ),
    );

    let mut engine = Engine::new(None, catalog, &["colors"])?;
    engine.add_resources(&[ball("bouncy", "red")])?;
    assert_eq!(engine.conflict_set_size()?, 1);

    assert!(engine.delete_resource("Ball", "bouncy", "test")?);
    assert_eq!(engine.conflict_set_size()?, 0);
    engine.run()?;
    Ok(())
}

#[test]
fn storage_invariants_hold_throughout_a_run() -> Result<()> {
    let mut catalog = Catalog::new();
    catalog.add(
        RuleSet::new("scaling").rule(
            Rule::new("grow-undersized")
                .when([Match::new("Deployment", "foo")
                    .test(namespace("ns"))
                    .test(lt(field(["spec", "replicas"]), 4.0))])
                .then(|ctx| {
                    let replicas = ctx.int_field("foo", &["spec", "replicas"])?;
                    ctx.update_field("foo", &["spec", "replicas"], &json!(replicas + 1))
                }),
        ),
    );

    let mut engine = Engine::new(None, catalog, &["scaling"])?;
    engine.add_resources(&[deployment("web", "ns", 1), deployment("api", "ns", 2)])?;

    let before = engine.integrity_report()?;
    assert!(before.is_healthy(), "unexpected report: {before:?}");

    engine.run()?;

    let after = engine.integrity_report()?;
    assert!(after.is_healthy(), "unexpected report: {after:?}");
    assert_eq!(replicas_of(&engine, "web", "ns")?, 4);
    assert_eq!(replicas_of(&engine, "api", "ns")?, 4);
    Ok(())
}

#[test]
fn on_disk_engines_persist_resources() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("rules.db");

    let mut catalog = Catalog::new();
    catalog.add(
        RuleSet::new("colors").rule(
            Rule::new("red-balls")
                .when([Match::new("Ball", "b").test(eq(field(["color"]), "red"))])
                .then(|_| Ok(())),
        ),
    );

    {
        let mut engine = Engine::new(Some(&path), catalog, &["colors"])?;
        engine.add_resources(&[ball("bouncy", "red")])?;
        engine.run()?;
    }

    let engine = Engine::new(Some(&path), Catalog::new(), &[])?;
    let stored: Value = serde_json::from_str(&engine.resource("Ball", "bouncy", "test")?)?;
    assert_eq!(stored["color"], json!("red"));
    Ok(())
}

#[test]
fn rule_contexts_expose_typed_field_reads() -> Result<()> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&seen);

    let mut catalog = Catalog::new();
    catalog.add(
        RuleSet::new("inspect").rule(
            Rule::new("describe-ball").when([Match::new("Ball", "b")]).then(move |ctx| {
                let size = ctx.int_field("b", &["size"])?;
                let color = ctx.str_field("b", &["color"])?;
                let metadata = ctx.json_field("b", &["metadata"])?;

                assert!(ctx.int_field("b", &["absent"]).is_err());
                assert!(ctx.str_field("nope", &["color"]).is_err());

                log.lock().expect("log lock").push((size, color, metadata));
                Ok(())
            }),
        ),
    );

    let mut engine = Engine::new(None, catalog, &["inspect"])?;
    engine.add_resources(&[json!({
        "kind": "Ball",
        "metadata": {"name": "bouncy", "namespace": "test"},
        "color": "red",
        "size": 10,
    })])?;
    engine.run()?;

    let seen = seen.lock().expect("log lock").clone();
    assert_eq!(
        seen,
        vec![(10, "red".to_string(), json!({"name": "bouncy", "namespace": "test"}))]
    );
    Ok(())
}

#[test]
fn raw_json_strings_are_stored_verbatim() -> Result<()> {
    let mut catalog = Catalog::new();
    catalog.add(
        RuleSet::new("colors").rule(
            Rule::new("red-balls")
                .when([Match::new("Ball", "b").test(eq(field(["color"]), "red"))])
                .then(|_| Ok(())),
        ),
    );

    let payload =
        r#"{"kind": "Ball", "metadata": {"name": "bouncy", "namespace": "test"}, "color": "red"}"#;
    let mut engine = Engine::new(None, catalog, &["colors"])?;
    engine.add_resource_strings(&[payload])?;

    assert_eq!(engine.resource("Ball", "bouncy", "test")?, payload);
    assert_eq!(engine.conflict_set_size()?, 1);

    let bad = engine.add_resource_strings(&[r#"{"kind": "Ball"}"#]);
    assert!(bad.is_err());
    Ok(())
}

#[test]
fn custom_key_functions_replace_the_default() -> Result<()> {
    let mut catalog = Catalog::new();
    catalog.add(
        RuleSet::new("flat").rule(
            Rule::new("any-widget").when([Match::new("Widget", "w")]).then(|_| Ok(())),
        ),
    );

    let mut engine = Engine::new(None, catalog, &["flat"])?.with_key_fn(|doc| {
        let kind = doc["type"].as_str().ok_or(KeyError::Missing("type"))?;
        let name = doc["id"].as_str().ok_or(KeyError::Missing("id"))?;
        Ok(ResourceKey::new(kind, name, "default"))
    });

    engine.add_resources(&[json!({"type": "Widget", "id": "w-1", "weight": 3})])?;
    assert_eq!(engine.conflict_set_size()?, 1);
    engine.run()?;
    Ok(())
}
