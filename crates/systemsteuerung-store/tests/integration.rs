//! Integration tests for the systemsteuerung-store crate.
//!
//! These tests run the configuration file, the realm router, the document
//! store and the session cache together against real SQLite databases on
//! disk (via tempfile).

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use futures::TryStreamExt;
use serde_json::json;
use systemsteuerung_store::{
    DatenMatch, DocumentFilter, DocumentStore, PutOptions, Realm, SessionConfigCache, SessionKey,
    SteuerungConfig, StoreError,
};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .with_test_writer()
        .try_init();
}

fn write_config(dir: &Path, extra: &str) -> SteuerungConfig {
    let root = dir.display().to_string().replace('\\', "/");
    let content = format!(
        r#"
[realms]
identity = {{ file = "{root}/identity.db" }}
system = {{ file = "{root}/system.db" }}

[realms.tenants]
acme = {{ file = "{root}/acme.db" }}
globex = {{ file = "{root}/globex.db" }}

[tables]
tenant_extra = ["auftraege"]

[database]
read_connections = 2
list_page_size = 16
{extra}
"#
    );
    let path = dir.join("systemsteuerung.toml");
    std::fs::write(&path, content).unwrap();
    SteuerungConfig::load(&path).unwrap()
}

fn setup() -> (tempfile::TempDir, SteuerungConfig, DocumentStore) {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), "");
    let store = DocumentStore::from_config(&config).unwrap();
    (dir, config, store)
}

// ═══════════════════════════════════════════════════════════════════════
//  Routing
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn realms_are_routed_to_their_own_files() {
    let (dir, _config, store) = setup();

    store
        .table(Realm::tenant("acme"), "mandantendaten")
        .unwrap()
        .put("mandant", json!({"waehrung": "EUR"}), PutOptions::default())
        .await
        .unwrap();
    store
        .table(Realm::System, "menuedaten")
        .unwrap()
        .put("hauptmenue", json!({"eintraege": []}), PutOptions::default())
        .await
        .unwrap();

    assert!(dir.path().join("acme.db").exists());
    assert!(dir.path().join("system.db").exists());
    assert!(!dir.path().join("globex.db").exists());
    assert_eq!(store.pool().open_count(), 2);
}

#[tokio::test]
async fn unknown_tenant_is_rejected() {
    let (_dir, _config, store) = setup();
    let err = store
        .table(Realm::tenant("initech"), "mandantendaten")
        .err()
        .unwrap();
    assert!(matches!(err, StoreError::UnknownRealm(ref name) if name.contains("initech")));

    let err = store.table(Realm::System, "mandantendaten").err().unwrap();
    assert!(matches!(err, StoreError::Validation(_)));
}

#[tokio::test]
async fn tenants_are_isolated() {
    let (_dir, _config, store) = setup();
    let acme = store.table(Realm::tenant("acme"), "auftraege").unwrap();
    let globex = store.table(Realm::tenant("globex"), "auftraege").unwrap();

    acme.put("a-1", json!({"betrag": 10}), PutOptions::default())
        .await
        .unwrap();
    globex
        .put("a-1", json!({"betrag": 99}), PutOptions::default())
        .await
        .unwrap();

    assert_eq!(acme.get_current("a-1").await.unwrap().daten["betrag"], 10);
    assert_eq!(globex.get_current("a-1").await.unwrap().daten["betrag"], 99);
}

// ═══════════════════════════════════════════════════════════════════════
//  Versioning
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn version_chain_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), "");
    let between;
    {
        let store = DocumentStore::from_config(&config).unwrap();
        let layouts = store.table(Realm::System, "layouts").unwrap();
        layouts
            .put("start", json!({"spalten": 2}), PutOptions::named("Start"))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        between = Utc::now();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        layouts
            .put("start", json!({"spalten": 3}), PutOptions::default())
            .await
            .unwrap();
    }

    let store = DocumentStore::from_config(&config).unwrap();
    let layouts = store.table(Realm::System, "layouts").unwrap();

    let current = layouts.get_current("start").await.unwrap();
    assert_eq!(current.daten, json!({"spalten": 3}));
    assert_eq!(current.name.as_deref(), Some("Start"));
    assert_eq!(current.daten_backup, json!({"spalten": 2}));

    let old = layouts.as_of("start", between).await.unwrap();
    assert_eq!(old.daten, json!({"spalten": 2}));
    assert_eq!(old.historisch, 1);
    assert_eq!(old.gilt_bis, current.created_at);

    let history = layouts.history("start").await.unwrap();
    assert_eq!(history.len(), 2);
    assert!(history[0].is_current());
}

#[tokio::test]
async fn extended_layout_is_provisioned_on_reopen() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let mut config = write_config(dir.path(), "");
    {
        let store = DocumentStore::from_config(&config).unwrap();
        store
            .table(Realm::tenant("acme"), "auftraege")
            .unwrap()
            .put("a-1", json!({"betrag": 10}), PutOptions::default())
            .await
            .unwrap();
    }

    config.tables.tenant_extra.push("rechnungen".to_string());
    let store = DocumentStore::from_config(&config).unwrap();
    let rechnungen = store.table(Realm::tenant("acme"), "rechnungen").unwrap();
    rechnungen
        .put("r-1", json!({"summe": 10}), PutOptions::default())
        .await
        .unwrap();
    assert_eq!(rechnungen.get_current("r-1").await.unwrap().daten["summe"], 10);

    let auftraege = store.table(Realm::tenant("acme"), "auftraege").unwrap();
    assert_eq!(auftraege.get_current("a-1").await.unwrap().daten["betrag"], 10);
}

#[tokio::test]
async fn historize_then_put_restarts_the_chain() {
    let (_dir, _config, store) = setup();
    let settings = store.table(Realm::Identity, "benutzer_einstellungen").unwrap();

    settings
        .put("u1", json!({"a": 1}), PutOptions::default())
        .await
        .unwrap();
    settings.historize("u1").await.unwrap();
    assert!(settings.get_current("u1").await.unwrap_err().is_not_found());
    assert!(settings.historize("u1").await.unwrap_err().is_not_found());

    let again = settings
        .put("u1", json!({"a": 2}), PutOptions::default())
        .await
        .unwrap();
    assert_eq!(again.daten_backup, json!({}));

    let generations: Vec<i64> = settings
        .history("u1")
        .await
        .unwrap()
        .iter()
        .map(|d| d.historisch)
        .collect();
    assert_eq!(generations, vec![0, 1]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_cas_has_exactly_one_winner() {
    let (_dir, _config, store) = setup();
    let table = store.table(Realm::tenant("acme"), "auftraege").unwrap();
    let base = table
        .put("a-7", json!({"status": "neu"}), PutOptions::default())
        .await
        .unwrap();

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let table = table.clone();
            let expected = base.source_hash.clone();
            tokio::spawn(async move {
                table
                    .cas_put("a-7", &expected, json!({"status": "bearbeitet", "von": i}), PutOptions::default())
                    .await
            })
        })
        .collect();

    let mut won = 0;
    let mut conflicts = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => won += 1,
            Err(err) if err.is_stale_write() => conflicts += 1,
            Err(err) => panic!("unexpected error: {err}"),
        }
    }
    assert_eq!(won, 1);
    assert_eq!(conflicts, 7);
    assert_eq!(table.history("a-7").await.unwrap().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_puts_leave_one_current_row() {
    let (_dir, _config, store) = setup();
    let table = store.table(Realm::System, "dialogdaten").unwrap();

    let handles: Vec<_> = (0..12)
        .map(|i| {
            let table = table.clone();
            tokio::spawn(async move {
                table
                    .put("kunde", json!({"felder": i}), PutOptions::default())
                    .await
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let history = table.history("kunde").await.unwrap();
    assert_eq!(history.len(), 12);
    assert_eq!(history.iter().filter(|d| d.is_current()).count(), 1);
    let mut generations: Vec<i64> = history.iter().map(|d| d.historisch).collect();
    generations.sort();
    assert_eq!(generations, (0..12).collect::<Vec<i64>>());
}

// ═══════════════════════════════════════════════════════════════════════
//  Listing
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn list_current_streams_across_pages() {
    let (_dir, _config, store) = setup();
    let table = store.table(Realm::tenant("globex"), "auftraege").unwrap();

    for i in 0..50 {
        let region = if i % 5 == 0 { "nord" } else { "sued" };
        table
            .put(
                &format!("a-{i:03}"),
                json!({"region": region, "nr": i}),
                PutOptions::default().sec_id("vertrieb"),
            )
            .await
            .unwrap();
    }
    // A historized document never shows up.
    table.historize("a-000").await.unwrap();

    let all = table.list_current(DocumentFilter::new()).collect().await.unwrap();
    assert_eq!(all.len(), 49);
    assert!(all.windows(2).all(|w| w[0].uid < w[1].uid));

    let listing = table.list_current(
        DocumentFilter::new()
            .sec_id("vertrieb")
            .daten(DatenMatch::Contains(json!({"region": "nord"}))),
    );
    let first: Vec<_> = listing.stream().try_collect().await.unwrap();
    assert_eq!(first.len(), 9);

    // Restartable: a second stream starts from the beginning.
    let second: Vec<_> = listing.stream().try_collect().await.unwrap();
    assert_eq!(
        first.iter().map(|d| &d.uid).collect::<Vec<_>>(),
        second.iter().map(|d| &d.uid).collect::<Vec<_>>()
    );
}

// ═══════════════════════════════════════════════════════════════════════
//  Session cache
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn cache_serves_settings_and_tenant_data() {
    let (_dir, config, store) = setup();
    let cache = SessionConfigCache::for_store(&store, &config);

    store
        .table(Realm::Identity, "benutzer_einstellungen")
        .unwrap()
        .put("u1", json!({"ui": {"theme": "dark"}}), PutOptions::default())
        .await
        .unwrap();
    store
        .table(Realm::tenant("acme"), "mandantendaten")
        .unwrap()
        .put("mandant", json!({"waehrung": "EUR"}), PutOptions::default())
        .await
        .unwrap();

    let key = SessionKey::new("u1", "acme");
    assert_eq!(cache.get_setting(&key, "ui.theme").await.unwrap(), json!("dark"));
    assert_eq!(cache.get_tenant_data(&key, "waehrung").await.unwrap(), json!("EUR"));
    assert_eq!(cache.get_setting(&key, "/ui/theme").await.unwrap(), json!("dark"));
    assert_eq!(cache.stats().loads(), 2);

    let err = cache.get_setting(&key, "ui.font").await.unwrap_err();
    assert!(matches!(err, StoreError::KeyNotFound { .. }));
}

#[tokio::test]
async fn writes_invalidate_cached_sessions() {
    let (_dir, config, store) = setup();
    let cache = SessionConfigCache::for_store(&store, &config);
    let settings = store.table(Realm::Identity, "benutzer_einstellungen").unwrap();
    let tenant = store.table(Realm::tenant("acme"), "mandantendaten").unwrap();

    settings
        .put("u1", json!({"sprache": "de"}), PutOptions::default())
        .await
        .unwrap();
    tenant
        .put("mandant", json!({"waehrung": "EUR"}), PutOptions::default())
        .await
        .unwrap();

    let key = SessionKey::new("u1", "acme");
    assert_eq!(cache.get_setting(&key, "sprache").await.unwrap(), json!("de"));
    assert_eq!(cache.get_tenant_data(&key, "waehrung").await.unwrap(), json!("EUR"));

    settings
        .put("u1", json!({"sprache": "en"}), PutOptions::default())
        .await
        .unwrap();
    assert_eq!(cache.get_setting(&key, "sprache").await.unwrap(), json!("en"));

    tenant
        .put("mandant", json!({"waehrung": "CHF"}), PutOptions::default())
        .await
        .unwrap();
    assert_eq!(cache.get_tenant_data(&key, "waehrung").await.unwrap(), json!("CHF"));

    settings.historize("u1").await.unwrap();
    let err = cache.get_setting(&key, "sprache").await.unwrap_err();
    assert!(matches!(err, StoreError::KeyNotFound { .. }));
}

#[tokio::test]
async fn unrouted_tenant_session_fails_with_unknown_realm() {
    let (_dir, config, store) = setup();
    let cache = SessionConfigCache::for_store(&store, &config);
    let key = SessionKey::new("u1", "initech");
    let err = cache.get_tenant_data(&key, "waehrung").await.unwrap_err();
    assert!(matches!(err.root(), StoreError::UnknownRealm(_)));
}

#[tokio::test]
async fn ended_sessions_reload_and_dropped_cache_stops_listening() {
    let (_dir, config, store) = setup();
    let settings = store.table(Realm::Identity, "benutzer_einstellungen").unwrap();
    settings
        .put("u2", json!({"x": 1}), PutOptions::default())
        .await
        .unwrap();

    let cache = SessionConfigCache::for_store(&store, &config);
    let key = SessionKey::new("u2", "globex");
    cache.get_setting(&key, "x").await.unwrap();
    cache.end_session(&key).await;
    cache.end_session(&key).await;
    assert_eq!(cache.session_count(), 0);
    cache.get_setting(&key, "x").await.unwrap();
    assert_eq!(cache.stats().loads(), 2);

    // Writes keep working after the cache is gone.
    drop(cache);
    settings
        .put("u2", json!({"x": 2}), PutOptions::default())
        .await
        .unwrap();
}

#[tokio::test]
async fn cache_section_is_read_from_file() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(
        dir.path(),
        "\n[cache]\nttl_seconds = 1\ntenant_document_uid = \"stammdaten\"\n",
    );
    assert_eq!(config.cache.ttl_seconds, 1);

    let store = DocumentStore::from_config(&config).unwrap();
    store
        .table(Realm::tenant("acme"), "mandantendaten")
        .unwrap()
        .put("stammdaten", json!({"name": "ACME"}), PutOptions::default())
        .await
        .unwrap();

    let cache = SessionConfigCache::builder_from_config(Arc::new(store.clone()), &config).build();
    let key = SessionKey::new("u1", "acme");
    assert_eq!(cache.get_tenant_data(&key, "name").await.unwrap(), json!("ACME"));

    tokio::time::sleep(std::time::Duration::from_millis(1_200)).await;
    cache.get_tenant_data(&key, "name").await.unwrap();
    assert_eq!(cache.stats().loads(), 2);
}
