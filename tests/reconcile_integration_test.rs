// Integration tests for hash-driven reconciliation: a declarative source
// converging the database with O(changed) writes under the distributed
// lock.

use modelgate::database::{ConnectionPool, DatabaseConfig, MigrationRunner};
use modelgate::hash::ConfigHash;
use modelgate::lock::LockManager;
use modelgate::models::{
    Key, Provider, VirtualKey, VirtualKeyMcpConfig, VirtualKeyProviderConfig,
};
use modelgate::reconcile::{DeclarativeConfig, Reconciler};
use modelgate::store::ConfigStore;
use tokio_util::sync::CancellationToken;

async fn setup() -> (ConfigStore, Reconciler) {
    let _ = env_logger::builder().is_test(true).try_init();
    let pool = ConnectionPool::new(DatabaseConfig::in_memory()).await.unwrap();
    MigrationRunner::with_declared_schema(pool.clone()).run().await.unwrap();
    let store = ConfigStore::new(pool.clone());
    let locks = LockManager::with_defaults(pool);
    let reconciler = Reconciler::new(store.clone(), locks);
    (store, reconciler)
}

fn desired_config() -> DeclarativeConfig {
    DeclarativeConfig::from_json(
        r#"{
            "budgets": [
                {"id": "budget-1", "max_limit": 500.0, "reset_duration": "1M"}
            ],
            "rate_limits": [
                {"id": "rl-1", "request_max_limit": 1000, "request_reset_duration": "1h"}
            ],
            "customers": [
                {"id": "cust-1", "name": "acme", "budget_id": "budget-1"}
            ],
            "providers": [
                {
                    "name": "openai",
                    "keys": [
                        {"key_id": "k1", "name": "openai-primary", "value": "sk-first",
                         "models": ["gpt-4o", "gpt-4o-mini"]},
                        {"key_id": "k2", "name": "openai-batch", "value": "sk-second",
                         "use_for_batch_api": true}
                    ]
                },
                {
                    "name": "anthropic",
                    "keys": [
                        {"key_id": "k3", "name": "anthropic-primary", "value": "env.ANTHROPIC_API_KEY"}
                    ]
                }
            ],
            "mcp_clients": [
                {"client_id": "mcp-1", "name": "tools", "connection_type": "http",
                 "connection_string": "https://mcp.example.com",
                 "tools_to_execute": ["search", "fetch"]}
            ],
            "virtual_keys": [
                {
                    "name": "analytics",
                    "value": "vk-token-1",
                    "budget_id": "budget-1",
                    "rate_limit_id": "rl-1",
                    "provider_configs": [
                        {"provider": "openai", "weight": 0.7,
                         "allowed_models": ["gpt-4o"], "key_ids": ["k1", "k2"]},
                        {"provider": "anthropic", "weight": 0.3, "key_ids": ["k3"]}
                    ],
                    "mcp_configs": [
                        {"mcp_client_id": "mcp-1", "tools_to_execute": ["search"]}
                    ]
                }
            ],
            "plugins": [
                {"name": "telemetry", "enabled": true, "version": "1.0.0",
                 "config": {"sample_rate": 0.1}}
            ]
        }"#,
    )
    .unwrap()
}

#[tokio::test]
async fn test_initial_reconcile_creates_everything() {
    let (store, reconciler) = setup().await;
    let cancel = CancellationToken::new();

    let report = reconciler.reconcile(&desired_config(), &cancel).await.unwrap();
    // budget + rate limit + customer + 2 providers + mcp + vk + plugin
    assert_eq!(report.created, 8);
    assert_eq!(report.updated, 0);
    assert_eq!(report.deleted, 0);

    let vk = store.get_virtual_key("analytics").await.unwrap();
    assert_eq!(vk.provider_configs.len(), 2);
    let openai = vk.provider_configs.iter().find(|pc| pc.provider == "openai").unwrap();
    assert_eq!(openai.key_ids, vec!["k1", "k2"]);
    assert_eq!(vk.mcp_configs.len(), 1);
}

#[tokio::test]
async fn test_second_reconcile_touches_nothing() {
    let (_store, reconciler) = setup().await;
    let cancel = CancellationToken::new();
    let desired = desired_config();

    reconciler.reconcile(&desired, &cancel).await.unwrap();
    let report = reconciler.reconcile(&desired, &cancel).await.unwrap();

    assert_eq!(report.created, 0);
    assert_eq!(report.updated, 0);
    assert_eq!(report.deleted, 0);
    assert_eq!(report.unchanged, 8);
}

#[tokio::test]
async fn test_drift_triggers_minimal_update() {
    let (store, reconciler) = setup().await;
    let cancel = CancellationToken::new();

    reconciler.reconcile(&desired_config(), &cancel).await.unwrap();

    // Rotate one credential: only that provider should be rewritten.
    let mut desired = desired_config();
    desired.providers[0].keys[0].value = "sk-rotated".to_string();
    let report = reconciler.reconcile(&desired, &cancel).await.unwrap();

    assert_eq!(report.updated, 1);
    assert_eq!(report.created, 0);
    assert_eq!(report.deleted, 0);
    assert_eq!(report.unchanged, 7);

    let key = store.get_key_by_key_id("k1").await.unwrap();
    assert_eq!(key.value, "sk-rotated");
}

#[tokio::test]
async fn test_upsert_preserves_internal_key_id() {
    let (store, reconciler) = setup().await;
    let cancel = CancellationToken::new();

    reconciler.reconcile(&desired_config(), &cancel).await.unwrap();
    let before = store.get_key_by_key_id("k1").await.unwrap();

    let mut desired = desired_config();
    desired.providers[0].keys[0].value = "sk-rotated".to_string();
    reconciler.reconcile(&desired, &cancel).await.unwrap();

    let after = store.get_key_by_key_id("k1").await.unwrap();
    assert_eq!(after.id, before.id);
    assert_eq!(after.value, "sk-rotated");
}

#[tokio::test]
async fn test_missing_entities_are_deleted() {
    let (store, reconciler) = setup().await;
    let cancel = CancellationToken::new();

    reconciler.reconcile(&desired_config(), &cancel).await.unwrap();

    let mut desired = desired_config();
    desired.plugins.clear();
    let report = reconciler.reconcile(&desired, &cancel).await.unwrap();

    assert_eq!(report.deleted, 1);
    assert!(store.list_plugins().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_hash_stability_across_child_ordering() {
    // A virtual key's hash ignores the order of provider configs and of
    // the key lists inside them.
    let build = |flip: bool| {
        let mut configs = vec![
            VirtualKeyProviderConfig {
                provider: "openai".to_string(),
                key_ids: vec!["k2".to_string(), "k1".to_string()],
                ..Default::default()
            },
            VirtualKeyProviderConfig {
                provider: "anthropic".to_string(),
                key_ids: vec!["k3".to_string()],
                ..Default::default()
            },
        ];
        if flip {
            configs.reverse();
            for pc in &mut configs {
                pc.key_ids.reverse();
            }
        }
        VirtualKey {
            name: "analytics".to_string(),
            provider_configs: configs,
            mcp_configs: vec![VirtualKeyMcpConfig {
                mcp_client_id: "mcp-1".to_string(),
                tools_to_execute: vec!["b".to_string(), "a".to_string()],
                ..Default::default()
            }],
            ..Default::default()
        }
    };

    assert_eq!(build(false).compute_config_hash(), build(true).compute_config_hash());
}

#[tokio::test]
async fn test_reconcile_rejects_unresolved_key_references() {
    let (store, reconciler) = setup().await;
    let cancel = CancellationToken::new();

    let mut desired = desired_config();
    desired.virtual_keys[0].provider_configs[0].key_ids.push("ghost".to_string());
    let err = reconciler.reconcile(&desired, &cancel).await.unwrap_err();
    assert!(format!("{}", err).contains("ghost"));

    // The whole transaction rolled back: nothing was created.
    assert!(store.list_providers().await.unwrap().is_empty());
    assert!(store.list_budgets().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_reconcile_runs_serialize_on_the_lock() {
    let (store, reconciler) = setup().await;
    let cancel = CancellationToken::new();

    // Hold the reconciliation lock from a fake replica; the run must wait
    // for its release (the first backoff gap is one second).
    let locks = LockManager::with_defaults(store.pool().clone());
    let mut foreign = locks.lock(modelgate::reconcile::RECONCILE_LOCK_KEY).unwrap();
    assert!(foreign.try_lock().await.unwrap());

    let release = tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        let mut foreign = foreign;
        foreign.unlock().await.unwrap();
    });

    let report = reconciler.reconcile(&desired_config(), &cancel).await.unwrap();
    assert_eq!(report.created, 8);
    release.await.unwrap();
}

#[tokio::test]
async fn test_provider_seeding_from_file_shape() {
    // The declarative file shape round-trips through the store types.
    let (store, reconciler) = setup().await;
    let cancel = CancellationToken::new();
    reconciler.reconcile(&desired_config(), &cancel).await.unwrap();

    let providers = store.list_providers().await.unwrap();
    assert_eq!(providers.len(), 2);
    let anthropic = providers.iter().find(|p| p.name == "anthropic").unwrap();
    assert_eq!(anthropic.keys[0].value, "env.ANTHROPIC_API_KEY");

    let provider: Provider = providers[0].clone();
    let key: Key = provider.keys[0].clone();
    assert!(!key.config_hash.is_empty());
}
