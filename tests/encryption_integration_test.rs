// Integration tests for envelope encryption: save/load hooks against real
// rows, raw column inspection, and the startup upgrade sweep.

use modelgate::database::{ConnectionPool, DatabaseConfig, MigrationRunner};
use modelgate::models::{AzureKeyConfig, Key, Provider, VirtualKey};
use modelgate::store::{encrypt_existing_plaintext, ConfigStore};
use parking_lot::Mutex;
use sqlx::Row;

// The codec is process-wide; tests that flip it on and off serialize here.
static CODEC_GUARD: Mutex<()> = Mutex::new(());

async fn migrated_store() -> ConfigStore {
    let _ = env_logger::builder().is_test(true).try_init();
    let pool = ConnectionPool::new(DatabaseConfig::in_memory()).await.unwrap();
    MigrationRunner::with_declared_schema(pool.clone()).run().await.unwrap();
    ConfigStore::new(pool)
}

fn azure_provider() -> Provider {
    Provider {
        name: "azure".to_string(),
        keys: vec![Key {
            key_id: "az-1".to_string(),
            name: "azure-primary".to_string(),
            value: "sk-azure".to_string(),
            azure_key_config: Some(AzureKeyConfig {
                endpoint: "https://x.openai.azure.com".to_string(),
                api_version: Some("2024-06-01".to_string()),
                client_secret: Some("S".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }],
        ..Default::default()
    }
}

#[tokio::test]
async fn test_envelope_encryption_round_trip() {
    let _guard = CODEC_GUARD.lock();
    modelgate::crypto::reset();
    modelgate::crypto::init("integration-key").unwrap();

    let store = migrated_store().await;
    let original = azure_provider();
    let original_snapshot = serde_json::to_string(&original).unwrap();

    store.create_provider(&original).await.unwrap();

    // The caller's struct is byte-identical to its pre-save contents.
    assert_eq!(serde_json::to_string(&original).unwrap(), original_snapshot);

    // Raw columns differ from the plaintext inputs.
    let row = sqlx::query(
        "SELECT value, azure_endpoint, azure_client_secret, azure_api_version, encryption_status \
         FROM config_keys WHERE key_id = 'az-1'",
    )
    .fetch_one(store.pool().inner())
    .await
    .unwrap();
    let raw_value: String = row.try_get("value").unwrap();
    let raw_endpoint: String = row.try_get("azure_endpoint").unwrap();
    let raw_secret: String = row.try_get("azure_client_secret").unwrap();
    let raw_api_version: String = row.try_get("azure_api_version").unwrap();
    let status: String = row.try_get("encryption_status").unwrap();

    assert_ne!(raw_value, "sk-azure");
    assert_ne!(raw_endpoint, "https://x.openai.azure.com");
    assert_ne!(raw_secret, "S");
    // API versions are routing metadata, not secrets.
    assert_eq!(raw_api_version, "2024-06-01");
    assert_eq!(status, "encrypted");

    // The load hook reconstructs the original bundle.
    let loaded = store.get_provider("azure").await.unwrap();
    let azure = loaded.keys[0].azure_key_config.as_ref().unwrap();
    assert_eq!(loaded.keys[0].value, "sk-azure");
    assert_eq!(azure.endpoint, "https://x.openai.azure.com");
    assert_eq!(azure.client_secret.as_deref(), Some("S"));

    modelgate::crypto::reset();
}

#[tokio::test]
async fn test_env_reference_stored_verbatim_and_resolved() {
    let _guard = CODEC_GUARD.lock();
    modelgate::crypto::reset();
    modelgate::crypto::init("integration-key").unwrap();

    std::env::set_var("MODELGATE_IT_KEY", "resolved-secret");

    let store = migrated_store().await;
    let mut provider = azure_provider();
    provider.keys[0].value = "env.MODELGATE_IT_KEY".to_string();
    store.create_provider(&provider).await.unwrap();

    // The raw column stores the reference literal, never ciphertext.
    let raw_value: String = sqlx::query_scalar("SELECT value FROM config_keys WHERE key_id = 'az-1'")
        .fetch_one(store.pool().inner())
        .await
        .unwrap();
    assert_eq!(raw_value, "env.MODELGATE_IT_KEY");

    // The loaded struct exposes the resolved value through the accessor
    // while keeping the persisted form.
    let loaded = store.get_provider("azure").await.unwrap();
    assert_eq!(loaded.keys[0].value, "env.MODELGATE_IT_KEY");
    assert_eq!(loaded.keys[0].resolved_value(), "resolved-secret");

    std::env::remove_var("MODELGATE_IT_KEY");
    modelgate::crypto::reset();
}

#[tokio::test]
async fn test_startup_sweep_upgrades_then_stabilizes() {
    let _guard = CODEC_GUARD.lock();
    modelgate::crypto::reset();

    // Seed rows while encryption is disabled: everything lands plaintext.
    let store = migrated_store().await;
    store.create_provider(&azure_provider()).await.unwrap();
    store
        .create_virtual_key(&VirtualKey {
            name: "analytics".to_string(),
            value: "vk-token".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

    let status: String = sqlx::query_scalar("SELECT encryption_status FROM config_keys WHERE key_id = 'az-1'")
        .fetch_one(store.pool().inner())
        .await
        .unwrap();
    assert_eq!(status, "plain_text");

    // Boot with a key: the sweep upgrades every plaintext row.
    modelgate::crypto::init("integration-key").unwrap();
    let report = encrypt_existing_plaintext(&store).await.unwrap();
    assert_eq!(report.keys, 1);
    assert_eq!(report.virtual_keys, 1);
    assert!(report.total() >= 2);

    let raw_value: String = sqlx::query_scalar("SELECT value FROM config_keys WHERE key_id = 'az-1'")
        .fetch_one(store.pool().inner())
        .await
        .unwrap();
    assert_ne!(raw_value, "sk-azure");

    // The pass is idempotent: a second run touches nothing.
    let second = encrypt_existing_plaintext(&store).await.unwrap();
    assert_eq!(second.total(), 0);
    let raw_value_again: String =
        sqlx::query_scalar("SELECT value FROM config_keys WHERE key_id = 'az-1'")
            .fetch_one(store.pool().inner())
            .await
            .unwrap();
    assert_eq!(raw_value, raw_value_again);

    // And the upgraded rows still decrypt through the load path.
    let loaded = store.get_provider("azure").await.unwrap();
    assert_eq!(loaded.keys[0].value, "sk-azure");
    let vk = store.get_virtual_key("analytics").await.unwrap();
    assert_eq!(vk.value, "vk-token");

    modelgate::crypto::reset();
}

#[tokio::test]
async fn test_hash_unchanged_by_encryption_state() {
    let _guard = CODEC_GUARD.lock();
    modelgate::crypto::reset();

    // Same provider written plain and encrypted hashes identically.
    let store_plain = migrated_store().await;
    store_plain.create_provider(&azure_provider()).await.unwrap();
    let plain_hash: String =
        sqlx::query_scalar("SELECT config_hash FROM config_keys WHERE key_id = 'az-1'")
            .fetch_one(store_plain.pool().inner())
            .await
            .unwrap();

    modelgate::crypto::init("integration-key").unwrap();
    let store_encrypted = migrated_store().await;
    store_encrypted.create_provider(&azure_provider()).await.unwrap();
    let encrypted_hash: String =
        sqlx::query_scalar("SELECT config_hash FROM config_keys WHERE key_id = 'az-1'")
            .fetch_one(store_encrypted.pool().inner())
            .await
            .unwrap();

    assert_eq!(plain_hash, encrypted_hash);
    modelgate::crypto::reset();
}
