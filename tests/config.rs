mod common;

use std::io::Write;

use common::fixtures::{paths, seeded_store};
use wardmill::config::{
    ConfigError, GuardianConfig, GuardianPaths, ARK_SERVER_PORT, GUARDIAN_ID,
    PERSISTENT_BASEPATH,
};
use wardmill::store::StateStore;

#[test]
fn file_layer_overrides_programmatic_values() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{"GUARDIAN_ID": "from-file", "ARK_SERVER_PORT": 8080}}"#
    )
    .unwrap();

    let mut config = GuardianConfig::new();
    config.set(GUARDIAN_ID, "from-code");
    config.merge_file(file.path()).unwrap();

    assert_eq!(config.get(GUARDIAN_ID).unwrap(), "from-file");
    // Non-string JSON values are rendered to strings.
    assert_eq!(config.get(ARK_SERVER_PORT).unwrap(), "8080");
}

#[test]
fn missing_file_layer_is_not_an_error() {
    let mut config = GuardianConfig::new();
    config.merge_file("/definitely/not/here.conf").unwrap();
    assert!(!config.has(GUARDIAN_ID));
}

#[test]
fn malformed_file_is_reported() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "not json at all").unwrap();

    let mut config = GuardianConfig::new();
    assert!(matches!(
        config.merge_file(file.path()),
        Err(ConfigError::Format(_))
    ));
}

#[tokio::test]
async fn remote_layer_overrides_the_file_layer() {
    let store = seeded_store().await;
    store
        .create(
            &paths().config(),
            br#"{"GUARDIAN_ID": "from-remote"}"#,
            false,
            false,
            false,
        )
        .await
        .unwrap();

    let mut config = GuardianConfig::new();
    config.set(GUARDIAN_ID, "testg");
    config.merge_remote(store.as_ref(), &paths()).await.unwrap();
    assert_eq!(config.get(GUARDIAN_ID).unwrap(), "from-remote");
}

#[tokio::test]
async fn absent_remote_layer_is_not_an_error() {
    let store = seeded_store().await;
    let mut config = GuardianConfig::new();
    config.set(GUARDIAN_ID, "testg");
    config.merge_remote(store.as_ref(), &paths()).await.unwrap();
    assert_eq!(config.get(GUARDIAN_ID).unwrap(), "testg");
}

#[test]
fn basepath_template_is_honoured() {
    let mut config = GuardianConfig::new();
    config.set(GUARDIAN_ID, "prod-guardian");
    config.set(PERSISTENT_BASEPATH, "/automation/{}");
    assert_eq!(
        config.paths().unwrap(),
        GuardianPaths::new("/automation/{}", "prod-guardian")
    );
    assert_eq!(
        config.paths().unwrap().context(),
        "/automation/prod-guardian/context"
    );
}
