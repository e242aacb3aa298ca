use nodefuse::config::{parse_config, save_config, Owner};
use nodefuse::{load_config, Config};
use tempfile::TempDir;

/// Test that a fully specified file is read back as written
#[test]
fn test_load_full_config_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(
        &path,
        r#"
[mount]
max_write = 131072
max_background = 20
buffer_pooling = false
latency = true
fs_name = "mirror"
allow_other = true
options = ["default_permissions"]

[fs]
entry_timeout = 0.5
attr_timeout = 2.0
negative_timeout = 1.5
portable_inodes = false

[fs.owner]
uid = 1234
gid = 5678

[pathfs]
client_inodes = true
"#,
    )
    .unwrap();

    let config = load_config(Some(&path)).expect("Failed to load config");
    assert_eq!(config.mount.max_write, 131072);
    assert_eq!(config.mount.max_background, 20);
    assert!(!config.mount.buffer_pooling);
    assert!(config.mount.latency);
    assert!(!config.mount.debug);
    assert_eq!(config.mount.fs_name, "mirror");
    assert!(config.mount.allow_other);
    assert_eq!(config.mount.options, vec!["default_permissions".to_string()]);
    assert_eq!(config.fs.entry_timeout, 0.5);
    assert_eq!(config.fs.negative_timeout, 1.5);
    assert!(!config.fs.portable_inodes);
    assert_eq!(config.fs.owner, Some(Owner { uid: 1234, gid: 5678 }));
    assert!(config.pathfs.client_inodes);
}

/// Test that save_config output loads back with the same settings
#[test]
fn test_save_config_round_trip_with_owner() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested/config.toml");

    let mut config = Config::default();
    config.fs.owner = Some(Owner { uid: 0, gid: 0 });
    config.fs.negative_timeout = 3.0;
    config.pathfs.client_inodes = true;
    save_config(&config, &path).expect("Failed to save config");

    let reloaded = load_config(Some(&path)).expect("Failed to reload config");
    assert_eq!(reloaded.fs.owner, Some(Owner { uid: 0, gid: 0 }));
    assert_eq!(reloaded.fs.negative_timeout, 3.0);
    assert!(reloaded.pathfs.client_inodes);
    assert_eq!(reloaded.mount.max_write, config.mount.max_write);
}

/// Test that unknown sections do not break loading
#[test]
fn test_parse_ignores_unknown_sections() {
    let config = parse_config("[telemetry]\nenabled = true\n").expect("Failed to parse");
    assert_eq!(config.mount.max_background, 12);
}

/// Test that a bad value type is reported as a config error
#[test]
fn test_parse_rejects_wrong_type() {
    let err = parse_config("[mount]\nmax_write = \"big\"\n").unwrap_err();
    assert!(err.to_string().contains("Failed to parse config"));
}
