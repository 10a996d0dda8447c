//! Unit tests for cloud configuration and instance document loading.

use std::time::Duration;

use camino::Utf8PathBuf;
use cap_std::{ambient_authority, fs_utf8::Dir};
use rstest::*;
use stratus::test_support::EnvGuard;
use stratus::{CloudConfig, ConfigError, DesiredPowerState, DocumentError, load_instance_document};
use tempfile::TempDir;

#[fixture]
fn valid_config() -> CloudConfig {
    CloudConfig {
        auth_token: String::from("gAAAAABexampletoken"),
        compute_endpoint: String::from("https://compute.example.test/v2.1/project-1"),
        image_endpoint: Some(String::from("https://image.example.test")),
        network_endpoint: None,
        volume_endpoint: None,
        image_id: None,
        image_name: Some(String::from("ubuntu-24.04")),
        flavor_id: Some(String::from("flv-1")),
        flavor_name: None,
        poll_interval_secs: 3,
        poll_min_delay_secs: 10,
        build_retry_attempts: 3,
    }
}

fn temp_root(tmp: &TempDir) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).unwrap_or_else(|non_utf8_path| {
        panic!("temp dir should be utf8: {}", non_utf8_path.display())
    })
}

fn write_file(root: &Utf8PathBuf, name: &str, contents: &str) {
    Dir::open_ambient_dir(root, ambient_authority())
        .unwrap_or_else(|err| panic!("open temp dir: {err}"))
        .write(name, contents)
        .unwrap_or_else(|err| panic!("write file: {err}"));
}

#[rstest]
fn valid_config_passes_validation(valid_config: CloudConfig) {
    valid_config
        .validate()
        .unwrap_or_else(|err| panic!("config should be valid: {err}"));
}

#[rstest]
#[case::token(
    |cfg: &mut CloudConfig| cfg.auth_token = String::from("  "),
    "OS_AUTH_TOKEN",
    "auth_token"
)]
#[case::compute(
    |cfg: &mut CloudConfig| cfg.compute_endpoint = String::new(),
    "OS_COMPUTE_ENDPOINT",
    "compute_endpoint"
)]
fn missing_fields_produce_actionable_errors(
    valid_config: CloudConfig,
    #[case] mutate: fn(&mut CloudConfig),
    #[case] env_var: &str,
    #[case] toml_key: &str,
) {
    let mut cfg = valid_config;
    mutate(&mut cfg);

    let error = cfg.validate().expect_err("validation should fail");
    let ConfigError::MissingField(ref message) = error else {
        panic!("expected MissingField error, got {error:?}");
    };
    assert!(message.contains(env_var), "error should mention env var: {message}");
    assert!(
        message.contains("stratus.toml"),
        "error should mention config file: {message}"
    );
    assert!(message.contains(toml_key), "error should mention TOML key: {message}");
}

#[rstest]
fn non_http_compute_endpoint_is_rejected(valid_config: CloudConfig) {
    let cfg = CloudConfig {
        compute_endpoint: String::from("compute.example.test"),
        ..valid_config
    };

    let error = cfg.validate().expect_err("bare host should be rejected");

    assert_eq!(
        error,
        ConfigError::InvalidEndpoint {
            env_var: "OS_COMPUTE_ENDPOINT",
            value: String::from("compute.example.test"),
        }
    );
}

#[rstest]
fn optional_endpoints_are_checked_when_present(valid_config: CloudConfig) {
    let cfg = CloudConfig {
        volume_endpoint: Some(String::from("ftp://volume.example.test")),
        ..valid_config
    };

    let error = cfg.validate().expect_err("ftp endpoint should be rejected");

    assert!(
        error.to_string().contains("OS_VOLUME_ENDPOINT"),
        "error should name the variable: {error}"
    );
}

#[rstest]
#[case::zero_interval(0, 10, "OS_POLL_INTERVAL_SECS", 0, 1)]
#[case::huge_interval(u64::MAX, 10, "OS_POLL_INTERVAL_SECS", u64::MAX, 1)]
#[case::huge_delay(3, u64::MAX, "OS_POLL_MIN_DELAY_SECS", u64::MAX, 0)]
fn poll_settings_out_of_range_are_rejected(
    valid_config: CloudConfig,
    #[case] interval: u64,
    #[case] min_delay: u64,
    #[case] env_var: &'static str,
    #[case] value: u64,
    #[case] min: u64,
) {
    let cfg = CloudConfig {
        poll_interval_secs: interval,
        poll_min_delay_secs: min_delay,
        ..valid_config
    };

    assert_eq!(
        cfg.validate(),
        Err(ConfigError::PollOutOfRange {
            env_var,
            value,
            min,
            max: 3600,
        })
    );
}

#[rstest]
fn config_maps_to_boot_defaults_and_poll_settings(valid_config: CloudConfig) {
    let defaults = valid_config.boot_defaults();
    let polling = valid_config.poll_settings();

    assert_eq!(defaults.image_name.as_deref(), Some("ubuntu-24.04"));
    assert_eq!(defaults.flavor_id.as_deref(), Some("flv-1"));
    assert_eq!(defaults.image_id, None);
    assert_eq!(polling.interval, Duration::from_secs(3));
    assert_eq!(polling.min_delay, Duration::from_secs(10));
    assert_eq!(polling.retry_attempts, 3);
}

#[tokio::test]
async fn load_reads_os_environment_variables() {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let home = temp_root(&tmp);
    let _guard = EnvGuard::set_vars(&[
        ("HOME", Some(home.as_str())),
        ("XDG_CONFIG_HOME", Some(home.as_str())),
        ("STRATUS_CONFIG_PATH", None),
        ("OS_AUTH_TOKEN", Some("env-token")),
        ("OS_COMPUTE_ENDPOINT", Some("https://compute.example.test/v2.1")),
        ("OS_IMAGE_ENDPOINT", None),
        ("OS_NETWORK_ENDPOINT", None),
        ("OS_VOLUME_ENDPOINT", None),
        ("OS_IMAGE_ID", None),
        ("OS_IMAGE_NAME", None),
        ("OS_FLAVOR_ID", None),
        ("OS_FLAVOR_NAME", Some("m1.small")),
        ("OS_POLL_INTERVAL_SECS", None),
        ("OS_POLL_MIN_DELAY_SECS", None),
        ("OS_BUILD_RETRY_ATTEMPTS", None),
    ])
    .await;

    let cfg = CloudConfig::load_without_cli_args()
        .unwrap_or_else(|err| panic!("config should load: {err}"));

    assert_eq!(cfg.auth_token, "env-token");
    assert_eq!(cfg.compute_endpoint, "https://compute.example.test/v2.1");
    assert_eq!(cfg.flavor_name.as_deref(), Some("m1.small"));
    assert_eq!(cfg.image_endpoint, None);
    assert_eq!(cfg.poll_interval_secs, 3);
    assert_eq!(cfg.poll_min_delay_secs, 10);
}

#[test]
fn instance_document_is_parsed() {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let root = temp_root(&tmp);
    write_file(
        &root,
        "web.json",
        r#"{
            "name": "web-1",
            "flavor_name": "m1.small",
            "power_state": "shutoff",
            "timeouts": { "create": 600 }
        }"#,
    );

    let config = load_instance_document(&root.join("web.json"))
        .unwrap_or_else(|err| panic!("document should load: {err}"));

    assert_eq!(config.name, "web-1");
    assert_eq!(config.flavor_name.as_deref(), Some("m1.small"));
    assert_eq!(config.power_state, DesiredPowerState::Shutoff);
    assert_eq!(config.timeouts.create, Duration::from_secs(600));
    assert_eq!(config.timeouts.delete, Duration::from_secs(30 * 60));
}

#[test]
fn missing_instance_document_reports_path() {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let path = temp_root(&tmp).join("absent.json");

    let error = load_instance_document(&path).expect_err("missing file should fail");

    assert!(matches!(error, DocumentError::Read { ref path, .. } if path.ends_with("absent.json")));
}

#[rstest]
#[case::syntax("{ not json")]
#[case::unknown_field(r#"{ "name": "web-1", "flavour": "m1.small" }"#)]
fn malformed_instance_document_is_rejected(#[case] contents: &str) {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let root = temp_root(&tmp);
    write_file(&root, "bad.json", contents);

    let error = load_instance_document(&root.join("bad.json")).expect_err("document should fail");

    assert!(matches!(error, DocumentError::Parse { .. }), "{error}");
}
