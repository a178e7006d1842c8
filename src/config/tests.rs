use super::*;
use crate::cache::{CspMode, EtagStrategy};

#[test]
fn cli_overrides_take_highest_precedence() {
    let mut raw = RawSettings::default();
    raw.server.port = Some(4000);
    raw.logging.level = Some("info".to_string());
    raw.cache.max_invalidation_batch = 50;

    let overrides = ServeOverrides {
        server_port: Some(4321),
        log_level: Some("debug".to_string()),
        cache_max_invalidation_batch: Some(25),
        ..Default::default()
    };

    raw.apply_serve_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.server.addr.port(), 4321);
    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
    assert_eq!(settings.cache.max_invalidation_batch, 25);
}

#[test]
fn defaults_are_valid() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");
    assert_eq!(settings.server.addr.port(), DEFAULT_PORT);
    assert_eq!(settings.assets.root, PathBuf::from(DEFAULT_ASSET_ROOT));
    assert!(settings.assets.manifest_path.is_none());
    assert_eq!(settings.cache.etag_strategy, EtagStrategy::Strong);
    assert!(matches!(settings.logging.format, LogFormat::Compact));
}

#[test]
fn cli_json_logging_enforces_format() {
    let mut raw = RawSettings::default();
    let overrides = ServeOverrides {
        log_json: Some(true),
        ..Default::default()
    };

    raw.apply_serve_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert!(matches!(settings.logging.format, LogFormat::Json));
}

#[test]
fn cache_overrides_reach_the_cache_config() {
    let mut raw = RawSettings::default();
    let overrides = ServeOverrides {
        cache_etag_strategy: Some(EtagStrategy::Hybrid),
        cache_csp_mode: Some(CspMode::Meta),
        cache_enable_sri: Some(false),
        cache_export_endpoint: Some("http://127.0.0.1:9000/telemetry".to_string()),
        ..Default::default()
    };

    raw.apply_serve_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.cache.etag_strategy, EtagStrategy::Hybrid);
    assert_eq!(settings.cache.csp_mode, CspMode::Meta);
    assert!(!settings.cache.enable_sri);
    assert_eq!(
        settings.cache.export_endpoint.as_deref(),
        Some("http://127.0.0.1:9000/telemetry")
    );
}

#[test]
fn out_of_range_ratios_are_rejected() {
    let mut raw = RawSettings::default();
    raw.cache.sample_rate = 1.5;
    let err = Settings::from_raw(raw).expect_err("invalid");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "cache.sample_rate",
            ..
        }
    ));

    let mut raw = RawSettings::default();
    raw.cache.cleanup_threshold = 0.0;
    assert!(Settings::from_raw(raw).is_err());
}

#[test]
fn zero_sized_limits_are_rejected() {
    let mut raw = RawSettings::default();
    raw.cache.invalidation_queue_limit = 0;
    let err = Settings::from_raw(raw).expect_err("invalid");
    assert_eq!(err.code(), "CONFIG_INVALID");
}

#[test]
fn zero_port_is_rejected() {
    let mut raw = RawSettings::default();
    raw.server.port = Some(0);
    assert!(Settings::from_raw(raw).is_err());
}

#[test]
fn bad_export_endpoint_is_rejected() {
    let mut raw = RawSettings::default();
    raw.cache.export_endpoint = Some("not a url".to_string());
    assert!(Settings::from_raw(raw).is_err());
}

#[test]
fn default_to_serve_command() {
    let args = CliArgs::try_parse_from(["kessel"]).expect("parse");
    assert!(args.command.is_none());
}

#[test]
fn parse_serve_overrides() {
    let args = CliArgs::try_parse_from([
        "kessel",
        "serve",
        "--server-port",
        "8080",
        "--cache-etag-strategy",
        "weak",
        "--cache-enable-etag",
        "false",
        "--assets-root",
        "/srv/assets",
    ])
    .expect("parse");

    let Some(Command::Serve(serve)) = args.command else {
        panic!("expected serve command");
    };
    assert_eq!(serve.overrides.server_port, Some(8080));
    assert_eq!(serve.overrides.cache_etag_strategy, Some(EtagStrategy::Weak));
    assert_eq!(serve.overrides.cache_enable_etag, Some(false));
    assert_eq!(
        serve.overrides.assets_root,
        Some(PathBuf::from("/srv/assets"))
    );
}

#[test]
fn parse_manifest_commands() {
    let args = CliArgs::try_parse_from(["kessel", "manifest", "build", "public", "manifest.json"])
        .expect("parse");
    match args.command {
        Some(Command::Manifest(ManifestArgs {
            command: ManifestCommand::Build(build),
        })) => {
            assert_eq!(build.dir, PathBuf::from("public"));
            assert_eq!(build.out, PathBuf::from("manifest.json"));
        }
        other => panic!("unexpected command: {other:?}"),
    }

    let args = CliArgs::try_parse_from(["kessel", "manifest", "verify", "public", "m.json"])
        .expect("parse");
    assert!(matches!(
        args.command,
        Some(Command::Manifest(ManifestArgs {
            command: ManifestCommand::Verify(_)
        }))
    ));
}

#[test]
fn invalid_strategy_fails_to_parse() {
    let result =
        CliArgs::try_parse_from(["kessel", "serve", "--cache-etag-strategy", "sha1"]);
    assert!(result.is_err());
}
