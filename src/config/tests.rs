use std::io::Write;

use clap::Parser;
use serial_test::serial;

use super::*;

fn parse(args: &[&str]) -> CliArgs {
    CliArgs::parse_from(args)
}

#[test]
fn defaults_are_valid() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");

    assert_eq!(settings.server.addr.to_string(), "127.0.0.1:3000");
    assert_eq!(settings.server.graceful_shutdown, Duration::from_secs(30));
    assert_eq!(settings.cache.directory, PathBuf::from(DEFAULT_CACHE_DIR));
    assert_eq!(settings.cache.max_workers.get(), 2);
    assert_eq!(settings.cache.purge_interval, Duration::from_secs(60));
    assert_eq!(settings.cache.default_ttl, Duration::from_secs(300));
    assert!(settings.cache.routes.is_empty());
    assert_eq!(settings.render.content_dir, PathBuf::from("content"));
    assert_eq!(settings.logging.level, LevelFilter::INFO);
}

#[test]
fn cli_overrides_take_highest_precedence() {
    let mut raw = RawSettings::default();
    raw.server.port = Some(4000);
    raw.logging.level = Some("info".to_string());
    raw.cache.max_workers = Some(8);

    let overrides = ServeOverrides {
        server_port: Some(4321),
        log_level: Some("debug".to_string()),
        cache: CacheOverrides {
            max_workers: Some(3),
            ..Default::default()
        },
        ..Default::default()
    };

    raw.apply_serve_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.server.addr.port(), 4321);
    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
    assert_eq!(settings.cache.max_workers.get(), 3);
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
fn zero_workers_is_rejected() {
    let mut raw = RawSettings::default();
    raw.cache.max_workers = Some(0);

    let err = Settings::from_raw(raw).expect_err("zero workers invalid");
    assert!(matches!(err, LoadError::Invalid { key: "cache.max_workers", .. }));
}

#[test]
fn zero_durations_are_rejected() {
    let mut raw = RawSettings::default();
    raw.cache.default_ttl_seconds = Some(0);
    let err = Settings::from_raw(raw).expect_err("zero ttl invalid");
    assert!(matches!(err, LoadError::Invalid { key: "cache.default_ttl_seconds", .. }));

    let mut raw = RawSettings::default();
    raw.cache.purge_interval_seconds = Some(0);
    let err = Settings::from_raw(raw).expect_err("zero interval invalid");
    assert!(matches!(err, LoadError::Invalid { key: "cache.purge_interval_seconds", .. }));
}

#[test]
fn invalid_log_level_is_rejected() {
    let mut raw = RawSettings::default();
    raw.logging.level = Some("loud".to_string());

    let err = Settings::from_raw(raw).expect_err("bad level");
    assert!(matches!(err, LoadError::Invalid { key: "logging.level", .. }));
}

#[test]
fn route_rules_are_validated() {
    let mut raw = RawSettings::default();
    raw.cache.routes = Some(vec![RouteRule {
        prefix: "events".to_string(),
        ttl_seconds: 60,
        category: None,
        exact: false,
    }]);
    let err = Settings::from_raw(raw).expect_err("relative prefix invalid");
    assert!(matches!(err, LoadError::Invalid { key: "cache.routes.prefix", .. }));

    let mut raw = RawSettings::default();
    raw.cache.routes = Some(vec![RouteRule {
        prefix: "/events".to_string(),
        ttl_seconds: 0,
        category: None,
        exact: false,
    }]);
    let err = Settings::from_raw(raw).expect_err("zero rule ttl invalid");
    assert!(matches!(err, LoadError::Invalid { key: "cache.routes.ttl_seconds", .. }));
}

#[test]
#[serial]
fn loads_config_file_with_routes() {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp config");
    write!(
        file,
        r#"
[server]
port = 8080

[cache]
directory = "/var/cache/isr"
max_workers = 4

[[cache.routes]]
prefix = "/"
exact = true
ttl_seconds = 60

[[cache.routes]]
prefix = "/events"
ttl_seconds = 120
category = "events"
"#
    )
    .expect("write config");

    let path = file.path().to_string_lossy().into_owned();
    let cli = parse(&["isr", "--config-file", path.as_str()]);
    let settings = load(&cli).expect("settings load");

    assert_eq!(settings.server.addr.port(), 8080);
    assert_eq!(settings.cache.directory, PathBuf::from("/var/cache/isr"));
    assert_eq!(settings.cache.max_workers.get(), 4);
    assert_eq!(settings.cache.routes.len(), 2);
    assert!(settings.cache.routes[0].exact);
    assert_eq!(settings.cache.routes[1].category.as_deref(), Some("events"));
}

#[test]
#[serial]
fn environment_overrides_defaults() {
    // SAFETY: serialized with the other environment-reading tests.
    unsafe { std::env::set_var("ISR__CACHE__DEFAULT_TTL_SECONDS", "42") };
    let result = load(&parse(&["isr"]));
    unsafe { std::env::remove_var("ISR__CACHE__DEFAULT_TTL_SECONDS") };

    let settings = result.expect("settings load");
    assert_eq!(settings.cache.default_ttl, Duration::from_secs(42));
}

#[test]
fn default_to_serve_command() {
    let args = parse(&["isr"]);
    let command = args
        .command
        .unwrap_or(Command::Serve(Box::<ServeArgs>::default()));
    assert!(matches!(command, Command::Serve(_)));
}

#[test]
fn parse_serve_overrides() {
    let args = parse(&[
        "isr",
        "serve",
        "--server-host",
        "0.0.0.0",
        "--cache-max-workers",
        "6",
        "--render-content-dir",
        "/srv/pages",
    ]);

    match args.command.expect("serve command") {
        Command::Serve(serve) => {
            assert_eq!(serve.overrides.server_host.as_deref(), Some("0.0.0.0"));
            assert_eq!(serve.overrides.cache.max_workers, Some(6));
            assert_eq!(
                serve.overrides.content_dir.as_deref(),
                Some(std::path::Path::new("/srv/pages"))
            );
        }
        _ => panic!("wrong command parsed"),
    }
}

#[test]
fn parse_purge_arguments() {
    let args = parse(&["isr", "purge", "--cache-directory", "/tmp/isr"]);

    match args.command.expect("purge command") {
        Command::Purge(purge) => {
            assert_eq!(
                purge.directory.as_deref(),
                Some(std::path::Path::new("/tmp/isr"))
            );
        }
        _ => panic!("wrong command parsed"),
    }
}
