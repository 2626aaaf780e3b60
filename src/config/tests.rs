use super::*;

fn raw() -> RawSettings {
    RawSettings::default()
}

#[test]
fn defaults_resolve() {
    let settings = Settings::from_raw(raw()).expect("defaults are valid");

    assert!(settings.database.url.is_none());
    assert_eq!(settings.queue.batch_size, 5);
    assert_eq!(settings.queue.visibility_timeout, Duration::from_secs(30));
    assert_eq!(settings.queue.max_receive_count, 5);
    assert_eq!(settings.queue.batch_deadline, Duration::from_secs(30));
    assert_eq!(settings.regeneration.origin_scheme, "https");
    assert_eq!(settings.regeneration.default_ttl, Duration::from_secs(300));
    assert_eq!(settings.cdn.fragment_suffix, "frag");
    assert_eq!(settings.cdn.data_prefix, "_data");
    assert_eq!(settings.cdn.failure_mode, PurgeFailureMode::WholeBatch);
    assert!(settings.cdn.distribution_id.is_none());
}

#[test]
fn zero_batch_size_is_rejected() {
    let mut raw = raw();
    raw.queue.batch_size = Some(0);
    assert!(Settings::from_raw(raw).is_err());
}

#[test]
fn zero_visibility_timeout_is_rejected() {
    let mut raw = raw();
    raw.queue.visibility_timeout_seconds = Some(0);
    assert!(Settings::from_raw(raw).is_err());
}

#[test]
fn invalid_cdn_endpoint_is_rejected() {
    let mut raw = raw();
    raw.cdn.endpoint = Some("not a url".to_string());
    assert!(Settings::from_raw(raw).is_err());
}

#[test]
fn failure_mode_parses_both_variants() {
    let mut raw_whole = raw();
    raw_whole.cdn.failure_mode = Some("whole_batch".to_string());
    let settings = Settings::from_raw(raw_whole).expect("valid");
    assert_eq!(settings.cdn.failure_mode, PurgeFailureMode::WholeBatch);

    let mut raw_per = raw();
    raw_per.cdn.failure_mode = Some("per_message".to_string());
    let settings = Settings::from_raw(raw_per).expect("valid");
    assert_eq!(settings.cdn.failure_mode, PurgeFailureMode::PerMessage);

    let mut raw_bad = raw();
    raw_bad.cdn.failure_mode = Some("maybe".to_string());
    assert!(Settings::from_raw(raw_bad).is_err());
}

#[test]
fn route_ttl_prefixes_must_be_absolute() {
    let mut raw_ok = raw();
    raw_ok.regeneration.route_ttls = Some(BTreeMap::from([("/blog".to_string(), 600)]));
    let settings = Settings::from_raw(raw_ok).expect("valid");
    assert_eq!(
        settings.regeneration.route_ttls.get("/blog"),
        Some(&Duration::from_secs(600))
    );

    let mut raw_bad = raw();
    raw_bad.regeneration.route_ttls = Some(BTreeMap::from([("blog".to_string(), 600)]));
    assert!(Settings::from_raw(raw_bad).is_err());
}

#[test]
fn serve_overrides_take_precedence() {
    let mut raw = raw();
    raw.database.url = Some("postgres://file".to_string());
    raw.apply_serve_overrides(&ServeOverrides {
        database_url: Some("postgres://cli".to_string()),
        queue_batch_size: Some(10),
        cdn_distribution_id: Some("D42".to_string()),
        ..Default::default()
    });

    let settings = Settings::from_raw(raw).expect("valid");
    assert_eq!(settings.database.url.as_deref(), Some("postgres://cli"));
    assert_eq!(settings.queue.batch_size, 10);
    assert_eq!(settings.cdn.distribution_id.as_deref(), Some("D42"));
}

#[test]
fn invalid_log_level_is_rejected() {
    let mut raw = raw();
    raw.logging.level = Some("loud".to_string());
    assert!(Settings::from_raw(raw).is_err());
}
