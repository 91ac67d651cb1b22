use std::sync::Arc;

use dd_compiler::{compile_json, BuildOptions};
use dd_core::{
    DataSet, DataSetError, DetectionConfig, EngineKind, Evidence, EvidencePrefix, MatchMethod, NoValueReason, Results,
};

const SAMPLE: &str = include_str!("data/sample.json");

const IPHONE: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0) Safari/604.1";
const WINDOWS: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) Chrome/90";
const PIXEL: &str = "Mozilla/5.0 (Linux; Android 13; Pixel 7) Chrome/120";
const GOOGLEBOT: &str = "Googlebot/2.1 (+http://www.google.com/bot.html)";

fn sample_bytes() -> Vec<u8> {
    compile_json(SAMPLE, &BuildOptions::default()).expect("sample should compile")
}

fn load(config: DetectionConfig) -> Arc<DataSet> {
    Arc::new(DataSet::from_memory(sample_bytes(), config).expect("sample should load"))
}

fn pattern() -> Arc<DataSet> {
    load(DetectionConfig::new().with_engine(EngineKind::Pattern))
}

fn value(results: &Results, name: &str) -> String {
    results
        .value_string(name, ", ")
        .unwrap_or_else(|reason| panic!("{name} has no value: {reason}"))
}

// =============================================================================
// Data set
// =============================================================================

#[test]
fn loads_catalog() {
    let data_set = load(DetectionConfig::new());
    assert_eq!(data_set.name(), "Sample");
    assert_eq!(data_set.header().build_id, 7);
    assert_eq!(data_set.header().published, 1_735_689_600);
    assert_eq!(data_set.component_count(), 4);
    assert_eq!(data_set.headers().len(), 3);
    assert_eq!(data_set.profile_count(), 14);

    let platform = &data_set.components()[1];
    assert_eq!(platform.name.as_ref(), "Platform");
    assert_eq!(platform.default_profile_id, 10);
    let first = data_set.header_index("sec-ch-ua-platform").expect("header should exist");
    assert_eq!(platform.headers.first(), Some(&first));

    assert!(data_set.property_by_name("screenpixelswidth").is_some());
    assert!(data_set.pattern().is_some());
    assert!(data_set.graphs().is_some());
}

#[test]
fn auto_engine_prefers_graphs() {
    use dd_core::ActiveEngine;
    assert_eq!(load(DetectionConfig::new()).engine(), ActiveEngine::Hash);
    assert_eq!(pattern().engine(), ActiveEngine::Pattern);
}

#[test]
fn rejects_other_format_version() {
    let mut bytes = sample_bytes();
    bytes[4] = 99;
    let err = DataSet::from_memory(bytes, DetectionConfig::new()).unwrap_err();
    assert!(matches!(err, DataSetError::IncorrectVersion { major: 99, .. }));
}

#[test]
fn detects_corruption_unless_crc_disabled() {
    let mut bytes = sample_bytes();
    // Published timestamp: covered by the checksum, never read structurally.
    bytes[36] ^= 0xff;

    let err = DataSet::from_memory(bytes.clone(), DetectionConfig::new()).unwrap_err();
    assert!(matches!(err, DataSetError::Crc32Mismatch { .. }));

    let mut config = DetectionConfig::new();
    config.collection.verify_crc = false;
    assert!(DataSet::from_memory(bytes, config).is_ok());
}

#[test]
fn required_properties_limit_values() {
    let data_set = load(DetectionConfig::new().with_properties("IsMobile, BrowserName"));
    assert_eq!(data_set.required_properties().len(), 2);

    let results = data_set.process_user_agent(IPHONE);
    assert_eq!(value(&results, "IsMobile"), "True");
    assert_eq!(value(&results, "BrowserName"), "Safari");
    assert_eq!(
        results.values_by_name("PlatformName").unwrap_err(),
        NoValueReason::InvalidProperty
    );
    assert_eq!(results.no_value_reason(2), Some(NoValueReason::InvalidProperty));
}

// =============================================================================
// Pattern engine
// =============================================================================

#[test]
fn pattern_matches_training_strings_exactly() {
    let data_set = pattern();
    let expected = [
        (IPHONE, "2-11-21-30"),
        (WINDOWS, "3-12-22-30"),
        (PIXEL, "4-13-23-30"),
        (GOOGLEBOT, "1-10-20-31"),
    ];
    for (user_agent, device_id) in expected {
        let results = data_set.process_user_agent(user_agent);
        assert_eq!(results.method(), MatchMethod::Exact, "{user_agent}");
        assert_eq!(results.difference(), 0, "{user_agent}");
        assert_eq!(results.device_id(), device_id, "{user_agent}");
    }

    let results = data_set.process_user_agent(IPHONE);
    assert_eq!(value(&results, "IsMobile"), "True");
    assert_eq!(value(&results, "HardwareModel"), "iPhone");
    assert_eq!(value(&results, "PlatformName"), "iOS");
    assert_eq!(value(&results, "BrowserVersion"), "17.0");
    assert_eq!(value(&results, "Features"), "webgl, webp");
}

#[test]
fn pattern_accepts_nearby_version_numbers() {
    let data_set = pattern();
    let results = data_set.process_user_agent("Mozilla/5.0 (Windows NT 10.0; Win64; x64) Chrome/93");
    assert_eq!(results.method(), MatchMethod::Numeric);
    assert_eq!(results.difference(), 3);
    assert_eq!(results.device_id(), "3-12-22-30");
    assert_eq!(value(&results, "BrowserVersion"), "90");

    let results = data_set.process_user_agent("Mozilla/5.0 (Windows NT 10.0; Win64; x64) Chrome/95");
    assert_eq!(results.method(), MatchMethod::Numeric);
    assert_eq!(results.difference(), 5);
}

#[test]
fn pattern_finds_moved_substrings() {
    let results = pattern().process_user_agent("Mozilla/5.0 (X; iPhone; CPU iPhone OS 17_0) Safari/604.1");
    assert_eq!(results.method(), MatchMethod::Nearest);
    assert_eq!(results.difference(), 3);
    assert_eq!(results.device_id(), "2-11-21-30");
}

#[test]
fn pattern_falls_back_to_closest_signature() {
    let user_agent = "Mozilla/5.0 (iPhonf; CPU iPhone OS 17_0) Safari/604.1";
    let results = pattern().process_user_agent(user_agent);
    assert_eq!(results.method(), MatchMethod::Closest);
    assert_eq!(results.difference(), 1);
    assert_eq!(value(&results, "HardwareModel"), "iPhone");

    let strict = load(DetectionConfig::new().with_engine(EngineKind::Pattern).with_max_difference(0));
    let results = strict.process_user_agent(user_agent);
    assert_eq!(
        results.values_by_name("BrowserName").unwrap_err(),
        NoValueReason::DifferenceExceeded
    );
    assert_eq!(results.device_id(), "0-0-0-0");

    let tolerant = load(DetectionConfig::new().with_engine(EngineKind::Pattern).with_max_difference(1));
    assert_eq!(value(&tolerant.process_user_agent(user_agent), "BrowserName"), "Safari");
}

#[test]
fn pattern_without_closest_phase_leaves_no_match() {
    let data_set = load(
        DetectionConfig::new()
            .with_engine(EngineKind::Pattern)
            .with_closest_signatures(0),
    );
    let results = data_set.process_user_agent("Mozilla/5.0 (iPhonf; CPU iPhone OS 17_0) Safari/604.1");
    assert_eq!(results.method(), MatchMethod::None);
    assert_eq!(results.values_by_name("IsMobile").unwrap_err(), NoValueReason::Unmatched);
}

#[test]
fn pattern_without_nodes_is_unmatched() {
    let data_set = pattern();
    for user_agent in ["\u{7f}", "x", ""] {
        let results = data_set.process_user_agent(user_agent);
        assert_eq!(results.method(), MatchMethod::None, "{user_agent:?}");
        assert_eq!(results.device_id(), "0-0-0-0");
    }
}

#[test]
fn pattern_reports_matched_characters() {
    let data_set = load(
        DetectionConfig::new()
            .with_engine(EngineKind::Pattern)
            .with_matched_user_agent(true),
    );
    let results = data_set.process_user_agent(WINDOWS);
    let matched = results.results()[0].matched_target.as_deref().expect("matched target");
    assert_eq!(matched.len(), WINDOWS.len());
    assert!(matched.starts_with("Mozilla/5.0 (Windows NT 10.0;"));
    assert!(matched.ends_with("Chrome/90"));
    assert!(matched.contains('_'));
}

// =============================================================================
// Hash engine
// =============================================================================

#[test]
fn graphs_match_user_agents() {
    let data_set = load(DetectionConfig::new());
    let results = data_set.process_user_agent(IPHONE);
    assert_eq!(results.method(), MatchMethod::Performance);
    assert_eq!(results.device_id(), "2-11-21-30");
    assert_eq!(value(&results, "ScreenPixelsWidth"), "390");

    let results = data_set.process_user_agent(PIXEL);
    assert_eq!(results.device_id(), "4-13-23-30");
    assert_eq!(value(&results, "HardwareModel"), "Pixel 7");

    let results = data_set.process_user_agent(GOOGLEBOT);
    assert_eq!(value(&results, "IsCrawler"), "True");
    assert_eq!(results.device_id(), "0-0-0-31");
}

#[test]
fn client_hints_take_precedence_over_user_agent() {
    let data_set = load(DetectionConfig::new());
    let mut evidence = Evidence::new();
    evidence.add(EvidencePrefix::HEADER, "User-Agent", PIXEL);
    evidence.add(EvidencePrefix::HEADER, "Sec-CH-UA-Platform", "\"Windows\"");
    evidence.add(
        EvidencePrefix::HEADER,
        "Sec-CH-UA",
        "\"Chromium\";v=\"120\", \"Google Chrome\";v=\"120\"",
    );

    let results = data_set.process_evidence(&evidence);
    assert_eq!(results.len(), 3);
    assert_eq!(results.device_id(), "4-12-23-30");
    assert_eq!(value(&results, "PlatformName"), "Windows");
    assert_eq!(value(&results, "BrowserVersion"), "120");
}

#[test]
fn query_evidence_shadows_headers() {
    let data_set = load(DetectionConfig::new());
    let evidence: Evidence = [("header.User-Agent", WINDOWS), ("query.User-Agent", IPHONE)]
        .into_iter()
        .collect();
    assert_eq!(data_set.process_evidence(&evidence).device_id(), "2-11-21-30");
}

#[test]
fn difference_tolerates_hash_distance() {
    let user_agent = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) Chrome/93";

    let results = load(DetectionConfig::new()).process_user_agent(user_agent);
    assert_eq!(results.device_id(), "3-12-0-30");
    assert_eq!(results.values_by_name("BrowserName").unwrap_err(), NoValueReason::NullProfile);

    let results = load(DetectionConfig::new().with_difference(3)).process_user_agent(user_agent);
    assert_eq!(results.device_id(), "3-12-22-30");
    assert_eq!(results.difference(), 3);

    let results = load(DetectionConfig::new().with_difference(3).with_max_difference(2)).process_user_agent(user_agent);
    assert_eq!(
        results.values_by_name("IsMobile").unwrap_err(),
        NoValueReason::DifferenceExceeded
    );
}

#[test]
fn drift_tolerates_shifted_substrings() {
    let user_agent = "Mozilla/5.0 (X; iPhone; CPU iPhone OS 17_0) Safari/604.1";

    let results = load(DetectionConfig::new()).process_user_agent(user_agent);
    assert_eq!(results.method(), MatchMethod::Predictive);
    assert_eq!(results.device_id(), "2-0-0-30");

    let results = load(DetectionConfig::new().with_drift(5)).process_user_agent(user_agent);
    assert_eq!(results.method(), MatchMethod::Performance);
    assert_eq!(results.device_id(), "2-11-21-30");
    assert_eq!(results.drift(), 3);

    let results = load(DetectionConfig::new().with_drift(5).with_max_drift(1)).process_user_agent(user_agent);
    assert_eq!(results.device_id(), "0-0-0-0");
    assert_eq!(results.values_by_name("IsMobile").unwrap_err(), NoValueReason::DriftExceeded);

    let results = load(DetectionConfig::new().with_drift(5).with_max_drift(3)).process_user_agent(user_agent);
    assert_eq!(results.device_id(), "2-11-21-30");
    assert_eq!(value(&results, "BrowserName"), "Safari");
}

#[test]
fn difference_threshold_is_inclusive() {
    let data_set = load(DetectionConfig::new().with_max_difference(2));
    let mut results = data_set.process_user_agent(IPHONE);
    assert_eq!(results.difference(), 0);

    results.result_mut(0).expect("one result").difference = 2;
    assert!(results.values_by_name("IsMobile").is_ok());

    results.result_mut(0).expect("one result").difference = 3;
    assert_eq!(
        results.values_by_name("IsMobile").unwrap_err(),
        NoValueReason::DifferenceExceeded
    );
    assert_eq!(results.device_id(), "0-0-0-0");
}

#[test]
fn predictive_graph_follows_failed_performance_graph() {
    let user_agent = "Mozilla/5.0 (X11; Ubuntu) iPhone";

    let results = load(DetectionConfig::new()).process_user_agent(user_agent);
    assert_eq!(results.method(), MatchMethod::Predictive);
    assert_eq!(results.device_id(), "2-0-0-30");

    let results = load(DetectionConfig::new().with_graphs(true, false)).process_user_agent(user_agent);
    assert_eq!(results.method(), MatchMethod::Performance);
    assert_eq!(results.device_id(), "0-0-0-30");

    let results = load(DetectionConfig::new().with_graphs(false, true)).process_user_agent(IPHONE);
    assert_eq!(results.method(), MatchMethod::Predictive);
    assert_eq!(results.device_id(), "2-0-0-0");
}

#[test]
fn graphs_report_matched_characters() {
    let data_set = load(DetectionConfig::new().with_matched_user_agent(true));
    let results = data_set.process_user_agent(IPHONE);
    assert_eq!(
        results.results()[0].matched_target.as_deref(),
        Some("Mozilla/_____iPhone______________________Safari/_____")
    );
}

#[test]
fn unmatched_uses_default_profiles_when_allowed() {
    let results = load(DetectionConfig::new()).process_user_agent("x");
    assert_eq!(results.method(), MatchMethod::None);
    assert_eq!(results.device_id(), "0-0-0-0");
    assert_eq!(results.values_by_name("IsMobile").unwrap_err(), NoValueReason::Unmatched);

    let results = load(DetectionConfig::new().with_allow_unmatched(true)).process_user_agent("x");
    assert_eq!(results.device_id(), "1-10-20-30");
    assert_eq!(value(&results, "IsMobile"), "False");
    assert_eq!(value(&results, "BrowserName"), "Unknown");
}

#[test]
fn empty_evidence_has_no_results() {
    let results = load(DetectionConfig::new()).process_evidence(&Evidence::new());
    assert!(results.is_empty());
    assert_eq!(results.values_by_name("IsMobile").unwrap_err(), NoValueReason::NoResults);
}

#[test]
fn processing_is_repeatable() {
    let data_set = load(DetectionConfig::new());
    let evidence: Evidence = [
        ("header.User-Agent", PIXEL),
        ("header.Sec-CH-UA-Platform", "\"Android\""),
    ]
    .into_iter()
    .collect();

    let first = data_set.process_evidence(&evidence);
    let second = data_set.process_evidence(&evidence);
    assert_eq!(first.device_id(), second.device_id());
    assert_eq!(first.results(), second.results());
    assert_eq!(value(&first, "Features"), value(&second, "Features"));
}

// =============================================================================
// Overrides
// =============================================================================

#[test]
fn profile_ids_override_matched_profiles() {
    let data_set = load(DetectionConfig::new());
    let evidence: Evidence = [
        ("header.User-Agent", IPHONE),
        ("cookie.51D_ProfileIds", "3"),
        ("query.51D_ProfileIds", "4|13"),
    ]
    .into_iter()
    .collect();

    let results = data_set.process_evidence(&evidence);
    assert_eq!(results.device_id(), "4-13-21-30");
    assert_eq!(value(&results, "HardwareModel"), "Pixel 7");
    assert!(results.results()[0].is_overridden(0));
    assert!(!results.results()[0].is_overridden(2));
}

#[test]
fn profile_overrides_apply_without_match() {
    let data_set = load(DetectionConfig::new());
    let evidence: Evidence = [("query.51D_deviceId", "3-12-bogus-999")].into_iter().collect();

    let results = data_set.process_evidence(&evidence);
    assert_eq!(results.len(), 1);
    assert_eq!(results.device_id(), "3-12-0-0");
    assert_eq!(value(&results, "PlatformName"), "Windows");
}

#[test]
fn property_overrides_replace_values() {
    let data_set = load(DetectionConfig::new());
    let evidence: Evidence = [
        ("header.User-Agent", IPHONE),
        ("query.51D_ScreenPixelsWidth", "800"),
        ("cookie.51D_ScreenPixelsWidth", "640"),
        ("query.51D_BrowserName", "Netscape"),
    ]
    .into_iter()
    .collect();

    let results = data_set.process_evidence(&evidence);
    assert_eq!(value(&results, "ScreenPixelsWidth"), "800");
    assert_eq!(value(&results, "ScreenPixelsWidthJavaScript"), "");
    assert_eq!(value(&results, "BrowserName"), "Safari");

    let plain = data_set.process_user_agent(IPHONE);
    assert_eq!(value(&plain, "ScreenPixelsWidthJavaScript"), "screen.width");
}

#[test]
fn client_hint_snippet_is_suppressed_by_hint_headers() {
    let data_set = load(DetectionConfig::new());

    let mut evidence = Evidence::from_user_agent(PIXEL);
    evidence.add(EvidencePrefix::HEADER, "Sec-CH-UA-Platform", "\"Android\"");
    let results = data_set.process_evidence(&evidence);
    assert_eq!(value(&results, "ClientHintsJavaScript"), "getHighEntropyValues()");

    evidence.add(EvidencePrefix::HEADER, "Sec-CH-UA", "\"Google Chrome\";v=\"120\"");
    let results = data_set.process_evidence(&evidence);
    assert_eq!(value(&results, "ClientHintsJavaScript"), "");
}

// =============================================================================
// Device ids
// =============================================================================

#[test]
fn device_id_round_trips() {
    let data_set = load(DetectionConfig::new());
    let matched = data_set.process_user_agent(PIXEL);
    let device_id = matched.device_id();

    let results = data_set.process_device_id(&device_id);
    assert_eq!(results.device_id(), device_id);
    assert_eq!(value(&results, "HardwareModel"), "Pixel 7");
    assert_eq!(value(&results, "Features"), "webgl, webp, avif");
}

#[test]
fn device_id_ignores_unusable_segments() {
    let data_set = load(DetectionConfig::new());
    assert_eq!(data_set.process_device_id("3-11").device_id(), "3-11-0-0");
    assert_eq!(data_set.process_device_id("11-2").device_id(), "0-0-0-0");
    assert_eq!(data_set.process_device_id("x-12-0-500").device_id(), "0-12-0-0");
    assert_eq!(data_set.process_device_id("").device_id(), "0-0-0-0");
}
