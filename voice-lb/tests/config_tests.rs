//! Tests for the balancer config file

use std::net::Ipv4Addr;

use voice_lb::config::{BalancerConfig, ChecksumSetting, SelectorSetting};
use voice_lb_common::{
    Backend, ChecksumMode, DEFAULT_RATE_LIMIT, LbConfig, MAX_BACKENDS, Pool, SelectorMode,
};

const SAMPLE: &str = include_str!("../voice-lb.toml");

#[test]
fn test_empty_file_uses_defaults() {
    let config = BalancerConfig::from_toml_str("").unwrap();

    assert_eq!(config, BalancerConfig::default());
    assert_eq!(config.lb_config(), LbConfig::DEFAULT);
    assert_eq!(config.rate_limit.requests_per_window, DEFAULT_RATE_LIMIT);
    assert_eq!(config.rate_limit.window_ms, 1000);
    assert!(config.signaling_backends.is_empty());
}

#[test]
fn test_sample_config_parses() {
    let config = BalancerConfig::from_toml_str(SAMPLE).unwrap();

    assert_eq!(config.signaling_backends.len(), 2);
    assert_eq!(config.api_backends.len(), 1);
    assert_eq!(config.selection.mode, SelectorSetting::Modulo);
    assert_eq!(config.checksum, ChecksumSetting::Offload);

    let table = config.backend_table(Pool::Signaling).unwrap();
    assert_eq!(table[0].addr, u32::from(Ipv4Addr::new(10, 0, 1, 10)));
    assert_eq!(table[1].mac(), Some([0x02, 0, 0, 0, 0x01, 0x0b]));
    assert!(table[2..].iter().all(|b| *b == Backend::EMPTY));
}

#[test]
fn test_lb_config_conversion() {
    let config = BalancerConfig::from_toml_str(
        r#"
        checksum = "incremental"

        [selection]
        mode = "maglev"
        signaling_slots = 4
        api_slots = 2

        [rate_limit]
        requests_per_window = 50
        window_ms = 250
        "#,
    )
    .unwrap();

    let lb = config.lb_config();
    assert_eq!(lb.selector_mode(), SelectorMode::Maglev);
    assert_eq!(lb.checksum_mode(), ChecksumMode::Incremental);
    assert_eq!(lb.slots(Pool::Signaling), 4);
    assert_eq!(lb.slots(Pool::Api), 2);
    assert_eq!(lb.rate_limit, 50);
    assert_eq!(lb.rate_window_ns, 250_000_000);
}

#[test]
fn test_explicit_slots() {
    let config = BalancerConfig::from_toml_str(
        r#"
        [[api_backends]]
        slot = 9
        address = "10.0.2.9"
        port = 8080
        weight = 5
        "#,
    )
    .unwrap();

    let table = config.backend_table(Pool::Api).unwrap();
    assert!(table[9].is_usable());
    assert_eq!(table[9].weight, 5);
    assert_eq!(table[9].mac(), None);
    assert_eq!(table.iter().filter(|b| b.is_usable()).count(), 1);
}

#[test]
fn test_rejects_invalid_configs() {
    let cases = [
        // Unspecified address
        "[[signaling_backends]]\naddress = \"0.0.0.0\"\nport = 5060\n",
        // Slot out of range
        "[[signaling_backends]]\nslot = 16\naddress = \"10.0.0.1\"\nport = 5060\n",
        // Slot used twice
        "[[api_backends]]\nslot = 1\naddress = \"10.0.0.1\"\nport = 1\n\
         [[api_backends]]\nslot = 1\naddress = \"10.0.0.2\"\nport = 1\n",
        // Empty media range
        "[ports]\nmedia_start = 20000\nmedia_end = 10000\n",
        // Zero slots
        "[selection]\nsignaling_slots = 0\n",
        // Too many slots
        "[selection]\napi_slots = 17\n",
        // Zero-length window
        "[rate_limit]\nwindow_ms = 0\n",
        // Bad MAC
        "[[signaling_backends]]\naddress = \"10.0.0.1\"\nport = 5060\nmac = \"02:00\"\n",
        // Unknown selector
        "[selection]\nmode = \"random\"\n",
        // Typo in a key
        "[rate_limit]\nrequests_per_second = 10\n",
        // Zero health threshold
        "[health]\nunhealthy_threshold = 0\n",
        // Zero health timeout
        "[health]\ntimeout_ms = 0\n",
    ];

    for case in cases {
        assert!(
            BalancerConfig::from_toml_str(case).is_err(),
            "accepted invalid config:\n{case}"
        );
    }
}

#[test]
fn test_sweep_can_be_disabled() {
    let config = BalancerConfig::from_toml_str("[rate_limit]\nsweep_interval_secs = 0\n").unwrap();
    assert!(config.sweep_interval().is_none());

    let config = BalancerConfig::default();
    assert_eq!(config.sweep_interval().map(|d| d.as_secs()), Some(30));
    assert_eq!(config.report_interval().as_secs(), 5);
    assert_eq!(config.selection.signaling_slots as u32, MAX_BACKENDS);
}

#[test]
fn test_health_policy() {
    let policy = BalancerConfig::default().health_policy();
    let (every, policy) = policy.unwrap();
    assert_eq!(every.as_secs(), 5);
    assert_eq!(policy.timeout.as_millis(), 2000);
    assert_eq!((policy.healthy_after, policy.unhealthy_after), (2, 3));

    let config = BalancerConfig::from_toml_str(SAMPLE).unwrap();
    assert!(config.health.enabled);

    // Thresholds are only checked when checks run.
    let config =
        BalancerConfig::from_toml_str("[health]\nenabled = false\nunhealthy_threshold = 0\n")
            .unwrap();
    assert!(config.health_policy().is_none());
}
