//! Phase relay factory rules: the same binary runs on several hosts, only
//! the one owning the contactor gets an active relay.

use pvcontrol::relay::{PhaseRelay as _, PhaseRelayFactory};

async fn enabled(tag: &str, hostname: &str, config: serde_json::Value) -> bool {
    let relay = PhaseRelayFactory::new_phase_relay(tag, hostname, &config).unwrap();
    let relay = relay.lock().await;
    relay.is_enabled()
}

#[tokio::test]
async fn relay_active_only_on_owning_host() {
    let cfg = serde_json::json!({"installed_on_host": "raspi"});
    assert!(enabled("Simulated", "raspi", cfg.clone()).await);
    assert!(!enabled("Simulated", "other-host", cfg).await);

    // empty installed_on_host: every host owns the relay
    assert!(enabled("Simulated", "any-host", serde_json::json!({})).await);
}

#[tokio::test]
async fn relay_disabled_by_config_or_tag() {
    let cfg = serde_json::json!({"enable_phase_switching": false});
    assert!(!enabled("Simulated", "raspi", cfg).await);
    assert!(!enabled("Disabled", "raspi", serde_json::json!({})).await);
}

#[tokio::test]
async fn unknown_relay_tag_fails_fast() {
    let res = PhaseRelayFactory::new_phase_relay("Gpio9000", "raspi", &serde_json::Value::Null);
    assert!(res.is_err());
}

#[tokio::test]
async fn disabled_relay_reports_zero_phases() {
    let relay =
        PhaseRelayFactory::new_phase_relay("Simulated", "other", &serde_json::json!({"installed_on_host": "raspi"}))
            .unwrap();
    let mut relay = relay.lock().await;
    assert_eq!(relay.get_phases(), 0);
    relay.set_phases(3);
    assert_eq!(relay.get_phases(), 0);
    assert_eq!(relay.get_data().phases, 0);
    assert!(!relay.get_data().enabled);
}
