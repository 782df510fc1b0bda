use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crawlpool::{
    HealthFlag, LocalState, ProxyEntry, ProxyItem, ProxyItemConfig, ProxyState, RetireReason,
    Validity,
};

fn epoch_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs_f64()
}

fn item_with(cfg: ProxyItemConfig) -> (ProxyItem, Arc<LocalState>) {
    let state = Arc::new(LocalState::default());
    let entry = ProxyEntry::from_id("1.2.3.4:8080");
    let item = ProxyItem::new(entry, Arc::new(cfg), state.clone());
    (item, state)
}

fn no_probe_cfg() -> ProxyItemConfig {
    ProxyItemConfig {
        valid_timeout: 0,
        ..Default::default()
    }
}

#[tokio::test]
async fn fresh_item_is_valid() {
    let (item, _) = item_with(no_probe_cfg());
    assert_eq!(item.is_valid(false).await, Validity::Valid { probed: true });
}

#[tokio::test]
async fn exhausted_after_max_use() {
    let cfg = ProxyItemConfig {
        max_use: 2,
        ..no_probe_cfg()
    };
    let (item, _) = item_with(cfg);
    item.checkout();
    item.checkout();
    assert_eq!(
        item.is_valid(false).await,
        Validity::Invalid(RetireReason::Exhausted)
    );
}

#[tokio::test]
async fn discarded_flag_is_invalid() {
    let (item, state) = item_with(no_probe_cfg());
    state.set_flag(HealthFlag::Discarded).await;
    assert_eq!(
        item.is_valid(false).await,
        Validity::Invalid(RetireReason::Discarded)
    );
}

#[tokio::test]
async fn delayed_within_bench_window() {
    let (item, state) = item_with(no_probe_cfg());
    state.set_flag(HealthFlag::Delayed).await;
    state.set_flag_ts(epoch_now()).await;
    assert_eq!(item.is_valid(false).await, Validity::Delay);
}

#[tokio::test]
async fn delayed_self_resets_once_bench_elapses() {
    let (item, state) = item_with(no_probe_cfg());
    state.set_flag(HealthFlag::Delayed).await;
    // Benched far in the past, so the delay has long elapsed.
    state.set_flag_ts(0.0).await;
    assert_eq!(item.is_valid(false).await, Validity::Valid { probed: true });
    assert_eq!(state.flag().await, HealthFlag::Active);
}

#[tokio::test]
async fn recent_probe_is_trusted_without_reprobing() {
    // Probing is enabled here, but a probe timestamp inside the check
    // interval short-circuits before any network activity.
    let cfg = ProxyItemConfig {
        valid_timeout: 20,
        check_interval: Duration::from_secs(180),
        ..Default::default()
    };
    let (item, _) = item_with(cfg);
    item.seed_probe_ts(epoch_now());
    assert_eq!(item.is_valid(false).await, Validity::Valid { probed: false });
}

#[tokio::test]
async fn use_interval_benches_rapid_reuse() {
    let cfg = ProxyItemConfig {
        use_interval: Some(Duration::from_secs(60)),
        ..no_probe_cfg()
    };
    let (item, state) = item_with(cfg);
    state.set_use_ts(epoch_now()).await;
    assert_eq!(item.is_valid(false).await, Validity::Delay);
}
