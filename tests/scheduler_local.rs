use relimit::scheduler::DEFAULT_SWEEP_INTERVAL;
use relimit::{LocalScheduler, LocalSchedulerConfig, ManualClock, Rate, RateScheduler};
use std::time::Duration;

fn scheduler(intervals: usize, clock: &ManualClock) -> LocalScheduler<String> {
    let config = LocalSchedulerConfig::new(intervals, DEFAULT_SWEEP_INTERVAL).unwrap();
    LocalScheduler::with_clock(config, clock.clone())
}

fn rate(count: u32, period_ms: u64) -> Rate {
    Rate::new(count, Duration::from_millis(period_ms)).unwrap()
}

#[tokio::test]
async fn new_key_is_scheduled_immediately() {
    let clock = ManualClock::new(1_234_010);
    let sch = scheduler(5, &clock);

    let delay = sch.schedule(&"key".to_string(), rate(10, 1000)).await.unwrap();
    assert_eq!(delay, Duration::ZERO);
}

#[tokio::test]
async fn bursts_spill_into_following_periods() {
    let clock = ManualClock::new(1_234_010);
    let sch = scheduler(4, &clock);
    let key = "key".to_string();

    let mut delays = Vec::new();
    for _ in 0..10 {
        delays.push(sch.schedule(&key, rate(3, 1000)).await.unwrap().as_millis());
    }

    assert_eq!(delays, vec![0, 0, 0, 990, 990, 990, 1990, 1990, 1990, 2990]);
}

#[tokio::test]
async fn bucket_start_follows_the_clock() {
    let times: [u64; 10] = [
        1507736110897,
        1507736110899,
        1507736110900,
        1507736110900,
        1507736110902,
        1507736110951,
        1507736110952,
        1507736110953,
        1507736110953,
        1507736110954,
    ];
    let clock = ManualClock::new(times[0]);
    let sch = scheduler(8, &clock);
    let key = "key".to_string();

    let mut result = Vec::new();
    for ts in times {
        clock.set(ts);
        let delay = sch.schedule(&key, rate(3, 80)).await.unwrap();
        result.push(delay.as_millis() as u64 + ts - times[0]);
    }

    assert_eq!(result, vec![0, 2, 3, 73, 73, 83, 153, 153, 163, 233]);
}

#[tokio::test]
async fn keys_are_limited_independently() {
    let clock = ManualClock::new(0);
    let sch = scheduler(4, &clock);

    assert_eq!(sch.reserve(&"a".to_string(), rate(1, 1000)), Duration::ZERO);
    assert_eq!(sch.reserve(&"b".to_string(), rate(1, 1000)), Duration::ZERO);
    assert!(sch.reserve(&"a".to_string(), rate(1, 1000)) > Duration::ZERO);
    assert_eq!(sch.window_count(), 2);
}
