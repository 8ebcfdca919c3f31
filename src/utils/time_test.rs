use std::thread::sleep;
use std::time::Duration;
use std::time::UNIX_EPOCH;

use crate::utils::get_now_as_millis;
use crate::utils::millis_since_epoch;
use crate::Clock;
use crate::ManualClock;
use crate::SystemClock;

#[test]
fn test_get_now_as_millis() {
    let t1 = get_now_as_millis();
    sleep(Duration::from_millis(10));
    let t2 = get_now_as_millis();

    assert!(t2 - t1 >= 10);
    assert!(t1 > 1_609_459_200_000); // Greater than 2021-01-01
}

#[test]
fn test_millis_since_epoch() {
    let t = UNIX_EPOCH + Duration::from_millis(1234);
    assert_eq!(millis_since_epoch(t), 1234);
}

#[test]
fn test_system_clock_moves_forward() {
    let clock = SystemClock;
    let t1 = clock.now_millis();
    sleep(Duration::from_millis(2));
    assert!(clock.now_millis() >= t1);
}

#[test]
fn test_manual_clock_only_moves_when_advanced() {
    let clock = ManualClock::new(1_000);
    assert_eq!(clock.now_millis(), 1_000);

    let shared = clock.clone();
    shared.advance(Duration::from_secs(2));
    assert_eq!(clock.now_millis(), 3_000);

    clock.set(10);
    assert_eq!(shared.now_millis(), 10);
}
