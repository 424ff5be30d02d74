//! Tests for five-field cron parsing and next-fire computation.

use chrono::{Datelike, TimeZone, Timelike, Utc};
use mcall::engine::schedule::{next_fire, parse};

#[test]
fn every_minute_fires_within_sixty_seconds() {
    let schedule = parse("* * * * *").unwrap();
    let after = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 30).unwrap();
    let fire = next_fire(&schedule, after).unwrap();
    assert!(fire > after);
    assert!((fire - after).num_seconds() <= 60);
    assert_eq!(fire.second(), 0);
}

#[test]
fn daily_at_midnight() {
    let schedule = parse("0 0 * * *").unwrap();
    let after = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
    let fire = next_fire(&schedule, after).unwrap();
    assert_eq!((fire.day(), fire.hour(), fire.minute()), (2, 0, 0));
}

#[test]
fn fire_is_strictly_after_anchor() {
    let schedule = parse("* * * * *").unwrap();
    let on_the_minute = Utc.with_ymd_and_hms(2026, 3, 1, 12, 5, 0).unwrap();
    let fire = next_fire(&schedule, on_the_minute).unwrap();
    assert!(fire > on_the_minute);
}

#[test]
fn rejects_wrong_field_count() {
    let err = parse("* * * *").unwrap_err().to_string();
    assert!(err.contains("five fields"), "got: {}", err);
    let err = parse("0 * * * * *").unwrap_err().to_string();
    assert!(err.contains("five fields"), "got: {}", err);
}

#[test]
fn rejects_malformed_expression() {
    assert!(parse("not a cron").is_err());
    assert!(parse("61 * * * *").is_err());
}
