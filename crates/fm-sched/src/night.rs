use chrono::{DateTime, FixedOffset, Timelike, Utc};
use fm_core::types::BeadType;

/// Local hours `[22, 07)` are night hours.
pub fn is_night_hour(hour: u32) -> bool {
    hour >= 22 || hour < 7
}

/// During night hours only bug and task beads stay eligible; everything else
/// is deferred to the morning.
pub fn night_blocks(bead_type: BeadType, hour: u32) -> bool {
    is_night_hour(hour) && !matches!(bead_type, BeadType::Bug | BeadType::Task)
}

/// Hour-of-day in the scheduler's configured offset, falling back to the
/// host's local timezone.
pub fn local_hour(now: DateTime<Utc>, utc_offset_mins: Option<i32>) -> u32 {
    match utc_offset_mins.and_then(|m| FixedOffset::east_opt(m * 60)) {
        Some(offset) => now.with_timezone(&offset).hour(),
        None => now.with_timezone(&chrono::Local).hour(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn night_window_edges() {
        assert!(is_night_hour(22));
        assert!(is_night_hour(23));
        assert!(is_night_hour(0));
        assert!(is_night_hour(6));
        assert!(!is_night_hour(7));
        assert!(!is_night_hour(21));
    }

    #[test]
    fn only_bug_and_task_pass_at_night() {
        assert!(!night_blocks(BeadType::Task, 22));
        assert!(!night_blocks(BeadType::Bug, 3));
        assert!(night_blocks(BeadType::Feature, 22));
        assert!(night_blocks(BeadType::Epic, 22));
        assert!(!night_blocks(BeadType::Feature, 12));
    }

    #[test]
    fn configured_offset_is_respected() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 21, 30, 0).unwrap();
        assert_eq!(local_hour(now, Some(60)), 22);
        assert_eq!(local_hour(now, Some(0)), 21);
    }
}
