use crate::config::{SchedulingConfig, SuggestionRanking};
use crate::model::*;

use super::conflict::overlaps;

/// "час" / "часа" for the durations a booking can have.
pub fn hours_word(n: u8) -> &'static str {
    match n % 100 {
        11..=14 => "часов",
        _ => match n % 10 {
            1 => "час",
            2..=4 => "часа",
            _ => "часов",
        },
    }
}

pub fn describe_slot(start_time: &str, end_time: &str, duration: u8) -> String {
    format!("{start_time}–{end_time} ({duration} {})", hours_word(duration))
}

/// Free alternatives to a rejected `(requested_start, requested_duration)`.
///
/// Candidates are whole hours from the window start to the last start hour,
/// crossed with every allowed duration. The rejected pair itself, candidates
/// finishing after `latest_end_hour`, and anything overlapping an existing
/// booking are dropped. At most `max_suggestions` survivors are returned,
/// ordered by start time.
pub fn suggest_alternatives(
    existing: &[Booking],
    requested_start: &str,
    requested_duration: u8,
    config: &SchedulingConfig,
) -> Vec<Suggestion> {
    let requested = time_to_minutes(requested_start);
    let mut candidates: Vec<(u32, u8)> = Vec::new();
    for hour in config.window_start_hour..=config.last_start_hour {
        for &duration in &config.allowed_durations {
            let start_time = hour_label(hour);
            if requested == Some(hour * 60) && duration == requested_duration {
                continue;
            }
            if hour + u32::from(duration) > config.latest_end_hour {
                continue;
            }
            let free = existing
                .iter()
                .all(|b| !overlaps(&start_time, duration, &b.time, b.duration_hours));
            if free {
                candidates.push((hour, duration));
            }
        }
    }

    if config.suggestion_ranking == SuggestionRanking::Nearest
        && let Some(requested) = requested
    {
        // Stable: equal distances keep generation order (earlier, then shorter).
        candidates.sort_by_key(|(hour, _)| (hour * 60).abs_diff(requested));
    }
    candidates.truncate(config.max_suggestions);
    candidates.sort_by_key(|(hour, duration)| (*hour, *duration));

    candidates
        .into_iter()
        .map(|(hour, duration)| {
            let start_time = hour_label(hour);
            let end_time = hour_label(hour + u32::from(duration));
            Suggestion {
                description: describe_slot(&start_time, &end_time, duration),
                start_time,
                duration,
                end_time,
            }
        })
        .collect()
}

/// Bullet list appended to an overlap rejection.
pub fn format_suggestions(suggestions: &[Suggestion]) -> String {
    if suggestions.is_empty() {
        return "\n\n❌ К сожалению, на эту дату нет свободных слотов.".to_string();
    }
    let bullets: Vec<String> = suggestions
        .iter()
        .map(|s| format!("• {}", s.description))
        .collect();
    format!("\n\n💡 Доступные альтернативы:\n{}", bullets.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn booking(time: &str, duration_hours: u8) -> Booking {
        Booking {
            id: Ulid::new(),
            user_id: Ulid::new(),
            location_id: Ulid::new(),
            date: "2025-07-01".parse().unwrap(),
            time: time.into(),
            duration_hours,
            created_at: 0,
        }
    }

    fn earliest() -> SchedulingConfig {
        SchedulingConfig {
            suggestion_ranking: SuggestionRanking::Earliest,
            ..SchedulingConfig::default()
        }
    }

    fn pairs(suggestions: &[Suggestion]) -> Vec<(&str, u8)> {
        suggestions
            .iter()
            .map(|s| (s.start_time.as_str(), s.duration))
            .collect()
    }

    #[test]
    fn russian_plural() {
        assert_eq!(hours_word(1), "час");
        assert_eq!(hours_word(2), "часа");
        assert_eq!(hours_word(5), "часов");
        assert_eq!(describe_slot("13:00", "14:00", 1), "13:00–14:00 (1 час)");
        assert_eq!(describe_slot("15:00", "17:00", 2), "15:00–17:00 (2 часа)");
    }

    #[test]
    fn nearest_window_around_rejected_request() {
        let existing = [booking("14:00", 1)];
        let s = suggest_alternatives(&existing, "14:00", 2, &SchedulingConfig::default());
        assert_eq!(
            pairs(&s),
            vec![("12:00", 1), ("12:00", 2), ("13:00", 1), ("15:00", 1), ("15:00", 2)]
        );
        let descriptions: Vec<_> = s.iter().map(|s| s.description.as_str()).collect();
        assert!(descriptions.contains(&"13:00–14:00 (1 час)"));
        assert!(descriptions.contains(&"15:00–16:00 (1 час)"));
        assert!(descriptions.contains(&"12:00–14:00 (2 часа)"));
    }

    #[test]
    fn earliest_ranking_takes_start_of_day() {
        let existing = [booking("14:00", 1)];
        let s = suggest_alternatives(&existing, "14:00", 2, &earliest());
        assert_eq!(
            pairs(&s),
            vec![("09:00", 1), ("09:00", 2), ("10:00", 1), ("10:00", 2), ("11:00", 1)]
        );
    }

    #[test]
    fn requested_pair_never_suggested() {
        let existing = [booking("09:00", 2)];
        for config in [SchedulingConfig::default(), earliest()] {
            let s = suggest_alternatives(&existing, "11:00", 1, &config);
            assert!(!s.iter().any(|s| s.start_time == "11:00" && s.duration == 1));
            assert!(s.len() <= 5);
            assert!(s.windows(2).all(|w| w[0].start_time <= w[1].start_time));
        }
    }

    #[test]
    fn requested_pair_matched_by_clock_time_not_spelling() {
        let existing = [booking("10:00", 2)];
        for config in [SchedulingConfig::default(), earliest()] {
            let s = suggest_alternatives(&existing, "9:00", 1, &config);
            assert!(!s.iter().any(|s| s.start_time == "09:00" && s.duration == 1));
            assert!(s.iter().any(|s| s.start_time == "12:00"));
        }
    }

    #[test]
    fn no_two_hour_candidate_past_closing() {
        let existing: Vec<_> = (9..20).map(|h| booking(&hour_label(h), 1)).collect();
        let s = suggest_alternatives(&existing, "19:00", 1, &SchedulingConfig::default());
        assert_eq!(pairs(&s), vec![("20:00", 1)]);
        assert_eq!(s[0].end_time, "21:00");
    }

    #[test]
    fn full_day_yields_nothing() {
        let existing: Vec<_> = (9..21).map(|h| booking(&hour_label(h), 1)).collect();
        let s = suggest_alternatives(&existing, "10:00", 1, &SchedulingConfig::default());
        assert!(s.is_empty());
        assert!(format_suggestions(&s).contains("нет свободных слотов"));
    }

    #[test]
    fn bullet_format() {
        let s = suggest_alternatives(&[], "09:00", 1, &earliest());
        let text = format_suggestions(&s);
        assert!(text.starts_with("\n\n💡 Доступные альтернативы:\n• 09:00–11:00 (2 часа)"));
        assert_eq!(text.matches('•').count(), 5);
    }
}
