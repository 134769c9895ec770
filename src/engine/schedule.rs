use crate::config::SchedulingConfig;
use crate::model::*;

// ── Schedule grid ─────────────────────────────────────────────────

/// Build the hourly grid for one location/date, one slot per hour from
/// `window_start_hour` to `window_end_hour` inclusive.
///
/// 2-hour bookability depends on the successor slot, which does not exist
/// yet while the first pass runs; the second pass settles it over the
/// finished sequence. The last slot has no successor and keeps its
/// first-pass value.
pub fn build_schedule(bookings: &[Booking], config: &SchedulingConfig) -> Vec<ScheduleSlot> {
    let spans: Vec<(&Booking, Span)> = bookings
        .iter()
        .filter_map(|b| match b.span() {
            Some(span) => Some((b, span)),
            None => {
                tracing::warn!("booking {} has unparseable time {:?}; left off the grid", b.id, b.time);
                None
            }
        })
        .collect();

    let mut schedule: Vec<ScheduleSlot> = (config.window_start_hour..=config.window_end_hour)
        .map(|hour| {
            let occupying = spans
                .iter()
                .find(|(_, span)| span.contains_minute(hour * 60))
                .map(|(b, _)| (*b).clone());
            let occupied = occupying.is_some();
            ScheduleSlot {
                hour,
                time: hour_label(hour),
                occupied,
                booking: occupying,
                can_book_1h: !occupied,
                can_book_2h: !occupied && hour < config.two_hour_gate_hour,
            }
        })
        .collect();

    for i in 0..schedule.len().saturating_sub(1) {
        if !schedule[i].occupied {
            schedule[i].can_book_2h = !schedule[i + 1].occupied;
        }
    }

    schedule
}

/// Text rendering of a grid for chat clients.
///
/// Occupied hours collapse into one line per booking; free hours list the
/// durations that fit.
pub fn format_schedule_visualization(schedule: &[ScheduleSlot]) -> String {
    let mut lines = vec!["📅 Расписание на выбранную дату:".to_string(), String::new()];

    let mut i = 0;
    while i < schedule.len() {
        let slot = &schedule[i];
        match (&slot.booking, slot.occupied) {
            (Some(booking), true) => {
                let end_hour = slot.hour + u32::from(booking.duration_hours);
                lines.push(format!(
                    "🔴 {}–{} - Занято",
                    hour_label(slot.hour),
                    hour_label(end_hour)
                ));
                // Always advance at least one slot.
                i += 1;
                while i < schedule.len() && schedule[i].hour < end_hour {
                    i += 1;
                }
            }
            _ => {
                let mut options = Vec::new();
                if slot.can_book_1h {
                    options.push("1ч");
                }
                if slot.can_book_2h {
                    options.push("2ч");
                }
                if options.is_empty() {
                    lines.push(format!("🟡 {} - Ограниченно", slot.time));
                } else {
                    lines.push(format!("🟢 {} - Свободно ({})", slot.time, options.join("/")));
                }
                i += 1;
            }
        }
    }

    lines.push(String::new());
    lines.push("🟢 - Можно забронировать".to_string());
    lines.push("🔴 - Занято".to_string());
    lines.push("🟡 - Частично доступно".to_string());

    lines.join("\n")
}
