use chrono::{DateTime, Duration, FixedOffset, TimeZone, Timelike};
use chrono_tz::Tz;
use std::fmt;

use crate::errors::EngineError;

/// Length of one price slot
pub const SLOT_MINUTES: i64 = 15;

/// Peak price above which charging is planned to finish before the peak
pub const HIGH_PRICE_THRESHOLD: f64 = 0.30;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PricePoint {
    pub timestamp: DateTime<FixedOffset>,
    /// EUR/kWh including taxes
    pub price: f64,
}

/// A price point converted to the engine's local timezone
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Slot {
    pub start: DateTime<Tz>,
    pub price: f64,
}

/// Today's and tomorrow's prices merged into one chronological series.
#[derive(Debug, Clone)]
pub struct PriceTimeline {
    all: Vec<Slot>,
    /// Slots starting at or after the current full hour
    future: Vec<Slot>,
}

impl PriceTimeline {
    /// Returns `None` when no slot starts at or after the current hour.
    pub fn build(today: &[PricePoint], tomorrow: &[PricePoint], now: DateTime<Tz>) -> Option<Self> {
        let tz = now.timezone();
        let mut all: Vec<Slot> = today
            .iter()
            .chain(tomorrow.iter())
            .map(|p| Slot {
                start: p.timestamp.with_timezone(&tz),
                price: p.price,
            })
            .collect();
        // Stable: equal timestamps keep their ingest order
        all.sort_by_key(|s| s.start);

        let hour_start = floor_to_hour(now);
        let future: Vec<Slot> = all.iter().copied().filter(|s| s.start >= hour_start).collect();

        if future.is_empty() {
            return None;
        }

        Some(Self { all, future })
    }

    pub fn future(&self) -> &[Slot] {
        &self.future
    }

    /// Highest future price, earliest slot among ties
    pub fn peak(&self) -> Slot {
        let mut peak = self.future[0];
        for slot in &self.future[1..] {
            if slot.price > peak.price {
                peak = *slot;
            }
        }
        peak
    }

    /// Charging has to be done before an expensive upcoming peak, otherwise by end of day.
    pub fn charge_deadline(&self, now: DateTime<Tz>) -> Result<DateTime<Tz>, EngineError> {
        let peak = self.peak();
        if peak.price > HIGH_PRICE_THRESHOLD && peak.start > now {
            return Ok(peak.start);
        }

        let end_of_day = now
            .date_naive()
            .and_hms_opt(23, 59, 0)
            .ok_or_else(|| EngineError::LocalTime(format!("{} 23:59", now.date_naive())))?;
        now.timezone()
            .from_local_datetime(&end_of_day)
            .earliest()
            .ok_or_else(|| EngineError::LocalTime(end_of_day.to_string()))
    }

    /// Future slots before `deadline`, cheapest first (ties stay chronological).
    pub fn cheap_pool(&self, deadline: DateTime<Tz>) -> Vec<Slot> {
        let mut pool: Vec<Slot> = self.future.iter().copied().filter(|s| s.start < deadline).collect();
        pool.sort_by(|a, b| a.price.total_cmp(&b.price));
        pool
    }

    /// Highest price between 05:00 and 09:59 on the day after `now`.
    pub fn morning_peak_tomorrow(&self, now: DateTime<Tz>) -> Option<f64> {
        let tomorrow = now.date_naive().succ_opt()?;
        self.all
            .iter()
            .filter(|s| s.start.date_naive() == tomorrow && (5..=9).contains(&s.start.hour()))
            .map(|s| s.price)
            .reduce(f64::max)
    }
}

/// The cheapest slots picked for grid charging
#[derive(Debug, Clone, PartialEq)]
pub struct SlotPlan {
    /// Selected slots in chronological order; not necessarily contiguous
    pub slots: Vec<Slot>,
}

impl SlotPlan {
    /// Take `count` slots from the front of `pool`. `None` when the pool is too short.
    pub fn select(pool: &[Slot], count: usize) -> Option<Self> {
        if count == 0 || pool.len() < count {
            return None;
        }
        let mut slots = pool[..count].to_vec();
        slots.sort_by_key(|s| s.start);
        Some(Self { slots })
    }

    pub fn first_start(&self) -> DateTime<Tz> {
        self.slots[0].start
    }

    /// End of the last selected slot
    pub fn end(&self) -> DateTime<Tz> {
        self.slots[self.slots.len() - 1].start + Duration::minutes(SLOT_MINUTES)
    }

    pub fn average_price(&self) -> f64 {
        self.slots.iter().map(|s| s.price).sum::<f64>() / self.slots.len() as f64
    }

    /// Whether the quarter hour containing `now` is one of the selected slots
    pub fn contains(&self, now: DateTime<Tz>) -> bool {
        let quarter = floor_to_quarter(now);
        self.slots.iter().any(|s| s.start == quarter)
    }
}

impl fmt::Display for SlotPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x 15min ({}...{}) Ø {:.3} €",
            self.slots.len(),
            self.first_start().format("%H:%M"),
            self.end().format("%H:%M"),
            self.average_price()
        )
    }
}

pub fn floor_to_hour(t: DateTime<Tz>) -> DateTime<Tz> {
    t - Duration::seconds(i64::from(t.minute() * 60 + t.second()))
        - Duration::nanoseconds(i64::from(t.nanosecond()))
}

pub fn floor_to_quarter(t: DateTime<Tz>) -> DateTime<Tz> {
    let minutes_into_quarter = t.minute() % SLOT_MINUTES as u32;
    t - Duration::seconds(i64::from(minutes_into_quarter * 60 + t.second()))
        - Duration::nanoseconds(i64::from(t.nanosecond()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::Europe::Berlin;

    fn at(h: u32, m: u32) -> DateTime<Tz> {
        Berlin.with_ymd_and_hms(2025, 3, 10, h, m, 0).unwrap()
    }

    fn point(t: DateTime<Tz>, price: f64) -> PricePoint {
        PricePoint {
            timestamp: t.fixed_offset(),
            price,
        }
    }

    /// Quarter-hour points starting at `start`, one per price
    fn series(start: DateTime<Tz>, prices: &[f64]) -> Vec<PricePoint> {
        prices
            .iter()
            .enumerate()
            .map(|(i, p)| point(start + Duration::minutes(15 * i as i64), *p))
            .collect()
    }

    #[test]
    fn test_future_keeps_current_hour() {
        let today = series(at(9, 0), &[0.20, 0.21, 0.22, 0.23, 0.24, 0.25]);
        let timeline = PriceTimeline::build(&today, &[], at(10, 20)).unwrap();

        // 10:00 onwards, even though 10:00 and 10:15 lie in the past
        assert_eq!(timeline.future().len(), 2);
        assert_eq!(timeline.future()[0].start, at(10, 0));
    }

    #[test]
    fn test_no_future_prices() {
        let today = series(at(8, 0), &[0.20, 0.21]);
        assert!(PriceTimeline::build(&today, &[], at(10, 0)).is_none());
        assert!(PriceTimeline::build(&[], &[], at(10, 0)).is_none());
    }

    #[test]
    fn test_merges_and_orders_today_and_tomorrow() {
        let today = series(at(22, 0), &[0.30]);
        let tomorrow = vec![point(at(22, 0) + Duration::hours(3), 0.10)];
        // Out of order on purpose
        let timeline = PriceTimeline::build(&tomorrow, &today, at(22, 5)).unwrap();
        assert_eq!(timeline.future()[0].price, 0.30);
        assert_eq!(timeline.future()[1].price, 0.10);
    }

    #[test]
    fn test_peak_prefers_earliest_tie() {
        let today = series(at(10, 0), &[0.20, 0.40, 0.30, 0.40]);
        let timeline = PriceTimeline::build(&today, &[], at(10, 0)).unwrap();
        let peak = timeline.peak();
        assert_eq!(peak.price, 0.40);
        assert_eq!(peak.start, at(10, 15));
    }

    #[test]
    fn test_deadline_is_peak_when_expensive() {
        let today = series(at(10, 0), &[0.20, 0.10, 0.45, 0.25]);
        let timeline = PriceTimeline::build(&today, &[], at(10, 0)).unwrap();
        assert_eq!(timeline.charge_deadline(at(10, 0)).unwrap(), at(10, 30));

        let pool = timeline.cheap_pool(at(10, 30));
        assert_eq!(pool.len(), 2);
        assert_eq!(pool[0].price, 0.10);
    }

    #[test]
    fn test_deadline_is_end_of_day_when_peak_cheap() {
        let today = series(at(10, 0), &[0.20, 0.10, 0.25]);
        let timeline = PriceTimeline::build(&today, &[], at(10, 0)).unwrap();
        assert_eq!(timeline.charge_deadline(at(10, 0)).unwrap(), at(23, 59));
    }

    #[test]
    fn test_pool_ties_stay_chronological() {
        let today = series(at(10, 0), &[0.20, 0.10, 0.10, 0.15]);
        let timeline = PriceTimeline::build(&today, &[], at(10, 0)).unwrap();
        let pool = timeline.cheap_pool(at(23, 59));
        assert_eq!(pool[0].start, at(10, 15));
        assert_eq!(pool[1].start, at(10, 30));
        assert_eq!(pool[2].price, 0.15);
    }

    #[test]
    fn test_select_cheapest_reports_span() {
        let today = series(at(10, 0), &[0.30, 0.12, 0.28, 0.10, 0.29]);
        let timeline = PriceTimeline::build(&today, &[], at(10, 0)).unwrap();
        let pool = timeline.cheap_pool(at(23, 59));

        let plan = SlotPlan::select(&pool, 2).unwrap();
        assert_eq!(plan.slots.len(), 2);
        assert_eq!(plan.first_start(), at(10, 15));
        // Scattered selection: 10:15 and 10:45, span reported up to 11:00
        assert_eq!(plan.end(), at(11, 0));
        assert_eq!(plan.to_string(), "2x 15min (10:15...11:00) Ø 0.110 €");
        assert!(plan.contains(at(10, 20)));
        assert!(!plan.contains(at(10, 30)));
    }

    #[test]
    fn test_select_requires_enough_slots() {
        let today = series(at(10, 0), &[0.30, 0.12]);
        let timeline = PriceTimeline::build(&today, &[], at(10, 0)).unwrap();
        let pool = timeline.cheap_pool(at(23, 59));
        assert!(SlotPlan::select(&pool, 3).is_none());
        assert!(SlotPlan::select(&pool, 0).is_none());
    }

    #[test]
    fn test_morning_peak_tomorrow() {
        let tomorrow_start = Berlin.with_ymd_and_hms(2025, 3, 11, 4, 0, 0).unwrap();
        let mut tomorrow = Vec::new();
        for h in 0..7 {
            let price = if h == 3 { 0.45 } else { 0.20 + h as f64 * 0.01 };
            tomorrow.push(point(tomorrow_start + Duration::hours(h), price));
        }
        // 11:00 is outside the morning window
        tomorrow.push(point(tomorrow_start + Duration::hours(7), 0.90));

        let today = series(at(19, 0), &[0.30]);
        let timeline = PriceTimeline::build(&today, &tomorrow, at(19, 0)).unwrap();
        assert_eq!(timeline.morning_peak_tomorrow(at(19, 0)), Some(0.45));
    }

    #[test]
    fn test_floor_helpers() {
        let t = Berlin.with_ymd_and_hms(2025, 3, 10, 10, 37, 42).unwrap();
        assert_eq!(floor_to_hour(t), at(10, 0));
        assert_eq!(floor_to_quarter(t), at(10, 30));
    }
}
