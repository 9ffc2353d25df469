use chrono::{DateTime, Utc};

use crate::domain::Frequency;

/// Infer observation frequency from the median spacing between consecutive
/// distinct timestamps. Fewer than two distinct timestamps yields `Unknown`.
///
/// Trading-day series (weekend gaps) still have a one-day median and come out `Daily`.
pub fn infer_frequency(timestamps: &[DateTime<Utc>]) -> Frequency {
    let mut sorted: Vec<DateTime<Utc>> = timestamps.to_vec();
    sorted.sort();
    sorted.dedup();
    if sorted.len() < 2 {
        return Frequency::Unknown;
    }

    let mut gaps: Vec<f64> = sorted
        .windows(2)
        .map(|w| (w[1] - w[0]).num_seconds() as f64 / 86_400.0)
        .collect();
    gaps.sort_by(|a, b| a.total_cmp(b));
    let mid = gaps.len() / 2;
    let median = if gaps.len() % 2 == 0 {
        (gaps[mid - 1] + gaps[mid]) / 2.0
    } else {
        gaps[mid]
    };

    match median {
        d if d > 0.0 && d <= 4.0 => Frequency::Daily,
        d if (5.0..=9.0).contains(&d) => Frequency::Weekly,
        d if (25.0..=35.0).contains(&d) => Frequency::Monthly,
        d if (80.0..=100.0).contains(&d) => Frequency::Quarterly,
        d if (350.0..=380.0).contains(&d) => Frequency::Annual,
        _ => Frequency::Irregular,
    }
}
