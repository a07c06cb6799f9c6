//! Eviction ordering.
//!
//! The scale-down pass walks machines in order and spends the idle budget on
//! the first ones it meets, so the front of the ordering is "keep" and the
//! tail is "evict". Machines with an unknown launch time always sort to the
//! front.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use fleet_events::EvictionStrategy;

fn compare(
    a: Option<DateTime<Utc>>,
    b: Option<DateTime<Utc>>,
    strategy: EvictionStrategy,
) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        // Oldest first: the newest machines lead the list and are kept.
        (Some(a), Some(b)) => match strategy {
            EvictionStrategy::OldestFirst => b.cmp(&a),
            EvictionStrategy::NewestFirst => a.cmp(&b),
        },
    }
}

/// Sorts items for a scale-down walk (first kept, last evicted).
pub fn order_for_eviction<T, F>(
    mut items: Vec<T>,
    strategy: EvictionStrategy,
    launch_time: F,
) -> Vec<T>
where
    F: Fn(&T) -> Option<DateTime<Utc>>,
{
    items.sort_by(|a, b| compare(launch_time(a), launch_time(b), strategy));
    items
}
