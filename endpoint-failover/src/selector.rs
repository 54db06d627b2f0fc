//! Priority-tiered endpoint selection.
//!
//! Summary of the strategy:
//! - Endpoints are grouped into tiers by priority. Positive tiers are evaluated from the highest
//!   priority down, tier 0 ("no explicit priority") always last.
//! - The first tier with an online endpoint wins. Within it, the online endpoint with the lowest
//!   last response time is the best response.
//! - Tier changes and recovery from an offline (or missing) current endpoint happen immediately.
//! - Inside the current tier the current endpoint is only replaced by one that was strictly faster
//!   in every one of the last N rounds, so equally fast endpoints don't flap.

use std::{cmp::Ordering, collections::BTreeMap};

use crate::{endpoint::EndpointSnapshot, history::LatencyHistory};

/// Outcome of a selection round.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Selection {
    /// The endpoint with this address should become current.
    Switch(String),
    /// Keep the current endpoint.
    NoChange,
}

/// Orders priorities so that positive ones come first, highest first, and 0 comes last.
pub fn tier_order(a: u32, b: u32) -> Ordering {
    match (a, b) {
        (0, 0) => Ordering::Equal,
        (0, _) => Ordering::Greater,
        (_, 0) => Ordering::Less,
        (a, b) => b.cmp(&a),
    }
}

/// Groups endpoints into tiers, in evaluation order.
pub fn tiers(endpoints: &[EndpointSnapshot]) -> Vec<(u32, Vec<&EndpointSnapshot>)> {
    let mut grouped: BTreeMap<u32, Vec<&EndpointSnapshot>> = BTreeMap::new();
    for endpoint in endpoints {
        grouped.entry(endpoint.priority).or_default().push(endpoint);
    }
    let mut tiers: Vec<_> = grouped.into_iter().collect();
    tiers.sort_by(|(a, _), (b, _)| tier_order(*a, *b));
    tiers
}

// Endpoints with a measured latency rank before those without one; the address breaks ties.
fn response_order(a: &EndpointSnapshot, b: &EndpointSnapshot) -> Ordering {
    let a_latency = a.health.last_response_time;
    let b_latency = b.health.last_response_time;
    a_latency
        .is_none()
        .cmp(&b_latency.is_none())
        .then(a_latency.cmp(&b_latency))
        .then_with(|| a.address.cmp(&b.address))
}

/// Returns the online endpoint of a tier with the lowest last response time.
pub fn best_response<'a>(tier: &[&'a EndpointSnapshot]) -> Option<&'a EndpointSnapshot> {
    tier.iter()
        .copied()
        .filter(|endpoint| endpoint.is_online())
        .min_by(|a, b| response_order(a, b))
}

/// Computes which endpoint should be current.
pub fn select(
    endpoints: &[EndpointSnapshot],
    current: Option<&str>,
    history: &LatencyHistory,
) -> Selection {
    let current = current.and_then(|address| endpoints.iter().find(|e| e.address == address));

    for (priority, tier) in tiers(endpoints) {
        let Some(best) = best_response(&tier) else {
            continue;
        };

        let current = match current {
            Some(current) if current.is_online() => current,
            _ => return Selection::Switch(best.address.clone()),
        };
        if current.address == best.address {
            return Selection::NoChange;
        }
        if current.priority != priority {
            return Selection::Switch(best.address.clone());
        }

        let mut challengers: Vec<_> = tier
            .iter()
            .copied()
            .filter(|e| e.is_online() && e.address != current.address)
            .filter(|e| history.consistently_better(&e.address, &current.address))
            .collect();
        challengers.sort_by(|a, b| response_order(a, b));
        return match challengers.first() {
            Some(challenger) => Selection::Switch(challenger.address.clone()),
            None => Selection::NoChange,
        };
    }

    Selection::NoChange
}

/// Returns the best online endpoint that isn't excluded, ignoring hysteresis.
pub fn best_available<'a>(
    endpoints: &'a [EndpointSnapshot],
    excluded: &[&str],
) -> Option<&'a EndpointSnapshot> {
    let eligible: Vec<EndpointSnapshot> = endpoints
        .iter()
        .filter(|e| !excluded.contains(&e.address.as_str()))
        .cloned()
        .collect();
    let address = tiers(&eligible)
        .into_iter()
        .find_map(|(_, tier)| best_response(&tier).map(|e| e.address.clone()))?;
    endpoints.iter().find(|e| e.address == address)
}

/// Listing order: current first, then online (yes, unknown, no), then tier order, then address.
pub fn listing_order(
    a: &EndpointSnapshot,
    b: &EndpointSnapshot,
    current: Option<&str>,
) -> Ordering {
    fn online_rank(endpoint: &EndpointSnapshot) -> u8 {
        match endpoint.health.online {
            Some(true) => 0,
            None => 1,
            Some(false) => 2,
        }
    }
    let is_current = |e: &EndpointSnapshot| Some(e.address.as_str()) == current;
    is_current(b)
        .cmp(&is_current(a))
        .then_with(|| online_rank(a).cmp(&online_rank(b)))
        .then_with(|| tier_order(a.priority, b.priority))
        .then_with(|| a.address.cmp(&b.address))
}
