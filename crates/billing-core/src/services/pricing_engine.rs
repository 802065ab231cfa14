//! Pricing Engine (§4.2). Pure: no I/O, no repository dependency.

use chrono::{DateTime, Utc};

use crate::models::{LineItem, LineItemType, Plan, PlanTier, Subscription, UsageType};
use crate::Result;

pub struct UsageAggregate {
    pub metric: String,
    pub total: i64,
}

/// Sorts tiers ascending by `up_to`, open-ended (`up_to = None`) last, per
/// §4.2 step 1 — callers may hand us tiers in whatever order they were
/// stored in, not necessarily already sorted.
fn sorted_tiers(tiers: &[PlanTier]) -> Vec<PlanTier> {
    let mut sorted = tiers.to_vec();
    sorted.sort_by_key(|t| t.up_to.unwrap_or(i64::MAX));
    sorted
}

/// Graduated tiered pricing: each unit is priced at the rate of the tier
/// it falls in.
pub fn graduated_charge(total: i64, tiers: &[PlanTier]) -> i64 {
    let mut remaining = total;
    let mut prev = 0i64;
    let mut charge = 0i64;
    for tier in sorted_tiers(tiers) {
        if remaining <= 0 {
            break;
        }
        let cap = tier.up_to.unwrap_or(i64::MAX);
        let take = remaining.min(cap.saturating_sub(prev));
        if take <= 0 {
            continue;
        }
        charge += take * tier.unit_amount;
        remaining -= take;
        prev = cap;
    }
    charge
}

/// Volume pricing: the entire quantity is priced at the single tier whose
/// range contains `total`.
pub fn volume_charge(total: i64, tiers: &[PlanTier]) -> i64 {
    let tiers = sorted_tiers(tiers);
    let mut prev = 0i64;
    for tier in &tiers {
        let cap = tier.up_to.unwrap_or(i64::MAX);
        if total <= cap {
            return total * tier.unit_amount;
        }
        prev = cap;
    }
    // total exceeded every finite tier; fall back to the last tier's rate.
    tiers
        .last()
        .map(|t| total * t.unit_amount)
        .unwrap_or_else(|| total * prev.max(0))
}

pub fn usage_charge(usage_type: UsageType, total: i64, tiers: &[PlanTier]) -> i64 {
    match usage_type {
        UsageType::Graduated => graduated_charge(total, tiers),
        UsageType::Volume => volume_charge(total, tiers),
    }
}

/// Base subscription line + one usage line per metered aggregate.
pub fn billing_cycle_line_items(
    subscription: &Subscription,
    plan: &Plan,
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
    usage: &[UsageAggregate],
) -> Result<Vec<LineItem>> {
    let mut items = Vec::new();

    items.push(LineItem {
        description: format!(
            "{} ({}–{})",
            plan.name,
            period_start.format("%Y-%m-%d"),
            period_end.format("%Y-%m-%d")
        ),
        amount: plan.amount * subscription.quantity as i64,
        quantity: subscription.quantity as i64,
        kind: LineItemType::Subscription,
    });

    if let Some(usage_type) = plan.usage_type {
        let tiers = plan.tiers()?;
        for aggregate in usage {
            if aggregate.total == 0 {
                continue;
            }
            let charge = usage_charge(usage_type, aggregate.total, &tiers);
            items.push(LineItem {
                description: format!("usage: {}", aggregate.metric),
                amount: charge,
                quantity: aggregate.total,
                kind: LineItemType::Usage,
            });
        }
    }

    Ok(items)
}

/// Proration pair for a mid-cycle plan change at instant `t`.
pub fn proration_line_items(
    old_amount: i64,
    new_amount: i64,
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
    t: DateTime<Utc>,
) -> Vec<LineItem> {
    let total_span = (period_end - period_start).num_milliseconds().max(1) as f64;
    let remaining_span = (period_end - t).num_milliseconds().max(0) as f64;
    let ratio = remaining_span / total_span;

    let credit = (old_amount as f64 * ratio).trunc() as i64;
    let charge = (new_amount as f64 * ratio).trunc() as i64;

    vec![
        LineItem {
            description: "unused time on previous plan".to_string(),
            amount: -credit,
            quantity: 1,
            kind: LineItemType::ProrationCredit,
        },
        LineItem {
            description: "remaining time on new plan".to_string(),
            amount: charge,
            quantity: 1,
            kind: LineItemType::ProrationCharge,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiers() -> Vec<PlanTier> {
        vec![
            PlanTier { up_to: Some(1000), unit_amount: 10 },
            PlanTier { up_to: Some(5000), unit_amount: 5 },
            PlanTier { up_to: None, unit_amount: 2 },
        ]
    }

    #[test]
    fn graduated_tiered_usage_matches_scenario_c() {
        // 1000*10 + 4000*5 + 2500*2 = 10000 + 20000 + 5000 = 35000
        assert_eq!(graduated_charge(7500, &tiers()), 35000);
    }

    #[test]
    fn graduated_charge_sorts_out_of_order_tiers() {
        let out_of_order = vec![
            PlanTier { up_to: None, unit_amount: 2 },
            PlanTier { up_to: Some(1000), unit_amount: 10 },
            PlanTier { up_to: Some(5000), unit_amount: 5 },
        ];
        assert_eq!(graduated_charge(7500, &out_of_order), 35000);
    }

    #[test]
    fn volume_prices_entire_quantity_at_landing_tier() {
        assert_eq!(volume_charge(500, &tiers()), 500 * 10);
        assert_eq!(volume_charge(7500, &tiers()), 7500 * 5);
    }

    #[test]
    fn proration_matches_scenario_b() {
        let start = Utc::now();
        let end = start + chrono::Duration::days(30);
        let t = start + chrono::Duration::days(15);
        let items = proration_line_items(1000, 2000, start, end, t);
        assert_eq!(items[0].amount, -500);
        assert_eq!(items[1].amount, 1000);
    }

    #[test]
    fn graduated_charge_stops_at_total() {
        assert_eq!(graduated_charge(500, &tiers()), 5000);
    }
}
