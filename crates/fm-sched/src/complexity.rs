use fm_core::types::{Bead, Tier};

/// Tier routing by bead complexity.
///
/// Label overrides first: any label containing `complex` or `architecture`
/// routes to `premium`; `trivial` or `chore` routes to `fast`. Otherwise the
/// estimate decides: no estimate lands in the middle, short work goes fast,
/// long work goes premium.
pub fn detect_complexity(bead: &Bead) -> Tier {
    let labels = bead.joined_labels_lower();
    if labels.contains("complex") || labels.contains("architecture") {
        return Tier::Premium;
    }
    if labels.contains("trivial") || labels.contains("chore") {
        return Tier::Fast;
    }

    match bead.estimate_minutes {
        0 => Tier::Balanced,
        e if e <= 30 => Tier::Fast,
        e if e <= 90 => Tier::Balanced,
        _ => Tier::Premium,
    }
}
