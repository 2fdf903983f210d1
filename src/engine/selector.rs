use std::cmp::Reverse;

use super::TableSnapshot;

/// Pick the snuggest table for `party_size`: smallest maximum capacity, so
/// larger tables stay open for larger parties.
///
/// Ties go to the tighter range (larger minimum), then to the lowest table id.
/// The answer does not depend on input order.
pub fn pick_best<'a>(candidates: &[&'a TableSnapshot], party_size: u32) -> Option<&'a TableSnapshot> {
    candidates
        .iter()
        .copied()
        .filter(|t| t.capacity.contains(party_size))
        .min_by_key(|t| (t.capacity.max, Reverse(t.capacity.min), t.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PartyRange;
    use ulid::Ulid;

    fn table(min: u32, max: u32) -> TableSnapshot {
        TableSnapshot {
            id: Ulid::new(),
            name: format!("{min}-{max}"),
            capacity: PartyRange::new(min, max).unwrap(),
            occupancies: Vec::new(),
        }
    }

    #[test]
    fn smallest_max_wins() {
        let (t1, t2, t3) = (table(1, 2), table(2, 4), table(4, 8));
        let best = pick_best(&[&t3, &t2, &t1], 2).unwrap();
        assert_eq!(best.id, t1.id);
        let best = pick_best(&[&t3, &t2, &t1], 3).unwrap();
        assert_eq!(best.id, t2.id);
    }

    #[test]
    fn tighter_range_breaks_ties() {
        let loose = table(1, 4);
        let tight = table(3, 4);
        assert_eq!(pick_best(&[&loose, &tight], 3).unwrap().id, tight.id);
    }

    #[test]
    fn lowest_id_breaks_remaining_ties() {
        let mut a = table(2, 4);
        let mut b = table(2, 4);
        a.id = Ulid::from_parts(1, 0);
        b.id = Ulid::from_parts(2, 0);
        assert_eq!(pick_best(&[&b, &a], 2).unwrap().id, a.id);
        assert_eq!(pick_best(&[&a, &b], 2).unwrap().id, a.id);
    }

    #[test]
    fn unsuitable_candidates_are_ignored() {
        let big = table(6, 10);
        assert!(pick_best(&[&big], 2).is_none());
        assert!(pick_best(&[], 2).is_none());
    }
}
