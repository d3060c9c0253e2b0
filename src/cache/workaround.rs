//! Broadwell 1540D CAT errata: classes 10 and 11 corrupt each other's
//! bitmask unless they are assigned to the *same* application partition.
//!
//! Ported from `cache_utils.cpp::verify_intel_cos_issue`. The original
//! operates on a fixed-size array of `std::stack<int>`, one per
//! partition, each holding the way indices assigned to that partition;
//! this is the same shape expressed as `Vec<Vec<u32>>` (way lists used as
//! stacks, last element = top).

const WAY_10: u32 = 10;
const WAY_11: u32 = 11;

/// Rewrites `partitions` in place so ways 10 and 11 end up in the same
/// partition, if they weren't already. Follows the exact three-case
/// policy from §4.1:
///
/// 1. If one victim partition has more than one way, swap one of its
///    other ways for the other victim's single way.
/// 2. Otherwise (both victims are singletons), donate two ways from a
///    third partition of size >= 2 to the two victims, and give that
///    third partition ways 10 and 11.
pub fn fix_cos_10_11_split(partitions: &mut [Vec<u32>]) {
    let Some(victim_10) = partitions.iter().position(|p| p.contains(&WAY_10)) else {
        return;
    };
    let Some(victim_11) = partitions.iter().position(|p| p.contains(&WAY_11)) else {
        return;
    };

    if victim_10 == victim_11 {
        return;
    }

    if partitions[victim_10].len() > 1 {
        swap_into_victim(partitions, victim_10, victim_11, WAY_10, WAY_11);
    } else if partitions[victim_11].len() > 1 {
        swap_into_victim(partitions, victim_11, victim_10, WAY_11, WAY_10);
    } else {
        // Both victims are singleton {10} and {11}: find a third
        // partition with >= 2 ways, take one of its ways for each victim,
        // and give it {10, 11}.
        if let Some(donor) = (0..partitions.len())
            .find(|&i| i != victim_10 && i != victim_11 && partitions[i].len() >= 2)
        {
            let swap1 = partitions[donor].pop().unwrap();
            let swap2 = partitions[donor].pop().unwrap();
            partitions[donor].push(WAY_10);
            partitions[donor].push(WAY_11);

            partitions[victim_10].pop();
            partitions[victim_10].push(swap1);

            partitions[victim_11].pop();
            partitions[victim_11].push(swap2);
        }
    }
}

/// `big` has more than one way; move a non-{way_big} way out of `big`
/// into `small`, and let `big` take over `small`'s original single way
/// (`way_small`), so `big` ends up owning both contested ways.
fn swap_into_victim(
    partitions: &mut [Vec<u32>],
    big: usize,
    small: usize,
    way_big: u32,
    way_small: u32,
) {
    let donor_way = partitions[big]
        .iter()
        .position(|&w| w != way_big)
        .map(|idx| partitions[big].remove(idx))
        .expect("a partition with len > 1 holding way_big has a non-way_big member");

    partitions[big].push(way_small);
    partitions[small].retain(|&w| w != way_small);
    partitions[small].push(donor_way);
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn no_op_when_already_together() {
        let mut partitions = vec![vec![0, 1], vec![10, 11], vec![2]];
        let before = partitions.clone();
        fix_cos_10_11_split(&mut partitions);
        assert_eq!(partitions, before);
    }

    #[test]
    fn merges_when_big_victim_has_spare_way() {
        // partition 0 = {3, 8, 9, 10}, partition 1 = {11}
        let mut partitions = vec![vec![3, 8, 9, 10], vec![11], vec![0, 1]];
        fix_cos_10_11_split(&mut partitions);

        let with_10 = partitions.iter().position(|p| p.contains(&10)).unwrap();
        let with_11 = partitions.iter().position(|p| p.contains(&11)).unwrap();
        assert_eq!(with_10, with_11, "10 and 11 must share a partition");
        // Total way count is preserved.
        let total: usize = partitions.iter().map(|p| p.len()).sum();
        assert_eq!(total, 6);
    }

    #[test]
    fn merges_via_third_donor_when_both_victims_singleton() {
        let mut partitions = vec![vec![10], vec![11], vec![0, 1, 2]];
        fix_cos_10_11_split(&mut partitions);

        let with_10 = partitions.iter().position(|p| p.contains(&10)).unwrap();
        let with_11 = partitions.iter().position(|p| p.contains(&11)).unwrap();
        assert_eq!(with_10, with_11);
        assert_eq!(with_10, 2, "the donor partition absorbs both ways");
        assert_eq!(partitions[0].len(), 1);
        assert_eq!(partitions[1].len(), 1);
    }
}
