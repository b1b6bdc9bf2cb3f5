//! UBI and UBIFS both protect critical records by writing more than one copy and letting a
//! sequence number decide which copy is current: the two layout-volume LEBs, the two master
//! LEBs, and any LEB that was re-written to a new PEB during wear-leveling. This module holds
//! the one rule they all share.

/// Pick the copy with the highest sequence number among the present ones.
///
/// Absent copies (`None`) are the ones that failed validation. Returns the index of the winning
/// copy along with it; on a tie the earlier copy wins.
pub fn newest<T, I, F>(copies: I, sequence: F) -> Option<(usize, T)>
where
    I: IntoIterator<Item = Option<T>>,
    F: Fn(&T) -> u64,
{
    let mut best: Option<(usize, T)> = None;
    for (i, copy) in copies.into_iter().enumerate() {
        let Some(copy) = copy else { continue };
        match &best {
            Some((_, current)) if sequence(current) >= sequence(&copy) => (),
            _ => best = Some((i, copy)),
        }
    }
    best
}

#[test]
fn test_newest() {
    let seq = |x: &u64| *x;

    assert_eq!(newest([Some(5), Some(7)], seq), Some((1, 7)));
    assert_eq!(newest([Some(7), Some(5)], seq), Some((0, 7)));
    assert_eq!(newest([None, Some(5)], seq), Some((1, 5)));
    assert_eq!(newest([Some(5), None], seq), Some((0, 5)));
    assert_eq!(newest::<u64, _, _>([None, None], seq), None);
    assert_eq!(newest([Some(3), Some(3)], seq), Some((0, 3)));
}
