use ocr_utils::SeqNr;

/// What an oracle should do to catch up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    /// Not behind, or not enough peers reported to tell.
    UpToDate,

    /// Enough peers still hold the blocks after the local committed state. Fetch them.
    BlockSync { target: SeqNr },

    /// Peers pruned the needed blocks. Download the state at the snapshot `target`.
    TreeSync { target: SeqNr },
}

/// A peer's latest state-sync summary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Summary {
    pub lowest_persisted: SeqNr,
    pub highest_committed: SeqNr,
}

/// Choose between block-sync and tree-sync from the latest summary of each peer.
///
/// The committee height is the highest committed sequence number that at least `f + 1` peers
/// reported, so a faulty minority can neither inflate nor hide it. Blocks are fetched when `f + 1`
/// peers still hold the block after `committed`; otherwise the state is downloaded at the latest
/// snapshot at or below the committee height.
pub fn decide(
    committed: SeqNr,
    summaries: &[Summary],
    f: usize,
    snapshot_interval: u64,
) -> Decision {
    if summaries.len() <= f {
        return Decision::UpToDate;
    }
    let mut heights: Vec<SeqNr> = summaries.iter().map(|s| s.highest_committed).collect();
    heights.sort_unstable_by(|a, b| b.cmp(a));
    let highest = heights[f];
    if highest <= committed {
        return Decision::UpToDate;
    }

    let next = committed + 1;
    let holders = summaries
        .iter()
        .filter(|s| s.lowest_persisted <= next && next <= s.highest_committed)
        .count();
    if holders > f {
        return Decision::BlockSync { target: highest };
    }

    let target = highest / snapshot_interval * snapshot_interval;
    if target <= committed {
        Decision::BlockSync { target: highest }
    } else {
        Decision::TreeSync { target }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn summary(lowest_persisted: SeqNr, highest_committed: SeqNr) -> Summary {
        Summary {
            lowest_persisted,
            highest_committed,
        }
    }

    #[test_case(
        0,
        &[(500, 1000), (500, 1000), (500, 1000)],
        Decision::TreeSync { target: 1000 };
        "empty replica behind pruned peers"
    )]
    #[test_case(
        0,
        &[(500, 1050), (500, 1050), (500, 1050)],
        Decision::TreeSync { target: 1000 };
        "target rounds down to snapshot"
    )]
    #[test_case(
        0,
        &[(1, 1000), (1, 1000), (500, 1000)],
        Decision::BlockSync { target: 1000 };
        "enough holders"
    )]
    #[test_case(
        0,
        &[(1, 1000), (500, 1000), (500, 1000)],
        Decision::TreeSync { target: 1000 };
        "single holder"
    )]
    #[test_case(1000, &[(500, 1000), (500, 1000), (500, 1000)], Decision::UpToDate; "caught up")]
    #[test_case(0, &[(500, 1000)], Decision::UpToDate; "too few summaries")]
    #[test_case(
        0,
        &[(1, 5000), (1, 10), (1, 10)],
        Decision::BlockSync { target: 10 };
        "faulty peer cannot inflate height"
    )]
    #[test_case(
        1020,
        &[(1030, 1050), (1030, 1050), (1030, 1050)],
        Decision::BlockSync { target: 1050 };
        "snapshot below committed"
    )]
    fn test_decide(committed: SeqNr, summaries: &[(SeqNr, SeqNr)], expected: Decision) {
        let summaries: Vec<_> = summaries.iter().map(|(l, h)| summary(*l, *h)).collect();
        assert_eq!(decide(committed, &summaries, 1, 100), expected);
    }
}
