//! Playlist sequencing module for restream
//!
//! Decides which playlist entry plays next for a given playback mode. The
//! sequencer only deals in indices; callers own the actual video list.

use crate::model::{PlaybackMode, PlaylistEntry};
use rand::seq::SliceRandom;
use rand::Rng;
use thiserror::Error;

/// Error type for sequencing operations
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlaylistError {
    /// Nothing to play
    #[error("playlist is empty")]
    EmptyPlaylist,

    /// Requested index does not exist in the playlist
    #[error("index {index} is out of range for a playlist of {len} entries")]
    OutOfRange { index: usize, len: usize },
}

/// Result of asking the sequencer for the next entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Play `index` (into the playlist); `position` is the new traversal position.
    Play { index: usize, position: usize },
    /// The traversal is over and the stream must stop.
    Finished,
}

impl Step {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Step::Finished)
    }
}

/// Traversal state for one playlist run.
///
/// For ordered modes the position is the playlist index itself. For shuffled
/// modes the position walks `order`, a permutation of all indices.
#[derive(Debug, Clone)]
pub struct Sequencer {
    mode: PlaybackMode,
    position: Option<usize>,
    order: Vec<usize>,
}

impl Sequencer {
    /// A sequencer that has not played anything yet.
    pub fn new(mode: PlaybackMode) -> Self {
        Self {
            mode,
            position: None,
            order: Vec::new(),
        }
    }

    /// A sequencer whose next step plays `index`.
    ///
    /// Ordered modes continue in stored order after `index`. Shuffled modes
    /// build a permutation that starts with `index` and covers every other
    /// entry afterwards.
    pub fn starting_at<R: Rng + ?Sized>(
        mode: PlaybackMode,
        len: usize,
        index: usize,
        rng: &mut R,
    ) -> Result<Self, PlaylistError> {
        if len == 0 {
            return Err(PlaylistError::EmptyPlaylist);
        }
        if index >= len {
            return Err(PlaylistError::OutOfRange { index, len });
        }

        if mode.is_shuffled() {
            let mut order = permutation(len, rng);
            if let Some(at) = order.iter().position(|&i| i == index) {
                order.swap(0, at);
            }
            Ok(Self {
                mode,
                position: None,
                order,
            })
        } else {
            Ok(Self {
                mode,
                position: index.checked_sub(1),
                order: Vec::new(),
            })
        }
    }

    /// Current traversal position, `None` before the first step.
    pub fn position(&self) -> Option<usize> {
        self.position
    }

    /// Advance over a playlist of `len` entries.
    pub fn next<R: Rng + ?Sized>(
        &mut self,
        len: usize,
        rng: &mut R,
    ) -> Result<Step, PlaylistError> {
        if len == 0 {
            return Err(PlaylistError::EmptyPlaylist);
        }

        let candidate = self.position.map_or(0, |p| p + 1);

        if self.mode.is_shuffled() {
            if self.order.len() != len {
                // First call, or the run was handed a different playlist length
                self.order = permutation(len, rng);
                self.position = None;
                return Ok(self.play_shuffled(0));
            }
            if self.position.is_none() {
                return Ok(self.play_shuffled(0));
            }
            if candidate < len {
                return Ok(self.play_shuffled(candidate));
            }
            if self.mode.repeats() {
                self.order = permutation(len, rng);
                return Ok(self.play_shuffled(0));
            }
            return Ok(Step::Finished);
        }

        if candidate < len {
            self.position = Some(candidate);
            return Ok(Step::Play {
                index: candidate,
                position: candidate,
            });
        }
        if self.mode.repeats() {
            self.position = Some(0);
            return Ok(Step::Play {
                index: 0,
                position: 0,
            });
        }
        Ok(Step::Finished)
    }

    fn play_shuffled(&mut self, position: usize) -> Step {
        self.position = Some(position);
        Step::Play {
            index: self.order[position],
            position,
        }
    }
}

/// A uniformly random ordering of `0..len`.
pub fn permutation<R: Rng + ?Sized>(len: usize, rng: &mut R) -> Vec<usize> {
    let mut order: Vec<usize> = (0..len).collect();
    order.shuffle(rng);
    order
}

/// Move the item at `from` to `to`, shifting the items in between.
///
/// Playlists are stored as plain vectors so the order is always the index;
/// this keeps the sequence dense after a reorder.
pub fn move_item<T>(items: &mut Vec<T>, from: usize, to: usize) -> Result<(), PlaylistError> {
    let len = items.len();
    if from >= len {
        return Err(PlaylistError::OutOfRange { index: from, len });
    }
    if to >= len {
        return Err(PlaylistError::OutOfRange { index: to, len });
    }
    let item = items.remove(from);
    items.insert(to, item);
    Ok(())
}

/// Sort entries by order and close any gaps so orders run `0..len`.
pub fn normalize_entries(entries: &mut [PlaylistEntry]) {
    entries.sort_by_key(|e| e.order);
    for (order, entry) in entries.iter_mut().enumerate() {
        entry.order = order;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::BTreeSet;

    fn collect_indices(
        seq: &mut Sequencer,
        len: usize,
        calls: usize,
        rng: &mut StdRng,
    ) -> Vec<Step> {
        (0..calls).map(|_| seq.next(len, rng).unwrap()).collect()
    }

    fn played(steps: &[Step]) -> Vec<usize> {
        steps
            .iter()
            .filter_map(|s| match s {
                Step::Play { index, .. } => Some(*index),
                Step::Finished => None,
            })
            .collect()
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_loop_returns_to_first_entry(len in 1usize..40, seed in any::<u64>()) {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut seq = Sequencer::new(PlaybackMode::Loop);
            let steps = collect_indices(&mut seq, len, len + 1, &mut rng);

            prop_assert!(steps.iter().all(|s| !s.is_terminal()));
            let indices = played(&steps);
            prop_assert_eq!(indices[0], indices[len]);
            prop_assert_eq!(indices[..len].to_vec(), (0..len).collect::<Vec<_>>());
        }

        #[test]
        fn prop_once_visits_in_order_then_terminates(len in 1usize..40, seed in any::<u64>()) {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut seq = Sequencer::new(PlaybackMode::Once);
            let steps = collect_indices(&mut seq, len, len, &mut rng);

            prop_assert_eq!(played(&steps), (0..len).collect::<Vec<_>>());
            prop_assert!(seq.next(len, &mut rng).unwrap().is_terminal());
        }

        #[test]
        fn prop_shuffle_is_a_permutation(len in 1usize..40, seed in any::<u64>()) {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut seq = Sequencer::new(PlaybackMode::Shuffle);
            let steps = collect_indices(&mut seq, len, len, &mut rng);
            let indices = played(&steps);

            prop_assert_eq!(indices.len(), len);
            let unique: BTreeSet<usize> = indices.iter().copied().collect();
            prop_assert_eq!(unique, (0..len).collect::<BTreeSet<_>>());
            prop_assert!(seq.next(len, &mut rng).unwrap().is_terminal());
        }

        #[test]
        fn prop_shuffle_loop_every_cycle_is_a_permutation(
            len in 1usize..20,
            cycles in 1usize..5,
            seed in any::<u64>(),
        ) {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut seq = Sequencer::new(PlaybackMode::ShuffleLoop);
            let steps = collect_indices(&mut seq, len, len * cycles, &mut rng);

            prop_assert!(steps.iter().all(|s| !s.is_terminal()));
            let indices = played(&steps);
            for cycle in indices.chunks(len) {
                let unique: BTreeSet<usize> = cycle.iter().copied().collect();
                prop_assert_eq!(unique.len(), len);
            }
        }

        #[test]
        fn prop_starting_at_plays_requested_index_first(
            len in 1usize..30,
            pick in any::<prop::sample::Index>(),
            mode_idx in 0usize..4,
            seed in any::<u64>(),
        ) {
            let modes = [
                PlaybackMode::Once,
                PlaybackMode::Loop,
                PlaybackMode::Shuffle,
                PlaybackMode::ShuffleLoop,
            ];
            let mode = modes[mode_idx];
            let index = pick.index(len);
            let mut rng = StdRng::seed_from_u64(seed);

            let mut seq = Sequencer::starting_at(mode, len, index, &mut rng).unwrap();
            match seq.next(len, &mut rng).unwrap() {
                Step::Play { index: first, .. } => prop_assert_eq!(first, index),
                Step::Finished => prop_assert!(false, "resumed sequencer finished immediately"),
            }

            if mode.is_shuffled() {
                // The remainder of the resumed cycle still covers every entry once
                let rest = collect_indices(&mut seq, len, len - 1, &mut rng);
                let mut all: BTreeSet<usize> = played(&rest).into_iter().collect();
                all.insert(index);
                prop_assert_eq!(all.len(), len);
            }
        }
    }

    #[test]
    fn test_empty_playlist_fails() {
        let mut rng = StdRng::seed_from_u64(7);
        for mode in [
            PlaybackMode::Once,
            PlaybackMode::Loop,
            PlaybackMode::Shuffle,
            PlaybackMode::ShuffleLoop,
        ] {
            let mut seq = Sequencer::new(mode);
            assert_eq!(seq.next(0, &mut rng), Err(PlaylistError::EmptyPlaylist));
        }
        assert!(matches!(
            Sequencer::starting_at(PlaybackMode::Loop, 0, 0, &mut rng),
            Err(PlaylistError::EmptyPlaylist)
        ));
    }

    #[test]
    fn test_starting_at_rejects_out_of_range() {
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(
            Sequencer::starting_at(PlaybackMode::Once, 3, 3, &mut rng).unwrap_err(),
            PlaylistError::OutOfRange { index: 3, len: 3 }
        );
    }

    #[test]
    fn test_resume_in_loop_mode_continues_in_stored_order() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut seq = Sequencer::starting_at(PlaybackMode::Loop, 3, 1, &mut rng).unwrap();
        let steps = collect_indices(&mut seq, 3, 4, &mut rng);
        assert_eq!(played(&steps), vec![1, 2, 0, 1]);
    }

    #[test]
    fn test_move_item_keeps_sequence_dense() {
        let mut items = vec!["a", "b", "c", "d"];
        move_item(&mut items, 0, 2).unwrap();
        assert_eq!(items, vec!["b", "c", "a", "d"]);
        move_item(&mut items, 3, 0).unwrap();
        assert_eq!(items, vec!["d", "b", "c", "a"]);
        assert!(move_item(&mut items, 4, 0).is_err());
        assert!(move_item(&mut items, 0, 4).is_err());
    }

    #[test]
    fn test_normalize_entries_sorts_and_closes_gaps() {
        let entry = |video: &str, order| PlaylistEntry {
            stream_id: "s1".to_string(),
            video_id: video.to_string(),
            order,
        };
        let mut entries = vec![entry("c", 7), entry("a", 0), entry("b", 3)];
        normalize_entries(&mut entries);

        let got: Vec<(usize, &str)> = entries
            .iter()
            .map(|e| (e.order, e.video_id.as_str()))
            .collect();
        assert_eq!(got, vec![(0, "a"), (1, "b"), (2, "c")]);
    }
}
