//! Final sub-pixel matches.

use crate::coarse::ConfidenceMatrix;
use serde::Serialize;

/// One refined correspondence.
///
/// `i`/`j` are coarse token indices in image0/image1. Offsets are in
/// normalized window units `[-1, 1]`; points are `(x, y)` in input pixels.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Match {
    pub batch: usize,
    pub i: usize,
    pub j: usize,
    pub confidence: f32,
    pub offset0: [f32; 2],
    pub offset1: [f32; 2],
    pub point0: [f32; 2],
    pub point1: [f32; 2],
    pub std: f32,
    pub ground_truth: bool,
}

/// Matches of every sample stored as parallel arrays.
///
/// Entries are ordered by `(batch, i)`; use [`MatchSet::in_sample`] to read
/// the variable-length result of one sample.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MatchSet {
    batch: Vec<usize>,
    i: Vec<usize>,
    j: Vec<usize>,
    confidence: Vec<f32>,
    offset1: Vec<[f32; 2]>,
    point0: Vec<[f32; 2]>,
    point1: Vec<[f32; 2]>,
    std: Vec<f32>,
    ground_truth: Vec<bool>,
}

impl MatchSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            batch: Vec::with_capacity(capacity),
            i: Vec::with_capacity(capacity),
            j: Vec::with_capacity(capacity),
            confidence: Vec::with_capacity(capacity),
            offset1: Vec::with_capacity(capacity),
            point0: Vec::with_capacity(capacity),
            point1: Vec::with_capacity(capacity),
            std: Vec::with_capacity(capacity),
            ground_truth: Vec::with_capacity(capacity),
        }
    }

    /// Appends a match; `offset0` is always the window anchor and is not stored.
    pub fn push(&mut self, m: Match) {
        self.batch.push(m.batch);
        self.i.push(m.i);
        self.j.push(m.j);
        self.confidence.push(m.confidence);
        self.offset1.push(m.offset1);
        self.point0.push(m.point0);
        self.point1.push(m.point1);
        self.std.push(m.std);
        self.ground_truth.push(m.ground_truth);
    }

    pub fn len(&self) -> usize {
        self.batch.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }

    pub fn get(&self, k: usize) -> Option<Match> {
        Some(Match {
            batch: *self.batch.get(k)?,
            i: self.i[k],
            j: self.j[k],
            confidence: self.confidence[k],
            offset0: [0.0, 0.0],
            offset1: self.offset1[k],
            point0: self.point0[k],
            point1: self.point1[k],
            std: self.std[k],
            ground_truth: self.ground_truth[k],
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = Match> + '_ {
        (0..self.len()).filter_map(move |k| self.get(k))
    }

    /// Matches of sample `b`.
    pub fn in_sample(&self, b: usize) -> impl Iterator<Item = Match> + '_ {
        self.iter().filter(move |m| m.batch == b)
    }

    pub fn count_in_sample(&self, b: usize) -> usize {
        self.batch.iter().filter(|&&v| v == b).count()
    }

    pub fn batch_ids(&self) -> &[usize] {
        &self.batch
    }

    pub fn confidences(&self) -> &[f32] {
        &self.confidence
    }

    /// `(x, y)` in image0 pixels.
    pub fn points0(&self) -> &[[f32; 2]] {
        &self.point0
    }

    /// `(x, y)` in image1 pixels.
    pub fn points1(&self) -> &[[f32; 2]] {
        &self.point1
    }

    pub fn std(&self) -> &[f32] {
        &self.std
    }
}

impl FromIterator<Match> for MatchSet {
    fn from_iter<I: IntoIterator<Item = Match>>(iter: I) -> Self {
        let mut out = Self::new();
        for m in iter {
            out.push(m);
        }
        out
    }
}

/// Result of one forward pass.
#[derive(Clone, Debug)]
pub struct MatchOutput {
    pub matches: MatchSet,
    /// Present when requested and always in the training phase.
    pub confidence: Option<ConfidenceMatrix>,
}

#[cfg(test)]
mod tests {
    use super::{Match, MatchSet};

    fn record(batch: usize, i: usize) -> Match {
        Match {
            batch,
            i,
            j: i + 1,
            confidence: 0.5,
            offset0: [0.0, 0.0],
            offset1: [0.25, -0.5],
            point0: [8.0, 16.0],
            point1: [9.0, 15.0],
            std: 0.1,
            ground_truth: false,
        }
    }

    #[test]
    fn samples_are_read_back_by_batch_index() {
        let set: MatchSet = [record(0, 3), record(0, 4), record(2, 1)].into_iter().collect();
        assert_eq!(set.len(), 3);
        assert_eq!(set.count_in_sample(0), 2);
        assert_eq!(set.count_in_sample(1), 0);
        let last: Vec<_> = set.in_sample(2).collect();
        assert_eq!(last, vec![record(2, 1)]);
        assert_eq!(set.get(3), None);
    }

    #[test]
    fn match_serializes_as_a_flat_record() {
        let json = serde_json::to_value(record(1, 7)).unwrap();
        assert_eq!(json["batch"], 1);
        assert_eq!(json["j"], 8);
        assert_eq!(json["point1"][0], 9.0);
    }
}
