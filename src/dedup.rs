use crate::normalize::{RecordDraft, UNKNOWN};
use std::collections::HashMap;

type NaturalKey = (String, String, String, String);

/// Keeps one draft per natural key, preferring the most complete one.
#[derive(Debug, Default)]
pub struct Deduplicator {
    slots: HashMap<NaturalKey, usize>,
    survivors: Vec<RecordDraft>,
    discarded: usize,
}

impl Deduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every collision counts as one discard, whichever draft survives. Ties
    /// keep the draft seen first.
    pub fn push(&mut self, draft: RecordDraft) {
        let key = draft.natural_key();
        match self.slots.get(&key) {
            None => {
                self.slots.insert(key, self.survivors.len());
                self.survivors.push(draft);
            }
            Some(&slot) => {
                if completeness_score(&draft) > completeness_score(&self.survivors[slot]) {
                    self.survivors[slot] = draft;
                }
                self.discarded += 1;
            }
        }
    }

    pub fn discarded(&self) -> usize {
        self.discarded
    }

    /// Survivors in first-seen key order, plus the discard count.
    pub fn finish(self) -> (Vec<RecordDraft>, usize) {
        (self.survivors, self.discarded)
    }
}

pub fn completeness_score(d: &RecordDraft) -> usize {
    [
        d.college.is_some(),
        d.major.is_some(),
        d.academic_year != UNKNOWN,
        d.semester != UNKNOWN,
        d.course_code != UNKNOWN,
        d.course_name != UNKNOWN,
        d.final_grade.is_some(),
        d.letter_grade.is_some(),
        d.grade_points.is_some(),
    ]
    .iter()
    .filter(|present| **present)
    .count()
}
