use crate::GcId;

/// Confirmation stage of a parked object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Parked since the last scan
    Fresh,
    /// Survived one scan with a zero count; freed by the next one
    Aged,
}

/// Deferred-destruction buffer for interned short strings and pooled
/// integers. Objects whose count drops to zero are parked here instead of
/// being freed. A scan confirms entries still at zero over two passes and
/// drops entries that were re-acquired in the meantime.
pub struct RecycleBin {
    entries: Vec<(GcId, Stage)>,
    threshold: usize,
}

/// Outcome for one entry during a scan
pub enum Verdict {
    /// Count is positive again; unlink and keep the object
    Revived,
    /// Count is still zero; keep waiting
    Waiting,
    /// Object vanished from under the bin
    Gone,
}

impl RecycleBin {
    pub fn new(threshold: usize) -> Self {
        Self {
            entries: Vec::new(),
            threshold,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    pub fn needs_scan(&self) -> bool {
        self.entries.len() > self.threshold
    }

    pub fn push(&mut self, id: GcId) {
        self.entries.push((id, Stage::Fresh));
    }

    /// One confirmation pass. `check` reports the state of each parked
    /// object; returns the ids confirmed dead, which are no longer in the bin.
    /// With `force`, a zero count is confirmed on the first pass.
    pub fn scan(&mut self, force: bool, mut check: impl FnMut(GcId) -> Verdict) -> Vec<GcId> {
        let mut confirmed = Vec::new();
        self.entries.retain_mut(|(id, stage)| match check(*id) {
            Verdict::Revived | Verdict::Gone => false,
            Verdict::Waiting => {
                if force || *stage == Stage::Aged {
                    confirmed.push(*id);
                    false
                } else {
                    *stage = Stage::Aged;
                    true
                }
            }
        });
        confirmed
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
