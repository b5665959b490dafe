use basalt_core::wire::ProposerPolicy;
use serde::{Deserialize, Serialize};

/// A block slot. Slots tick at the chain's block interval; producers serve
/// runs of consecutive slots.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockTimestamp {
    pub slot: u64,
}

impl BlockTimestamp {
    pub fn new(slot: u64) -> Self {
        Self { slot }
    }

    /// The slot after this one.
    pub fn next(self) -> Self {
        Self { slot: self.slot + 1 }
    }
}

/// The active producer schedule: who proposes at which slot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerSchedule {
    pub version: u32,
    /// Producer names in schedule order.
    pub producers: Vec<String>,
    /// Consecutive slots each producer serves before the schedule rotates.
    pub repetitions: u64,
}

impl ProducerSchedule {
    /// The producer scheduled at `t`:
    /// `producers[(slot / repetitions) % len]`.
    pub fn scheduled_producer(&self, t: BlockTimestamp) -> Option<&str> {
        if self.producers.is_empty() {
            return None;
        }
        let repetitions = self.repetitions.max(1);
        let index = (t.slot / repetitions) as usize % self.producers.len();
        Some(&self.producers[index])
    }

    /// Adopt a proposer policy announced in a header extension.
    pub fn from_proposer_policy(policy: &ProposerPolicy, version: u32, repetitions: u64) -> Self {
        Self { version, producers: policy.producers.clone(), repetitions }
    }
}
