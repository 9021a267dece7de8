use serde::{Deserialize, Serialize};

use crate::profile::SiteProfile;
use crate::spec::TaskArraySpec;

/// Contiguous, non-empty range of task indices submitted as one scheduler
/// array.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexRange {
    pub start: u32,
    pub count: u32,
}

impl IndexRange {
    pub fn new(start: u32, count: u32) -> IndexRange {
        debug_assert!(count > 0);
        IndexRange { start, count }
    }

    /// Last index covered by the range.
    pub fn end(&self) -> u32 {
        self.start + self.count - 1
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> {
        self.start..self.start + self.count
    }
}

/// Node and partition layout of one task array, computed once per session.
///
/// The partition tie-break is deployment policy: tasks fitting within the
/// site's `small_max_nodes` go to the low-latency partition when the site has
/// one, everything else to the general partition.
#[derive(Debug, Clone)]
pub struct SubmissionPlan {
    pub nodes_per_task: u32,
    pub partition: Option<String>,
    pub sbatch_args: Vec<String>,
}

impl SubmissionPlan {
    pub fn from_spec(spec: &TaskArraySpec, profile: &SiteProfile) -> SubmissionPlan {
        let nodes_per_task = spec.cores_per_task.div_ceil(spec.cores_per_node);
        let partition = if nodes_per_task <= profile.small_max_nodes {
            profile
                .small_partition
                .clone()
                .or_else(|| profile.general_partition.clone())
        } else {
            profile.general_partition.clone()
        };
        SubmissionPlan {
            nodes_per_task,
            partition,
            sbatch_args: profile.sbatch_args.clone(),
        }
    }
}

/// First wave of a fresh session: the lowest `min(N, M)` task indices.
pub fn initial_wave(spec: &TaskArraySpec) -> IndexRange {
    IndexRange::new(0, spec.task_count.min(spec.max_concurrent))
}

/// Next wave to dispatch, given how many indices were already submitted and
/// how many of them are still live. Returns `None` when every index has been
/// submitted or no concurrency slot is free.
pub fn next_wave(spec: &TaskArraySpec, submitted: u32, live: u32) -> Option<IndexRange> {
    let remaining = spec.task_count.saturating_sub(submitted);
    let free = spec.max_concurrent.saturating_sub(live);
    let count = remaining.min(free);
    (count > 0).then(|| IndexRange::new(submitted, count))
}
