//! Grouping jobs into provider lanes.
//!
//! A lane runs its jobs one after another, so two jobs in the same lane never
//! touch storage at the same time. Jobs of one provider always share a lane.
//! Providers whose jobs write to a common dataset are fused into one lane.

use std::collections::HashMap;

use pricevault_core::domain::{DatasetLocator, DownloadJob, ProviderKind};

#[derive(Debug, Clone, PartialEq)]
pub struct Lane {
    /// Providers served by this lane, in first-use order.
    pub providers: Vec<ProviderKind>,
    /// Jobs in submission order.
    pub jobs: Vec<DownloadJob>,
}

/// Split jobs into lanes. Lanes are ordered by their first job.
pub fn build_lanes(jobs: Vec<DownloadJob>) -> Vec<Lane> {
    let mut providers: Vec<ProviderKind> = Vec::new();
    for job in &jobs {
        if !providers.contains(&job.provider) {
            providers.push(job.provider);
        }
    }
    let index = |p: ProviderKind| providers.iter().position(|x| *x == p).unwrap_or(0);

    let mut sets = DisjointSets::new(providers.len());
    let mut first_writer: HashMap<&DatasetLocator, usize> = HashMap::new();
    for job in &jobs {
        let i = index(job.provider);
        match first_writer.get(&job.locator) {
            Some(&j) => sets.union(i, j),
            None => {
                first_writer.insert(&job.locator, i);
            }
        }
    }

    let mut lane_of_root: HashMap<usize, usize> = HashMap::new();
    let mut lanes: Vec<Lane> = Vec::new();
    for job in jobs {
        let i = index(job.provider);
        let root = sets.find(i);
        let lane = *lane_of_root.entry(root).or_insert_with(|| {
            lanes.push(Lane {
                providers: Vec::new(),
                jobs: Vec::new(),
            });
            lanes.len() - 1
        });
        if !lanes[lane].providers.contains(&job.provider) {
            lanes[lane].providers.push(job.provider);
        }
        lanes[lane].jobs.push(job);
    }
    lanes
}

struct DisjointSets {
    parent: Vec<usize>,
}

impl DisjointSets {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            // Keep the earlier provider as root so lane order is stable.
            let (keep, merge) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent[merge] = keep;
        }
    }
}
