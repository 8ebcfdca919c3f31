use std::collections::BTreeSet;
use std::collections::HashSet;
use std::time::Duration;

use rand::seq::SliceRandom;

use crate::HostRegistration;
use crate::Lease;

/// Leases this host should take and give up in one acquire cycle.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct BalancePlan {
    pub to_acquire: Vec<Lease>,
    pub to_release: Vec<Lease>,
    /// Fair share of this host
    pub target: usize,
    pub active_hosts: usize,
}

/// Spreads leases evenly over the active hosts.
///
/// A host is active when it owns a live lease or its registration was
/// refreshed within the expiration interval. Hosts are ranked by name and
/// the first `L % H` of them get one extra lease, so every host computes the
/// same shares from the same snapshot.
///
/// Live leases of other hosts are never taken. A host above its share gives
/// the surplus back and lets the others pick it up.
#[derive(Debug, Clone)]
pub struct EqualPartitionsBalancingStrategy {
    host_name: String,
    max_scale_count: usize,
    expiration_ms: u64,
}

impl EqualPartitionsBalancingStrategy {
    pub fn new(
        host_name: impl Into<String>,
        max_scale_count: usize,
        expiration: Duration,
    ) -> Self {
        Self {
            host_name: host_name.into(),
            max_scale_count,
            expiration_ms: expiration.as_millis() as u64,
        }
    }

    /// Sorted names of the hosts taking part in the current round, this host
    /// included.
    pub fn active_hosts(
        &self,
        leases: &[Lease],
        hosts: &[HostRegistration],
        now_ms: u64,
    ) -> Vec<String> {
        let mut active = BTreeSet::new();
        active.insert(self.host_name.clone());
        for lease in leases {
            if lease.is_live(now_ms, self.expiration_ms) {
                if let Some(owner) = &lease.owner {
                    active.insert(owner.clone());
                }
            }
        }
        for host in hosts {
            if host.is_active(now_ms, self.expiration_ms) {
                active.insert(host.host_name.clone());
            }
        }
        active.into_iter().collect()
    }

    /// Number of leases this host should own.
    pub fn target_for(
        &self,
        lease_count: usize,
        active_hosts: &[String],
    ) -> usize {
        let host_count = active_hosts.len().max(1);
        let rank = active_hosts
            .iter()
            .position(|h| h == &self.host_name)
            .unwrap_or(host_count - 1);

        let mut target = lease_count / host_count;
        if rank < lease_count % host_count {
            target += 1;
        }
        if self.max_scale_count > 0 {
            target = target.min(self.max_scale_count);
        }
        target
    }

    /// `recently_owned` holds tokens this host lost without giving them up;
    /// they are preferred over other free leases.
    pub fn plan(
        &self,
        leases: &[Lease],
        hosts: &[HostRegistration],
        recently_owned: &HashSet<String>,
        now_ms: u64,
    ) -> BalancePlan {
        let active = self.active_hosts(leases, hosts, now_ms);
        let target = self.target_for(leases.len(), &active);

        let mut owned: Vec<&Lease> = leases
            .iter()
            .filter(|l| l.is_owned_by(&self.host_name) && l.is_live(now_ms, self.expiration_ms))
            .collect();

        let mut plan = BalancePlan {
            target,
            active_hosts: active.len(),
            ..Default::default()
        };

        if owned.len() > target {
            owned.sort_by(|a, b| a.lease_token.cmp(&b.lease_token));
            plan.to_release = owned.split_off(target).into_iter().cloned().collect();
            return plan;
        }

        let mut own_expired = Vec::new();
        let mut sticky = Vec::new();
        let mut unowned = Vec::new();
        let mut expired = Vec::new();
        for lease in leases {
            match &lease.owner {
                None if recently_owned.contains(&lease.lease_token) => sticky.push(lease),
                None => unowned.push(lease),
                Some(owner) if lease.is_expired(now_ms, self.expiration_ms) => {
                    if owner == &self.host_name {
                        own_expired.push(lease);
                    } else {
                        expired.push(lease);
                    }
                }
                Some(_) => {}
            }
        }

        let mut rng = rand::thread_rng();
        own_expired.shuffle(&mut rng);
        sticky.shuffle(&mut rng);
        unowned.shuffle(&mut rng);
        expired.shuffle(&mut rng);

        plan.to_acquire = own_expired
            .into_iter()
            .chain(sticky)
            .chain(unowned)
            .chain(expired)
            .take(target - owned.len())
            .cloned()
            .collect();
        plan
    }
}
