//! Leadership transitions.

use tracing::info;

use convoy_state::JobState;

use super::Pump;
use crate::events::Event;
use crate::streams::fire;

impl Pump {
    pub(super) fn handle_leader_change(&mut self, is_leader: bool) {
        if self.is_leader == Some(is_leader) {
            return;
        }
        self.is_leader = Some(is_leader);
        self.publish(Event::LeaderChange { is_leader });

        if !is_leader {
            info!("following another scheduler");
            return;
        }
        info!(
            formations = self.formations.len(),
            jobs = self.jobs.len(),
            "became leader"
        );

        // The controller may have missed transitions while another
        // scheduler led; write current states back.
        let visible: Vec<_> = self
            .jobs
            .iter()
            .filter(|job| matches!(job.state, JobState::Starting | JobState::Running))
            .map(|job| job.id)
            .collect();
        for id in visible {
            self.persist(&id);
        }

        self.rectify_all();
        self.requeue_new_jobs();
        let triggers = &self.outlets.triggers;
        fire(&triggers.sync_jobs);
        fire(&triggers.sync_formations);
        fire(&triggers.sync_hosts);
    }
}
