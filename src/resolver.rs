use crate::entities::{Project, ReferenceSet, Submission, WatchedEntity};
use crate::types::Subscription;

/// Read-only lookups the resolver needs from the record store.
pub trait SubscriptionSource: Send + Sync {
    fn project(&self, id: u64) -> Option<Project>;
    fn submission(&self, id: u64) -> Option<Submission>;
    fn reference_set(&self, id: u64) -> Option<ReferenceSet>;
    fn subscriptions_for(&self, project_id: u64) -> Vec<Subscription>;
}

/// Follows the ownership chain up to the project. `None` when any link is cleared
/// or dangling.
pub fn owning_project(source: &dyn SubscriptionSource, entity: &WatchedEntity) -> Option<Project> {
    let project_id = match entity {
        WatchedEntity::Submission(s) => s.project_id?,
        WatchedEntity::ReferenceSet(r) => r.project_id?,
        WatchedEntity::TestResult(t) => source.submission(t.submission_id?)?.project_id?,
        WatchedEntity::TestReference(t) => source.reference_set(t.reference_set_id?)?.project_id?,
    };
    source.project(project_id)
}

/// The owning project and the subscriptions interested in this entity's kind.
pub fn resolve(
    source: &dyn SubscriptionSource,
    entity: &WatchedEntity,
) -> Option<(Project, Vec<Subscription>)> {
    let project = owning_project(source, entity)?;
    let kind = entity.kind();
    let subscriptions = source
        .subscriptions_for(project.id)
        .into_iter()
        .filter(|s| s.interests.wants(kind))
        .collect();
    Some((project, subscriptions))
}
