use super::{ModelChange, ModelChangesSorter};

/// Orders changes so that dependents are dropped before what they depend on
/// and created after it.
///
/// Changes of the same kind keep their relative order.
#[derive(Debug, Clone, Copy, Default)]
pub struct DependencyOrder;

const fn rank(change: &ModelChange) -> u8 {
    match change {
        ModelChange::DropIndex(_) => 0,
        ModelChange::DropView(_) => 1,
        ModelChange::DropColumn(_) => 2,
        ModelChange::DropTable(_) => 3,
        ModelChange::CreateDatabase { .. } => 4,
        ModelChange::CreateSchema { .. } => 5,
        ModelChange::CreateTable(_) => 6,
        ModelChange::CreateColumn(_) => 7,
        ModelChange::AlterColumn { .. } => 8,
        ModelChange::CreateView(_) => 9,
        ModelChange::CreateIndex(_) => 10,
    }
}

impl ModelChangesSorter for DependencyOrder {
    fn sort(&self, mut changes: Vec<ModelChange>) -> Vec<ModelChange> {
        changes.sort_by_key(rank);
        changes
    }
}
