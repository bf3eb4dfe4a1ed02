//! Flag, experiment and target-group repositories.
//!
//! Experiments and target groups live only as long as the current
//! configuration generation: a configuration apply publishes a complete new
//! set through an atomic pointer swap, so readers observe either the full
//! old set or the full new set, never a mix. The flag repository is
//! host-populated and lives for the whole engine lifetime.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use arc_swap::ArcSwap;

use crate::core::flags::FlagValue;
use crate::model::{ExperimentModel, TargetGroupModel};

#[derive(Default)]
pub struct TargetGroupRepository {
    groups: ArcSwap<Vec<Arc<TargetGroupModel>>>,
}

impl TargetGroupRepository {
    pub fn new() -> TargetGroupRepository {
        TargetGroupRepository::default()
    }

    pub fn set_target_groups(&self, groups: Vec<TargetGroupModel>) {
        self.groups
            .store(Arc::new(groups.into_iter().map(Arc::new).collect()));
    }

    pub fn get(&self, id: &str) -> Option<Arc<TargetGroupModel>> {
        self.groups
            .load()
            .iter()
            .find(|group| group.id == id)
            .cloned()
    }
}

#[derive(Default)]
pub struct ExperimentRepository {
    experiments: ArcSwap<Vec<Arc<ExperimentModel>>>,
}

impl ExperimentRepository {
    pub fn new() -> ExperimentRepository {
        ExperimentRepository::default()
    }

    pub fn set_experiments(&self, experiments: Vec<ExperimentModel>) {
        self.experiments
            .store(Arc::new(experiments.into_iter().map(Arc::new).collect()));
    }

    pub fn all(&self) -> Arc<Vec<Arc<ExperimentModel>>> {
        self.experiments.load_full()
    }

    /// The first experiment targeting `flag_name`, in configuration order.
    pub fn experiment_for_flag(&self, flag_name: &str) -> Option<Arc<ExperimentModel>> {
        self.experiments
            .load()
            .iter()
            .find(|experiment| experiment.targets_flag(flag_name))
            .cloned()
    }
}

type FlagAddedListener = Box<dyn Fn(&Arc<FlagValue>) + Send + Sync>;

#[derive(Default)]
pub struct FlagRepository {
    flags: RwLock<HashMap<String, Arc<FlagValue>>>,
    listeners: RwLock<Vec<FlagAddedListener>>,
}

impl FlagRepository {
    pub fn new() -> FlagRepository {
        FlagRepository::default()
    }

    /// Registers `flag`, or returns the already registered flag of the same
    /// name (registration is idempotent on name). Listeners fire only for a
    /// fresh registration.
    pub fn register(&self, flag: FlagValue) -> Arc<FlagValue> {
        let flag = {
            let mut flags = self.flags.write().unwrap();
            if let Some(existing) = flags.get(flag.name()) {
                return Arc::clone(existing);
            }
            let flag = Arc::new(flag);
            flags.insert(flag.name().to_string(), Arc::clone(&flag));
            flag
        };
        for listener in self.listeners.read().unwrap().iter() {
            listener(&flag);
        }
        flag
    }

    pub fn get(&self, name: &str) -> Option<Arc<FlagValue>> {
        self.flags.read().unwrap().get(name).cloned()
    }

    pub fn all(&self) -> Vec<Arc<FlagValue>> {
        self.flags.read().unwrap().values().cloned().collect()
    }

    pub fn on_flag_added<F>(&self, listener: F)
    where
        F: Fn(&Arc<FlagValue>) + Send + Sync + 'static,
    {
        self.listeners.write().unwrap().push(Box::new(listener));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::flags::{FlagKind, RoxFreeze};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn experiment(id: &str, flags: &[&str]) -> ExperimentModel {
        ExperimentModel {
            id: id.to_string(),
            name: id.to_string(),
            archived: false,
            condition: "true".to_string(),
            stickiness_property: None,
            labels: vec![],
            flags: flags.iter().map(|f| f.to_string()).collect(),
        }
    }

    #[test]
    fn experiment_lookup_by_flag() {
        let repository = ExperimentRepository::new();
        repository.set_experiments(vec![
            experiment("e1", &["a.flag"]),
            experiment("e2", &["b.flag", "c.flag"]),
        ]);
        assert_eq!(repository.experiment_for_flag("c.flag").unwrap().id, "e2");
        assert!(repository.experiment_for_flag("d.flag").is_none());
    }

    #[test]
    fn apply_replaces_the_whole_set() {
        let repository = ExperimentRepository::new();
        repository.set_experiments(vec![experiment("e1", &["a"])]);
        repository.set_experiments(vec![experiment("e2", &["b"])]);
        assert!(repository.experiment_for_flag("a").is_none());
        assert_eq!(repository.experiment_for_flag("b").unwrap().id, "e2");
    }

    #[test]
    fn target_group_lookup_by_id() {
        let repository = TargetGroupRepository::new();
        repository.set_target_groups(vec![TargetGroupModel {
            id: "tg1".to_string(),
            condition: "true".to_string(),
        }]);
        assert!(repository.get("tg1").is_some());
        assert!(repository.get("tg2").is_none());
    }

    #[test]
    fn flag_registration_is_idempotent() {
        let repository = FlagRepository::new();
        let added = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&added);
        repository.on_flag_added(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let first = repository.register(
            FlagValue::new("demo.flag", "false", vec![], FlagKind::Boolean, RoxFreeze::None)
                .unwrap(),
        );
        let second = repository.register(
            FlagValue::new("demo.flag", "true", vec![], FlagKind::Boolean, RoxFreeze::None)
                .unwrap(),
        );
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.default_value(), "false");
        assert_eq!(added.load(Ordering::SeqCst), 1);
    }
}
