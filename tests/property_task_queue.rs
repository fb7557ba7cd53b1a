use autolab::domain::models::{
    Capability, PriorityLevel, ProviderType, ResourceLimits, ResourceType, WorkflowStep,
    WorkflowTemplate,
};
use autolab::services::resource_ledger::AllocationRequest;
use autolab::services::task_queue::TaskQueue;
use autolab::services::{DependencyResolver, ResourceLedger, TemplateRegistry};
use autolab::OrchestrationError;
use chrono::{Duration, Utc};
use proptest::prelude::*;
use std::collections::HashSet;

fn priority() -> impl Strategy<Value = PriorityLevel> {
    prop_oneof![
        Just(PriorityLevel::Critical),
        Just(PriorityLevel::High),
        Just(PriorityLevel::Medium),
        Just(PriorityLevel::Low),
        Just(PriorityLevel::Background),
    ]
}

/// Steps where step `i` may only depend on steps before it.
fn acyclic_steps() -> impl Strategy<Value = Vec<WorkflowStep>> {
    prop::collection::vec(prop::collection::vec(any::<prop::sample::Index>(), 0..3), 1..15).prop_map(|deps| {
        deps.iter()
            .enumerate()
            .map(|(i, picks)| {
                let dependencies: Vec<String> = if i == 0 {
                    Vec::new()
                } else {
                    picks
                        .iter()
                        .map(|p| format!("s{}", p.index(i)))
                        .collect::<HashSet<_>>()
                        .into_iter()
                        .collect()
                };
                let mut step = WorkflowStep::new(
                    format!("s{i}"),
                    format!("Step {i}"),
                    ProviderType::Analysis,
                    vec![Capability::DataAnalysis],
                    1.0,
                );
                step.dependencies = dependencies;
                step
            })
            .collect()
    })
}

fn template(steps: Vec<WorkflowStep>) -> WorkflowTemplate {
    WorkflowTemplate {
        template_id: "generated".to_string(),
        template_name: "Generated".to_string(),
        description: String::new(),
        domain: "general".to_string(),
        steps,
        estimated_total_duration_hours: 1.0,
        success_criteria: Vec::new(),
        failure_conditions: Vec::new(),
    }
}

proptest! {
    /// Property: pops come out by priority, then creation time, then insertion order
    #[test]
    fn prop_pop_order_is_priority_then_age(
        entries in prop::collection::vec((priority(), 0i64..5), 1..60)
    ) {
        let base = Utc::now();
        let mut queue = TaskQueue::new();
        for (i, (p, age)) in entries.iter().enumerate() {
            let id = format!("t{i}");
            prop_assert!(queue.push(id, *p, base + Duration::seconds(*age)));
        }

        let mut previous = None;
        while let Some(entry) = queue.pop() {
            let key = (entry.priority, entry.created_at, entry.seq);
            if let Some(prev) = previous {
                prop_assert!(prev <= key, "{:?} popped before {:?}", prev, key);
            }
            previous = Some(key);
        }
        prop_assert!(queue.is_empty());
    }

    /// Property: removed tasks are never popped and length tracks live entries
    #[test]
    fn prop_removed_tasks_never_surface(
        entries in prop::collection::vec(priority(), 1..120),
        removals in prop::collection::vec(any::<prop::sample::Index>(), 0..80)
    ) {
        let now = Utc::now();
        let mut queue = TaskQueue::new();
        for (i, p) in entries.iter().enumerate() {
            queue.push(format!("t{i}"), *p, now);
        }

        let mut removed = HashSet::new();
        for index in &removals {
            let id = format!("t{}", index.index(entries.len()));
            let was_live = !removed.contains(&id);
            prop_assert_eq!(queue.remove(&id), was_live);
            removed.insert(id);
        }
        prop_assert_eq!(queue.len(), entries.len() - removed.len());

        let mut popped = 0;
        while let Some(entry) = queue.pop() {
            prop_assert!(!removed.contains(&entry.task_id));
            popped += 1;
        }
        prop_assert_eq!(popped, entries.len() - removed.len());
    }

    /// Property: a queued id cannot be pushed twice, but can be re-queued after pop
    #[test]
    fn prop_push_is_idempotent_while_queued(p in priority(), q in priority()) {
        let mut queue = TaskQueue::new();
        let now = Utc::now();
        prop_assert!(queue.push("x", p, now));
        prop_assert!(!queue.push("x", q, now));
        prop_assert_eq!(queue.len(), 1);
        prop_assert_eq!(queue.pop().map(|e| e.priority), Some(p));
        prop_assert!(queue.push("x", q, now));
    }

    /// Property: templates whose steps only point backwards are accepted
    #[test]
    fn prop_acyclic_templates_register(steps in acyclic_steps()) {
        let resolver = DependencyResolver::new();
        prop_assert!(resolver.validate_dependencies(&steps).is_ok());
        prop_assert!(resolver.detect_cycle(&steps).is_none());

        let mut registry = TemplateRegistry::new();
        prop_assert!(registry.register(template(steps)).is_ok());
    }

    /// Property: a back edge from the first step to the last always creates a cycle
    #[test]
    fn prop_back_edge_is_detected(mut steps in acyclic_steps()) {
        prop_assume!(steps.len() > 1);
        let last = steps.len() - 1;
        steps[last].dependencies.push("s0".to_string());
        let last_id = steps[last].step_id.clone();
        steps[0].dependencies.push(last_id);

        let resolver = DependencyResolver::new();
        let cycle = resolver.detect_cycle(&steps);
        prop_assert!(cycle.as_ref().is_some_and(|c| c.first() == c.last()));

        let registry = TemplateRegistry::new();
        prop_assert!(matches!(
            registry.validate(&template(steps)),
            Err(OrchestrationError::DependencyCycle(_))
        ));
    }

    /// Property: live allocations never exceed a limit, and usage tracks them
    #[test]
    fn prop_ledger_stays_within_limits(
        ops in prop::collection::vec((0usize..6, 0.0f64..80.0, 0.0f64..80.0, any::<bool>()), 1..60)
    ) {
        let limits = ResourceLimits {
            agent: 3.0,
            compute: 100.0,
            memory: 120.0,
            storage: 100.0,
            network: 100.0,
        };
        let mut ledger = ResourceLedger::new(&limits);

        for (task, compute, memory, release) in ops {
            let task_id = format!("t{task}");
            if release {
                ledger.release_task(&task_id);
            } else {
                let before = ledger.allocations_for(&task_id).len();
                let requests = [
                    AllocationRequest::new(ResourceType::Agent, 1.0).with_handle("p1"),
                    AllocationRequest::new(ResourceType::Compute, compute),
                    AllocationRequest::new(ResourceType::Memory, memory),
                ];
                match ledger.allocate_all(&task_id, &requests, None) {
                    Ok(granted) => prop_assert_eq!(granted.len(), 3),
                    Err(_) => prop_assert_eq!(ledger.allocations_for(&task_id).len(), before),
                }
            }

            for rt in ResourceType::ALL {
                let live = ledger.live_total(rt);
                prop_assert!(live <= ledger.limit(rt) + 1e-9);
                prop_assert!((ledger.usage(rt) - live).abs() < 1e-6);
            }
        }
    }
}
